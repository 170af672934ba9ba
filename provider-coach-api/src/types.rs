//! Coach API response types
//!
//! Every struct uses `#[serde(default)]` and ignores unknown fields. Counts
//! and labels accept either numbers or strings, and `null` lists decode as
//! empty.

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The signed-in account (`/user/current/`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub id: Option<i64>,
    #[serde(deserialize_with = "lenient::string")]
    pub username: String,
    #[serde(deserialize_with = "lenient::string")]
    pub email: String,
    #[serde(deserialize_with = "lenient::string")]
    pub first_name: String,
    #[serde(deserialize_with = "lenient::string")]
    pub last_name: String,
    pub image: Option<String>,
    /// Subscription end, as sent by the server
    pub active_until: Option<String>,
    pub trainer: Option<Trainer>,
}

impl UserProfile {
    pub fn full_name(&self) -> String {
        join_name(&self.first_name, &self.last_name)
    }

    pub fn active_until_date(&self) -> Option<NaiveDate> {
        self.active_until.as_deref().and_then(parse_date)
    }
}

/// The coach assigned to a user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Trainer {
    pub id: Option<i64>,
    #[serde(deserialize_with = "lenient::string")]
    pub first_name: String,
    #[serde(deserialize_with = "lenient::string")]
    pub last_name: String,
    pub email: Option<String>,
    pub image: Option<String>,
}

impl Trainer {
    pub fn full_name(&self) -> String {
        join_name(&self.first_name, &self.last_name)
    }
}

/// `/user/current/image`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileImage {
    pub image: Option<String>,
}

/// A general or personal workout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workout {
    pub id: i64,
    #[serde(deserialize_with = "lenient::string")]
    pub title: String,
    pub description: Option<String>,
    pub image: Option<String>,
    pub workout_date: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub category: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub difficulty: Option<String>,
    /// Minutes
    #[serde(deserialize_with = "lenient::number")]
    pub duration: Option<u32>,
    #[serde(deserialize_with = "lenient::list")]
    pub exercises: Vec<WorkoutExerciseSummary>,
}

impl Workout {
    pub fn date(&self) -> Option<NaiveDate> {
        self.workout_date.as_deref().and_then(parse_date)
    }
}

/// Entry of a workout's exercise list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkoutExerciseSummary {
    pub workoutexercise_id: i64,
    pub exercise_id: i64,
    #[serde(deserialize_with = "lenient::string")]
    pub title: String,
    pub image: Option<String>,
}

/// An exercise as prescribed inside a workout (`/workoutexercises/{id}/`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkoutExercise {
    pub id: i64,
    pub exercise: Option<Exercise>,
    #[serde(deserialize_with = "lenient::count")]
    pub warmup_series: u32,
    /// Per-set loads
    #[serde(deserialize_with = "lenient::text_list")]
    pub warmup: Vec<String>,
    #[serde(deserialize_with = "lenient::count")]
    pub main_series: u32,
    #[serde(deserialize_with = "lenient::count")]
    pub main_series_reps: u32,
    #[serde(deserialize_with = "lenient::text_list")]
    pub main: Vec<String>,
    #[serde(deserialize_with = "lenient::count")]
    pub rest_min: u32,
    #[serde(deserialize_with = "lenient::count")]
    pub rest_sec: u32,
    pub comment: Option<String>,
}

impl WorkoutExercise {
    /// Rest between sets.
    pub fn rest(&self) -> Duration {
        Duration::from_secs(u64::from(self.rest_min) * 60 + u64::from(self.rest_sec))
    }
}

/// Exercise from the catalogue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exercise {
    pub id: i64,
    #[serde(deserialize_with = "lenient::string")]
    pub title: String,
    pub description: Option<String>,
    pub image: Option<String>,
    /// Instructions as an HTML fragment
    pub html_content: Option<String>,
    pub video_link: Option<String>,
    pub language: Option<String>,
    #[serde(deserialize_with = "lenient::list")]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tag {
    pub id: i64,
    #[serde(deserialize_with = "lenient::string")]
    pub name: String,
    pub image: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub category: Option<String>,
}

/// Tag grouping used to browse exercises (`/tagcategory`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagCategory {
    pub id: i64,
    #[serde(deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(deserialize_with = "lenient::list")]
    pub tags: Vec<Tag>,
}

/// Rating of one exercise after a workout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseFeedback {
    pub workout_exercise_id: i64,
    pub comment: String,
    /// 1 to 5
    pub rating: u8,
}

fn join_name(first: &str, last: &str) -> String {
    format!("{} {}", first, last).trim().to_string()
}

/// Accepts `2024-05-01` or an RFC 3339 timestamp.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn as_text(value: Value) -> Option<String> {
        match value {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(as_text(Value::deserialize(d)?).unwrap_or_default())
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(as_text(Value::deserialize(d)?))
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn count<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        Ok(number(d)?.unwrap_or(0))
    }

    pub fn text_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items.into_iter().filter_map(as_text).collect(),
            _ => Vec::new(),
        })
    }

    pub fn list<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Ok(Option::<Vec<T>>::deserialize(d)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_user_profile() {
        let json = r#"{
            "id": 4,
            "username": "anna",
            "email": "anna@example.com",
            "first_name": "Anna",
            "last_name": "Nowak",
            "image": "/media/users/anna.jpg",
            "active_until": "2025-01-31",
            "trainer": {"first_name": "Piotr", "last_name": "Witek", "image": null},
            "is_staff": false
        }"#;

        let user: UserProfile = serde_json::from_str(json).unwrap();
        assert_eq!(user.full_name(), "Anna Nowak");
        assert_eq!(
            user.active_until_date(),
            NaiveDate::from_ymd_opt(2025, 1, 31)
        );
        let trainer = user.trainer.unwrap();
        assert_eq!(trainer.full_name(), "Piotr Witek");
        assert!(trainer.image.is_none());
    }

    #[test]
    fn test_deserialize_workout_lenient_fields() {
        let json = r#"{
            "id": 12,
            "title": "Full body",
            "difficulty": 2,
            "duration": "45",
            "workout_date": "2024-05-01T07:30:00Z",
            "exercises": [
                {"workoutexercise_id": 101, "exercise_id": 7, "title": "Squat"}
            ]
        }"#;

        let workout: Workout = serde_json::from_str(json).unwrap();
        assert_eq!(workout.difficulty.as_deref(), Some("2"));
        assert_eq!(workout.duration, Some(45));
        assert_eq!(workout.date(), NaiveDate::from_ymd_opt(2024, 5, 1));
        assert_eq!(workout.exercises[0].workoutexercise_id, 101);
    }

    #[test]
    fn test_nulls_and_missing_fields_default() {
        let workout: Workout =
            serde_json::from_str(r#"{"id": 1, "title": null, "exercises": null}"#).unwrap();
        assert_eq!(workout.title, "");
        assert!(workout.exercises.is_empty());
        assert!(workout.date().is_none());

        let category: TagCategory = serde_json::from_str(r#"{"name": "Legs"}"#).unwrap();
        assert!(category.tags.is_empty());
    }

    #[test]
    fn test_workout_exercise_sets_and_rest() {
        let json = r#"{
            "id": 101,
            "exercise": {"id": 7, "title": "Squat", "tags": [{"id": 1, "name": "Legs", "category": 3}]},
            "warmup_series": 2,
            "warmup": [20, "30"],
            "main_series": "3",
            "main_series_reps": 8,
            "main": ["60", 62.5, null],
            "rest_min": 1,
            "rest_sec": 30
        }"#;

        let detail: WorkoutExercise = serde_json::from_str(json).unwrap();
        assert_eq!(detail.warmup, vec!["20", "30"]);
        assert_eq!(detail.main_series, 3);
        assert_eq!(detail.main, vec!["60", "62.5"]);
        assert_eq!(detail.rest(), Duration::from_secs(90));

        let exercise = detail.exercise.unwrap();
        assert_eq!(exercise.tags[0].category.as_deref(), Some("3"));
    }
}

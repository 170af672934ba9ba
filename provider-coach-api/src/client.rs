//! Coach API client
//!
//! Thin typed layer over [`RequestDispatcher`]. Credential handling, refresh
//! and classification all happen in the pipeline; this module only knows
//! paths and payload shapes.

use core_auth::{ApiRequest, RequestDispatcher};
use core_runtime::config::CoreConfig;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::error::{CoachApiError, Result};
use crate::types::{
    Exercise, ExerciseFeedback, ProfileImage, TagCategory, UserProfile, Workout, WorkoutExercise,
};

const CURRENT_USER_PATH: &str = "/user/current/";
const CURRENT_USER_IMAGE_PATH: &str = "/user/current/image";
const GENERAL_WORKOUTS_PATH: &str = "/workouts/general/";
const PERSONAL_WORKOUTS_PATH: &str = "/workouts/personal/";
const TODAY_WORKOUTS_PATH: &str = "/workouts/personal/today/";
const TAG_CATEGORIES_PATH: &str = "/tagcategory";
const EXERCISES_PATH: &str = "/exercises/";

/// Coach API client
///
/// # Example
///
/// ```ignore
/// use provider_coach_api::CoachApiClient;
///
/// let api = CoachApiClient::new(session.dispatcher().clone(), &config.media_base_url);
/// for workout in api.today_workouts().await? {
///     println!("{} {:?}", workout.title, api.media_url(workout.image.as_deref()));
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CoachApiClient {
    dispatcher: RequestDispatcher,
    media_base_url: String,
}

impl CoachApiClient {
    pub fn new(dispatcher: RequestDispatcher, media_base_url: impl Into<String>) -> Self {
        let media_base_url = media_base_url.into().trim_end_matches('/').to_string();
        Self {
            dispatcher,
            media_base_url,
        }
    }

    pub fn from_config(dispatcher: RequestDispatcher, config: &CoreConfig) -> Self {
        Self::new(dispatcher, config.media_base_url.clone())
    }

    pub fn media_base_url(&self) -> &str {
        &self.media_base_url
    }

    /// Resolve a media path returned by the API to a full URL.
    ///
    /// Absolute `http(s)://` URLs are returned unchanged. Empty or missing
    /// paths resolve to `None`.
    pub fn media_url(&self, path: Option<&str>) -> Option<String> {
        let path = path.map(str::trim).filter(|p| !p.is_empty())?;

        if path.starts_with("http://") || path.starts_with("https://") {
            return Some(path.to_string());
        }

        let path = path.strip_prefix('/').unwrap_or(path);
        Some(format!("{}/{}", self.media_base_url, path))
    }

    #[instrument(skip(self))]
    pub async fn current_user(&self) -> Result<UserProfile> {
        self.fetch(ApiRequest::get(CURRENT_USER_PATH), "current user")
            .await
    }

    /// Profile picture of the current user, if one is set.
    #[instrument(skip(self))]
    pub async fn current_user_image(&self) -> Result<Option<String>> {
        let image: ProfileImage = self
            .fetch(ApiRequest::get(CURRENT_USER_IMAGE_PATH), "profile image")
            .await?;
        Ok(image.image.filter(|path| !path.is_empty()))
    }

    #[instrument(skip(self))]
    pub async fn general_workouts(&self) -> Result<Vec<Workout>> {
        self.fetch_list(ApiRequest::get(GENERAL_WORKOUTS_PATH)).await
    }

    #[instrument(skip(self))]
    pub async fn personal_workouts(&self) -> Result<Vec<Workout>> {
        self.fetch_list(ApiRequest::get(PERSONAL_WORKOUTS_PATH)).await
    }

    #[instrument(skip(self))]
    pub async fn today_workouts(&self) -> Result<Vec<Workout>> {
        self.fetch_list(ApiRequest::get(TODAY_WORKOUTS_PATH)).await
    }

    #[instrument(skip(self))]
    pub async fn workout_details(&self, workout_id: i64) -> Result<Workout> {
        self.fetch(
            ApiRequest::get(format!("/workout/{}/", workout_id)),
            format!("workout {}", workout_id),
        )
        .await
    }

    /// Sets, loads and rest of one exercise inside a workout.
    #[instrument(skip(self))]
    pub async fn workout_exercise(&self, workout_exercise_id: i64) -> Result<WorkoutExercise> {
        self.fetch(
            ApiRequest::get(format!("/workoutexercises/{}/", workout_exercise_id)),
            format!("workout exercise {}", workout_exercise_id),
        )
        .await
    }

    #[instrument(skip(self, comment))]
    pub async fn submit_exercise_feedback(
        &self,
        workout_exercise_id: i64,
        comment: &str,
        rating: u8,
    ) -> Result<Value> {
        let request = ApiRequest::post(
            format!("/workoutexercises/{}/feedback/", workout_exercise_id),
            json!({ "comment": comment, "rating": rating }),
        );
        self.dispatcher
            .send(request)
            .await
            .map_err(|e| {
                CoachApiError::for_resource(e, format!("workout exercise {}", workout_exercise_id))
            })
    }

    /// Send the ratings collected during a workout in one call.
    #[instrument(skip(self, feedbacks), fields(count = feedbacks.len()))]
    pub async fn submit_workout_feedback(
        &self,
        workout_id: i64,
        feedbacks: &[ExerciseFeedback],
    ) -> Result<Value> {
        let request = ApiRequest::post(
            format!("/workouts/{}/feedback/", workout_id),
            json!({ "feedbacks": feedbacks }),
        );
        self.dispatcher
            .send(request)
            .await
            .map_err(|e| CoachApiError::for_resource(e, format!("workout {}", workout_id)))
    }

    #[instrument(skip(self))]
    pub async fn tag_categories(&self) -> Result<Vec<TagCategory>> {
        self.fetch_list(ApiRequest::get(TAG_CATEGORIES_PATH)).await
    }

    /// Exercise catalogue, optionally narrowed to one tag.
    #[instrument(skip(self))]
    pub async fn exercises(&self, tag_id: Option<i64>) -> Result<Vec<Exercise>> {
        let request = match tag_id {
            Some(tag_id) => ApiRequest::get(EXERCISES_PATH).query("tag_id", tag_id.to_string()),
            None => ApiRequest::get(EXERCISES_PATH),
        };
        self.fetch_list(request).await
    }

    #[instrument(skip(self))]
    pub async fn exercise_details(&self, exercise_id: i64) -> Result<Exercise> {
        self.fetch(
            ApiRequest::get(format!("{}{}/", EXERCISES_PATH, exercise_id)),
            format!("exercise {}", exercise_id),
        )
        .await
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        resource: impl Into<String>,
    ) -> Result<T> {
        let value = self
            .dispatcher
            .send(request)
            .await
            .map_err(|e| CoachApiError::for_resource(e, resource))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Decode a list endpoint. An empty body is an empty list, and a paged
    /// `{"results": [...]}` envelope is unwrapped.
    async fn fetch_list<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<Vec<T>> {
        let path = request.path.clone();
        let value = self.dispatcher.send(request).await?;

        let items = match value {
            Value::Null => return Ok(Vec::new()),
            Value::Object(mut envelope) => envelope.remove("results").unwrap_or(Value::Null),
            other => other,
        };

        let items: Vec<T> = match items {
            Value::Null => Vec::new(),
            items => serde_json::from_value(items)?,
        };
        debug!(path = %path, count = items.len(), "Fetched list");
        Ok(items)
    }
}

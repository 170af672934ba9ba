//! # Coach API Provider
//!
//! Typed access to the coaching backend over the authenticated request
//! pipeline.
//!
//! ## Overview
//!
//! This module provides:
//! - Profile, workout, exercise and tag category endpoints
//! - Workout feedback submission
//! - Media URL resolution against the media host
//!
//! Payload types are lenient: missing fields take defaults and unknown
//! fields are ignored, so backend additions never break decoding.

pub mod client;
pub mod error;
pub mod types;

pub use client::CoachApiClient;
pub use error::{CoachApiError, Result};
pub use types::{
    Exercise, ExerciseFeedback, ProfileImage, Tag, TagCategory, Trainer, UserProfile, Workout,
    WorkoutExercise, WorkoutExerciseSummary,
};

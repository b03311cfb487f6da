//! # Error Types
//!
//! Custom error types for Course Telemetry using `thiserror`.

use thiserror::Error;

use crate::course::status::CourseStatus;

/// Main error type for Course Telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors for persisted or wire data
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Course status transition not allowed by the state machine
    #[error("Invalid transition for course {course_id}: {from} -> {to}")]
    InvalidTransition {
        course_id: String,
        from: CourseStatus,
        to: CourseStatus,
    },

    /// Course already has a transition waiting on the collector or the bridge
    #[error("Course {0} has a transition in progress")]
    TransitionInProgress(String),

    /// Course id not known to the controller
    #[error("Unknown course: {0}")]
    UnknownCourse(String),

    /// Integer that is not one of the course status codes 1-4
    #[error("Invalid course status code: {0}")]
    InvalidStatusCode(u8),

    /// Positioning collaborator rejected or failed a command
    #[error("Positioning bridge error: {0}")]
    Bridge(String),

    /// Request never produced an HTTP response
    #[error("Transport error: {0}")]
    Transport(String),

    /// No bearer credential available
    #[error("Missing credential: {0}")]
    MissingCredential(String),
}

/// Result type alias for Course Telemetry
pub type Result<T> = std::result::Result<T, TelemetryError>;

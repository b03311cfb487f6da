//! # Course Status
//!
//! Course status codes and the transition table.
//!
//! Status values travel as integers across the positioning bridge and in the
//! telemetry payload, so the enum is serialized as its numeric code.
//!
//! | Code | Status | May move to |
//! |------|--------|-------------|
//! | 1 | AVAILABLE | ACTIVE |
//! | 2 | ACTIVE | PAUSED, FINISHED |
//! | 3 | PAUSED | ACTIVE, FINISHED |
//! | 4 | FINISHED | (terminal) |

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TelemetryError;

/// Lifecycle status of a course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CourseStatus {
    /// Assigned to the vehicle, not started.
    Available = 1,
    /// Running; the only status that produces coordinates.
    Active = 2,
    /// Temporarily halted; the capture session is kept.
    Paused = 3,
    /// Completed; terminal.
    Finished = 4,
}

impl CourseStatus {
    /// Numeric code used on the wire and across the bridge.
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Upper-case name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CourseStatus::Available => "AVAILABLE",
            CourseStatus::Active => "ACTIVE",
            CourseStatus::Paused => "PAUSED",
            CourseStatus::Finished => "FINISHED",
        }
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    ///
    /// # Examples
    ///
    /// ```
    /// use course_telemetry::course::status::CourseStatus;
    ///
    /// assert!(CourseStatus::Available.can_transition_to(CourseStatus::Active));
    /// assert!(!CourseStatus::Finished.can_transition_to(CourseStatus::Active));
    /// ```
    #[must_use]
    pub fn can_transition_to(self, next: CourseStatus) -> bool {
        use CourseStatus::*;
        matches!(
            (self, next),
            (Available, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Finished)
                | (Paused, Finished)
        )
    }
}

impl fmt::Display for CourseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.code())
    }
}

impl From<CourseStatus> for u8 {
    fn from(status: CourseStatus) -> u8 {
        status.code()
    }
}

impl TryFrom<u8> for CourseStatus {
    type Error = TelemetryError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(CourseStatus::Available),
            2 => Ok(CourseStatus::Active),
            3 => Ok(CourseStatus::Paused),
            4 => Ok(CourseStatus::Finished),
            other => Err(TelemetryError::InvalidStatusCode(other)),
        }
    }
}

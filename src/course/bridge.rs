//! Narrow command interface to the positioning / background capture service.
//!
//! Every command returns an explicit result. A failed [`PositioningBridge::start`]
//! means no capture session exists for the course.

use async_trait::async_trait;

use super::status::CourseStatus;
use crate::credential::Credential;
use crate::error::Result;

/// Everything the capture service needs to run a course session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub course_id: String,
    pub vehicle_number: String,
    pub uit: String,
    pub credential: Credential,
    pub status: CourseStatus,
}

/// Commands issued by the course controller to the capture service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositioningBridge: Send + Sync {
    /// Open a capture session for a course.
    async fn start(&self, request: StartRequest) -> Result<()>;

    /// Close the session of one course.
    async fn stop(&self, course_id: &str) -> Result<()>;

    /// Change the status carried by an existing session.
    async fn update_status(&self, course_id: &str, status: CourseStatus) -> Result<()>;

    /// Close every session.
    async fn clear_all(&self) -> Result<()>;
}

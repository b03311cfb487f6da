//! # Course Module
//!
//! Course lifecycle and the commands it issues to the capture service.
//!
//! This module handles:
//! - Status codes and the transition table ([`status`])
//! - The command interface to the positioning collaborator ([`bridge`])
//! - The per-course state machine gating sample production ([`controller`])

pub mod bridge;
pub mod controller;
pub mod status;

pub use bridge::{PositioningBridge, StartRequest};
pub use controller::{Course, CourseController, StatusReporter, VehicleSession};
pub use status::CourseStatus;

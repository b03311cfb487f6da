//! # Course Telemetry Library
//!
//! Offline-resilient telemetry for vehicles running transport courses.
//!
//! This library provides the pipeline that captures position samples for
//! active courses, delivers them to a remote collector, queues them durably
//! when delivery fails, and resynchronizes the queue once the collector is
//! reachable again.

pub mod config;
pub mod console;
pub mod coordinate;
pub mod course;
pub mod credential;
pub mod error;
pub mod network;
pub mod store;
pub mod sync;
pub mod tracker;
pub mod transmit;

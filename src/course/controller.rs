//! # Course Status Controller
//!
//! State machine that gates sample production per course.
//!
//! ## Side Effects Per Target Status
//!
//! | Target | Remote report | Bridge command |
//! |--------|---------------|----------------|
//! | ACTIVE (first time) | yes | `start` (must succeed) |
//! | ACTIVE (resume) | yes | `update_status` |
//! | PAUSED | yes | `update_status` |
//! | FINISHED | yes | `stop`, then removal after the grace delay |
//!
//! The remote report happens before the local status changes. A failed report
//! is logged and does not block the transition; the next regular sample
//! carries the corrected status. A failed `start` leaves the course where it
//! was, since no capture session exists, and the previous status is reported
//! again so the collector does not keep the rejected ACTIVE.
//!
//! The registry lock is never held across a report or a bridge command; a
//! course in the middle of a transition rejects a second one.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::bridge::{PositioningBridge, StartRequest};
use super::status::CourseStatus;
use crate::credential::Credential;
use crate::error::{Result, TelemetryError};

/// A unit of transport work assigned to the vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Course {
    /// Local key, also used across the bridge.
    pub id: String,
    /// Server-facing transport identifier.
    pub uit: String,
    #[serde(default = "default_course_status")]
    pub status: CourseStatus,
}

fn default_course_status() -> CourseStatus {
    CourseStatus::Available
}

/// Vehicle identity and credential for the logged-in session.
#[derive(Debug, Clone)]
pub struct VehicleSession {
    pub vehicle_number: String,
    pub credential: Credential,
}

/// Reports a course status change to the remote collector.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report_status(
        &self,
        uit: &str,
        vehicle_number: &str,
        status: CourseStatus,
        credential: &Credential,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
struct Registry {
    courses: HashMap<String, Course>,
    /// Courses with an open capture session.
    tracked: HashSet<String>,
    /// Courses whose transition is waiting on the collector or the bridge.
    transitioning: HashSet<String>,
}

/// Per-course lifecycle state machine.
pub struct CourseController {
    bridge: Arc<dyn PositioningBridge>,
    reporter: Arc<dyn StatusReporter>,
    session: VehicleSession,
    finish_grace: Duration,
    registry: Arc<Mutex<Registry>>,
}

impl CourseController {
    pub fn new(
        bridge: Arc<dyn PositioningBridge>,
        reporter: Arc<dyn StatusReporter>,
        session: VehicleSession,
        finish_grace: Duration,
    ) -> Self {
        Self {
            bridge,
            reporter,
            session,
            finish_grace,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Register the vehicle's course list.
    ///
    /// Courses with an open session keep their local status.
    pub async fn load_courses(&self, courses: Vec<Course>) -> usize {
        let mut registry = self.registry.lock().await;
        let mut loaded = 0;
        for course in courses {
            if registry.tracked.contains(&course.id) {
                debug!("Keeping local state of tracked course {}", course.id);
                continue;
            }
            registry.courses.insert(course.id.clone(), course);
            loaded += 1;
        }
        info!("Loaded {} courses for {}", loaded, self.session.vehicle_number);
        loaded
    }

    /// Open capture sessions for loaded courses that are already ACTIVE or
    /// PAUSED, e.g. after a restart. Returns the number of sessions opened.
    ///
    /// A course whose `start` fails falls back to AVAILABLE.
    pub async fn restore_sessions(&self) -> usize {
        let pending: Vec<Course> = {
            let mut registry = self.registry.lock().await;
            let pending: Vec<Course> = registry
                .courses
                .values()
                .filter(|c| matches!(c.status, CourseStatus::Active | CourseStatus::Paused))
                .filter(|c| !registry.tracked.contains(&c.id) && !registry.transitioning.contains(&c.id))
                .cloned()
                .collect();
            for course in &pending {
                registry.transitioning.insert(course.id.clone());
            }
            pending
        };

        let mut restored = 0;
        for course in pending {
            let result = self.bridge.start(self.start_request(&course, course.status)).await;

            let mut registry = self.registry.lock().await;
            registry.transitioning.remove(&course.id);
            let known = registry.courses.contains_key(&course.id);
            match result {
                Ok(()) if known => {
                    registry.tracked.insert(course.id.clone());
                    restored += 1;
                    info!("Restored capture session for course {} ({})", course.id, course.status);
                }
                Ok(()) => {
                    drop(registry);
                    self.stop_orphan(&course.id).await;
                }
                Err(e) => {
                    warn!("Could not restore course {}: {}", course.id, e);
                    if let Some(entry) = registry.courses.get_mut(&course.id) {
                        entry.status = CourseStatus::Available;
                    }
                }
            }
        }
        restored
    }

    /// Known courses, ordered by id.
    pub async fn courses(&self) -> Vec<Course> {
        let registry = self.registry.lock().await;
        let mut courses: Vec<_> = registry.courses.values().cloned().collect();
        courses.sort_by(|a, b| a.id.cmp(&b.id));
        courses
    }

    pub async fn course(&self, course_id: &str) -> Option<Course> {
        self.registry.lock().await.courses.get(course_id).cloned()
    }

    /// True while the course has a capture session or is inside its grace delay.
    pub async fn is_tracked(&self, course_id: &str) -> bool {
        self.registry.lock().await.tracked.contains(course_id)
    }

    pub async fn tracked_count(&self) -> usize {
        self.registry.lock().await.tracked.len()
    }

    /// Move a course to `new_status`.
    ///
    /// Returns the previous status. The registry is not locked while the
    /// collector or the bridge is being called.
    ///
    /// # Errors
    ///
    /// - [`TelemetryError::UnknownCourse`] if the id is not loaded, or was
    ///   cleared while the transition ran
    /// - [`TelemetryError::InvalidTransition`] if the state machine forbids it
    /// - [`TelemetryError::TransitionInProgress`] if the course is mid-transition
    /// - the bridge error if `start` fails; the course keeps its status and
    ///   the previous status is reported again
    pub async fn set_status(&self, course_id: &str, new_status: CourseStatus) -> Result<CourseStatus> {
        let (course, tracked) = {
            let mut registry = self.registry.lock().await;
            let course = registry
                .courses
                .get(course_id)
                .cloned()
                .ok_or_else(|| TelemetryError::UnknownCourse(course_id.to_string()))?;

            if !course.status.can_transition_to(new_status) {
                warn!("Rejected course {} transition {} -> {}", course_id, course.status, new_status);
                return Err(TelemetryError::InvalidTransition {
                    course_id: course_id.to_string(),
                    from: course.status,
                    to: new_status,
                });
            }
            if !registry.transitioning.insert(course_id.to_string()) {
                return Err(TelemetryError::TransitionInProgress(course_id.to_string()));
            }
            let tracked = registry.tracked.contains(course_id);
            (course, tracked)
        };

        let result = self.run_transition(&course, tracked, new_status).await;

        let mut registry = self.registry.lock().await;
        registry.transitioning.remove(course_id);
        let started = result?;

        if !registry.courses.contains_key(course_id) {
            drop(registry);
            warn!("Course {} was cleared during its transition", course_id);
            if started {
                self.stop_orphan(course_id).await;
            }
            return Err(TelemetryError::UnknownCourse(course_id.to_string()));
        }
        if let Some(entry) = registry.courses.get_mut(course_id) {
            entry.status = new_status;
        }
        if started {
            registry.tracked.insert(course_id.to_string());
        }
        if new_status == CourseStatus::Finished {
            self.schedule_removal(course_id);
        }

        info!("Course {} ({}) {} -> {}", course_id, course.uit, course.status, new_status);
        Ok(course.status)
    }

    /// Collector report and bridge command for one transition.
    ///
    /// Returns true if a new capture session was started.
    async fn run_transition(&self, course: &Course, tracked: bool, new_status: CourseStatus) -> Result<bool> {
        self.report(course, new_status).await;

        match new_status {
            CourseStatus::Active if tracked => {
                self.update_bridge_status(&course.id, new_status).await;
            }
            CourseStatus::Active => {
                if let Err(e) = self.bridge.start(self.start_request(course, new_status)).await {
                    warn!("Capture service refused to start course {}: {}", course.id, e);
                    // The collector already saw the new status; put it back.
                    self.report(course, course.status).await;
                    return Err(e);
                }
                return Ok(true);
            }
            CourseStatus::Paused => {
                self.update_bridge_status(&course.id, new_status).await;
            }
            CourseStatus::Finished => {
                if let Err(e) = self.bridge.stop(&course.id).await {
                    warn!("Failed to stop capture for course {}: {}", course.id, e);
                }
            }
            CourseStatus::Available => {}
        }
        Ok(false)
    }

    fn start_request(&self, course: &Course, status: CourseStatus) -> StartRequest {
        StartRequest {
            course_id: course.id.clone(),
            vehicle_number: self.session.vehicle_number.clone(),
            uit: course.uit.clone(),
            credential: self.session.credential.clone(),
            status,
        }
    }

    /// Close a session opened for a course that no longer exists.
    async fn stop_orphan(&self, course_id: &str) {
        if let Err(e) = self.bridge.stop(course_id).await {
            warn!("Failed to stop orphaned capture for course {}: {}", course_id, e);
        }
    }

    /// Stop every session and forget every course. Safe to call repeatedly.
    pub async fn clear_all(&self) {
        let mut registry = self.registry.lock().await;
        if let Err(e) = self.bridge.clear_all().await {
            warn!("Capture service failed to clear sessions: {}", e);
        }
        let dropped = registry.tracked.len();
        registry.tracked.clear();
        registry.courses.clear();
        info!("Cleared all courses ({} tracked)", dropped);
    }

    async fn report(&self, course: &Course, status: CourseStatus) {
        if let Err(e) = self
            .reporter
            .report_status(
                &course.uit,
                &self.session.vehicle_number,
                status,
                &self.session.credential,
            )
            .await
        {
            warn!(
                "Could not report {} for course {} to the collector, next sample will carry it: {}",
                status, course.id, e
            );
        }
    }

    async fn update_bridge_status(&self, course_id: &str, status: CourseStatus) {
        if let Err(e) = self.bridge.update_status(course_id, status).await {
            warn!("Failed to update capture status of course {}: {}", course_id, e);
        }
    }

    /// Forget a finished course once the grace delay has passed.
    fn schedule_removal(&self, course_id: &str) {
        let registry = Arc::clone(&self.registry);
        let course_id = course_id.to_string();
        let grace = self.finish_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut registry = registry.lock().await;
            let finished = registry
                .courses
                .get(&course_id)
                .is_some_and(|c| c.status == CourseStatus::Finished);
            if finished {
                registry.tracked.remove(&course_id);
                registry.courses.remove(&course_id);
                debug!("Course {} removed after grace delay", course_id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::bridge::MockPositioningBridge;
    use mockall::predicate::eq;
    use std::sync::Mutex as StdMutex;

    /// Reporter recording calls into a shared event log.
    struct RecordingReporter {
        events: Arc<StdMutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl StatusReporter for RecordingReporter {
        async fn report_status(
            &self,
            uit: &str,
            _vehicle_number: &str,
            status: CourseStatus,
            _credential: &Credential,
        ) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("report {} {}", uit, status.code()));
            if self.fail {
                return Err(TelemetryError::Transport("offline".to_string()));
            }
            Ok(())
        }
    }

    const GRACE: Duration = Duration::from_secs(5);

    fn controller_with(
        bridge: MockPositioningBridge,
        fail_reports: bool,
    ) -> (CourseController, Arc<StdMutex<Vec<String>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let reporter = RecordingReporter {
            events: events.clone(),
            fail: fail_reports,
        };
        let session = VehicleSession {
            vehicle_number: "B-123-XYZ".to_string(),
            credential: Credential::new("token").unwrap(),
        };
        let controller = CourseController::new(Arc::new(bridge), Arc::new(reporter), session, GRACE);
        (controller, events)
    }

    fn course(id: &str) -> Course {
        Course {
            id: id.to_string(),
            uit: format!("UIT-{}", id),
            status: CourseStatus::Available,
        }
    }

    #[tokio::test]
    async fn test_start_issues_start_command() {
        let mut bridge = MockPositioningBridge::new();
        bridge
            .expect_start()
            .withf(|req| {
                req.course_id == "c1"
                    && req.uit == "UIT-c1"
                    && req.vehicle_number == "B-123-XYZ"
                    && req.status == CourseStatus::Active
                    && req.credential.token() == "token"
            })
            .times(1)
            .returning(|_| Ok(()));
        let (controller, _) = controller_with(bridge, false);
        controller.load_courses(vec![course("c1")]).await;

        let previous = controller.set_status("c1", CourseStatus::Active).await.unwrap();
        assert_eq!(previous, CourseStatus::Available);
        assert!(controller.is_tracked("c1").await);
        assert_eq!(controller.course("c1").await.unwrap().status, CourseStatus::Active);
    }

    #[tokio::test]
    async fn test_pause_resume_does_not_restart() {
        let mut bridge = MockPositioningBridge::new();
        bridge.expect_start().times(1).returning(|_| Ok(()));
        bridge
            .expect_update_status()
            .with(eq("c1"), eq(CourseStatus::Paused))
            .times(1)
            .returning(|_, _| Ok(()));
        bridge
            .expect_update_status()
            .with(eq("c1"), eq(CourseStatus::Active))
            .times(1)
            .returning(|_, _| Ok(()));
        let (controller, _) = controller_with(bridge, false);
        controller.load_courses(vec![course("c1")]).await;

        controller.set_status("c1", CourseStatus::Active).await.unwrap();
        controller.set_status("c1", CourseStatus::Paused).await.unwrap();
        controller.set_status("c1", CourseStatus::Active).await.unwrap();
        assert_eq!(controller.course("c1").await.unwrap().status, CourseStatus::Active);
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_state() {
        // No expectations: any bridge call panics.
        let bridge = MockPositioningBridge::new();
        let (controller, events) = controller_with(bridge, false);
        controller.load_courses(vec![course("c1")]).await;

        for target in [CourseStatus::Paused, CourseStatus::Finished, CourseStatus::Available] {
            let err = controller.set_status("c1", target).await.unwrap_err();
            assert!(matches!(err, TelemetryError::InvalidTransition { .. }));
        }
        assert_eq!(controller.course("c1").await.unwrap().status, CourseStatus::Available);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_course() {
        let (controller, _) = controller_with(MockPositioningBridge::new(), false);
        let err = controller.set_status("nope", CourseStatus::Active).await.unwrap_err();
        assert!(matches!(err, TelemetryError::UnknownCourse(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_failed_start_is_not_active() {
        let mut bridge = MockPositioningBridge::new();
        let mut seq = mockall::Sequence::new();
        bridge
            .expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(TelemetryError::Bridge("service unavailable".to_string())));
        bridge
            .expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let (controller, events) = controller_with(bridge, false);
        controller.load_courses(vec![course("c1")]).await;

        let err = controller.set_status("c1", CourseStatus::Active).await.unwrap_err();
        assert!(matches!(err, TelemetryError::Bridge(_)));
        assert_eq!(controller.course("c1").await.unwrap().status, CourseStatus::Available);
        assert!(!controller.is_tracked("c1").await);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["report UIT-c1 2", "report UIT-c1 1"],
            "rejected ACTIVE must be followed by the status the course kept"
        );

        controller.set_status("c1", CourseStatus::Active).await.unwrap();
        assert!(controller.is_tracked("c1").await);
    }

    #[tokio::test]
    async fn test_report_precedes_bridge_command() {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let mut bridge = MockPositioningBridge::new();
        let log = events.clone();
        bridge.expect_start().times(1).returning(move |req| {
            log.lock().unwrap().push(format!("start {}", req.course_id));
            Ok(())
        });
        let log = events.clone();
        bridge.expect_update_status().times(1).returning(move |id, status| {
            log.lock().unwrap().push(format!("update {} {}", id, status.code()));
            Ok(())
        });

        let reporter = RecordingReporter {
            events: events.clone(),
            fail: false,
        };
        let session = VehicleSession {
            vehicle_number: "V".to_string(),
            credential: Credential::new("token").unwrap(),
        };
        let controller = CourseController::new(Arc::new(bridge), Arc::new(reporter), session, GRACE);
        controller.load_courses(vec![course("c1")]).await;

        controller.set_status("c1", CourseStatus::Active).await.unwrap();
        controller.set_status("c1", CourseStatus::Paused).await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["report UIT-c1 2", "start c1", "report UIT-c1 3", "update c1 3"]
        );
    }

    #[tokio::test]
    async fn test_failed_report_does_not_block() {
        let mut bridge = MockPositioningBridge::new();
        bridge.expect_start().times(1).returning(|_| Ok(()));
        bridge.expect_update_status().times(1).returning(|_, _| Ok(()));
        let (controller, events) = controller_with(bridge, true);
        controller.load_courses(vec![course("c1")]).await;

        controller.set_status("c1", CourseStatus::Active).await.unwrap();
        controller.set_status("c1", CourseStatus::Paused).await.unwrap();
        assert_eq!(controller.course("c1").await.unwrap().status, CourseStatus::Paused);
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_status_update_still_transitions() {
        let mut bridge = MockPositioningBridge::new();
        bridge.expect_start().times(1).returning(|_| Ok(()));
        bridge
            .expect_update_status()
            .times(1)
            .returning(|_, _| Err(TelemetryError::Bridge("busy".to_string())));
        let (controller, _) = controller_with(bridge, false);
        controller.load_courses(vec![course("c1")]).await;

        controller.set_status("c1", CourseStatus::Active).await.unwrap();
        controller.set_status("c1", CourseStatus::Paused).await.unwrap();
        assert_eq!(controller.course("c1").await.unwrap().status, CourseStatus::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_removes_after_grace() {
        let mut bridge = MockPositioningBridge::new();
        bridge.expect_start().times(1).returning(|_| Ok(()));
        bridge
            .expect_stop()
            .with(eq("c1"))
            .times(1)
            .returning(|_| Ok(()));
        let (controller, _) = controller_with(bridge, false);
        controller.load_courses(vec![course("c1"), course("c2")]).await;

        controller.set_status("c1", CourseStatus::Active).await.unwrap();
        controller.set_status("c1", CourseStatus::Finished).await.unwrap();

        assert!(controller.is_tracked("c1").await);
        assert_eq!(controller.course("c1").await.unwrap().status, CourseStatus::Finished);
        let err = controller.set_status("c1", CourseStatus::Active).await.unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidTransition { .. }));

        tokio::time::sleep(GRACE - Duration::from_millis(100)).await;
        assert!(controller.is_tracked("c1").await);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!controller.is_tracked("c1").await);
        assert!(controller.course("c1").await.is_none());
        assert_eq!(controller.courses().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_from_paused() {
        let mut bridge = MockPositioningBridge::new();
        bridge.expect_start().times(1).returning(|_| Ok(()));
        bridge.expect_update_status().times(1).returning(|_, _| Ok(()));
        bridge.expect_stop().times(1).returning(|_| Ok(()));
        let (controller, _) = controller_with(bridge, false);
        controller.load_courses(vec![course("c1")]).await;

        controller.set_status("c1", CourseStatus::Active).await.unwrap();
        controller.set_status("c1", CourseStatus::Paused).await.unwrap();
        controller.set_status("c1", CourseStatus::Finished).await.unwrap();
        tokio::time::sleep(GRACE * 2).await;
        assert_eq!(controller.tracked_count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_courses() {
        let mut bridge = MockPositioningBridge::new();
        bridge.expect_start().times(2).returning(|_| Ok(()));
        let (controller, _) = controller_with(bridge, false);
        controller.load_courses(vec![course("c1"), course("c2")]).await;

        controller.set_status("c1", CourseStatus::Active).await.unwrap();
        controller.set_status("c2", CourseStatus::Active).await.unwrap();
        assert_eq!(controller.tracked_count().await, 2);
    }

    #[tokio::test]
    async fn test_clear_all_is_idempotent() {
        let mut bridge = MockPositioningBridge::new();
        bridge.expect_start().times(2).returning(|_| Ok(()));
        bridge.expect_clear_all().times(2).returning(|| Ok(()));
        let (controller, _) = controller_with(bridge, false);
        controller.load_courses(vec![course("c1"), course("c2")]).await;
        controller.set_status("c1", CourseStatus::Active).await.unwrap();
        controller.set_status("c2", CourseStatus::Active).await.unwrap();

        controller.clear_all().await;
        assert_eq!(controller.tracked_count().await, 0);
        assert!(controller.courses().await.is_empty());

        controller.clear_all().await;
        assert_eq!(controller.tracked_count().await, 0);
    }

    #[tokio::test]
    async fn test_reload_keeps_tracked_state() {
        let mut bridge = MockPositioningBridge::new();
        bridge.expect_start().times(1).returning(|_| Ok(()));
        let (controller, _) = controller_with(bridge, false);
        controller.load_courses(vec![course("c1")]).await;
        controller.set_status("c1", CourseStatus::Active).await.unwrap();

        let loaded = controller.load_courses(vec![course("c1"), course("c2")]).await;
        assert_eq!(loaded, 1);
        assert_eq!(controller.course("c1").await.unwrap().status, CourseStatus::Active);
    }

    /// Reporter that takes as long as a slow collector.
    struct SlowReporter;

    #[async_trait]
    impl StatusReporter for SlowReporter {
        async fn report_status(
            &self,
            _uit: &str,
            _vehicle_number: &str,
            _status: CourseStatus,
            _credential: &Credential,
        ) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_usable_while_report_in_flight() {
        let mut bridge = MockPositioningBridge::new();
        bridge.expect_start().times(2).returning(|_| Ok(()));
        let session = VehicleSession {
            vehicle_number: "V".to_string(),
            credential: Credential::new("token").unwrap(),
        };
        let controller = Arc::new(CourseController::new(
            Arc::new(bridge),
            Arc::new(SlowReporter),
            session,
            GRACE,
        ));
        controller.load_courses(vec![course("c1"), course("c2")]).await;

        let background = controller.clone();
        let first = tokio::spawn(async move { background.set_status("c1", CourseStatus::Active).await });
        tokio::task::yield_now().await;

        let quick = Duration::from_secs(1);
        assert!(tokio::time::timeout(quick, controller.courses()).await.is_ok());
        assert!(tokio::time::timeout(quick, controller.is_tracked("c1")).await.is_ok());

        let err = controller.set_status("c1", CourseStatus::Active).await.unwrap_err();
        assert!(matches!(err, TelemetryError::TransitionInProgress(id) if id == "c1"));

        // Another course transitions independently.
        controller.set_status("c2", CourseStatus::Active).await.unwrap();
        assert_eq!(first.await.unwrap().unwrap(), CourseStatus::Available);
        assert_eq!(controller.tracked_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_during_start_closes_session() {
        let mut bridge = MockPositioningBridge::new();
        bridge.expect_start().times(1).returning(|_| Ok(()));
        bridge.expect_clear_all().times(1).returning(|| Ok(()));
        bridge.expect_stop().with(eq("c1")).times(1).returning(|_| Ok(()));
        let session = VehicleSession {
            vehicle_number: "V".to_string(),
            credential: Credential::new("token").unwrap(),
        };
        let controller = Arc::new(CourseController::new(
            Arc::new(bridge),
            Arc::new(SlowReporter),
            session,
            GRACE,
        ));
        controller.load_courses(vec![course("c1")]).await;

        let background = controller.clone();
        let first = tokio::spawn(async move { background.set_status("c1", CourseStatus::Active).await });
        tokio::task::yield_now().await;
        controller.clear_all().await;

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, TelemetryError::UnknownCourse(_)));
        assert_eq!(controller.tracked_count().await, 0);
    }

    #[tokio::test]
    async fn test_restore_sessions() {
        let mut bridge = MockPositioningBridge::new();
        bridge
            .expect_start()
            .withf(|req| req.course_id == "active")
            .times(1)
            .returning(|_| Ok(()));
        bridge
            .expect_start()
            .withf(|req| req.course_id == "paused" && req.status == CourseStatus::Paused)
            .times(1)
            .returning(|_| Err(TelemetryError::Bridge("denied".to_string())));
        bridge
            .expect_update_status()
            .with(eq("active"), eq(CourseStatus::Paused))
            .times(1)
            .returning(|_, _| Ok(()));
        let (controller, _) = controller_with(bridge, false);

        let mut active = course("active");
        active.status = CourseStatus::Active;
        let mut paused = course("paused");
        paused.status = CourseStatus::Paused;
        controller.load_courses(vec![active, paused, course("idle")]).await;

        assert_eq!(controller.restore_sessions().await, 1);
        assert_eq!(controller.restore_sessions().await, 0);
        assert!(controller.is_tracked("active").await);
        assert_eq!(controller.course("paused").await.unwrap().status, CourseStatus::Available);

        // Restored session behaves as a resumable one.
        controller.set_status("active", CourseStatus::Paused).await.unwrap();
    }

    #[test]
    fn test_course_deserializes_with_default_status() {
        let course: Course = toml::from_str("id = \"c1\"\nuit = \"U1\"").unwrap();
        assert_eq!(course.status, CourseStatus::Available);
        let course: Course = toml::from_str("id = \"c1\"\nuit = \"U1\"\nstatus = 3").unwrap();
        assert_eq!(course.status, CourseStatus::Paused);
    }
}

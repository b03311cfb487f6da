//! # Tracker Module
//!
//! In-process capture service: the collaborator the course controller
//! commands through [`PositioningBridge`].
//!
//! This module handles:
//! - Capture sessions keyed by course id
//! - The capture tick: one reading and one timestamp shared by every ACTIVE session
//! - Real-time delivery, queueing samples whose transmission fails
//! - Immediate status reports for course transitions ([`StatusReporter`])
//!
//! Stopping a session only affects future ticks; a tick already transmitting
//! runs to completion.

pub mod source;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::coordinate::{CaptureTimestamp, Coordinate};
use crate::course::bridge::{PositioningBridge, StartRequest};
use crate::course::controller::StatusReporter;
use crate::course::status::CourseStatus;
use crate::credential::Credential;
use crate::error::{Result, TelemetryError};
use crate::store::CoordinateStore;
use crate::transmit::Transmitter;
use source::PositionSource;

#[derive(Debug, Clone)]
struct Session {
    vehicle_number: String,
    uit: String,
    credential: Credential,
    status: CourseStatus,
}

/// Periodic capture-and-transmit service.
pub struct Tracker {
    source: Arc<dyn PositionSource>,
    transmitter: Arc<Transmitter>,
    store: Arc<CoordinateStore>,
    capture_interval: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Tracker {
    pub fn new(
        source: Arc<dyn PositionSource>,
        transmitter: Arc<Transmitter>,
        store: Arc<CoordinateStore>,
        capture_interval: Duration,
    ) -> Self {
        Self {
            source,
            transmitter,
            store,
            capture_interval,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Status carried by a course's session, if one is open.
    pub fn session_status(&self, course_id: &str) -> Option<CourseStatus> {
        self.sessions().get(course_id).map(|s| s.status)
    }

    /// Capture and deliver one sample per ACTIVE session.
    ///
    /// Returns the number of coordinates produced.
    pub async fn capture_tick(&self) -> usize {
        let active: Vec<Session> = self
            .sessions()
            .values()
            .filter(|s| s.status == CourseStatus::Active)
            .cloned()
            .collect();
        if active.is_empty() {
            return 0;
        }

        let reading = match self.source.read().await {
            Ok(reading) => reading,
            Err(e) => {
                warn!("No position available this tick: {}", e);
                return 0;
            }
        };
        let timestamp = CaptureTimestamp::now();

        for session in &active {
            let coordinate = Coordinate::capture(
                &session.uit,
                &session.vehicle_number,
                session.status,
                &reading.position,
                &reading.device,
                &timestamp,
            );
            self.deliver(coordinate, &session.credential).await;
        }
        debug!("Captured {} coordinates at {}", active.len(), timestamp.as_str());
        active.len()
    }

    /// Transmit a real-time sample, queueing it on failure.
    async fn deliver(&self, coordinate: Coordinate, credential: &Credential) -> bool {
        let outcome = self.transmitter.transmit(&coordinate, credential).await;
        if !outcome.success {
            self.store.enqueue(coordinate).await;
        }
        outcome.success
    }

    /// Capture loop; returns when `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.capture_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Capturing every {:?}", self.capture_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.capture_tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Capture loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PositioningBridge for Tracker {
    async fn start(&self, request: StartRequest) -> Result<()> {
        let mut sessions = self.sessions();
        if sessions.contains_key(&request.course_id) {
            return Err(TelemetryError::Bridge(format!(
                "course {} already has a capture session",
                request.course_id
            )));
        }
        info!("Starting capture for course {} ({})", request.course_id, request.uit);
        sessions.insert(
            request.course_id,
            Session {
                vehicle_number: request.vehicle_number,
                uit: request.uit,
                credential: request.credential,
                status: request.status,
            },
        );
        Ok(())
    }

    async fn stop(&self, course_id: &str) -> Result<()> {
        match self.sessions().remove(course_id) {
            Some(_) => {
                info!("Stopped capture for course {}", course_id);
                Ok(())
            }
            None => Err(TelemetryError::Bridge(format!(
                "no capture session for course {}",
                course_id
            ))),
        }
    }

    async fn update_status(&self, course_id: &str, status: CourseStatus) -> Result<()> {
        match self.sessions().get_mut(course_id) {
            Some(session) => {
                session.status = status;
                debug!("Capture session {} now {}", course_id, status);
                Ok(())
            }
            None => Err(TelemetryError::Bridge(format!(
                "no capture session for course {}",
                course_id
            ))),
        }
    }

    async fn clear_all(&self) -> Result<()> {
        let mut sessions = self.sessions();
        if !sessions.is_empty() {
            info!("Stopping {} capture sessions", sessions.len());
        }
        sessions.clear();
        Ok(())
    }
}

#[async_trait]
impl StatusReporter for Tracker {
    async fn report_status(
        &self,
        uit: &str,
        vehicle_number: &str,
        status: CourseStatus,
        credential: &Credential,
    ) -> Result<()> {
        let reading = self.source.read().await?;
        let coordinate = Coordinate::capture(
            uit,
            vehicle_number,
            status,
            &reading.position,
            &reading.device,
            &CaptureTimestamp::now(),
        );
        if self.deliver(coordinate, credential).await {
            Ok(())
        } else {
            Err(TelemetryError::Transport(format!(
                "status {} for {} not delivered, queued",
                status, uit
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::source::Reading;
    use super::*;
    use crate::coordinate::fixtures::position;
    use crate::coordinate::DeviceReading;
    use crate::course::controller::{Course, CourseController, VehicleSession};
    use crate::network::NetworkOracle;
    use crate::store::kv::MemoryKeyValueStore;
    use crate::sync::{SyncEngine, SyncSettings};
    use crate::transmit::mocks::{MockTransport, Reply};

    struct FixedSource;

    #[async_trait]
    impl PositionSource for FixedSource {
        async fn read(&self) -> Result<Reading> {
            Ok(Reading {
                position: position(),
                device: DeviceReading {
                    battery_pct: 70,
                    signal_level: 2,
                },
            })
        }
    }

    struct Harness {
        tracker: Arc<Tracker>,
        store: Arc<CoordinateStore>,
        oracle: Arc<NetworkOracle>,
        transmitter: Arc<Transmitter>,
        transport: MockTransport,
    }

    fn harness() -> Harness {
        let store = Arc::new(CoordinateStore::new(Arc::new(MemoryKeyValueStore::new())));
        let oracle = Arc::new(NetworkOracle::new(3));
        let transport = MockTransport::new();
        let transmitter = Arc::new(Transmitter::new(
            Arc::new(transport.clone()),
            oracle.clone(),
            Duration::from_secs(10),
        ));
        let tracker = Arc::new(Tracker::new(
            Arc::new(FixedSource),
            transmitter.clone(),
            store.clone(),
            Duration::from_secs(10),
        ));
        Harness {
            tracker,
            store,
            oracle,
            transmitter,
            transport,
        }
    }

    fn credential() -> Credential {
        Credential::new("token").unwrap()
    }

    fn start_request(course_id: &str) -> StartRequest {
        StartRequest {
            course_id: course_id.to_string(),
            vehicle_number: "B-123-XYZ".to_string(),
            uit: format!("UIT-{}", course_id),
            credential: credential(),
            status: CourseStatus::Active,
        }
    }

    #[tokio::test]
    async fn test_no_sessions_no_capture() {
        let h = harness();
        assert_eq!(h.tracker.capture_tick().await, 0);
        assert_eq!(h.transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_active_sessions_share_timestamp() {
        let h = harness();
        h.tracker.start(start_request("c1")).await.unwrap();
        h.tracker.start(start_request("c2")).await.unwrap();
        h.tracker.start(start_request("c3")).await.unwrap();
        h.tracker.update_status("c3", CourseStatus::Paused).await.unwrap();

        assert_eq!(h.tracker.capture_tick().await, 2);

        let requests = h.transport.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].2, requests[1].2);
        let mut uits: Vec<_> = requests.iter().map(|r| r.0.clone()).collect();
        uits.sort();
        assert_eq!(uits, vec!["UIT-c1", "UIT-c2"]);
        assert!(requests.iter().all(|r| r.1 == CourseStatus::Active.code()));
    }

    #[tokio::test]
    async fn test_failed_capture_is_queued_once() {
        let h = harness();
        h.transport.set_default(Reply::NoResponse);
        h.tracker.start(start_request("c1")).await.unwrap();

        h.tracker.capture_tick().await;
        let queue = h.store.all().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].attempts(), 0);
        assert_eq!(queue[0].uit(), "UIT-c1");
    }

    #[tokio::test]
    async fn test_bridge_commands() {
        let h = harness();
        h.tracker.start(start_request("c1")).await.unwrap();
        assert!(h.tracker.start(start_request("c1")).await.is_err());
        assert_eq!(h.tracker.session_status("c1"), Some(CourseStatus::Active));

        h.tracker.update_status("c1", CourseStatus::Paused).await.unwrap();
        assert_eq!(h.tracker.session_status("c1"), Some(CourseStatus::Paused));
        assert!(h.tracker.update_status("zz", CourseStatus::Active).await.is_err());

        h.tracker.stop("c1").await.unwrap();
        assert!(h.tracker.stop("c1").await.is_err());

        h.tracker.start(start_request("c2")).await.unwrap();
        h.tracker.clear_all().await.unwrap();
        h.tracker.clear_all().await.unwrap();
        assert_eq!(h.tracker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_status_report_failure_is_queued() {
        let h = harness();
        h.transport.set_default(Reply::Status(502, ""));
        let result = h
            .tracker
            .report_status("UIT-1", "V", CourseStatus::Paused, &credential())
            .await;
        assert!(result.is_err());
        let queue = h.store.all().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].status(), CourseStatus::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_mid_course_then_drain() {
        let h = harness();
        let sync = Arc::new(SyncEngine::new(
            h.store.clone(),
            h.transmitter.clone(),
            SyncSettings {
                check_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sync_task = tokio::spawn(sync.clone().run(credential(), shutdown_rx));

        h.tracker.start(start_request("c1")).await.unwrap();
        h.transport.set_default(Reply::NoResponse);
        for tick in 1..=4 {
            h.tracker.capture_tick().await;
            assert_eq!(h.store.count().await, tick);
        }
        assert!(!h.oracle.is_online());

        // Connectivity returns: the next real-time sample goes through.
        h.transport.set_default(Reply::Status(200, ""));
        h.tracker.capture_tick().await;
        assert!(h.oracle.is_online());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.store.count().await, 0);
        assert_eq!(sync.stats().await.total_synced, 4);
        assert_eq!(h.transport.request_count(), 4 + 1 + 4);

        shutdown_tx.send(true).unwrap();
        sync_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_with_transmission_in_flight() {
        let h = harness();
        let session = VehicleSession {
            vehicle_number: "B-123-XYZ".to_string(),
            credential: credential(),
        };
        let grace = Duration::from_secs(5);
        let controller = CourseController::new(h.tracker.clone(), h.tracker.clone(), session, grace);
        controller
            .load_courses(vec![Course {
                id: "c1".to_string(),
                uit: "UIT-c1".to_string(),
                status: CourseStatus::Available,
            }])
            .await;
        controller.set_status("c1", CourseStatus::Active).await.unwrap();
        assert_eq!(h.transport.request_count(), 1);

        // The in-flight tick sample fails; the finish report succeeds.
        h.transport.push([Reply::NoResponse, Reply::Status(200, "")]);
        h.transport.set_delay(Duration::from_secs(2));

        let tracker = h.tracker.clone();
        let tick = tokio::spawn(async move { tracker.capture_tick().await });
        tokio::task::yield_now().await;

        controller.set_status("c1", CourseStatus::Finished).await.unwrap();
        assert!(controller.is_tracked("c1").await);
        assert_eq!(h.tracker.session_count(), 0);

        assert_eq!(tick.await.unwrap(), 1);
        let queue = h.store.all().await;
        assert_eq!(queue.len(), 1, "in-flight sample must be queued, not dropped");
        assert_eq!(queue[0].status(), CourseStatus::Active);

        let statuses: Vec<u8> = h.transport.requests.lock().unwrap().iter().map(|r| r.1).collect();
        assert_eq!(statuses, vec![2, 2, 4]);

        tokio::time::sleep(grace + Duration::from_secs(1)).await;
        assert!(!controller.is_tracked("c1").await);
        assert_eq!(h.tracker.capture_tick().await, 0);
    }
}

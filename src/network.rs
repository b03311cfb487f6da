//! # Network Status Module
//!
//! Infers online/offline state from transmission outcomes instead of the
//! operating system's connectivity flag.
//!
//! ## State Rules
//!
//! - Any success resets the failure counter and, if offline, flips to online.
//! - `failure_threshold` consecutive failures (default 3) flip to offline.
//! - Failures with an HTTP status and failures without one count the same.
//!
//! A background probe ([`NetworkOracle::run_probe`]) checks reachability on a
//! fixed interval whenever nothing has succeeded within that interval, so
//! recovery is noticed even while no course is producing telemetry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Snapshot of the inferred network state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
    pub is_online: bool,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Lightweight reachability check against the collector.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Returns the HTTP status obtained, or an error if no response arrived.
    async fn probe(&self) -> Result<u16>;
}

/// Probe loop timing.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug)]
struct Inner {
    state: NetworkState,
    last_success: Option<Instant>,
}

/// Process-wide online/offline oracle.
#[derive(Debug)]
pub struct NetworkOracle {
    failure_threshold: u32,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<bool>,
}

impl NetworkOracle {
    /// Creates an oracle that starts online.
    pub fn new(failure_threshold: u32) -> Self {
        let (status_tx, _) = watch::channel(true);
        Self {
            failure_threshold: failure_threshold.max(1),
            inner: Mutex::new(Inner {
                state: NetworkState {
                    is_online: true,
                    consecutive_failures: 0,
                    last_success_at: None,
                },
                last_success: None,
            }),
            status_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a delivered request.
    pub fn report_success(&self) {
        let mut inner = self.lock();
        inner.state.consecutive_failures = 0;
        inner.state.last_success_at = Some(Utc::now());
        inner.last_success = Some(Instant::now());

        if !inner.state.is_online {
            inner.state.is_online = true;
            drop(inner);
            info!("Collector reachable again, network is online");
            self.status_tx.send_replace(true);
        }
    }

    /// Record a failed request, with the HTTP status if one was received.
    pub fn report_failure(&self, http_status: Option<u16>) {
        let mut inner = self.lock();
        inner.state.consecutive_failures = inner.state.consecutive_failures.saturating_add(1);
        let failures = inner.state.consecutive_failures;

        match http_status {
            Some(status) => debug!("Transmission rejected with HTTP {} ({} in a row)", status, failures),
            None => debug!("Transmission got no response ({} in a row)", failures),
        }

        if inner.state.is_online && failures >= self.failure_threshold {
            inner.state.is_online = false;
            drop(inner);
            warn!("{} consecutive transmission failures, network is offline", failures);
            self.status_tx.send_replace(false);
        }
    }

    pub fn is_online(&self) -> bool {
        self.lock().state.is_online
    }

    pub fn state(&self) -> NetworkState {
        self.lock().state.clone()
    }

    /// Receiver that observes every online/offline change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.status_tx.subscribe()
    }

    /// Invoke `callback` with the new status on every change.
    ///
    /// The callback runs on a spawned task, which ends when the oracle is dropped.
    pub fn on_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(bool) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                callback(online);
            }
        })
    }

    /// True when nothing has succeeded within `window`.
    pub fn needs_probe(&self, window: Duration) -> bool {
        match self.lock().last_success {
            Some(at) => at.elapsed() >= window,
            None => true,
        }
    }

    /// Runs one probe and feeds the outcome back into the oracle.
    pub async fn probe_once(&self, probe: &dyn ReachabilityProbe, limit: Duration) -> bool {
        match timeout(limit, probe.probe()).await {
            Ok(Ok(status)) if (200..300).contains(&status) => {
                self.report_success();
                true
            }
            Ok(Ok(status)) => {
                self.report_failure(Some(status));
                false
            }
            Ok(Err(e)) => {
                debug!("Reachability probe failed: {}", e);
                self.report_failure(None);
                false
            }
            Err(_) => {
                debug!("Reachability probe timed out after {:?}", limit);
                self.report_failure(None);
                false
            }
        }
    }

    /// Periodic probe loop; returns when `shutdown` turns true.
    pub async fn run_probe(
        self: Arc<Self>,
        probe: Arc<dyn ReachabilityProbe>,
        settings: ProbeSettings,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup is not a reason to probe.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.needs_probe(settings.interval) {
                        self.probe_once(probe.as_ref(), settings.timeout).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Probe loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

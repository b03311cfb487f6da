//! # Offline Sync Module
//!
//! Drains the coordinate store through the transmitter.
//!
//! ## Sync Pass
//!
//! 1. Refuse to start while offline or while another pass is running
//! 2. Read the whole queue and split it into `batch_size` batches
//! 3. Transmit each coordinate once, oldest first
//!    - success: remove from the store, count as synced
//!    - failure: increment `attempts` in place; at `max_attempts` evict and
//!      count as a sync error
//! 4. Pause `batch_pause` between batches
//!
//! ## Triggers
//!
//! [`SyncEngine::run`] starts a pass when the oracle flips to online, on every
//! `check_interval` tick while online, and once at startup, each only if the
//! queue is non-empty. Manual requests call [`SyncEngine::sync`] directly.
//! Every trigger goes through the same guard.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::credential::Credential;
use crate::network::NetworkOracle;
use crate::store::CoordinateStore;
use crate::transmit::Transmitter;

/// Sync pass tuning.
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub batch_pause: Duration,
    /// Retry ceiling; a coordinate is evicted once it has failed this often.
    pub max_attempts: u32,
    pub check_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_pause: Duration::from_secs(1),
            max_attempts: 3,
            check_interval: Duration::from_secs(120),
        }
    }
}

/// Counts for one completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    /// Failed attempts this pass, evictions included.
    pub failed: usize,
    /// Coordinates evicted at the retry ceiling this pass.
    pub evicted: usize,
    pub total: usize,
}

/// Result of a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass holds the guard; nothing was done.
    AlreadyRunning,
    /// The oracle reports offline; nothing was done.
    Offline,
}

/// Aggregate sync statistics, recomputable from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub total_offline: usize,
    pub total_synced: u64,
    pub sync_errors: u64,
    pub sync_in_progress: bool,
    pub current_batch: usize,
    pub total_batches: usize,
    pub last_sync_attempt: Option<DateTime<Utc>>,
}

impl SyncStats {
    /// Non-blocking status line for the operator.
    ///
    /// # Examples
    ///
    /// ```
    /// use course_telemetry::sync::SyncStats;
    ///
    /// let stats = SyncStats { total_offline: 4, ..Default::default() };
    /// assert_eq!(stats.summary(false), "Offline — 4 coordinates pending");
    /// assert_eq!(SyncStats::default().summary(true), "All synced");
    /// ```
    pub fn summary(&self, online: bool) -> String {
        if self.sync_in_progress {
            format!("Syncing… (batch {}/{})", self.current_batch, self.total_batches)
        } else if !online {
            format!("Offline — {} coordinates pending", self.total_offline)
        } else if self.total_offline > 0 {
            format!("{} coordinates pending", self.total_offline)
        } else {
            "All synced".to_string()
        }
    }
}

/// Clears the in-progress flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the queue lifecycle after enqueue.
pub struct SyncEngine {
    store: Arc<CoordinateStore>,
    transmitter: Arc<Transmitter>,
    settings: SyncSettings,
    in_progress: AtomicBool,
    progress: watch::Sender<SyncStats>,
}

impl SyncEngine {
    pub fn new(store: Arc<CoordinateStore>, transmitter: Arc<Transmitter>, settings: SyncSettings) -> Self {
        let (progress, _) = watch::channel(SyncStats::default());
        Self {
            store,
            transmitter,
            settings: SyncSettings {
                batch_size: settings.batch_size.max(1),
                max_attempts: settings.max_attempts.max(1),
                ..settings
            },
            in_progress: AtomicBool::new(false),
            progress,
        }
    }

    fn oracle(&self) -> &Arc<NetworkOracle> {
        self.transmitter.oracle()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Receiver updated at the start and end of every batch.
    pub fn subscribe_progress(&self) -> watch::Receiver<SyncStats> {
        self.progress.subscribe()
    }

    /// Current statistics, rebuilt from the store.
    pub async fn stats(&self) -> SyncStats {
        let cumulative = self.store.load_stats().await;
        let progress = self.progress.borrow().clone();
        let syncing = self.is_syncing();
        SyncStats {
            total_offline: self.store.count().await,
            total_synced: cumulative.total_synced,
            sync_errors: cumulative.sync_errors,
            sync_in_progress: syncing,
            current_batch: if syncing { progress.current_batch } else { 0 },
            total_batches: if syncing { progress.total_batches } else { 0 },
            last_sync_attempt: cumulative.last_sync_attempt,
        }
    }

    /// One guarded sync pass.
    pub async fn sync(&self, credential: &Credential) -> SyncOutcome {
        if !self.oracle().is_online() {
            debug!("Skipping sync, network is offline");
            return SyncOutcome::Offline;
        }
        let Some(_guard) = PassGuard::acquire(&self.in_progress) else {
            debug!("Skipping sync, a pass is already running");
            return SyncOutcome::AlreadyRunning;
        };

        let queue = self.store.all().await;
        let mut report = SyncReport {
            total: queue.len(),
            ..Default::default()
        };
        if queue.is_empty() {
            return SyncOutcome::Completed(report);
        }

        let batches: Vec<_> = queue.chunks(self.settings.batch_size).collect();
        let total_batches = batches.len();
        let mut cumulative = self.store.load_stats().await;
        cumulative.last_sync_attempt = Some(Utc::now());

        info!(
            "Syncing {} queued coordinates in {} batches of up to {}",
            report.total, total_batches, self.settings.batch_size
        );

        for (index, batch) in batches.into_iter().enumerate() {
            self.publish(SyncStats {
                total_offline: report.total - report.synced - report.evicted,
                total_synced: cumulative.total_synced,
                sync_errors: cumulative.sync_errors,
                sync_in_progress: true,
                current_batch: index + 1,
                total_batches,
                last_sync_attempt: cumulative.last_sync_attempt,
            });

            for coordinate in batch {
                let outcome = self.transmitter.transmit(coordinate, credential).await;
                if outcome.success {
                    self.store.remove_by_id(coordinate.id()).await;
                    report.synced += 1;
                    cumulative.total_synced += 1;
                    continue;
                }

                report.failed += 1;
                match self.store.increment_attempt(coordinate.id()).await {
                    Some(attempts) if attempts >= self.settings.max_attempts => {
                        self.store.remove_by_id(coordinate.id()).await;
                        report.evicted += 1;
                        cumulative.sync_errors += 1;
                        warn!(
                            "Dropping coordinate {} (uit {}) after {} failed attempts",
                            coordinate.id(),
                            coordinate.uit(),
                            attempts
                        );
                    }
                    Some(attempts) => debug!(
                        "Coordinate {} failed attempt {}/{}",
                        coordinate.id(),
                        attempts,
                        self.settings.max_attempts
                    ),
                    None => debug!("Coordinate {} left the queue during sync", coordinate.id()),
                }
            }

            self.store.save_stats(&cumulative).await;

            if index + 1 < total_batches {
                sleep(self.settings.batch_pause).await;
            }
        }

        info!(
            "Sync finished: {} synced, {} failed ({} dropped) of {}",
            report.synced, report.failed, report.evicted, report.total
        );
        self.publish(SyncStats {
            total_offline: report.total - report.synced - report.evicted,
            total_synced: cumulative.total_synced,
            sync_errors: cumulative.sync_errors,
            sync_in_progress: false,
            current_batch: 0,
            total_batches: 0,
            last_sync_attempt: cumulative.last_sync_attempt,
        });

        SyncOutcome::Completed(report)
    }

    fn publish(&self, stats: SyncStats) {
        self.progress.send_replace(stats);
    }

    /// Start a pass in the background if online and the queue is non-empty.
    async fn trigger(self: &Arc<Self>, credential: &Credential, reason: &str) {
        if !self.oracle().is_online() || self.is_syncing() {
            return;
        }
        let pending = self.store.count().await;
        if pending == 0 {
            return;
        }
        debug!("Sync triggered ({}), {} coordinates pending", reason, pending);

        let engine = Arc::clone(self);
        let credential = credential.clone();
        tokio::spawn(async move {
            engine.sync(&credential).await;
        });
    }

    /// Trigger loop; returns when `shutdown` turns true.
    pub async fn run(self: Arc<Self>, credential: Credential, mut shutdown: watch::Receiver<bool>) {
        let mut status_rx = self.oracle().subscribe();
        let mut ticker = interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *status_rx.borrow_and_update();
                    if online {
                        self.trigger(&credential, "reconnect").await;
                    }
                }
                _ = ticker.tick() => {
                    self.trigger(&credential, "periodic").await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Sync loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

//! # Coordinate Store Module
//!
//! Durable queue of coordinates that could not be delivered, plus the
//! cumulative sync counters.
//!
//! This module handles:
//! - Persisting the whole queue as one JSON collection under [`QUEUE_KEY`]
//! - Persisting cumulative sync counters under [`STATS_KEY`]
//! - FIFO batch reads, in-place attempt bookkeeping and removal by id
//!
//! Persistence failures never propagate. Reads degrade to an empty queue and
//! failed writes are logged, the next successful write reconciling state.
//! A mutation never writes over a queue it could not read. Coordinates that
//! could not be persisted are held in memory and merged back on the next
//! successful write. An unparseable collection is copied to
//! [`CORRUPT_QUEUE_KEY`] before it is replaced.

pub mod kv;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::coordinate::Coordinate;
use kv::KeyValueStore;

/// Key of the queued coordinate collection.
pub const QUEUE_KEY: &str = "offline_coordinates";

/// Where an unparseable queue collection is kept for inspection.
pub const CORRUPT_QUEUE_KEY: &str = "offline_coordinates_corrupt";

/// Key of the cumulative sync counters.
pub const STATS_KEY: &str = "sync_stats";

/// Cumulative counters persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CumulativeStats {
    #[serde(default)]
    pub total_synced: u64,
    #[serde(default)]
    pub sync_errors: u64,
    #[serde(default)]
    pub last_sync_attempt: Option<DateTime<Utc>>,
}

/// Durable FIFO of undelivered coordinates.
pub struct CoordinateStore {
    backend: Arc<dyn KeyValueStore>,
    /// Coordinates queued while the backend could not be read, oldest first.
    /// The lock also serializes read-modify-write cycles on the queue.
    unsaved: Mutex<Vec<Coordinate>>,
}

impl std::fmt::Debug for CoordinateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinateStore").finish_non_exhaustive()
    }
}

impl CoordinateStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            unsaved: Mutex::new(Vec::new()),
        }
    }

    /// Append a coordinate whose real-time transmission failed.
    pub async fn enqueue(&self, coordinate: Coordinate) {
        self.mutate(|queue| {
            debug!(
                "Queueing coordinate {} for {} ({} already pending)",
                coordinate.id(),
                coordinate.uit(),
                queue.len()
            );
            queue.push(coordinate);
            true
        })
        .await;
    }

    /// The oldest `max_size` queued coordinates, in enqueue order.
    ///
    /// Entries stay in the store until [`remove_by_id`](Self::remove_by_id).
    pub async fn dequeue_batch(&self, max_size: usize) -> Vec<Coordinate> {
        let mut queue = self.all().await;
        queue.truncate(max_size);
        queue
    }

    /// Every queued coordinate, in enqueue order.
    pub async fn all(&self) -> Vec<Coordinate> {
        let unsaved = self.unsaved.lock().await;
        let mut queue: Vec<Coordinate> = self.read_json(QUEUE_KEY).await.unwrap_or_default();
        queue.extend(unsaved.iter().cloned());
        queue
    }

    /// Delete a coordinate. Returns false if it was not queued.
    pub async fn remove_by_id(&self, id: Uuid) -> bool {
        self.mutate(|queue| {
            let before = queue.len();
            queue.retain(|c| c.id() != id);
            queue.len() != before
        })
        .await
    }

    /// Record a failed delivery attempt in place.
    ///
    /// Returns the new attempt count, or `None` if the id is not queued.
    pub async fn increment_attempt(&self, id: Uuid) -> Option<u32> {
        let mut attempts = None;
        self.mutate(|queue| {
            attempts = queue.iter_mut().find(|c| c.id() == id).map(|c| {
                c.record_attempt(Utc::now());
                c.attempts()
            });
            attempts.is_some()
        })
        .await;
        attempts
    }

    pub async fn count(&self) -> usize {
        self.all().await.len()
    }

    /// Drop every queued coordinate.
    pub async fn clear(&self) {
        let mut unsaved = self.unsaved.lock().await;
        unsaved.clear();
        if let Err(e) = self.backend.remove(QUEUE_KEY).await {
            error!("Failed to clear coordinate queue: {}", e);
        }
    }

    /// Coordinates currently held in memory because the backend was unreadable.
    pub async fn unsaved_count(&self) -> usize {
        self.unsaved.lock().await.len()
    }

    /// Cumulative counters, default when missing or unreadable.
    pub async fn load_stats(&self) -> CumulativeStats {
        self.read_json(STATS_KEY).await.unwrap_or_default()
    }

    pub async fn save_stats(&self, stats: &CumulativeStats) {
        self.write_json(STATS_KEY, stats).await;
    }

    /// Apply `change` to the queue; `change` returns whether anything changed.
    ///
    /// With a readable backend the in-memory backlog is merged in first and
    /// the result is written back. Otherwise only the backlog is changed and
    /// nothing is written.
    async fn mutate<F>(&self, change: F) -> bool
    where
        F: FnOnce(&mut Vec<Coordinate>) -> bool,
    {
        let mut unsaved = self.unsaved.lock().await;
        match self.load_queue().await {
            Some(mut queue) => {
                let persisted: HashSet<Uuid> = queue.iter().map(Coordinate::id).collect();
                let merged = !unsaved.is_empty();
                if merged {
                    debug!("Merging {} coordinates held in memory", unsaved.len());
                    queue.append(&mut unsaved);
                }
                let changed = change(&mut queue);
                if (changed || merged) && !self.write_queue(&queue).await {
                    // Entries already on disk stay there; keep the rest.
                    unsaved.extend(queue.into_iter().filter(|c| !persisted.contains(&c.id())));
                }
                changed
            }
            None => change(&mut unsaved),
        }
    }

    /// Read the persisted queue for modification.
    ///
    /// `None` means the stored collection must not be overwritten.
    async fn load_queue(&self) -> Option<Vec<Coordinate>> {
        let raw = match self.backend.get(QUEUE_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Some(Vec::new()),
            Err(e) => {
                warn!("Failed to read {}, holding changes in memory: {}", QUEUE_KEY, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(queue) => Some(queue),
            Err(e) => {
                warn!("Unreadable {} ({}), moving it to {}", QUEUE_KEY, e, CORRUPT_QUEUE_KEY);
                match self.backend.set(CORRUPT_QUEUE_KEY, raw).await {
                    Ok(()) => Some(Vec::new()),
                    Err(e) => {
                        error!("Failed to preserve unreadable {}: {}", QUEUE_KEY, e);
                        None
                    }
                }
            }
        }
    }

    /// Returns false if the queue could not be persisted.
    async fn write_queue(&self, queue: &[Coordinate]) -> bool {
        if queue.is_empty() {
            return match self.backend.remove(QUEUE_KEY).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to persist empty coordinate queue: {}", e);
                    false
                }
            };
        }
        self.write_json(QUEUE_KEY, &queue).await
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read {}, treating as empty: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", key, e);
                None
            }
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                error!("Failed to serialize {}: {}", key, e);
                return false;
            }
        };
        match self.backend.set(key, raw).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to persist {}: {}", key, e);
                false
            }
        }
    }
}

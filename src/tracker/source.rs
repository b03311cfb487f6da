//! Position sources feeding the capture loop.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

use crate::coordinate::{DeviceReading, PositionReading};
use crate::error::{Result, TelemetryError};

/// One reading of position and device state.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub position: PositionReading,
    pub device: DeviceReading,
}

/// Trait for the on-device positioning subsystem.
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Current position, battery and signal.
    async fn read(&self) -> Result<Reading>;
}

/// A replay file line: position fields plus optional device fields.
#[derive(Debug, Deserialize)]
struct ReplayLine {
    #[serde(flatten)]
    position: PositionReading,
    #[serde(default)]
    battery_pct: Option<u8>,
    #[serde(default)]
    signal_level: Option<u8>,
}

/// Replays JSON-lines readings from a file, wrapping around at the end.
///
/// Each line is a JSON object such as:
///
/// ```text
/// {"latitude":44.4267,"longitude":26.1025,"speed_kmh":42.0,"heading_deg":90.0,"altitude_m":80.0,"accuracy_m":3.0,"battery_pct":88,"signal_level":4}
/// ```
#[derive(Debug)]
pub struct ReplayPositionSource {
    readings: Vec<Reading>,
    cursor: AtomicUsize,
}

impl ReplayPositionSource {
    /// Load readings from `path`. Blank lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, a line is not a valid
    /// reading, or the file holds no readings at all.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let source = Self::parse(&contents)?;
        debug!(
            "Loaded {} replay readings from {}",
            source.readings.len(),
            path.as_ref().display()
        );
        Ok(source)
    }

    /// Parse JSON-lines content.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut readings = Vec::new();
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let parsed: ReplayLine = serde_json::from_str(line)?;
            let defaults = DeviceReading::default();
            readings.push(Reading {
                position: parsed.position,
                device: DeviceReading {
                    battery_pct: parsed.battery_pct.unwrap_or(defaults.battery_pct),
                    signal_level: parsed.signal_level.unwrap_or(defaults.signal_level),
                },
            });
        }
        if readings.is_empty() {
            return Err(TelemetryError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "replay file contains no readings",
            )));
        }
        Ok(Self {
            readings,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[async_trait]
impl PositionSource for ReplayPositionSource {
    async fn read(&self) -> Result<Reading> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.readings.len();
        if index == 0 && self.cursor.load(Ordering::Relaxed) > 1 {
            warn!("Replay wrapped around to the first reading");
        }
        Ok(self.readings[index].clone())
    }
}

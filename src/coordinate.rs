//! # Coordinate Module
//!
//! GPS samples destined for the remote collector.
//!
//! This module handles:
//! - Readings consumed from the positioning subsystem ([`PositionReading`], [`DeviceReading`])
//! - The shared per-tick capture timestamp ([`CaptureTimestamp`])
//! - The queued sample itself ([`Coordinate`]) and its retry bookkeeping
//! - The outbound wire object ([`TelemetryPayload`])
//!
//! ## Wire Format
//!
//! ```json
//! {
//!   "lat": 44.4267674, "lng": 26.1025384, "timestamp": "2026-03-14 09:21:07",
//!   "viteza": 54.0, "directie": 182.5, "altitudine": 81.0, "baterie": 87,
//!   "numar_inmatriculare": "B-123-XYZ", "uit": "UIT0001", "status": 2,
//!   "hdop": 4.0, "gsm_signal": 4
//! }
//! ```

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::course::status::CourseStatus;

/// Timestamp format expected by the collector.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Highest categorical cellular signal level.
pub const MAX_SIGNAL_LEVEL: u8 = 5;

/// Highest battery percentage.
pub const MAX_BATTERY_PCT: u8 = 100;

/// Rounds a latitude or longitude to 7 decimal places (~1cm).
#[inline]
#[must_use]
pub fn round_degrees(value: f64) -> f64 {
    (value * 1e7).round() / 1e7
}

/// Replaces NaN and infinities with 0.0; JSON cannot carry them.
#[inline]
fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// One reading from the positioning subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReading {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed_kmh: f64,
    #[serde(default)]
    pub heading_deg: f64,
    #[serde(default)]
    pub altitude_m: f64,
    /// Horizontal accuracy reported by the receiver, in meters.
    #[serde(default)]
    pub accuracy_m: f64,
}

/// Battery and cellular signal reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub battery_pct: u8,
    pub signal_level: u8,
}

impl Default for DeviceReading {
    fn default() -> Self {
        Self {
            battery_pct: MAX_BATTERY_PCT,
            signal_level: 0,
        }
    }
}

/// Capture time shared by every coordinate of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTimestamp(String);

impl CaptureTimestamp {
    /// Current local time in collector format.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    /// Formats an arbitrary date-time.
    #[must_use]
    pub fn from_datetime<Tz: TimeZone>(at: &DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        Self(at.format(TIMESTAMP_FORMAT).to_string())
    }

    /// Parses a collector-format string.
    pub fn parse(raw: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
            .ok()
            .map(|_| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One GPS sample with kinematics and course context.
///
/// Only `attempts` and `last_attempt_at` change after creation; every other
/// field is private and read through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    id: Uuid,
    uit: String,
    vehicle_number: String,
    lat: f64,
    lng: f64,
    speed_kmh: f64,
    heading_deg: f64,
    altitude_m: f64,
    hdop: f64,
    signal_level: u8,
    battery_pct: u8,
    status: CourseStatus,
    timestamp: String,
    #[serde(default)]
    attempts: u32,
    #[serde(default)]
    last_attempt_at: Option<DateTime<Utc>>,
}

impl Coordinate {
    /// Builds a fresh sample for one course from the tick's readings.
    ///
    /// Latitude and longitude are rounded to 7 decimals; battery and signal
    /// are clamped to their ranges.
    ///
    /// # Examples
    ///
    /// ```
    /// use course_telemetry::coordinate::{CaptureTimestamp, Coordinate, DeviceReading, PositionReading};
    /// use course_telemetry::course::status::CourseStatus;
    ///
    /// let position = PositionReading {
    ///     latitude: 44.426767412345,
    ///     longitude: 26.10253849,
    ///     speed_kmh: 50.0,
    ///     heading_deg: 90.0,
    ///     altitude_m: 80.0,
    ///     accuracy_m: 3.5,
    /// };
    /// let ts = CaptureTimestamp::parse("2026-03-14 09:21:07").unwrap();
    /// let c = Coordinate::capture("UIT1", "B-01-ABC", CourseStatus::Active, &position, &DeviceReading::default(), &ts);
    /// assert_eq!(c.lat(), 44.4267674);
    /// assert_eq!(c.attempts(), 0);
    /// ```
    #[must_use]
    pub fn capture(
        uit: &str,
        vehicle_number: &str,
        status: CourseStatus,
        position: &PositionReading,
        device: &DeviceReading,
        timestamp: &CaptureTimestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            uit: uit.to_string(),
            vehicle_number: vehicle_number.to_string(),
            lat: round_degrees(finite_or_zero(position.latitude)),
            lng: round_degrees(finite_or_zero(position.longitude)),
            speed_kmh: finite_or_zero(position.speed_kmh).max(0.0),
            heading_deg: finite_or_zero(position.heading_deg),
            altitude_m: finite_or_zero(position.altitude_m),
            hdop: finite_or_zero(position.accuracy_m).max(0.0),
            signal_level: device.signal_level.min(MAX_SIGNAL_LEVEL),
            battery_pct: device.battery_pct.min(MAX_BATTERY_PCT),
            status,
            timestamp: timestamp.as_str().to_string(),
            attempts: 0,
            last_attempt_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn uit(&self) -> &str {
        &self.uit
    }

    pub fn vehicle_number(&self) -> &str {
        &self.vehicle_number
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lng(&self) -> f64 {
        self.lng
    }

    pub fn status(&self) -> CourseStatus {
        self.status
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Number of failed resync attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.last_attempt_at
    }

    /// Records one more failed delivery attempt.
    pub(crate) fn record_attempt(&mut self, at: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_at = Some(at);
    }

    /// Borrowed wire representation of this sample.
    #[must_use]
    pub fn payload(&self) -> TelemetryPayload<'_> {
        TelemetryPayload {
            lat: self.lat,
            lng: self.lng,
            timestamp: &self.timestamp,
            viteza: self.speed_kmh,
            directie: self.heading_deg,
            altitudine: self.altitude_m,
            baterie: self.battery_pct,
            numar_inmatriculare: &self.vehicle_number,
            uit: &self.uit,
            status: self.status.code(),
            hdop: self.hdop,
            gsm_signal: self.signal_level,
        }
    }
}

/// Outbound telemetry object, one per coordinate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryPayload<'a> {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: &'a str,
    /// Speed in km/h.
    pub viteza: f64,
    /// Heading in degrees.
    pub directie: f64,
    /// Altitude in meters.
    pub altitudine: f64,
    /// Battery percentage.
    pub baterie: u8,
    /// Vehicle registration number.
    pub numar_inmatriculare: &'a str,
    pub uit: &'a str,
    pub status: u8,
    pub hdop: f64,
    pub gsm_signal: u8,
}

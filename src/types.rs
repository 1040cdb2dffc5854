use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::{error::Result, live_data::LiveFields};

/// Serial link status as seen by hub consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkStatus {
    /// No console has been opened yet
    #[default]
    Connecting,
    /// Console is answering requests
    Connected,
    /// Console disconnected; telemetry merges are paused
    Lost,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Lost => write!(f, "Lost"),
        }
    }
}

/// Producer classes that may write into the hub
///
/// Each class owns a disjoint set of fields; see [`crate::hub::StateUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriterClass {
    /// Serial ingestion path: rower telemetry, workout and link fields
    Rower,
    /// Heart-rate fusion: heart rate and RR fields
    HeartRate,
}

impl fmt::Display for WriterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rower => write!(f, "rower"),
            Self::HeartRate => write!(f, "heart-rate"),
        }
    }
}

/// Type of workout programmed on the console
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkoutKind {
    /// Fixed distance (single or interval)
    Distance,
    /// Fixed duration (single or interval)
    Duration,
    /// Open rowing without a programmed target
    JustRow,
}

impl fmt::Display for WorkoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Distance => write!(f, "distance"),
            Self::Duration => write!(f, "duration"),
            Self::JustRow => write!(f, "open"),
        }
    }
}

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Console idle, nothing recorded
    #[default]
    NoSession,
    /// Strokes seen, waiting to learn whether a workout is programmed
    RowingDetected,
    /// Open rowing
    JustRow,
    /// Programmed workout, carrying the 1-based interval number
    WorkoutActive(usize),
    /// All intervals completed
    Completed,
    /// Ended before completion
    Aborted,
}

impl SessionPhase {
    /// Whether the phase records telemetry into a workout
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        matches!(self, Self::JustRow | Self::WorkoutActive(_))
    }

    /// Whether the phase is terminal
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSession => write!(f, "No Session"),
            Self::RowingDetected => write!(f, "Rowing Detected"),
            Self::JustRow => write!(f, "Just Row"),
            Self::WorkoutActive(interval) => write!(f, "Workout (interval {interval})"),
            Self::Completed => write!(f, "Completed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Heart-rate peripheral information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Device address, used as the heart-rate source identifier
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: i16,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub const fn new(name: String, address: String, rssi: i16) -> Self {
        Self {
            name,
            address,
            rssi,
        }
    }

    /// Map RSSI onto a 0-100 signal quality score
    ///
    /// -100 dBm and below scores 0, -40 dBm and above scores 100.
    #[must_use]
    pub fn signal_quality(&self) -> u8 {
        let clamped = self.rssi.clamp(-100, -40);
        let score = (i32::from(clamped) + 100) * 100 / 60;
        u8::try_from(score).unwrap_or(0)
    }
}

/// Serial port parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path of the console
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Delay between reconnect attempts in milliseconds
    pub reconnect_delay_ms: u64,
    /// Maximum reconnect attempts before giving up (0 retries forever)
    pub max_reconnect_attempts: u32,
}

/// Protocol engine timing and queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-command response timeout in milliseconds
    pub response_timeout_ms: u64,
    /// Reissues allowed after the first attempt before a register is marked stale
    pub max_retries: u8,
    /// Low-frequency registers are polled once every this many cycles
    pub low_tier_every: u32,
    /// Bounded backlog of on-demand commands
    pub on_demand_capacity: usize,
    /// Pause between channel exchanges in milliseconds
    pub request_spacing_ms: u64,
}

/// Live-state hub parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Snapshot delivery tick in milliseconds
    pub delivery_tick_ms: u64,
    /// RR samples retained per interval
    pub rr_capacity: usize,
}

/// Heart-rate fusion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// A bound source silent for this long is treated as disconnected
    pub stale_after_ms: u64,
    /// Capacity of the source event channel
    pub channel_capacity: usize,
}

/// HRV analyzer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HrvConfig {
    /// Width of one HRV time bucket in seconds
    pub window_secs: u64,
}

/// Live-data encoder parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Optional fields the connected client supports
    pub fields: LiveFields,
    /// Maximum notification payload in bytes (ATT MTU minus 3)
    pub max_payload: usize,
}

/// Persistence queue and recorder parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Bounded record queue capacity
    pub queue_capacity: usize,
    /// User that recorded workouts belong to
    pub user_id: String,
    /// Interval telemetry sample cadence in milliseconds
    pub sample_interval_ms: u64,
    /// Periodic flush cadence in milliseconds
    pub flush_interval_ms: u64,
}

/// BLE heart-rate scan parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Delay before scanning again after a disconnect in milliseconds
    pub rescan_delay_ms: u64,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Serial port parameters
    pub serial: SerialConfig,
    /// Protocol engine parameters
    pub engine: EngineConfig,
    /// Hub parameters
    pub hub: HubConfig,
    /// Heart-rate fusion parameters
    pub fusion: FusionConfig,
    /// HRV parameters
    pub hrv: HrvConfig,
    /// Live-data encoder parameters
    pub encoder: EncoderConfig,
    /// Persistence parameters
    pub persistence: PersistenceConfig,
    /// BLE scan parameters
    pub scan: ScanConfig,
}

impl PipelineConfig {
    /// Load configuration from a JSON document; missing keys take their defaults
    ///
    /// # Errors
    ///
    /// Returns [`crate::RowbridgeError::Config`] if the document is not valid JSON or a
    /// value has the wrong type.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl EngineConfig {
    /// Response timeout as a [`Duration`]
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 19_200,
            reconnect_delay_ms: 2_000,
            max_reconnect_attempts: 0,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 250,
            max_retries: 2,
            low_tier_every: 10,
            on_demand_capacity: 8,
            request_spacing_ms: 25,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            delivery_tick_ms: 200,
            rr_capacity: 512,
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 10_000,
            channel_capacity: 64,
        }
    }
}

impl Default for HrvConfig {
    fn default() -> Self {
        Self { window_secs: 60 }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            fields: LiveFields::all(),
            max_payload: 20,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            user_id: "default".to_string(),
            sample_interval_ms: 1_000,
            flush_interval_ms: 5_000,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            rescan_delay_ms: 5_000,
        }
    }
}

use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

/// Opaque platform identifier of a ring (link-layer address or platform handle)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a platform identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// RSSI recorded for rings whose signal strength is not known, such as
/// rings the platform reports as already connected. Sorts after any real
/// reading.
pub const UNKNOWN_RSSI: i16 = i16::MIN;

/// A candidate ring seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Platform identifier
    pub id: DeviceId,
    /// Advertised name
    pub name: Option<String>,
    /// Signal strength (RSSI), more negative is weaker
    pub rssi: i16,
    /// When the advertisement was seen
    pub discovered_at: SystemTime,
}

impl DiscoveredDevice {
    /// Create a device record stamped with the current time
    #[must_use]
    pub fn new(id: DeviceId, name: Option<String>, rssi: i16) -> Self {
        Self {
            id,
            name,
            rssi,
            discovered_at: SystemTime::now(),
        }
    }
}

/// Lifecycle state of the single ring connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    #[default]
    Disconnected,
    /// Link negotiation or service discovery in progress
    Connecting,
    /// Services discovered, ready for monitors and commands
    Ready,
    /// Teardown in progress
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Which decoder a subscribed channel feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecoderKind {
    /// Standard heart-rate measurement profile
    StandardHeartRate,
    /// Standard battery level profile
    Battery,
    /// Proprietary vendor telemetry (compact and structured dialects)
    Vendor,
}

/// A decoded telemetry reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelemetryValue {
    /// Heart rate in beats per minute
    HeartRate {
        /// Beats per minute
        bpm: u16,
    },
    /// Battery charge
    Battery {
        /// Percentage as reported by the ring
        percent: u8,
    },
    /// Blood oxygen saturation
    BloodOxygen {
        /// Saturation percentage
        percent: u8,
    },
    /// Stress score derived from heart-rate variability
    Stress {
        /// 0 (relaxed) to 100 (stressed)
        score: u8,
    },
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartRate { bpm } => write!(f, "{bpm} bpm"),
            Self::Battery { percent } => write!(f, "battery {percent}%"),
            Self::BloodOxygen { percent } => write!(f, "SpO2 {percent}%"),
            Self::Stress { score } => write!(f, "stress {score}"),
        }
    }
}

/// A telemetry reading with its capture time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// When the payload carrying this value was decoded
    pub captured_at: SystemTime,
    /// The decoded value
    pub value: TelemetryValue,
}

impl TelemetrySample {
    /// Stamp a value with the current time
    #[must_use]
    pub fn now(value: TelemetryValue) -> Self {
        Self {
            captured_at: SystemTime::now(),
            value,
        }
    }
}

/// Discovery parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Scan window in milliseconds before discovery stops on its own
    pub window_ms: u64,
    /// Minimum name-match confidence (0-100) for a device to be reported
    pub min_confidence: u8,
}

/// Connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Link negotiation timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Payload size to request where the backend supports negotiation
    pub requested_mtu: u16,
}

/// Pacing of command batches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTiming {
    /// Settling time between consecutive continuous-mode commands
    pub settle_delay_ms: u64,
}

/// Noise gates applied while decoding telemetry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlausibilityLimits {
    /// Lowest accepted heart rate for the compact dialect
    pub min_bpm: u8,
    /// Highest accepted heart rate for the compact dialect
    pub max_bpm: u8,
    /// Blood oxygen readings at or below this value are discarded
    pub blood_oxygen_floor: u8,
}

/// Aggregate configuration for a [`crate::RingDevice`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingConfig {
    /// Discovery parameters
    pub scan: ScanConfig,
    /// Connection parameters
    pub connection: ConnectionParams,
    /// Command pacing
    pub timing: CommandTiming,
    /// Telemetry noise gates
    pub plausibility: PlausibilityLimits,
    /// Capacity of the telemetry broadcast channel
    pub sample_buffer: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            connection: ConnectionParams::default(),
            timing: CommandTiming::default(),
            plausibility: PlausibilityLimits::default(),
            sample_buffer: 64,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window_ms: 10_000,
            min_confidence: 0,
        }
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            requested_mtu: 512,
        }
    }
}

impl Default for CommandTiming {
    fn default() -> Self {
        Self {
            settle_delay_ms: 200,
        }
    }
}

impl Default for PlausibilityLimits {
    fn default() -> Self {
        Self {
            min_bpm: 30,
            max_bpm: 220,
            blood_oxygen_floor: 80,
        }
    }
}

impl PlausibilityLimits {
    /// Whether a compact-dialect heart rate passes the noise gate
    #[must_use]
    pub const fn accepts_bpm(&self, bpm: u8) -> bool {
        bpm >= self.min_bpm && bpm <= self.max_bpm
    }

    /// Whether a blood oxygen percentage passes the noise gate
    #[must_use]
    pub const fn accepts_blood_oxygen(&self, percent: u8) -> bool {
        percent > self.blood_oxygen_floor && percent <= 100
    }
}

use thiserror::Error;

/// Errors that can occur when talking to a ring
#[derive(Error, Debug)]
pub enum RingError {
    /// Radio permissions were not granted
    #[error("Bluetooth permissions were not granted")]
    PermissionDenied,

    /// Discovery could not run on the transport
    #[error("Scan failed: {0}")]
    ScanTransport(String),

    /// The ring did not answer within the connect timeout
    #[error("Connection timed out after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The peer or the platform cancelled the connection attempt
    #[error("Connection was cancelled")]
    ConnectionCancelled,

    /// The ring is held by another central
    #[error("Ring is already connected to another device")]
    AlreadyConnectedElsewhere,

    /// Connection failed for a reason not covered by the other variants
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// An operation needed a live connection and none exists
    #[error("No active connection")]
    NoActiveConnection,

    /// A telemetry payload could not be decoded
    #[error("Malformed telemetry: {0}")]
    MalformedTelemetry(String),

    /// A command frame could not be written
    #[error("Failed to send command: {0}")]
    CommandSendFailure(String),

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Binary-to-text decoding failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Fault reported by the transport backend
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for ring operations
pub type Result<T> = std::result::Result<T, RingError>;

impl RingError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::ConnectionCancelled
                | Self::AlreadyConnectedElsewhere
                | Self::ConnectionFailed(_)
                | Self::NoActiveConnection
        )
    }

    /// Check if retrying the same operation may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::ConnectionCancelled
                | Self::MalformedTelemetry(_)
                | Self::CommandSendFailure(_)
        )
    }

    /// Remediation text for failures the user can act on
    ///
    /// Connection failures differ in what the user should do about them: a
    /// sleeping or distant ring needs to be brought closer, a ring paired to
    /// another phone has to be freed, and a dismissed pairing dialog just
    /// needs another attempt.
    #[must_use]
    pub const fn user_guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConnectionTimeout { .. } => Some(
                "The ring did not respond. Make sure it is charged, awake and close to this device, then try again.",
            ),
            Self::ConnectionCancelled => Some(
                "The connection was cancelled. Try again and accept the pairing request if one appears.",
            ),
            Self::AlreadyConnectedElsewhere => Some(
                "The ring is connected to another phone or app. Disconnect it there, then try again.",
            ),
            Self::PermissionDenied => Some(
                "Bluetooth access is required to find your ring. Grant the permission in system settings.",
            ),
            _ => None,
        }
    }
}

/// Faults raised by a transport backend
///
/// Backends translate their native errors into this enum so the connection
/// layer can map them onto user-facing categories without knowing which
/// radio stack produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The backend gave up waiting
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled by the peer or the platform
    #[error("operation cancelled")]
    Cancelled,

    /// The device is busy with another central
    #[error("device already connected elsewhere")]
    AlreadyConnected,

    /// The platform refused radio access
    #[error("permission denied")]
    PermissionDenied,

    /// No adapter is available
    #[error("Bluetooth adapter unavailable: {0}")]
    Unavailable(String),

    /// The identifier is unknown to the backend
    #[error("device {0} not found")]
    DeviceNotFound(String),

    /// The link is down
    #[error("device not connected")]
    NotConnected,

    /// The service/characteristic pair is not exposed by the device
    #[error("characteristic {0} not found")]
    MissingCharacteristic(String),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Classify a backend message by the wording platform stacks use
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if lowered.contains("timed out") || lowered.contains("timeout") {
            Self::Timeout
        } else if lowered.contains("cancel") {
            Self::Cancelled
        } else if lowered.contains("already connected") || lowered.contains("in progress") {
            Self::AlreadyConnected
        } else if lowered.contains("not authorized") || lowered.contains("permission") {
            Self::PermissionDenied
        } else {
            Self::Other(message)
        }
    }
}

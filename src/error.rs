use thiserror::Error;

use crate::types::WriterClass;

/// Errors raised while framing or deframing bytes on the serial channel
///
/// Decode errors are recovered locally by the codec (buffering more bytes or
/// resynchronizing on the next delimiter) and never reach the pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer does not yet contain a complete frame
    #[error("incomplete frame")]
    Incomplete,

    /// The trailing checksum does not match the frame contents
    #[error("checksum mismatch: expected {expected:02X}, found {found:02X}")]
    Checksum {
        /// Checksum computed over the received bytes
        expected: u8,
        /// Checksum byte carried by the frame
        found: u8,
    },

    /// Missing delimiter or reserved kind/opcode bits
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Outbound payload does not fit the 4-bit length field
    #[error("payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLong {
        /// Bytes in the rejected payload
        len: usize,
        /// Largest payload a frame can carry
        max: usize,
    },
}

/// Errors returned by the live-state hub
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// A writer touched a field owned by the other writer class
    #[error("{writer} writer does not own field `{field}`")]
    Ownership {
        /// Name of the offending field
        field: &'static str,
        /// Writer class that attempted the merge
        writer: WriterClass,
    },

    /// Rower telemetry merges are paused while the serial link is down
    #[error("serial link lost - telemetry merge paused")]
    LinkLost,
}

/// Errors returned by the live-data encoder
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Even the mandatory fields do not fit in the transport limit
    #[error("payload limit {limit} bytes cannot carry the {required} mandatory bytes")]
    LimitTooSmall {
        /// Configured transport limit
        limit: usize,
        /// Bytes needed for flags plus mandatory fields
        required: usize,
    },
}

/// Errors that can occur while bridging the rowing console
#[derive(Error, Debug)]
pub enum RowbridgeError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Serial port errors
    #[error("Serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Frame decoding errors
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Hub merge rejected
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    /// Live-data encoding failed
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Serial link dropped or reached end of stream
    #[error("Serial link lost")]
    LinkLost,

    /// Command timeout
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Register value could not be parsed
    #[error("Failed to parse register value: {0}")]
    ParseError(String),

    /// Startup configuration failure (unusable serial path or BLE adapter)
    #[error("Startup failed: {0}")]
    Startup(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// Persistence sink failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A channel to another pipeline task was closed
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for rowbridge operations
pub type Result<T> = std::result::Result<T, RowbridgeError>;

impl RowbridgeError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::Serial(_)
                | Self::ConnectionFailed(_)
                | Self::LinkLost
                | Self::Io(_)
        )
    }

    /// Check if this error is recoverable without restarting the pipeline
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Frame(_) | Self::ParseError(_) | Self::Hub(_)
        )
    }

    /// Check if this error must terminate the process
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Startup(_) | Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let link_error = RowbridgeError::LinkLost;
        assert!(link_error.is_connection_error());
        assert!(!link_error.is_recoverable());
        assert!(!link_error.is_fatal());

        let timeout_error = RowbridgeError::Timeout { timeout_ms: 250 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        let frame_error = RowbridgeError::from(FrameError::Incomplete);
        assert!(frame_error.is_recoverable());

        let startup_error = RowbridgeError::Startup("no adapter".to_string());
        assert!(startup_error.is_fatal());
        assert!(!startup_error.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = HubError::Ownership {
            field: "heart_rate_bpm",
            writer: WriterClass::Rower,
        };
        let error_string = format!("{}", RowbridgeError::from(error));
        assert!(error_string.contains("Hub error"));
        assert!(error_string.contains("heart_rate_bpm"));

        let checksum = FrameError::Checksum {
            expected: 0x1F,
            found: 0x20,
        };
        assert_eq!(
            checksum.to_string(),
            "checksum mismatch: expected 1F, found 20"
        );
    }
}

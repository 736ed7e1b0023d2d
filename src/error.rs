use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when working with a TapFit Puck
#[derive(Error, Debug)]
pub enum PuckError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Bluetooth is off, missing, or permission was denied
    ///
    /// Retrying will not help until the user fixes the external condition,
    /// so this error never participates in the retry policy.
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// No acceptable device was observed within the scan window
    #[error("no Puck found within {budget_ms}ms scan window")]
    NoDeviceFound {
        /// Scan budget that elapsed without a candidate
        budget_ms: u64,
    },

    /// The physical connect call failed (after the immediate retry)
    #[error("failed to connect to device: {0}")]
    ConnectFailed(String),

    /// Notification subscription or session setup failed
    #[error("failed to set up event notifications: {0}")]
    SubscriptionFailed(String),

    /// A write to the command characteristic failed
    #[error("command write failed: {0}")]
    WriteFailed(String),

    /// The device disconnected without being asked to
    #[error("link to device lost")]
    LinkLost,

    /// A second connection request arrived while one was in flight
    #[error("a connection attempt is already in flight")]
    AlreadyConnecting,

    /// A command was issued with no live session
    #[error("not connected to a device")]
    NotConnected,

    /// An inbound notification carried zero bytes
    #[error("empty packet")]
    EmptyPacket,

    /// An outbound payload exceeds the characteristic write limit
    #[error("command payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge {
        /// Offending payload length
        len: usize,
        /// Maximum payload length for the active profile
        max: usize,
    },

    /// Trailing checksum verification failed on an inbound packet
    #[error("packet checksum mismatch: computed {computed:02X}, received {received:02X}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes
        computed: u8,
        /// Checksum byte the device sent
        received: u8,
    },

    /// An operation exceeded its time bound
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The connection attempt was interrupted by an explicit disconnect
    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Result type for Puck operations
pub type Result<T> = std::result::Result<T, PuckError>;

/// Coarse error classification surfaced to UI collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No device passed the scan filter in time
    NoDeviceFound,
    /// Physical connection could not be established
    ConnectFailed,
    /// Notification subscription or handshake failed
    SubscriptionFailed,
    /// Command write failed
    WriteFailed,
    /// Unsolicited disconnect
    LinkLost,
    /// Duplicate connection request
    AlreadyConnecting,
    /// Bluetooth off / no permission / no adapter
    AdapterUnavailable,
    /// The device itself reported an error packet
    DeviceReported,
    /// Anything else
    Other,
}

impl PuckError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectFailed(_)
                | Self::LinkLost
                | Self::NotConnected
                | Self::NoDeviceFound { .. }
        )
    }

    /// Check if the reconnection controller should retry after this error
    ///
    /// Adapter unavailability and cancellation are deliberately excluded:
    /// the former cannot improve without user action, the latter was asked for.
    #[must_use]
    pub const fn triggers_retry(&self) -> bool {
        matches!(
            self,
            Self::NoDeviceFound { .. }
                | Self::ConnectFailed(_)
                | Self::SubscriptionFailed(_)
                | Self::Timeout { .. }
        )
    }

    /// Classification used for `onError`-style notifications
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NoDeviceFound { .. } => ErrorKind::NoDeviceFound,
            Self::ConnectFailed(_) | Self::Timeout { .. } => ErrorKind::ConnectFailed,
            Self::SubscriptionFailed(_) => ErrorKind::SubscriptionFailed,
            Self::WriteFailed(_) => ErrorKind::WriteFailed,
            Self::LinkLost => ErrorKind::LinkLost,
            Self::AlreadyConnecting => ErrorKind::AlreadyConnecting,
            Self::AdapterUnavailable(_) => ErrorKind::AdapterUnavailable,
            _ => ErrorKind::Other,
        }
    }
}

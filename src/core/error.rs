//! Error taxonomy for the provisioning pipeline.
//! Raw radio faults are converted into these kinds at the Radio Session boundary,
//! so the state machine and its callers only ever see `ProvisionError`.

use std::time::Duration;

use thiserror::Error;

/// Failure of an in-flight read or write on a connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("peripheral disconnected")]
    Disconnected,
    #[error("operation timed out")]
    Timeout,
    #[error("radio link busy")]
    Busy,
    #[error("link failure: {0}")]
    Link(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    /// Adapter unavailable or permission denied while scanning.
    #[error("scan failed: {0}")]
    ScanFailed(String),

    /// The scan ran to its time limit without a matching peripheral.
    #[error("no matching peripheral found within {0:?}")]
    NoDeviceFound(Duration),

    /// Transport-level connect failure. The caller may retry.
    #[error("connection failed: {0}")]
    ConnectionError(String),

    /// Service enumeration itself failed.
    #[error("capability discovery failed: {0}")]
    DiscoveryError(String),

    /// The peripheral does not expose the provisioning service and characteristics.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    #[error("radio I/O failed: {0}")]
    Io(#[from] IoError),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Application-level error reported by the peripheral, e.g. a wrong password.
    #[error("device reported status {code}: {message}")]
    ProtocolFailure { code: i64, message: String },

    #[error("operation not permitted in state {0}")]
    InvalidState(String),

    #[error("another operation is in progress")]
    Busy,

    #[error("network {0:?} is not in the scanned list")]
    UnknownNetwork(String),

    /// A scan or connect attempt was abandoned by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

/// Machine-readable classification of a [`ProvisionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorKind {
    ScanFailed,
    NoDeviceFound,
    ConnectionError,
    DiscoveryError,
    UnsupportedDevice,
    Disconnected,
    Timeout,
    IoError,
    MalformedResponse,
    ProtocolFailure,
    InvalidState,
    Busy,
    UnknownNetwork,
    Cancelled,
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ScanFailed(_) => ErrorKind::ScanFailed,
            Self::NoDeviceFound(_) => ErrorKind::NoDeviceFound,
            Self::ConnectionError(_) => ErrorKind::ConnectionError,
            Self::DiscoveryError(_) => ErrorKind::DiscoveryError,
            Self::UnsupportedDevice(_) => ErrorKind::UnsupportedDevice,
            Self::Io(IoError::Disconnected) => ErrorKind::Disconnected,
            Self::Io(IoError::Timeout) => ErrorKind::Timeout,
            Self::Io(IoError::Busy) => ErrorKind::Busy,
            Self::Io(IoError::Link(_)) => ErrorKind::IoError,
            Self::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Self::ProtocolFailure { .. } => ErrorKind::ProtocolFailure,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Busy => ErrorKind::Busy,
            Self::UnknownNetwork(_) => ErrorKind::UnknownNetwork,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the caller can reasonably try the same step again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ScanFailed(_)
                | Self::NoDeviceFound(_)
                | Self::ConnectionError(_)
                | Self::ProtocolFailure { .. }
                | Self::Busy
        )
    }
}

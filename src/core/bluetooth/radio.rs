//! Seams between the provisioning core and the platform radio stack.
//!
//! The core only needs two capabilities from the stack: scanning for
//! advertisements and reading/writing characteristics on a connected
//! peripheral. Production code plugs `bluest` in behind these traits; tests
//! use an in-memory radio.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::types::{Advertisement, CapabilityId, DiscoveredService};
use crate::core::error::IoError;

/// Raw fault reported by the radio stack. Never escapes the Radio Session and
/// Scanner, which translate it into [`crate::core::error::ProvisionError`].
#[derive(Debug, Clone, Error)]
pub enum RadioFault {
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("bluetooth permission denied: {0}")]
    PermissionDenied(String),
    #[error("peripheral not connected")]
    NotConnected,
    #[error("radio operation timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl From<RadioFault> for IoError {
    fn from(fault: RadioFault) -> Self {
        match fault {
            RadioFault::NotConnected => IoError::Disconnected,
            RadioFault::Timeout => IoError::Timeout,
            other => IoError::Link(other.to_string()),
        }
    }
}

/// Scanning and connecting side of the radio stack.
#[async_trait]
pub trait RadioAdapter: Send + Sync + 'static {
    type Link: RadioLink;

    /// Pushes every advertisement into `sink` until `cancel` fires or the
    /// stack fails. Must release the scan resource before returning.
    async fn scan(
        &self,
        sink: mpsc::Sender<Advertisement>,
        cancel: CancellationToken,
    ) -> Result<(), RadioFault>;

    /// Establishes a transport-level link. A failed attempt must not leave a
    /// half-open connection behind.
    async fn connect(&self, peripheral_id: &str) -> Result<Self::Link, RadioFault>;
}

/// One transport-level link to a peripheral.
#[async_trait]
pub trait RadioLink: Send + Sync + 'static {
    async fn discover(&self) -> Result<Vec<DiscoveredService>, RadioFault>;

    async fn read(&self, capability: CapabilityId) -> Result<Vec<u8>, RadioFault>;

    async fn write(&self, capability: CapabilityId, data: &[u8]) -> Result<(), RadioFault>;

    /// Resolves once the link has dropped.
    async fn disconnected(&self);

    async fn close(&self) -> Result<(), RadioFault>;
}

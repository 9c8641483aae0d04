//! Bluetooth functionality for the camera provisioner
//! This module handles scanning for cameras, connecting to one and
//! performing characteristic I/O over a single radio session.

pub mod bluest_radio;
pub mod connection;
pub mod constants;
#[cfg(test)]
pub(crate) mod mock;
pub mod radio;
pub mod scanner;
pub mod types;

// Re-export types that should be publicly accessible
pub use bluest_radio::{BluestLink, BluestRadio};
pub use connection::RadioSession;
pub use radio::{RadioAdapter, RadioFault, RadioLink};
pub use scanner::{BluetoothScanner, ScanStream, name_contains};
pub use types::{CapabilityId, PeripheralHandle, ProvisioningProfile, SessionState};

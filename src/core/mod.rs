//! Core functionality for the camera provisioner
//! This module contains the radio layer, the provisioning message codec and
//! the state machine that drives a camera onto a Wi-Fi network.

pub mod bluetooth;
pub mod codec;
pub mod error;
pub mod provisioning;
pub mod session_store;

// Re-export commonly used types
pub use codec::NetworkDescriptor;
pub use error::{ErrorKind, IoError, ProvisionError};
pub use provisioning::{ProvisioningEvent, ProvisioningMachine, ProvisioningState};
pub use session_store::SessionStore;

//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use regex::Regex;
use uuid::Uuid;

/// A peripheral seen while scanning. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PeripheralHandle {
    /// Platform-specific unique identifier, used to connect
    pub id: String,
    /// The advertised local name
    pub name: String,
    /// The MAC address, when the platform id embeds one (not on macOS)
    pub address: Option<String>,
    /// The signal strength (RSSI) of the advertisement
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    pub fn new(id: String, name: String, rssi: Option<i16>) -> Self {
        let address = extract_mac_address(&id);
        Self {
            id,
            name,
            address,
            rssi,
        }
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address.as_deref().unwrap_or(&self.id))?;
        if let Some(rssi) = self.rssi {
            write!(f, " {} dBm", rssi)?;
        }
        Ok(())
    }
}

/// Raw advertisement as reported by the radio stack, before filtering.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// A readable/writable endpoint on a connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CapabilityId {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// A service found during discovery together with its characteristics.
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// The service and characteristics the provisioning protocol needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningProfile {
    pub service: Uuid,
    pub network_list: Uuid,
    pub credentials: Uuid,
}

impl ProvisioningProfile {
    pub fn network_list(&self) -> CapabilityId {
        CapabilityId::new(self.service, self.network_list)
    }

    pub fn credentials(&self) -> CapabilityId {
        CapabilityId::new(self.service, self.credentials)
    }
}

/// Lifecycle of one connection to a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SessionState {
    Connecting,
    Connected,
    Discovering,
    Ready,
    Disconnected,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Closed)
    }
}

fn extract_mac_address(device_id_str: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
    re.find_iter(device_id_str).last().map(|m| m.as_str().to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_mac_from_platform_id() {
        let handle = PeripheralHandle::new(
            "BluetoothLE#BluetoothLEe0:d4:64:11:22:33-aa:bb:cc:dd:ee:ff".into(),
            "MeerConCam-01".into(),
            Some(-60),
        );
        assert_eq!(handle.address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn opaque_ids_have_no_address() {
        let handle = PeripheralHandle::new(
            "5C2B7A3E-9F0D-4E1B-8D61-0C7E2A9B4F10".into(),
            "MeerConCam".into(),
            None,
        );
        assert_eq!(handle.address, None);
        assert_eq!(handle.to_string(), "MeerConCam (5C2B7A3E-9F0D-4E1B-8D61-0C7E2A9B4F10)");
    }
}

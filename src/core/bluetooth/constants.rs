//! Constants used throughout the provisioning pipeline
//! This module contains the identifiers fixed by the camera firmware and the
//! timing defaults of the pairing flow.

use uuid::Uuid;

/// Substring every MeerCon camera carries in its advertised local name
pub const DEVICE_NAME_FILTER: &str = "MeerConCam";

/// The UUID of the Wi-Fi provisioning service
pub const UUID_PROVISIONING_SERVICE: Uuid = Uuid::from_u128(0xd2884631_92ad_4aa1_b362_7e1329f7d990);

/// The UUID of the characteristic that returns the list of visible networks (read)
pub const UUID_NETWORK_LIST_CHAR: Uuid = Uuid::from_u128(0x322e774f_c909_49c4_bd7b_48a4003a967f);

/// The UUID of the characteristic that accepts credentials (write, then read for the status)
pub const UUID_CREDENTIALS_CHAR: Uuid = Uuid::from_u128(0x4116f8d2_9f66_4f58_a53d_fc7440e7c14e);

/// Scan duration in seconds before giving up on finding a camera
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 30;

/// Interval for polling the connection state when the platform has no connection events
pub const CONNECTION_POLL_INTERVAL_MS: u64 = 1000;

/// Capacity of the channels carrying advertisements and state-machine events
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

//! Bluetooth radio backed by the `bluest` crate
//! This module adapts the platform adapter to the provisioning radio seam.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bluest::error::ErrorKind;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::CONNECTION_POLL_INTERVAL_MS;
use crate::core::bluetooth::radio::{RadioAdapter, RadioFault, RadioLink};
use crate::core::bluetooth::types::{Advertisement, CapabilityId, DiscoveredService};

fn fault_from(error: bluest::Error) -> RadioFault {
    match error.kind() {
        ErrorKind::AdapterUnavailable => RadioFault::AdapterUnavailable(error.to_string()),
        ErrorKind::NotAuthorized => RadioFault::PermissionDenied(error.to_string()),
        ErrorKind::NotConnected => RadioFault::NotConnected,
        ErrorKind::Timeout => RadioFault::Timeout,
        _ => RadioFault::Other(error.to_string()),
    }
}

/// The system Bluetooth adapter
pub struct BluestRadio {
    adapter: Adapter,
    /// Devices seen while scanning, keyed by platform id
    devices: Arc<Mutex<HashMap<String, Device>>>,
}

impl BluestRadio {
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn remember(&self, device: &Device) -> String {
        let id = device.id().to_string();
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone(), device.clone());
        id
    }
}

#[async_trait]
impl RadioAdapter for BluestRadio {
    type Link = BluestLink;

    async fn scan(
        &self,
        sink: mpsc::Sender<Advertisement>,
        cancel: CancellationToken,
    ) -> Result<(), RadioFault> {
        // A camera that is still connected from an earlier session does not advertise.
        info!("Checking for connected devices");
        for device in self.adapter.connected_devices().await.map_err(fault_from)? {
            let id = self.remember(&device);
            let advertisement = Advertisement {
                id,
                name: device.name().ok(),
                rssi: None,
            };
            if sink.send(advertisement).await.is_err() {
                return Ok(());
            }
        }

        info!("Starting bluetooth scan");
        let mut scan_stream = self.adapter.scan(&[]).await.map_err(fault_from)?;

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered_device) => {
                            let device = discovered_device.device;
                            let id = self.remember(&device);
                            let name = discovered_device
                                .adv_data
                                .local_name
                                .or_else(|| device.name().ok());
                            let advertisement = Advertisement {
                                id,
                                name,
                                rssi: discovered_device.rssi,
                            };
                            if sink.send(advertisement).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<BluestLink, RadioFault> {
        let device = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(peripheral_id)
            .cloned()
            .ok_or_else(|| RadioFault::Other(format!("Device not found with ID: {}", peripheral_id)))?;

        if !device.is_connected().await {
            if let Err(e) = self.adapter.connect_device(&device).await {
                // Do not leave a half-open link behind for the next attempt.
                if let Err(cleanup) = self.adapter.disconnect_device(&device).await {
                    debug!("Cleanup after failed connect: {}", cleanup);
                }
                return Err(fault_from(e));
            }
        } else {
            info!("Device already connected.");
        }

        Ok(BluestLink {
            adapter: self.adapter.clone(),
            device,
            characteristics: Mutex::new(HashMap::new()),
        })
    }
}

/// A connected camera.
///
/// The radio capability carries values in base64 text form, so reads are
/// base64-encoded here and writes are decoded before they reach the air.
pub struct BluestLink {
    adapter: Adapter,
    device: Device,
    characteristics: Mutex<HashMap<CapabilityId, Characteristic>>,
}

impl BluestLink {
    fn characteristic(&self, capability: CapabilityId) -> Result<Characteristic, RadioFault> {
        self.characteristics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&capability)
            .cloned()
            .ok_or_else(|| RadioFault::Other(format!("characteristic not discovered: {}", capability)))
    }
}

#[async_trait]
impl RadioLink for BluestLink {
    async fn discover(&self) -> Result<Vec<DiscoveredService>, RadioFault> {
        let services = self.device.discover_services().await.map_err(fault_from)?;
        let mut discovered = Vec::with_capacity(services.len());
        let mut handles = HashMap::new();

        for service in services {
            let service_uuid = service.uuid();
            let mut uuids = Vec::new();
            for characteristic in service.discover_characteristics().await.map_err(fault_from)? {
                let uuid = characteristic.uuid();
                uuids.push(uuid);
                handles.insert(CapabilityId::new(service_uuid, uuid), characteristic);
            }
            discovered.push(DiscoveredService {
                uuid: service_uuid,
                characteristics: uuids,
            });
        }

        *self
            .characteristics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = handles;
        Ok(discovered)
    }

    async fn read(&self, capability: CapabilityId) -> Result<Vec<u8>, RadioFault> {
        let characteristic = self.characteristic(capability)?;
        let raw = characteristic.read().await.map_err(fault_from)?;
        Ok(BASE64.encode(raw).into_bytes())
    }

    async fn write(&self, capability: CapabilityId, data: &[u8]) -> Result<(), RadioFault> {
        let characteristic = self.characteristic(capability)?;
        let raw = BASE64
            .decode(data)
            .map_err(|e| RadioFault::Other(format!("value is not base64: {}", e)))?;
        characteristic.write(&raw).await.map_err(fault_from)
    }

    async fn disconnected(&self) {
        match self.adapter.device_connection_events(&self.device).await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    if matches!(event, ConnectionEvent::Disconnected) {
                        return;
                    }
                }
            }
            Err(e) => warn!("Connection events unavailable, polling instead: {}", e),
        }

        while self.device.is_connected().await {
            tokio::time::sleep(Duration::from_millis(CONNECTION_POLL_INTERVAL_MS)).await;
        }
    }

    async fn close(&self) -> Result<(), RadioFault> {
        if self.device.is_connected().await {
            info!("Disconnecting from device {}", self.device.id());
            self.adapter
                .disconnect_device(&self.device)
                .await
                .map_err(fault_from)?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", self.device.id());
        }
        Ok(())
    }
}

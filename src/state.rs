//! Application state management
//! This module defines the state shared by the CLI commands.

use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::config::ProvisionerConfig;
use crate::core::ProvisioningMachine;
use crate::core::bluetooth::{BluestRadio, BluetoothScanner};

pub struct AppState {
    pub config: ProvisionerConfig,
    /// The machine's scanner, reused by ad-hoc scans so only one radio scan runs.
    pub scanner: Arc<BluetoothScanner<BluestRadio>>,
    pub machine: ProvisioningMachine<BluestRadio>,
}

impl AppState {
    pub async fn new(config: ProvisionerConfig) -> Result<Self> {
        info!("Initializing Bluetooth adapter...");
        let radio = Arc::new(BluestRadio::new().await?);
        let machine = ProvisioningMachine::new(radio, &config);
        Ok(Self {
            config,
            scanner: machine.scanner(),
            machine,
        })
    }
}

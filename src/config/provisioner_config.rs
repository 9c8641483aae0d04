use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DEFAULT_SCAN_DURATION_SECS, DEVICE_NAME_FILTER, UUID_CREDENTIALS_CHAR, UUID_NETWORK_LIST_CHAR,
    UUID_PROVISIONING_SERVICE,
};
use crate::core::bluetooth::types::ProvisioningProfile;
use crate::utils::ensure_directory_exists;

pub const CONFIG_FILE_NAME: &str = "provisioner_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Substring an advertised name must contain to count as a camera.
    pub device_name_filter: String,

    /// How long `start` scans before giving up.
    pub scan_timeout_secs: u64,

    pub service_uuid: Uuid,
    pub network_list_uuid: Uuid,
    pub credentials_uuid: Uuid,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        ProvisionerConfig {
            device_name_filter: DEVICE_NAME_FILTER.to_string(),
            scan_timeout_secs: DEFAULT_SCAN_DURATION_SECS,
            service_uuid: UUID_PROVISIONING_SERVICE,
            network_list_uuid: UUID_NETWORK_LIST_CHAR,
            credentials_uuid: UUID_CREDENTIALS_CHAR,
        }
    }
}

impl ProvisionerConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn profile(&self) -> ProvisioningProfile {
        ProvisioningProfile {
            service: self.service_uuid,
            network_list: self.network_list_uuid,
            credentials: self.credentials_uuid,
        }
    }

    /// Loads the config from a configuration file.
    pub async fn load_config(file_path: &Path) -> Result<Self> {
        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;
        if config.scan_timeout_secs == 0 {
            bail!("scan_timeout_secs in {:?} must be positive", file_path);
        }

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the current config to a configuration file.
    pub async fn save_config(&self, file_path: &Path) -> Result<()> {
        if let Some(config_dir) = file_path.parent() {
            ensure_directory_exists(config_dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize provisioner config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Provisioner config saved to {:?}.", file_path);
        Ok(())
    }
}

pub mod provisioner_config;

pub use provisioner_config::{CONFIG_FILE_NAME, ProvisionerConfig};

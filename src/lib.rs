//! MeerCon camera provisioner library
//! Finds a MeerCon camera over Bluetooth LE and hands it Wi-Fi credentials.

pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;

//! CLI commands
//! This module implements the user-facing flows on top of the provisioning machine.

use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};

use crate::config::ProvisionerConfig;
use crate::core::bluetooth::{BluetoothScanner, PeripheralHandle, RadioAdapter, name_contains};
use crate::core::{NetworkDescriptor, ProvisionError, ProvisioningMachine};

/// Source of the user's choices during `provision`.
#[async_trait]
pub trait CredentialPrompt: Send {
    async fn choose_network(&mut self, networks: &[NetworkDescriptor]) -> Result<String>;

    /// `None` abandons the selection.
    async fn password(
        &mut self,
        network: &NetworkDescriptor,
        last_error: Option<&str>,
    ) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub network: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionOutcome {
    pub peripheral: PeripheralHandle,
    pub network: String,
    /// Passwords the camera rejected before one was accepted.
    pub rejected_attempts: usize,
}

/// Lists every matching peripheral seen within `duration`, in arrival order.
/// Pass the machine's scanner; a scan started elsewhere on it ends this one early.
pub async fn scan_devices<A: RadioAdapter>(
    scanner: &BluetoothScanner<A>,
    config: &ProvisionerConfig,
    duration: Duration,
) -> Result<Vec<PeripheralHandle>> {
    let mut stream = scanner
        .scan(name_contains(config.device_name_filter.clone()), duration)
        .await?;

    let mut found = Vec::new();
    while let Some(item) = stream.next().await {
        found.push(item?);
    }
    info!("Scan finished with {} matching devices", found.len());
    Ok(found)
}

/// Runs the whole flow: scan, connect, list, select and submit. A rejected
/// password re-prompts; any other failure ends the run.
pub async fn provision<A, P>(
    machine: &ProvisioningMachine<A>,
    request: ProvisionRequest,
    prompt: &mut P,
) -> Result<ProvisionOutcome>
where
    A: RadioAdapter,
    P: CredentialPrompt,
{
    let peripheral = machine.start().await?;
    machine.connect().await?;
    let networks = machine.fetch().await?;

    let network = match request.network {
        Some(network) => network,
        None => prompt.choose_network(&networks).await?,
    };
    machine.select(&network)?;
    let descriptor = networks
        .iter()
        .find(|candidate| candidate.name == network)
        .cloned()
        .unwrap_or_else(|| NetworkDescriptor::new(network.as_str()));

    let mut password = request.password;
    let mut last_error: Option<String> = None;
    let mut rejected_attempts = 0;
    loop {
        let secret = match password.take() {
            Some(secret) => secret,
            None => match prompt.password(&descriptor, last_error.as_deref()).await? {
                Some(secret) => secret,
                None => {
                    machine.cancel_selection()?;
                    bail!("provisioning abandoned before the camera accepted a password");
                }
            },
        };

        match machine.submit(&secret).await {
            Ok(()) => {
                return Ok(ProvisionOutcome {
                    peripheral,
                    network,
                    rejected_attempts,
                });
            }
            Err(ProvisionError::ProtocolFailure { message, .. }) => {
                warn!("Password rejected for {:?}", descriptor.display_name());
                rejected_attempts += 1;
                last_error = Some(message);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Interactive prompt on the terminal.
pub struct StdinPrompt {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinPrompt {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    async fn ask(&mut self, question: &str) -> Result<Option<String>> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(question.as_bytes()).await?;
        stdout.flush().await?;
        Ok(self.lines.next_line().await?.map(|line| line.trim().to_string()))
    }
}

impl Default for StdinPrompt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialPrompt for StdinPrompt {
    async fn choose_network(&mut self, networks: &[NetworkDescriptor]) -> Result<String> {
        if networks.is_empty() {
            bail!("the camera did not report any networks");
        }
        println!("\nNetworks seen by the camera:");
        for (index, network) in networks.iter().enumerate() {
            match network.rssi {
                Some(rssi) => println!("  {:>2}. {} ({} dBm)", index + 1, network.display_name(), rssi),
                None => println!("  {:>2}. {}", index + 1, network.display_name()),
            }
        }

        loop {
            let Some(answer) = self.ask("Network (number or name): ").await? else {
                bail!("no network chosen");
            };
            if let Ok(choice) = answer.parse::<usize>() {
                if let Some(network) = choice.checked_sub(1).and_then(|i| networks.get(i)) {
                    return Ok(network.name.clone());
                }
            }
            if networks.iter().any(|network| network.name == answer) {
                return Ok(answer);
            }
            println!("{:?} is not in the list.", answer);
        }
    }

    async fn password(
        &mut self,
        network: &NetworkDescriptor,
        last_error: Option<&str>,
    ) -> Result<Option<String>> {
        if let Some(reason) = last_error {
            println!("The camera rejected the password: {}", reason);
        }
        let question = format!("Password for {} (empty to cancel): ", network.display_name());
        Ok(self.ask(&question).await?.filter(|answer| !answer.is_empty()))
    }
}

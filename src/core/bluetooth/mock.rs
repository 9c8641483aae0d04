//! Test-friendly in-memory radio that simulates scanning and a GATT link
//! without hardware.
//!
//! Tests script advertisements, characteristic responses and faults up front,
//! then drive disconnects and inspect what the core wrote.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{
    UUID_CREDENTIALS_CHAR, UUID_NETWORK_LIST_CHAR, UUID_PROVISIONING_SERVICE,
};
use crate::core::bluetooth::radio::{RadioAdapter, RadioFault, RadioLink};
use crate::core::bluetooth::types::{
    Advertisement, CapabilityId, DiscoveredService, ProvisioningProfile,
};

pub fn profile() -> ProvisioningProfile {
    ProvisioningProfile {
        service: UUID_PROVISIONING_SERVICE,
        network_list: UUID_NETWORK_LIST_CHAR,
        credentials: UUID_CREDENTIALS_CHAR,
    }
}

pub fn advertisement(id: &str, name: &str) -> Advertisement {
    Advertisement {
        id: id.to_string(),
        name: Some(name.to_string()),
        rssi: Some(-55),
    }
}

/// Shared state of the simulated peripheral link.
pub struct MockLinkState {
    pub services: Mutex<Vec<DiscoveredService>>,
    pub responses: Mutex<HashMap<CapabilityId, VecDeque<Vec<u8>>>>,
    pub writes: Mutex<Vec<(CapabilityId, Vec<u8>)>>,
    pub reads: AtomicUsize,
    /// Reads never complete on their own while set.
    pub hold_reads: AtomicBool,
    pub read_started: Notify,
    pub read_delay: Mutex<Duration>,
    pub discover_delay: Mutex<Duration>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub dropped: CancellationToken,
    pub closed: AtomicBool,
}

impl MockLinkState {
    fn new() -> Self {
        Self {
            services: Mutex::new(vec![DiscoveredService {
                uuid: UUID_PROVISIONING_SERVICE,
                characteristics: vec![UUID_NETWORK_LIST_CHAR, UUID_CREDENTIALS_CHAR],
            }]),
            responses: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            hold_reads: AtomicBool::new(false),
            read_started: Notify::new(),
            read_delay: Mutex::new(Duration::ZERO),
            discover_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            dropped: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push_response(&self, capability: CapabilityId, payload: Vec<u8>) {
        self.responses
            .lock()
            .unwrap()
            .entry(capability)
            .or_default()
            .push_back(payload);
    }

    pub fn set_services(&self, services: Vec<DiscoveredService>) {
        *self.services.lock().unwrap() = services;
    }

    /// Simulates the peripheral going out of range.
    pub fn drop_link(&self) {
        self.dropped.cancel();
    }

    pub fn writes(&self) -> Vec<(CapabilityId, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn io_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst) + self.writes.lock().unwrap().len()
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockLink {
    state: Arc<MockLinkState>,
}

#[async_trait]
impl RadioLink for MockLink {
    async fn discover(&self) -> Result<Vec<DiscoveredService>, RadioFault> {
        let delay = *self.state.discover_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.dropped.is_cancelled() {
            return Err(RadioFault::NotConnected);
        }
        Ok(self.state.services.lock().unwrap().clone())
    }

    async fn read(&self, capability: CapabilityId) -> Result<Vec<u8>, RadioFault> {
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        self.state.enter();
        self.state.read_started.notify_one();
        if self.state.hold_reads.load(Ordering::SeqCst) {
            // A stuck radio: only the session's disconnect handling can end this.
            std::future::pending::<()>().await;
        }
        let delay = *self.state.read_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.leave();
        self.state
            .responses
            .lock()
            .unwrap()
            .get_mut(&capability)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| RadioFault::Other(format!("no scripted response for {}", capability)))
    }

    async fn write(&self, capability: CapabilityId, data: &[u8]) -> Result<(), RadioFault> {
        if self.state.dropped.is_cancelled() {
            return Err(RadioFault::NotConnected);
        }
        self.state
            .writes
            .lock()
            .unwrap()
            .push((capability, data.to_vec()));
        Ok(())
    }

    async fn disconnected(&self) {
        self.state.dropped.cancelled().await;
    }

    async fn close(&self) -> Result<(), RadioFault> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Simulated adapter. Every successful connect hands out a link backed by `link`.
pub struct MockRadio {
    pub advertisements: Mutex<Vec<(Duration, Advertisement)>>,
    pub scan_fault: Mutex<Option<RadioFault>>,
    pub connect_fault: Mutex<Option<RadioFault>>,
    pub connect_delay: Mutex<Duration>,
    pub link: Arc<MockLinkState>,
    pub active_scans: AtomicUsize,
    pub max_active_scans: AtomicUsize,
    pub scans_started: AtomicUsize,
    pub connect_attempts: AtomicUsize,
}

impl MockRadio {
    pub fn new() -> Self {
        Self {
            advertisements: Mutex::new(Vec::new()),
            scan_fault: Mutex::new(None),
            connect_fault: Mutex::new(None),
            connect_delay: Mutex::new(Duration::ZERO),
            link: Arc::new(MockLinkState::new()),
            active_scans: AtomicUsize::new(0),
            max_active_scans: AtomicUsize::new(0),
            scans_started: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
        }
    }

    /// Queues an advertisement delivered `after` the scan starts.
    pub fn advertise(&self, after: Duration, advertisement: Advertisement) {
        self.advertisements
            .lock()
            .unwrap()
            .push((after, advertisement));
    }

    pub fn fail_scan(&self, fault: RadioFault) {
        *self.scan_fault.lock().unwrap() = Some(fault);
    }

    pub fn fail_connect(&self, fault: RadioFault) {
        *self.connect_fault.lock().unwrap() = Some(fault);
    }
}

#[async_trait]
impl RadioAdapter for MockRadio {
    type Link = MockLink;

    async fn scan(
        &self,
        sink: mpsc::Sender<Advertisement>,
        cancel: CancellationToken,
    ) -> Result<(), RadioFault> {
        self.scans_started.fetch_add(1, Ordering::SeqCst);
        let now = self.active_scans.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_scans.fetch_max(now, Ordering::SeqCst);

        let fault = self.scan_fault.lock().unwrap().clone();
        if let Some(fault) = fault {
            self.active_scans.fetch_sub(1, Ordering::SeqCst);
            return Err(fault);
        }

        let mut scripted = self.advertisements.lock().unwrap().clone();
        scripted.sort_by_key(|(after, _)| *after);
        let started = tokio::time::Instant::now();
        for (after, advertisement) in scripted {
            tokio::select! {
                _ = tokio::time::sleep_until(started + after) => {}
                _ = cancel.cancelled() => break,
            }
            if sink.send(advertisement).await.is_err() {
                break;
            }
        }
        cancel.cancelled().await;

        self.active_scans.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, _peripheral_id: &str) -> Result<Self::Link, RadioFault> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let fault = self.connect_fault.lock().unwrap().take();
        if let Some(fault) = fault {
            return Err(fault);
        }
        Ok(MockLink {
            state: self.link.clone(),
        })
    }
}

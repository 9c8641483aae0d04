//! Radio session handling for the camera
//! This module owns one connected peripheral: capability discovery, serialized
//! characteristic I/O and disconnect detection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio::sync::{OwnedMutexGuard, watch};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::radio::{RadioAdapter, RadioFault, RadioLink};
use crate::core::bluetooth::types::{
    CapabilityId, PeripheralHandle, ProvisioningProfile, SessionState,
};
use crate::core::error::{IoError, ProvisionError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One live connection to a peripheral.
///
/// Reads and writes are only permitted in [`SessionState::Ready`]. Calls on
/// the same capability are queued, since the link allows a single outstanding
/// request per characteristic. When the link drops, every queued or in-flight
/// call resolves with `IoError::Disconnected`.
pub struct RadioSession<L: RadioLink> {
    id: u64,
    peripheral: PeripheralHandle,
    link: Arc<L>,
    state: Arc<watch::Sender<SessionState>>,
    capabilities: Mutex<HashSet<CapabilityId>>,
    capability_locks: Mutex<HashMap<CapabilityId, Arc<tokio::sync::Mutex<()>>>>,
    /// Fires when the link drops or the session is closed.
    disconnected: CancellationToken,
    /// Fires when the session is closed or dropped; ends the watcher task.
    closed: CancellationToken,
}

impl<L: RadioLink> RadioSession<L> {
    /// Connects to `peripheral`. A failed attempt leaves nothing behind, so
    /// retrying is safe.
    pub async fn connect<A>(adapter: &A, peripheral: PeripheralHandle) -> Result<Arc<Self>, ProvisionError>
    where
        A: RadioAdapter<Link = L>,
    {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self::connect_observed(adapter, peripheral, state).await
    }

    /// Same as [`connect`](Self::connect), reporting the session state on
    /// `state` from `Connecting` onwards. A failed attempt ends in `Closed`.
    pub async fn connect_observed<A>(
        adapter: &A,
        peripheral: PeripheralHandle,
        state: watch::Sender<SessionState>,
    ) -> Result<Arc<Self>, ProvisionError>
    where
        A: RadioAdapter<Link = L>,
    {
        state.send_replace(SessionState::Connecting);
        info!("Initiating connection to {}...", peripheral);
        let link = match adapter.connect(&peripheral.id).await {
            Ok(link) => link,
            Err(fault) => {
                warn!("Connection to {} failed: {}", peripheral.id, fault);
                state.send_replace(SessionState::Closed);
                return Err(ProvisionError::ConnectionError(fault.to_string()));
            }
        };

        state.send_replace(SessionState::Connected);
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peripheral,
            link: Arc::new(link),
            state: Arc::new(state),
            capabilities: Mutex::new(HashSet::new()),
            capability_locks: Mutex::new(HashMap::new()),
            disconnected: CancellationToken::new(),
            closed: CancellationToken::new(),
        });
        session.spawn_disconnect_watcher();
        info!("Connected to {} (session {})", session.peripheral, session.id);
        Ok(session)
    }

    fn spawn_disconnect_watcher(&self) {
        let link = self.link.clone();
        let state = self.state.clone();
        let disconnected = self.disconnected.clone();
        let closed = self.closed.clone();
        let id = self.id;

        tokio::spawn(async move {
            tokio::select! {
                _ = link.disconnected() => {
                    info!("Session {} lost its connection.", id);
                    state.send_if_modified(|current| {
                        if current.is_terminal() {
                            false
                        } else {
                            *current = SessionState::Disconnected;
                            true
                        }
                    });
                    disconnected.cancel();
                }
                _ = closed.cancelled() => {
                    debug!("Disconnect watcher for session {} stopped.", id);
                }
            }
        });
    }

    /// Enumerates services and verifies the provisioning service and both of
    /// its characteristics are present.
    pub async fn discover_capabilities(
        &self,
        profile: &ProvisioningProfile,
    ) -> Result<HashSet<CapabilityId>, ProvisionError> {
        let current = self.state();
        if current != SessionState::Connected {
            return Err(ProvisionError::InvalidState(format!("{:?}", current)));
        }
        self.set_state(SessionState::Discovering);

        info!("Connection successful, discovering services...");
        let services = tokio::select! {
            biased;
            _ = self.disconnected.cancelled() => return Err(IoError::Disconnected.into()),
            result = self.link.discover() => result,
        };
        let services = match services {
            Ok(services) => services,
            Err(RadioFault::NotConnected) => return Err(IoError::Disconnected.into()),
            Err(fault) => {
                error!("Service discovery failed: {}", fault);
                self.revert_discovery();
                return Err(ProvisionError::DiscoveryError(fault.to_string()));
            }
        };

        let mut found = HashSet::new();
        for service in &services {
            debug!("Available service: {}", service.uuid);
            for characteristic in &service.characteristics {
                found.insert(CapabilityId::new(service.uuid, *characteristic));
            }
        }

        if !services.iter().any(|s| s.uuid == profile.service) {
            self.revert_discovery();
            return Err(ProvisionError::UnsupportedDevice(format!(
                "provisioning service not found: {}",
                profile.service
            )));
        }
        for (label, capability) in [
            ("network list", profile.network_list()),
            ("credentials", profile.credentials()),
        ] {
            if !found.contains(&capability) {
                self.revert_discovery();
                return Err(ProvisionError::UnsupportedDevice(format!(
                    "{} characteristic not found: {}",
                    label, capability.characteristic
                )));
            }
            info!("Found {} characteristic: {}", label, capability.characteristic);
        }

        *self.lock_capabilities() = found.clone();
        let became_ready = self.state.send_if_modified(|current| {
            if *current == SessionState::Discovering {
                *current = SessionState::Ready;
                true
            } else {
                false
            }
        });
        if !became_ready {
            return Err(IoError::Disconnected.into());
        }
        Ok(found)
    }

    pub async fn read(&self, capability: CapabilityId) -> Result<Vec<u8>, ProvisionError> {
        let _turn = self.acquire(capability).await?;
        let result = tokio::select! {
            biased;
            _ = self.disconnected.cancelled() => return Err(IoError::Disconnected.into()),
            result = self.link.read(capability) => result,
        };
        let data = result.map_err(|fault| ProvisionError::Io(fault.into()))?;
        debug!("Read {} bytes from {}", data.len(), capability);
        Ok(data)
    }

    pub async fn write(&self, capability: CapabilityId, data: &[u8]) -> Result<(), ProvisionError> {
        let _turn = self.acquire(capability).await?;
        debug!("Writing {} bytes to {}", data.len(), capability);
        let result = tokio::select! {
            biased;
            _ = self.disconnected.cancelled() => return Err(IoError::Disconnected.into()),
            result = self.link.write(capability, data) => result,
        };
        result.map_err(|fault| ProvisionError::Io(fault.into()))
    }

    /// Tears the link down. Safe to call more than once.
    pub async fn close(&self) {
        let was_open = self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = SessionState::Closed;
                true
            }
        });
        self.closed.cancel();
        self.disconnected.cancel();
        if was_open {
            info!("Disconnecting from {}", self.peripheral);
            if let Err(fault) = self.link.close().await {
                warn!("Failed to close link to {}: {}", self.peripheral.id, fault);
            }
        }
    }

    /// Resolves once the session has disconnected or been closed.
    pub async fn wait_disconnected(&self) {
        self.disconnected.cancelled().await;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peripheral(&self) -> &PeripheralHandle {
        &self.peripheral
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn capabilities(&self) -> HashSet<CapabilityId> {
        self.lock_capabilities().clone()
    }

    /// Checks preconditions, then waits for this capability's turn.
    async fn acquire(&self, capability: CapabilityId) -> Result<OwnedMutexGuard<()>, ProvisionError> {
        self.ensure_ready()?;
        if !self.lock_capabilities().contains(&capability) {
            return Err(ProvisionError::UnsupportedDevice(format!(
                "capability {} was not discovered",
                capability
            )));
        }
        let lock = self.capability_lock(capability);
        let guard = tokio::select! {
            biased;
            _ = self.disconnected.cancelled() => return Err(IoError::Disconnected.into()),
            guard = lock.lock_owned() => guard,
        };
        if self.disconnected.is_cancelled() {
            return Err(IoError::Disconnected.into());
        }
        Ok(guard)
    }

    fn ensure_ready(&self) -> Result<(), ProvisionError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            other => Err(ProvisionError::InvalidState(format!("{:?}", other))),
        }
    }

    fn capability_lock(&self, capability: CapabilityId) -> Arc<tokio::sync::Mutex<()>> {
        self.capability_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(capability)
            .or_default()
            .clone()
    }

    fn lock_capabilities(&self) -> std::sync::MutexGuard<'_, HashSet<CapabilityId>> {
        self.capabilities
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn revert_discovery(&self) {
        self.state.send_if_modified(|current| {
            if *current == SessionState::Discovering {
                *current = SessionState::Connected;
                true
            } else {
                false
            }
        });
    }
}

impl<L: RadioLink> Drop for RadioSession<L> {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::core::bluetooth::mock::{MockLink, MockRadio, profile};
    use crate::core::bluetooth::types::DiscoveredService;

    fn handle() -> PeripheralHandle {
        PeripheralHandle::new("cam".into(), "MeerConCam".into(), Some(-50))
    }

    async fn ready_session(radio: &MockRadio) -> Arc<RadioSession<MockLink>> {
        let session = RadioSession::connect(radio, handle()).await.unwrap();
        session.discover_capabilities(&profile()).await.unwrap();
        session
    }

    #[tokio::test]
    async fn connect_then_discover_reaches_ready() {
        let radio = MockRadio::new();
        let session = RadioSession::connect(&radio, handle()).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        let found = session.discover_capabilities(&profile()).await.unwrap();
        assert!(found.contains(&profile().network_list()));
        assert!(found.contains(&profile().credentials()));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn failed_connect_can_be_retried() {
        let radio = MockRadio::new();
        radio.fail_connect(RadioFault::Timeout);

        let first = RadioSession::connect(&radio, handle()).await;
        assert!(matches!(first, Err(ProvisionError::ConnectionError(_))));

        let second = RadioSession::connect(&radio, handle()).await.unwrap();
        assert_eq!(second.state(), SessionState::Connected);
        assert_eq!(radio.connect_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn connecting_is_observable_until_the_link_is_up() {
        let radio = MockRadio::new();
        *radio.connect_delay.lock().unwrap() = Duration::from_secs(2);
        let (state, mut observer) = watch::channel(SessionState::Closed);

        let attempt = RadioSession::connect_observed(&radio, handle(), state);
        tokio::pin!(attempt);
        let saw_connecting = tokio::select! {
            _ = observer.wait_for(|s| *s == SessionState::Connecting) => true,
            _ = &mut attempt => false,
        };
        assert!(saw_connecting);

        let session = attempt.await.unwrap();
        assert_eq!(*observer.borrow(), SessionState::Connected);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn failed_connect_reports_closed() {
        let radio = MockRadio::new();
        radio.fail_connect(RadioFault::Timeout);
        let (state, observer) = watch::channel(SessionState::Connecting);

        let result = RadioSession::connect_observed(&radio, handle(), state).await;

        assert!(matches!(result, Err(ProvisionError::ConnectionError(_))));
        assert_eq!(*observer.borrow(), SessionState::Closed);
    }

    #[tokio::test]
    async fn missing_characteristic_is_unsupported_device() {
        let radio = MockRadio::new();
        radio.link.set_services(vec![DiscoveredService {
            uuid: profile().service,
            characteristics: vec![profile().network_list],
        }]);
        let session = RadioSession::connect(&radio, handle()).await.unwrap();

        let result = session.discover_capabilities(&profile()).await;
        assert!(matches!(result, Err(ProvisionError::UnsupportedDevice(_))));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn missing_service_is_unsupported_device() {
        let radio = MockRadio::new();
        radio.link.set_services(Vec::new());
        let session = RadioSession::connect(&radio, handle()).await.unwrap();

        let result = session.discover_capabilities(&profile()).await;
        assert!(matches!(result, Err(ProvisionError::UnsupportedDevice(_))));
    }

    #[tokio::test]
    async fn io_outside_ready_fails_without_touching_the_radio() {
        let radio = MockRadio::new();
        let session = RadioSession::connect(&radio, handle()).await.unwrap();

        let read = session.read(profile().network_list()).await;
        let write = session.write(profile().credentials(), b"x").await;

        assert!(matches!(read, Err(ProvisionError::InvalidState(_))));
        assert!(matches!(write, Err(ProvisionError::InvalidState(_))));
        assert_eq!(radio.link.io_count(), 0);
    }

    #[tokio::test]
    async fn in_flight_read_resolves_on_disconnect() {
        let radio = MockRadio::new();
        let session = ready_session(&radio).await;
        radio.link.hold_reads.store(true, Ordering::SeqCst);

        let reader = {
            let session = session.clone();
            tokio::spawn(async move { session.read(profile().network_list()).await })
        };
        radio.link.read_started.notified().await;
        radio.link.drop_link();

        let result = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("read must not hang")
            .unwrap();
        assert_eq!(result, Err(ProvisionError::Io(IoError::Disconnected)));
        session.subscribe_state().wait_for(|s| *s == SessionState::Disconnected).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reads_on_one_capability_are_serialized() {
        let radio = MockRadio::new();
        let session = ready_session(&radio).await;
        *radio.link.read_delay.lock().unwrap() = Duration::from_millis(100);
        for _ in 0..3 {
            radio.link.push_response(profile().network_list(), b"W10=".to_vec());
        }

        let reads = (0..3).map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.read(profile().network_list()).await })
        });
        for read in futures_util::future::join_all(reads).await {
            assert_eq!(read.unwrap().unwrap(), b"W10=".to_vec());
        }
        assert_eq!(radio.link.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let radio = MockRadio::new();
        let session = ready_session(&radio).await;

        session.close().await;
        session.close().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert!(radio.link.closed.load(Ordering::SeqCst));
        let read = session.read(profile().network_list()).await;
        assert!(matches!(read, Err(ProvisionError::InvalidState(_))));
    }
}

//! Provisioning state machine
//! Drives one camera from discovery to credential submission.
//!
//! The machine accepts one command at a time. A command issued while another
//! one is still waiting on the radio is rejected with `Busy` rather than
//! queued. Every transition is published on a state watch and as a
//! [`ProvisioningEvent`], which replaces variable-watching in the UI layer.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{Mutex, MutexGuard, broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ProvisionerConfig;
use crate::core::bluetooth::connection::RadioSession;
use crate::core::bluetooth::constants::EVENT_CHANNEL_CAPACITY;
use crate::core::bluetooth::radio::{RadioAdapter, RadioLink};
use crate::core::bluetooth::scanner::{BluetoothScanner, name_contains};
use crate::core::bluetooth::types::{PeripheralHandle, ProvisioningProfile};
use crate::core::codec::{self, NetworkDescriptor, ProvisioningRequest, ProvisioningResponse};
use crate::core::error::{IoError, ProvisionError};
use crate::core::session_store::{SessionPublisher, SessionStore, session_store};

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningState {
    Idle,
    Scanning,
    Found(PeripheralHandle),
    Connecting,
    Discovering,
    Ready,
    FetchingList,
    ListReady(Vec<NetworkDescriptor>),
    AwaitingCredentials {
        network: NetworkDescriptor,
        /// Message of the last rejected attempt, shown when re-prompting.
        last_error: Option<String>,
    },
    Submitting,
    Done,
    Error(ProvisionError),
}

impl ProvisioningState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Scanning => "Scanning",
            Self::Found(_) => "Found",
            Self::Connecting => "Connecting",
            Self::Discovering => "Discovering",
            Self::Ready => "Ready",
            Self::FetchingList => "FetchingList",
            Self::ListReady(_) => "ListReady",
            Self::AwaitingCredentials { .. } => "AwaitingCredentials",
            Self::Submitting => "Submitting",
            Self::Done => "Done",
            Self::Error(_) => "Error",
        }
    }

    /// States that only exist while a command is waiting on the radio.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Connecting | Self::Discovering | Self::FetchingList | Self::Submitting
        )
    }

    /// States in which a live link to the peripheral is expected.
    fn has_link(&self) -> bool {
        matches!(
            self,
            Self::Discovering
                | Self::Ready
                | Self::FetchingList
                | Self::ListReady(_)
                | Self::AwaitingCredentials { .. }
                | Self::Submitting
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningEvent {
    StateChanged {
        from: ProvisioningState,
        to: ProvisioningState,
    },
    PeripheralFound(PeripheralHandle),
    NetworksListed(Vec<NetworkDescriptor>),
    /// The camera refused the credentials; the machine is awaiting a new secret.
    CredentialsRejected { code: i64, message: String },
    Provisioned { network: String },
}

struct Inner<L: RadioLink> {
    state: ProvisioningState,
    networks: Vec<NetworkDescriptor>,
    /// Session of a connect attempt that has not reached `Ready` yet.
    pending: Option<Arc<RadioSession<L>>>,
    publisher: SessionPublisher<L>,
}

struct Shared<A: RadioAdapter> {
    scanner: Arc<BluetoothScanner<A>>,
    name_filter: String,
    scan_timeout: Duration,
    profile: ProvisioningProfile,
    inner: Mutex<Inner<A::Link>>,
    state_tx: watch::Sender<ProvisioningState>,
    events: broadcast::Sender<ProvisioningEvent>,
    store: SessionStore<A::Link>,
    operation: StdMutex<CancellationToken>,
}

pub struct ProvisioningMachine<A: RadioAdapter> {
    shared: Arc<Shared<A>>,
}

impl<A: RadioAdapter> Clone for ProvisioningMachine<A> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<A: RadioAdapter> ProvisioningMachine<A> {
    pub fn new(adapter: Arc<A>, config: &ProvisionerConfig) -> Self {
        Self::with_scanner(Arc::new(BluetoothScanner::new(adapter)), config)
    }

    /// Builds a machine that scans through `scanner`, which other callers on
    /// the same adapter share so that only one radio scan runs at a time.
    pub fn with_scanner(scanner: Arc<BluetoothScanner<A>>, config: &ProvisionerConfig) -> Self {
        let (publisher, store) = session_store();
        let (state_tx, _) = watch::channel(ProvisioningState::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                scanner,
                name_filter: config.device_name_filter.clone(),
                scan_timeout: config.scan_timeout(),
                profile: config.profile(),
                inner: Mutex::new(Inner {
                    state: ProvisioningState::Idle,
                    networks: Vec::new(),
                    pending: None,
                    publisher,
                }),
                state_tx,
                events,
                store,
                operation: StdMutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProvisioningState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProvisioningEvent> {
        self.shared.events.subscribe()
    }

    pub fn scanner(&self) -> Arc<BluetoothScanner<A>> {
        self.shared.scanner.clone()
    }

    /// Read-only view of the active session for other consumers.
    pub fn session_store(&self) -> SessionStore<A::Link> {
        self.shared.store.clone()
    }

    /// `Idle --start--> Scanning --> Found`.
    ///
    /// Scans for the first peripheral whose name contains the product
    /// identifier and stops the scan immediately. Also the explicit restart
    /// out of `Error` and `Done`.
    pub async fn start(&self) -> Result<PeripheralHandle, ProvisionError> {
        let mut inner = self.lock()?;
        match &inner.state {
            ProvisioningState::Idle | ProvisioningState::Found(_) => {}
            ProvisioningState::Error(_) | ProvisioningState::Done => {
                self.shared.teardown(&mut inner).await;
            }
            state if state.is_transient() => {
                warn!("Recovering from an abandoned {} step.", state.name());
                self.shared.teardown(&mut inner).await;
            }
            state => return Err(invalid_state(state)),
        }

        let token = self.begin_operation();
        self.shared.transition(&mut inner, ProvisioningState::Scanning);
        info!("Scanning for devices named *{}*...", self.shared.name_filter);

        let scan = self.shared.scanner.first_match(
            name_contains(self.shared.name_filter.clone()),
            self.shared.scan_timeout,
        );
        let outcome = tokio::select! {
            outcome = scan => outcome,
            _ = token.cancelled() => {
                self.shared.scanner.stop_scan().await;
                return self.shared.cancelled(&mut inner);
            }
        };

        match outcome {
            Ok(Some(handle)) => {
                self.shared.emit(ProvisioningEvent::PeripheralFound(handle.clone()));
                self.shared
                    .transition(&mut inner, ProvisioningState::Found(handle.clone()));
                Ok(handle)
            }
            Ok(None) => {
                let timeout = self.shared.scan_timeout;
                self.shared.fail(&mut inner, ProvisionError::NoDeviceFound(timeout))
            }
            Err(e) => self.shared.fail(&mut inner, e),
        }
    }

    /// `Found --connect--> Connecting --> Discovering --> Ready`.
    ///
    /// Never retries on its own; after a failure the caller re-issues `start`.
    pub async fn connect(&self) -> Result<(), ProvisionError> {
        let mut inner = self.lock()?;
        let handle = match &inner.state {
            ProvisioningState::Found(handle) => handle.clone(),
            state => return Err(invalid_state(state)),
        };

        let token = self.begin_operation();
        self.shared.transition(&mut inner, ProvisioningState::Connecting);
        let adapter = self.shared.scanner.adapter().clone();
        let session = match RadioSession::connect(adapter.as_ref(), handle).await {
            Ok(session) => session,
            Err(e) => return self.shared.fail(&mut inner, e),
        };
        // Kept until published, so an abandoned attempt can still be closed.
        inner.pending = Some(session.clone());
        if token.is_cancelled() {
            self.shared.release_pending(&mut inner).await;
            return self.shared.cancelled(&mut inner);
        }

        self.shared.transition(&mut inner, ProvisioningState::Discovering);
        info!("Discovering services and characteristics");
        if let Err(e) = session.discover_capabilities(&self.shared.profile).await {
            self.shared.release_pending(&mut inner).await;
            return self.shared.fail(&mut inner, e);
        }
        if token.is_cancelled() {
            self.shared.release_pending(&mut inner).await;
            return self.shared.cancelled(&mut inner);
        }

        // The store now owns the connection.
        inner.pending = None;
        if let Some(previous) = inner.publisher.publish(session.clone()) {
            previous.close().await;
        }
        self.spawn_disconnect_watcher(session);
        self.shared.transition(&mut inner, ProvisioningState::Ready);
        Ok(())
    }

    /// `Ready --fetch--> FetchingList --> ListReady`. Also refreshes the list
    /// from `ListReady`; the previous list is replaced, never merged.
    pub async fn fetch(&self) -> Result<Vec<NetworkDescriptor>, ProvisionError> {
        let mut inner = self.lock()?;
        match &inner.state {
            ProvisioningState::Ready | ProvisioningState::ListReady(_) => {}
            state => return Err(invalid_state(state)),
        }
        let session = self.shared.active_session(&inner)?;

        self.shared.transition(&mut inner, ProvisioningState::FetchingList);
        let response = self
            .shared
            .exchange(&session, &ProvisioningRequest::ListNetworks)
            .await;
        match response {
            Ok(ProvisioningResponse::NetworkList(networks)) => {
                info!("Camera reports {} networks", networks.len());
                inner.networks = networks.clone();
                self.shared
                    .emit(ProvisioningEvent::NetworksListed(networks.clone()));
                self.shared
                    .transition(&mut inner, ProvisioningState::ListReady(networks.clone()));
                Ok(networks)
            }
            Ok(ProvisioningResponse::Failure { code, message }) => self
                .shared
                .fail(&mut inner, ProvisionError::ProtocolFailure { code, message }),
            Ok(ProvisioningResponse::Ack) => self.shared.fail(
                &mut inner,
                ProvisionError::MalformedResponse("acknowledgement instead of a network list".into()),
            ),
            Err(e) => self.shared.fail(&mut inner, e),
        }
    }

    /// `ListReady --select(network)--> AwaitingCredentials`. No I/O.
    pub fn select(&self, network: &str) -> Result<(), ProvisionError> {
        let mut inner = self.lock()?;
        if !matches!(inner.state, ProvisioningState::ListReady(_)) {
            return Err(invalid_state(&inner.state));
        }
        let descriptor = inner
            .networks
            .iter()
            .find(|candidate| candidate.name == network)
            .cloned()
            .ok_or_else(|| ProvisionError::UnknownNetwork(network.to_string()))?;

        self.shared.transition(
            &mut inner,
            ProvisioningState::AwaitingCredentials {
                network: descriptor,
                last_error: None,
            },
        );
        Ok(())
    }

    /// `AwaitingCredentials --> ListReady`, as when the password dialog is closed.
    pub fn cancel_selection(&self) -> Result<(), ProvisionError> {
        let mut inner = self.lock()?;
        if !matches!(inner.state, ProvisioningState::AwaitingCredentials { .. }) {
            return Err(invalid_state(&inner.state));
        }
        let networks = inner.networks.clone();
        self.shared
            .transition(&mut inner, ProvisioningState::ListReady(networks));
        Ok(())
    }

    /// `AwaitingCredentials --submit(secret)--> Submitting --> Done`.
    ///
    /// A failure reported by the camera (wrong password) returns to
    /// `AwaitingCredentials` with the message attached and keeps the session;
    /// every other failure is terminal.
    pub async fn submit(&self, secret: &str) -> Result<(), ProvisionError> {
        let mut inner = self.lock()?;
        let network = match &inner.state {
            ProvisioningState::AwaitingCredentials { network, .. } => network.clone(),
            state => return Err(invalid_state(state)),
        };
        let session = self.shared.active_session(&inner)?;

        self.shared.transition(&mut inner, ProvisioningState::Submitting);
        info!("Sending credentials for {:?}", network.display_name());
        let request = ProvisioningRequest::SetCredentials {
            network: network.name.clone(),
            secret: secret.to_string(),
        };
        match self.shared.exchange(&session, &request).await {
            Ok(ProvisioningResponse::Ack) => {
                info!("Camera accepted the credentials.");
                self.shared.emit(ProvisioningEvent::Provisioned {
                    network: network.name.clone(),
                });
                self.shared.transition(&mut inner, ProvisioningState::Done);
                Ok(())
            }
            Ok(ProvisioningResponse::Failure { code, message }) => {
                warn!("Camera rejected the credentials ({}): {}", code, message);
                self.shared.emit(ProvisioningEvent::CredentialsRejected {
                    code,
                    message: message.clone(),
                });
                self.shared.transition(
                    &mut inner,
                    ProvisioningState::AwaitingCredentials {
                        network,
                        last_error: Some(message.clone()),
                    },
                );
                Err(ProvisionError::ProtocolFailure { code, message })
            }
            Ok(ProvisioningResponse::NetworkList(_)) => self.shared.fail(
                &mut inner,
                ProvisionError::MalformedResponse("network list instead of a status".into()),
            ),
            Err(e) => self.shared.fail(&mut inner, e),
        }
    }

    /// Tears down any session and returns to `Idle` from any state.
    pub async fn reset(&self) -> Result<(), ProvisionError> {
        let mut inner = self.lock()?;
        self.shared.teardown(&mut inner).await;
        self.shared.transition(&mut inner, ProvisioningState::Idle);
        Ok(())
    }

    /// Abandons a running scan, or a connect attempt at its next step. The
    /// radio is released before the interrupted command returns `Cancelled`.
    pub fn abort(&self) {
        self.shared
            .operation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<A::Link>>, ProvisionError> {
        self.shared.inner.try_lock().map_err(|_| ProvisionError::Busy)
    }

    fn begin_operation(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .shared
            .operation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token.clone();
        token
    }

    fn spawn_disconnect_watcher(&self, session: Arc<RadioSession<A::Link>>) {
        let shared: Weak<Shared<A>> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            session.wait_disconnected().await;
            let id = session.id();
            drop(session);
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut inner = shared.inner.lock().await;
            shared.handle_disconnect(&mut inner, id);
        });
    }
}

impl<A: RadioAdapter> Shared<A> {
    fn transition(&self, inner: &mut Inner<A::Link>, next: ProvisioningState) {
        let from = std::mem::replace(&mut inner.state, next.clone());
        info!("Provisioning state: {} -> {}", from.name(), next.name());
        self.state_tx.send_replace(next.clone());
        self.emit(ProvisioningEvent::StateChanged { from, to: next });
    }

    fn emit(&self, event: ProvisioningEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn fail<T>(&self, inner: &mut Inner<A::Link>, error: ProvisionError) -> Result<T, ProvisionError> {
        warn!("Provisioning failed during {}: {}", inner.state.name(), error);
        self.transition(inner, ProvisioningState::Error(error.clone()));
        Err(error)
    }

    fn cancelled<T>(&self, inner: &mut Inner<A::Link>) -> Result<T, ProvisionError> {
        info!("{} abandoned by the caller.", inner.state.name());
        self.transition(inner, ProvisioningState::Idle);
        Err(ProvisionError::Cancelled)
    }

    fn active_session(&self, inner: &Inner<A::Link>) -> Result<Arc<RadioSession<A::Link>>, ProvisionError> {
        inner
            .publisher
            .current()
            .ok_or_else(|| ProvisionError::InvalidState("no active session".into()))
    }

    /// Sends one request and reads the peripheral's answer from the same characteristic.
    async fn exchange(
        &self,
        session: &RadioSession<A::Link>,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningResponse, ProvisionError> {
        let capability = match request {
            ProvisioningRequest::ListNetworks => self.profile.network_list(),
            ProvisioningRequest::SetCredentials { .. } => self.profile.credentials(),
        };
        let payload = codec::encode(request);
        if !payload.is_empty() {
            session.write(capability, &payload).await?;
        }
        let response = session.read(capability).await?;
        codec::decode(&response)
    }

    fn handle_disconnect(&self, inner: &mut Inner<A::Link>, session_id: u64) {
        // Already torn down or replaced by a newer session.
        if inner.publisher.clear_if(session_id).is_none() {
            return;
        }
        if inner.state.has_link() {
            self.transition(
                inner,
                ProvisioningState::Error(ProvisionError::Io(IoError::Disconnected)),
            );
        }
    }

    async fn release_pending(&self, inner: &mut Inner<A::Link>) {
        if let Some(session) = inner.pending.take() {
            session.close().await;
        }
    }

    async fn teardown(&self, inner: &mut Inner<A::Link>) {
        self.scanner.stop_scan().await;
        self.release_pending(inner).await;
        if let Some(session) = inner.publisher.clear() {
            session.close().await;
        }
        inner.networks.clear();
    }
}

fn invalid_state(state: &ProvisioningState) -> ProvisionError {
    ProvisionError::InvalidState(state.name().to_string())
}

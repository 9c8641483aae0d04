use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use log::{debug, error, info};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::EVENT_CHANNEL_CAPACITY;
use crate::core::bluetooth::radio::{RadioAdapter, RadioFault};
use crate::core::bluetooth::types::PeripheralHandle;
use crate::core::error::ProvisionError;

type ScanItem = Result<PeripheralHandle, ProvisionError>;

struct ActiveScan {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Time-bounded discovery of peripherals. At most one scan runs per scanner;
/// starting a new one stops the previous one first. Everything scanning on one
/// adapter must share a single scanner (`ProvisioningMachine::scanner`) so that
/// only one radio scan runs in the process.
pub struct BluetoothScanner<A: RadioAdapter> {
    adapter: Arc<A>,
    active: Mutex<Option<ActiveScan>>,
}

impl<A: RadioAdapter> BluetoothScanner<A> {
    pub fn new(adapter: Arc<A>) -> Self {
        Self {
            adapter,
            active: Mutex::new(None),
        }
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    /// Starts a scan and returns the lazy sequence of matching peripherals.
    ///
    /// The sequence ends when `time_limit` elapses (normally, not an error),
    /// when the stream is stopped or dropped, or with a single `ScanFailed`
    /// item if the radio stack fails. Handles arrive in advertisement order and
    /// are not deduplicated.
    pub async fn scan<F>(&self, filter: F, time_limit: Duration) -> Result<ScanStream, ProvisionError>
    where
        F: Fn(&PeripheralHandle) -> bool + Send + 'static,
    {
        if time_limit.is_zero() {
            return Err(ProvisionError::ScanFailed(
                "scan time limit must be positive".into(),
            ));
        }

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!("Stopping previous scan before starting a new one.");
            Self::finish(previous).await;
        }

        let cancel_token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(Self::internal_scan_task(
            self.adapter.clone(),
            filter,
            time_limit,
            tx,
            cancel_token.clone(),
        ));

        *active = Some(ActiveScan {
            cancel_token: cancel_token.clone(),
            handle,
        });
        info!("Device scan task started ({:?} limit).", time_limit);
        Ok(ScanStream { rx, cancel_token })
    }

    /// Scans until the first matching peripheral and stops immediately.
    /// `Ok(None)` means the time limit elapsed without a match.
    pub async fn first_match<F>(
        &self,
        filter: F,
        time_limit: Duration,
    ) -> Result<Option<PeripheralHandle>, ProvisionError>
    where
        F: Fn(&PeripheralHandle) -> bool + Send + 'static,
    {
        let mut stream = self.scan(filter, time_limit).await?;
        let first = stream.next_handle().await;
        stream.stop().await;
        self.stop_scan().await;
        first.transpose()
    }

    /// Stops the active scan, if any, and waits until the radio is released.
    pub async fn stop_scan(&self) {
        if let Some(active) = self.active.lock().await.take() {
            Self::finish(active).await;
        }
    }

    async fn finish(active: ActiveScan) {
        active.cancel_token.cancel();
        if let Err(e) = active.handle.await {
            error!("Scan task finished with an unexpected join error: {:?}", e);
        }
    }

    async fn internal_scan_task<F>(
        adapter: Arc<A>,
        filter: F,
        time_limit: Duration,
        tx: mpsc::Sender<ScanItem>,
        cancel_token: CancellationToken,
    ) where
        F: Fn(&PeripheralHandle) -> bool + Send + 'static,
    {
        let (adv_tx, mut adv_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let radio_token = cancel_token.child_token();
        let radio = adapter.scan(adv_tx, radio_token.clone());
        tokio::pin!(radio);
        let deadline = tokio::time::sleep(time_limit);
        tokio::pin!(deadline);
        let mut radio_done = false;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Scan cancelled by caller.");
                    break;
                }
                _ = &mut deadline => {
                    info!("Scan time limit of {:?} reached.", time_limit);
                    break;
                }
                result = &mut radio, if !radio_done => {
                    radio_done = true;
                    if let Err(fault) = result {
                        error!("Bluetooth scan failed: {}", fault);
                        Self::deliver(&tx, Err(scan_failed(fault)), &cancel_token).await;
                        break;
                    }
                    info!("Bluetooth scan stream has ended.");
                }
                Some(advertisement) = adv_rx.recv() => {
                    debug!("Found device - ID: {}, Name: {:?}, RSSI: {:?}",
                        advertisement.id, advertisement.name, advertisement.rssi);
                    let Some(name) = advertisement.name else {
                        continue;
                    };
                    let handle = PeripheralHandle::new(advertisement.id, name, advertisement.rssi);
                    if filter(&handle) {
                        info!("Found matching device: {}", handle);
                        if !Self::deliver(&tx, Ok(handle), &cancel_token).await {
                            break;
                        }
                    }
                }
            }
        }

        // Release the radio before the stream observes its end.
        radio_token.cancel();
        if !radio_done {
            if let Err(fault) = radio.await {
                debug!("Scan ended with a fault after stop: {}", fault);
            }
        }
        drop(tx);
    }

    /// Sends one item unless the consumer is gone or the scan is cancelled
    /// while the consumer is not draining.
    async fn deliver(
        tx: &mpsc::Sender<ScanItem>,
        item: ScanItem,
        cancel_token: &CancellationToken,
    ) -> bool {
        tokio::select! {
            sent = tx.send(item) => sent.is_ok(),
            _ = cancel_token.cancelled() => false,
        }
    }
}

fn scan_failed(fault: RadioFault) -> ProvisionError {
    ProvisionError::ScanFailed(fault.to_string())
}

/// Case-sensitive substring match on the advertised name.
pub fn name_contains(needle: impl Into<String>) -> impl Fn(&PeripheralHandle) -> bool + Send + 'static {
    let needle = needle.into();
    move |handle: &PeripheralHandle| handle.name.contains(needle.as_str())
}

/// Lazy, cancelable sequence of discovered peripherals.
pub struct ScanStream {
    rx: mpsc::Receiver<ScanItem>,
    cancel_token: CancellationToken,
}

impl ScanStream {
    pub async fn next_handle(&mut self) -> Option<ScanItem> {
        self.rx.recv().await
    }

    /// Stops the scan and resolves once the scan task has released the radio.
    pub async fn stop(&mut self) {
        self.cancel_token.cancel();
        while self.rx.recv().await.is_some() {}
    }
}

impl Stream for ScanStream {
    type Item = ScanItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

//! Process-wide holder of the single active radio session.
//!
//! The store is split in two halves: [`SessionPublisher`] is the only writer
//! and is owned by the provisioning state machine; any number of
//! [`SessionStore`] readers can look at, or wait for changes to, the current
//! session. The publisher is neither `Clone` nor shared, so single-writer
//! discipline holds by construction.

use std::sync::Arc;

use log::info;
use tokio::sync::watch;

use crate::core::bluetooth::connection::RadioSession;
use crate::core::bluetooth::radio::RadioLink;
use crate::core::bluetooth::types::SessionState;

type Slot<L> = Option<Arc<RadioSession<L>>>;

/// Creates an empty store and its unique writer.
pub fn session_store<L: RadioLink>() -> (SessionPublisher<L>, SessionStore<L>) {
    let (tx, rx) = watch::channel(None);
    (SessionPublisher { tx }, SessionStore { rx })
}

pub struct SessionPublisher<L: RadioLink> {
    tx: watch::Sender<Slot<L>>,
}

impl<L: RadioLink> SessionPublisher<L> {
    /// Takes ownership of a freshly connected session. Any previous session is
    /// returned so the caller can tear it down.
    pub fn publish(&self, session: Arc<RadioSession<L>>) -> Slot<L> {
        info!("Publishing session {} for {}", session.id(), session.peripheral());
        self.tx.send_replace(Some(session))
    }

    /// Removes the current session and hands it back to the caller.
    pub fn clear(&self) -> Slot<L> {
        let previous = self.tx.send_replace(None);
        if let Some(session) = &previous {
            info!("Session {} removed from the store.", session.id());
        }
        previous
    }

    /// Removes the session only if it is still the one with `id`.
    pub fn clear_if(&self, id: u64) -> Slot<L> {
        let mut previous = None;
        self.tx.send_if_modified(|slot| {
            if slot.as_ref().is_some_and(|session| session.id() == id) {
                previous = slot.take();
                true
            } else {
                false
            }
        });
        previous
    }

    pub fn current(&self) -> Slot<L> {
        self.tx.borrow().clone()
    }

    pub fn reader(&self) -> SessionStore<L> {
        SessionStore {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of the active session.
pub struct SessionStore<L: RadioLink> {
    rx: watch::Receiver<Slot<L>>,
}

impl<L: RadioLink> Clone for SessionStore<L> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<L: RadioLink> SessionStore<L> {
    pub fn current(&self) -> Slot<L> {
        self.rx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.rx
            .borrow()
            .as_ref()
            .is_some_and(|session| session.state() == SessionState::Ready)
    }

    /// Waits until a different session (or none) is published.
    /// Returns `false` once the publisher is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock::{MockLink, MockRadio, profile};
    use crate::core::bluetooth::types::PeripheralHandle;

    async fn session(radio: &MockRadio, id: &str) -> Arc<RadioSession<MockLink>> {
        let handle = PeripheralHandle::new(id.into(), "MeerConCam".into(), None);
        RadioSession::connect(radio, handle).await.unwrap()
    }

    #[tokio::test]
    async fn readers_observe_published_session() {
        let radio = MockRadio::new();
        let (publisher, store) = session_store::<MockLink>();
        let mut watcher = store.clone();
        assert!(store.current().is_none());

        let first = session(&radio, "cam").await;
        first.discover_capabilities(&profile()).await.unwrap();
        assert!(publisher.publish(first.clone()).is_none());

        assert!(watcher.changed().await);
        assert_eq!(store.current().unwrap().id(), first.id());
        assert!(store.is_ready());
    }

    #[tokio::test]
    async fn publishing_hands_back_the_previous_session() {
        let radio = MockRadio::new();
        let (publisher, store) = session_store::<MockLink>();
        let first = session(&radio, "a").await;
        let second = session(&radio, "b").await;

        publisher.publish(first.clone());
        let previous = publisher.publish(second.clone()).unwrap();

        assert_eq!(previous.id(), first.id());
        assert_eq!(store.current().unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn stale_clear_does_not_remove_newer_session() {
        let radio = MockRadio::new();
        let (publisher, store) = session_store::<MockLink>();
        let first = session(&radio, "a").await;
        let second = session(&radio, "b").await;
        publisher.publish(second.clone());

        assert!(publisher.clear_if(first.id()).is_none());
        assert!(store.current().is_some());
        assert!(publisher.clear_if(second.id()).is_some());
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn changed_reports_closed_publisher() {
        let (publisher, mut store) = session_store::<MockLink>();
        drop(publisher);
        assert!(!store.changed().await);
    }
}

//! Inbound connection registry

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::Connection;

/// Connections accepted by a listener
///
/// The accept path is the only writer. `len()` is a lock-free read of a
/// counter that never decreases, so pollers may observe a stale value but
/// never a smaller one than before.
#[derive(Default)]
pub struct ConnectionRegistry {
    accepted: AtomicUsize,
    pending: Mutex<Vec<Box<dyn Connection>>>,
    notify: Arc<Notify>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, conn: Box<dyn Connection>) {
        self.pending.lock().push(conn);
        self.accepted.fetch_add(1, Ordering::Release);
        // stores a permit when the barrier is between checks
        self.notify.notify_one();
    }

    /// Connections accepted so far, including ones already taken
    pub fn len(&self) -> usize {
        self.accepted.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand over every accepted connection, in registration order
    pub fn take_all(&self) -> Vec<Box<dyn Connection>> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Signalled on every accept, for a single barrier waiter
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("accepted", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::WireFramer;
    use crate::protocol::PeerAddress;
    use crate::rendezvous::{wait_until, NotifyWait};
    use crate::transport::{StreamTransport, Transport};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_accept_before_pause_is_not_lost() {
        let registry = ConnectionRegistry::new();
        let notify = registry.notifier();

        // a push with nobody waiting leaves a permit behind
        registry.accepted.fetch_add(1, Ordering::Release);
        registry.notify.notify_one();
        tokio::time::timeout(Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_notify_barrier_wakes_on_accept() {
        let transport = StreamTransport::new(WireFramer::default());
        let listener = transport
            .listen("127.0.0.1", None, Default::default())
            .await
            .unwrap();
        let registry = listener.registry();
        let addr = PeerAddress::new("127.0.0.1", listener.port());

        let dialer = tokio::spawn(async move {
            let mut conns = Vec::new();
            for _ in 0..3 {
                conns.push(transport.connect(&addr).await.unwrap());
            }
            conns
        });

        let waiter = NotifyWait::new(registry.notifier(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_until(&waiter, &cancel, "inbound connections", || Ok(registry.len() >= 3)),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(registry.take_all().len(), 3);
        assert!(registry.take_all().is_empty());
        assert_eq!(registry.len(), 3);
        drop(dialer.await.unwrap());
    }
}

//! Barrier waits
//!
//! A barrier is a condition re-checked after every [`BarrierWait::pause`].
//! Polling waits sleep a fixed interval (or just yield when the interval is
//! zero); notify waits wake as soon as the watched state signals a change.
//! Every wait also ends when the run's cancellation token fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// How a barrier suspends between checks
#[async_trait]
pub trait BarrierWait: Send + Sync {
    /// Suspend until the watched state may have changed
    async fn pause(&self);
}

/// Re-check the condition every `interval`
#[derive(Debug, Clone, Copy)]
pub struct PollingWait {
    interval: Duration,
}

impl PollingWait {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl BarrierWait for PollingWait {
    async fn pause(&self) {
        if self.interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Re-check on notification, falling back to polling
///
/// The fallback covers a notification that fires between the check and
/// the wait.
#[derive(Debug, Clone)]
pub struct NotifyWait {
    notify: Arc<Notify>,
    fallback: Duration,
}

impl NotifyWait {
    pub fn new(notify: Arc<Notify>, fallback: Duration) -> Self {
        Self { notify, fallback }
    }
}

#[async_trait]
impl BarrierWait for NotifyWait {
    async fn pause(&self) {
        let fallback = self.fallback.max(Duration::from_millis(1));
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(fallback) => {}
        }
    }
}

/// Barrier strategy selected in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarrierKind {
    #[default]
    Poll,
    Notify,
}

/// Wait until `ready` returns true, pausing with `waiter` between checks
///
/// Returns [`Error::WaitCancelled`] naming `barrier` once `cancel` fires.
pub async fn wait_until<W, F>(
    waiter: &W,
    cancel: &CancellationToken,
    barrier: &'static str,
    mut ready: F,
) -> Result<()>
where
    W: BarrierWait + ?Sized,
    F: FnMut() -> Result<bool>,
{
    wait_for(waiter, cancel, barrier, || std::future::ready(ready())).await
}

/// [`wait_until`] for conditions that must be checked asynchronously
pub async fn wait_for<W, F, Fut>(
    waiter: &W,
    cancel: &CancellationToken,
    barrier: &'static str,
    mut ready: F,
) -> Result<()>
where
    W: BarrierWait + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    while !ready().await? {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::WaitCancelled { barrier }),
            _ = waiter.pause() => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_polling_wait_releases() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bump = Arc::clone(&counter);
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                bump.fetch_add(1, Ordering::SeqCst);
            }
        });

        let waiter = PollingWait::new(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        wait_until(&waiter, &cancel, "test", || Ok(counter.load(Ordering::SeqCst) == 3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_yields() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bump = Arc::clone(&counter);
        tokio::spawn(async move {
            bump.fetch_add(1, Ordering::SeqCst);
        });

        let waiter = PollingWait::new(Duration::ZERO);
        let cancel = CancellationToken::new();
        wait_until(&waiter, &cancel, "test", || Ok(counter.load(Ordering::SeqCst) == 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_notify_wait_wakes_early() {
        let notify = Arc::new(Notify::new());
        let flag = Arc::new(AtomicUsize::new(0));

        let (n, f) = (Arc::clone(&notify), Arc::clone(&flag));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            f.store(1, Ordering::SeqCst);
            n.notify_one();
        });

        let waiter = NotifyWait::new(notify, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_until(&waiter, &cancel, "test", || Ok(flag.load(Ordering::SeqCst) == 1)),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_condition_error_propagates() {
        let waiter = PollingWait::new(Duration::ZERO);
        let cancel = CancellationToken::new();
        let result = wait_until(&waiter, &cancel, "test", || Err(Error::Internal("boom".into()))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancel_releases_parked_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        // the condition never holds; only cancellation can end the wait
        let waiter = PollingWait::new(Duration::from_secs(60));
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            wait_until(&waiter, &cancel, "discovery", || Ok(false)),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::WaitCancelled { barrier: "discovery" })));
    }
}

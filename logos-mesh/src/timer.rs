//! Cancellable timers that post events back into an actor inbox.
//!
//! A timer is a spawned task sleeping on the tokio clock. Dropping the
//! [`TimerGuard`] aborts the task, so cancelling is synchronous and a
//! cancelled timer never delivers.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Owns a timer task; aborts it on drop.
#[derive(Debug)]
pub struct TimerGuard {
    handle: JoinHandle<()>,
}

impl TimerGuard {
    /// Guard an arbitrary task, e.g. a pending connect.
    pub fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Deliver `event` once after `delay`.
pub fn after<E>(delay: Duration, tx: mpsc::UnboundedSender<E>, event: E) -> TimerGuard
where
    E: Send + 'static,
{
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(event);
    });
    TimerGuard { handle }
}

/// Deliver `make()` every `period`, first after one full period.
pub fn every<E, F>(period: Duration, tx: mpsc::UnboundedSender<E>, make: F) -> TimerGuard
where
    E: Send + 'static,
    F: Fn() -> E + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.send(make()).is_err() {
                break;
            }
        }
    });
    TimerGuard { handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_after_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = after(Duration::from_millis(100), tx, 7u32);
        assert_eq!(rx.recv().await, Some(7));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_guard_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = after(Duration::from_millis(100), tx.clone(), 1u32);
        drop(guard);
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_repeats_until_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = every(Duration::from_millis(10), tx, || ());
        for _ in 0..3 {
            assert!(rx.recv().await.is_some());
        }
        guard.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}

//! Cancellable timers that post events back into the client loop.
//!
//! A timer is a spawned task; dropping or cancelling the [`TimerHandle`] aborts
//! it. An event that was already queued before the abort can still arrive, so
//! every timer event carries a generation the receiver checks against its own.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Post `event` once after `delay`.
pub fn after<T>(delay: Duration, tx: mpsc::UnboundedSender<T>, event: T) -> TimerHandle
where
    T: Send + 'static,
{
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(event);
    });
    TimerHandle { handle }
}

/// Post `make()` every `period`, first one period from now, until cancelled or
/// the receiver goes away.
pub fn every<T, F>(period: Duration, tx: mpsc::UnboundedSender<T>, make: F) -> TimerHandle
where
    T: Send + 'static,
    F: Fn() -> T + Send + 'static,
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
    TimerHandle { handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _t = after(Duration::from_millis(500), tx, 42u32);
        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.recv().await, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = after(Duration::from_millis(500), tx, 1u32);
        t.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_ticks_until_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = every(Duration::from_secs(1), tx, || ());
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let mut ticks = 0;
        while rx.try_recv().is_ok() {
            ticks += 1;
        }
        assert_eq!(ticks, 3);
        drop(t);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
    }
}

//! Field stability debouncer.
//!
//! The board reports every lifted and placed piece. Sliding a piece across
//! squares produces a burst of updates, so the full board is only requested
//! once the updates stop for a while.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::tracing::prelude::*;
use crate::transport::Channel;

/// How long the board must be quiet before it is considered stable.
///
/// In low time the wait is short so moves register quickly, but a larger
/// sliding tolerance costs more per step. Bluetooth boards scan at half
/// speed and need longer.
pub fn settle_delay(channel: Channel, field_factor: u8, low_time: bool) -> Duration {
    let factor = (field_factor % 10) as u64;
    let millis = match (low_time, channel) {
        (true, Channel::Bluetooth) => 200 + 60 * factor,
        (true, Channel::Usb) => 100 + 60 * factor,
        (false, Channel::Bluetooth) => 500 + 30 * factor,
        (false, Channel::Usb) => 250 + 30 * factor,
    };
    Duration::from_millis(millis)
}

/// Restartable single-shot timer. At most one countdown is ever pending.
#[derive(Debug, Default)]
pub struct FieldDebouncer {
    timer: Option<JoinHandle<()>>,
}

impl FieldDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel any pending countdown and start a new one that runs
    /// `on_settled` after `delay`.
    ///
    /// The previous timer task is joined before the new one starts.
    /// `on_settled` runs as its own task so cancelling the timer never
    /// interrupts it halfway.
    pub async fn restart<F>(&mut self, delay: Duration, on_settled: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel().await;
        debug!(
            "board position changed, wait {:.2} secs for a stable result",
            delay.as_secs_f64()
        );
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("board position now stable, ask for complete board");
            tokio::spawn(on_settled);
        }));
    }

    pub async fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            if !timer.is_finished() {
                debug!("board position was unstable, ignore former field update");
            }
            timer.abort();
            // Err is the expected cancellation
            let _ = timer.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    #[test_case(Channel::Usb, 0, false, 250)]
    #[test_case(Channel::Bluetooth, 0, false, 500)]
    #[test_case(Channel::Usb, 0, true, 100)]
    #[test_case(Channel::Bluetooth, 0, true, 200)]
    #[test_case(Channel::Usb, 5, false, 400)]
    #[test_case(Channel::Bluetooth, 9, true, 740)]
    #[test_case(Channel::Usb, 12, true, 220; "factor_wraps")]
    fn delays(channel: Channel, factor: u8, low_time: bool, millis: u64) {
        assert_eq!(
            settle_delay(channel, factor, low_time),
            Duration::from_millis(millis)
        );
    }

    async fn run_pending() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn bump(count: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut debouncer = FieldDebouncer::new();
        debouncer.restart(Duration::from_millis(250), bump(&count)).await;
        run_pending().await;
        assert!(debouncer.is_running());

        tokio::time::advance(Duration::from_millis(249)).await;
        run_pending().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(2)).await;
        run_pending().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_within_window_fires_once_from_latest() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut debouncer = FieldDebouncer::new();
        debouncer.restart(Duration::from_millis(250), bump(&count)).await;
        run_pending().await;

        tokio::time::advance(Duration::from_millis(200)).await;
        run_pending().await;
        debouncer.restart(Duration::from_millis(250), bump(&count)).await;
        run_pending().await;

        // the first countdown would have expired here
        tokio::time::advance(Duration::from_millis(100)).await;
        run_pending().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(151)).await;
        run_pending().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        run_pending().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_expiry() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut debouncer = FieldDebouncer::new();
        debouncer.restart(Duration::from_millis(100), bump(&count)).await;
        debouncer.cancel().await;
        assert!(!debouncer.is_running());

        tokio::time::advance(Duration::from_secs(1)).await;
        run_pending().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

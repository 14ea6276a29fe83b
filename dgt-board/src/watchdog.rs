//! Periodic liveness probe.
//!
//! Once the board has answered, a watchdog task ticks every second: it
//! frees a clock command stuck without ack and pokes the board with a
//! serial-number request, which both keeps the link busy and makes a
//! replugged board reveal itself.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::tracing::prelude::*;

/// Tick period.
pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

/// Handle on the watchdog task. Dropping it does not stop the task; call
/// [`Watchdog::stop`].
#[derive(Debug, Default)]
pub struct Watchdog {
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Start calling `tick` every `period`, first after one period.
    /// Returns false if already running.
    pub fn start<F, Fut>(&mut self, period: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            warn!("watchdog timer is already running");
            return false;
        }
        debug!("watchdog timer is started");

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        trace!("running watchdog");
                        tick().await;
                    }
                }
            }
        });
        self.running = Some((token, handle));
        true
    }

    /// Stop the task and wait for it to finish its current tick.
    pub async fn stop(&mut self) {
        if let Some((token, handle)) = self.running.take() {
            debug!("watchdog timer is stopped");
            token.cancel();
            if let Err(e) = handle.await {
                warn!("watchdog task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn run_pending() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn counting(count: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_every_period_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut watchdog = Watchdog::new();
        assert!(watchdog.start(WATCHDOG_PERIOD, counting(&count)));
        run_pending().await;
        assert!(watchdog.is_running());

        for expected in 1..=3 {
            time::advance(WATCHDOG_PERIOD).await;
            run_pending().await;
            assert_eq!(count.load(Ordering::SeqCst), expected);
        }

        watchdog.stop().await;
        assert!(!watchdog.is_running());

        time::advance(WATCHDOG_PERIOD * 5).await;
        run_pending().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_refused() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut watchdog = Watchdog::new();
        assert!(watchdog.start(WATCHDOG_PERIOD, counting(&count)));
        assert!(!watchdog.start(WATCHDOG_PERIOD, counting(&count)));
        watchdog.stop().await;

        // stopping twice is harmless, and it can start again
        watchdog.stop().await;
        assert!(watchdog.start(WATCHDOG_PERIOD, counting(&count)));
        watchdog.stop().await;
    }
}

//! Adaptive polling scheduler.

use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Owns the single repeating poll ticker.
///
/// Each tick asks the controller for one refresh through a signal channel
/// that holds at most one pending tick: a tick that fires while the
/// previous refresh is still being handled is dropped, never queued, so a
/// slow device cannot build up a backlog of reads.
pub struct PollScheduler {
    tick_tx: mpsc::Sender<()>,
    armed: Option<ArmedTicker>,
}

struct ArmedTicker {
    every: Duration,
    cancel: CancellationToken,
}

impl PollScheduler {
    /// Create the tick signal channel. Capacity one is the coalescing.
    pub fn channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
        mpsc::channel(1)
    }

    pub fn new(tick_tx: mpsc::Sender<()>) -> Self {
        Self {
            tick_tx,
            armed: None,
        }
    }

    /// Arm the ticker at `every`. Starting at the interval that is already
    /// armed keeps the running ticker; a different interval replaces it.
    /// The first tick fires one full interval from now.
    pub fn start(&mut self, every: Duration) {
        if let Some(armed) = &self.armed {
            if armed.every == every {
                return;
            }
        }
        self.stop();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tick_tx = self.tick_tx.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match tick_tx.try_send(()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(())) => {
                                debug!("poll tick dropped, previous refresh still pending");
                            }
                            Err(mpsc::error::TrySendError::Closed(())) => break,
                        }
                    }
                }
            }
        });
        debug!("poll ticker armed at {every:?}");
        self.armed = Some(ArmedTicker { every, cancel });
    }

    /// Cancel the armed ticker, if any. Idempotent.
    pub fn stop(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.cancel.cancel();
            debug!("poll ticker stopped");
        }
    }

    /// Interval the ticker is currently armed at.
    pub fn interval(&self) -> Option<Duration> {
        self.armed.as_ref().map(|armed| armed.every)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_armed_ticker_delivers_ticks() {
        let (tick_tx, mut tick_rx) = PollScheduler::channel();
        let mut scheduler = PollScheduler::new(tick_tx);
        scheduler.start(Duration::from_millis(10));
        assert!(scheduler.is_armed());

        timeout(Duration::from_millis(500), tick_rx.recv())
            .await
            .expect("no tick arrived")
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_with_same_interval_is_a_no_op() {
        let (tick_tx, _tick_rx) = PollScheduler::channel();
        let mut scheduler = PollScheduler::new(tick_tx);
        scheduler.start(Duration::from_millis(10));
        scheduler.start(Duration::from_millis(10));
        assert_eq!(scheduler.interval(), Some(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_start_with_new_interval_replaces_ticker() {
        let (tick_tx, mut tick_rx) = PollScheduler::channel();
        let mut scheduler = PollScheduler::new(tick_tx);
        scheduler.start(Duration::from_millis(10));
        scheduler.start(Duration::from_millis(50));
        assert_eq!(scheduler.interval(), Some(Duration::from_millis(50)));

        // The replaced ticker must not fire anymore; the new one starts
        // counting from the replacement.
        while tick_rx.try_recv().is_ok() {}
        timeout(Duration::from_millis(500), tick_rx.recv())
            .await
            .expect("replacement ticker never fired")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_silences_ticker_and_is_idempotent() {
        let (tick_tx, mut tick_rx) = PollScheduler::channel();
        let mut scheduler = PollScheduler::new(tick_tx);
        scheduler.start(Duration::from_millis(5));
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_armed());
        assert_eq!(scheduler.interval(), None);

        // Drain anything that raced the stop, then confirm silence.
        tokio::time::sleep(Duration::from_millis(20)).await;
        while tick_rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(tick_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unconsumed_ticks_coalesce_into_one() {
        let (tick_tx, mut tick_rx) = PollScheduler::channel();
        let mut scheduler = PollScheduler::new(tick_tx);
        scheduler.start(Duration::from_millis(5));

        // Nobody consumes for many intervals.
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut pending = 0;
        while tick_rx.try_recv().is_ok() {
            pending += 1;
        }
        assert_eq!(pending, 1);
    }
}

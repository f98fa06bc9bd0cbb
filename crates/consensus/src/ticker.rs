use std::pin::Pin;

use tokio::sync::mpsc;
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;

use crate::messages::TimeoutInfo;

/// Schedules the timeouts of the state machine, one at a time.
///
/// A request replaces the pending timeout only if it is for a later height,
/// round or step, so a burst of requests collapses into the most advanced
/// one. Fired timeouts ("tocks") arrive on the receiver returned by
/// [`TimeoutTicker::spawn`]. Stopping or dropping the ticker ends its task,
/// after which the receiver yields `None`.
pub struct TimeoutTicker {
    requests: mpsc::UnboundedSender<TimeoutInfo>,
    stop: CancellationToken,
}

impl TimeoutTicker {
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<TimeoutInfo>) {
        let (requests, rx) = mpsc::unbounded_channel();
        let (tock_tx, tocks) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        util::task::spawn(run(rx, tock_tx, stop.clone()));
        (Self { requests, stop }, tocks)
    }

    pub fn schedule_timeout(&self, timeout: TimeoutInfo) {
        // Only fails once the ticker task is gone, during shutdown.
        let _ = self.requests.send(timeout);
    }

    /// Drops the pending timeout and ends the ticker task.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for TimeoutTicker {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run(
    mut requests: mpsc::UnboundedReceiver<TimeoutInfo>,
    tocks: mpsc::UnboundedSender<TimeoutInfo>,
    stop: CancellationToken,
) {
    // The last requested timeout, kept after firing to reject stale requests.
    let mut pending: Option<TimeoutInfo> = None;
    // Armed only while `pending` has not fired yet.
    let mut timer: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            request = requests.recv() => {
                let Some(request) = request else {
                    return;
                };
                if let Some(current) = &pending {
                    if !request.is_after(current) {
                        tracing::trace!(?request, ?current, "Ignoring stale timeout request");
                        continue;
                    }
                }
                tracing::trace!(?request, "Scheduling timeout");
                timer = Some(Box::pin(sleep(request.duration)));
                pending = Some(request);
            }
            _ = expired(&mut timer) => {
                timer = None;
                let Some(fired) = pending.clone() else {
                    continue;
                };
                tracing::debug!(timeout = ?fired, "Timed out");
                if tocks.send(fired).is_err() {
                    return;
                }
            }
        }
    }
}

/// Completes when the armed timer does, never when disarmed.
async fn expired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::round_state::Step;

    fn timeout(millis: u64, height: i64, round: i32, step: Step) -> TimeoutInfo {
        TimeoutInfo {
            duration: Duration::from_millis(millis),
            height,
            round,
            step,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_the_scheduled_timeout() {
        let (ticker, mut tocks) = TimeoutTicker::spawn();
        let request = timeout(100, 1, 0, Step::Propose);
        ticker.schedule_timeout(request.clone());
        assert_eq!(tocks.recv().await, Some(request));
    }

    #[tokio::test(start_paused = true)]
    async fn later_request_replaces_earlier_one() {
        let (ticker, mut tocks) = TimeoutTicker::spawn();
        ticker.schedule_timeout(timeout(100, 1, 0, Step::Propose));
        ticker.schedule_timeout(timeout(500, 1, 0, Step::PrevoteWait));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(tocks.try_recv().is_err());
        assert_eq!(tocks.recv().await.map(|t| t.step), Some(Step::PrevoteWait));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_requests_never_fire() {
        let (ticker, mut tocks) = TimeoutTicker::spawn();
        ticker.schedule_timeout(timeout(300, 2, 1, Step::Prevote));
        ticker.schedule_timeout(timeout(10, 2, 1, Step::Prevote));
        ticker.schedule_timeout(timeout(10, 2, 0, Step::PrecommitWait));
        ticker.schedule_timeout(timeout(10, 1, 5, Step::Commit));

        let fired = tocks.recv().await.unwrap();
        assert_eq!((fired.height, fired.round, fired.step), (2, 1, Step::Prevote));
        assert_eq!(fired.duration, Duration::from_millis(300));

        // Nothing else is pending.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(tocks.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn requests_after_a_fired_timeout_must_still_advance() {
        let (ticker, mut tocks) = TimeoutTicker::spawn();
        ticker.schedule_timeout(timeout(10, 1, 0, Step::Propose));
        assert_eq!(tocks.recv().await.map(|t| t.step), Some(Step::Propose));

        ticker.schedule_timeout(timeout(10, 1, 0, Step::Propose));
        ticker.schedule_timeout(timeout(20, 1, 0, Step::PrevoteWait));
        assert_eq!(tocks.recv().await.map(|t| t.step), Some(Step::PrevoteWait));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_ticker_never_fires() {
        let (ticker, mut tocks) = TimeoutTicker::spawn();
        ticker.schedule_timeout(timeout(100, 1, 0, Step::Propose));
        ticker.stop();
        assert_eq!(tocks.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_timeout_stays_quiet() {
        let (ticker, mut tocks) = TimeoutTicker::spawn();
        ticker.schedule_timeout(timeout(10, 1, 0, Step::Propose));
        assert_eq!(tocks.recv().await.map(|t| t.step), Some(Step::Propose));

        tokio::time::sleep(Duration::from_secs(2 * 366 * 86_400)).await;
        assert!(tocks.try_recv().is_err());
    }
}

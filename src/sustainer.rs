use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::queue::{Queue, QueueError};

const RETRY_PAUSE: Duration = Duration::from_millis(100);

// Keeps a message's claim alive while the job runs. One background task
// per job; the token is the only state shared with the foreground, and
// `stop` joins the task so no renewal can race with job teardown.
pub struct LeaseSustainer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl LeaseSustainer {
    pub fn start(
        queue: Arc<dyn Queue>,
        message_id: String,
        ack_id: String,
        delay: Duration,
        interval: Duration,
    ) -> Self {
        debug!(
            "Sustaining the lease of `{}` every {:?} by {:?}.",
            message_id, interval, delay
        );
        let token = CancellationToken::new();
        let worker = token.clone();
        let handle = tokio::spawn(async move {
            sustain(queue, message_id, ack_id, delay, interval, worker).await;
        });
        LeaseSustainer {
            token: token,
            handle: handle,
        }
    }

    // Stop renewing and wait for the task to wind down.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Lease sustainer task did not shut down cleanly: {e}.");
        }
    }
}

async fn sustain(
    queue: Arc<dyn Queue>,
    message_id: String,
    ack_id: String,
    delay: Duration,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match renew_with_retry(queue.as_ref(), &ack_id, delay, &token).await {
            Ok(true) => debug!("Extended the lease of `{}` by {:?}.", message_id, delay),
            // cancelled while retrying, nothing left to renew for
            Ok(false) => break,
            Err(e) => {
                error!("Giving up extending the lease of `{}`: {e}.", message_id);
                break;
            }
        }
    }
    debug!("Lease sustainer of `{}` stopped.", message_id);
}

// Transient failures are retried until `delay` past the first failure,
// anything else propagates at once. `Ok(false)` reports cancellation.
async fn renew_with_retry(
    queue: &dyn Queue,
    ack_id: &str,
    delay: Duration,
    token: &CancellationToken,
) -> Result<bool, QueueError> {
    let mut deadline: Option<Instant> = None;
    loop {
        if token.is_cancelled() {
            return Ok(false);
        }
        match queue.renew_lease(ack_id, delay).await {
            Ok(()) => return Ok(true),
            Err(e) if e.is_transient() => {
                let limit = *deadline.get_or_insert_with(|| Instant::now() + delay);
                if Instant::now() >= limit {
                    return Err(e);
                }
                warn!("Transient failure extending a lease, retrying: {e}.");
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::JobMessage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Mode {
        Healthy,
        TransientUntil(usize),
        NonTransient,
        AlwaysTransient,
    }

    struct FakeQueue {
        attempts: AtomicUsize,
        mode: Mode,
    }

    impl FakeQueue {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(FakeQueue {
                attempts: AtomicUsize::new(0),
                mode: mode,
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Queue for FakeQueue {
        async fn pull(&self) -> Result<Option<JobMessage>, QueueError> {
            Ok(None)
        }

        async fn renew_lease(&self, ack_id: &str, _lease: Duration) -> Result<(), QueueError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.mode {
                Mode::Healthy => Ok(()),
                Mode::TransientUntil(ok_from) if n < ok_from => Err(QueueError::Io(
                    std::io::Error::new(std::io::ErrorKind::ConnectionReset, "queue down"),
                )),
                Mode::TransientUntil(_) => Ok(()),
                Mode::NonTransient => Err(QueueError::UnknownAckId(ack_id.to_string())),
                Mode::AlwaysTransient => Err(QueueError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "queue down",
                ))),
            }
        }

        async fn acknowledge(&self, _ack_id: &str) -> Result<(), QueueError> {
            Ok(())
        }

        fn ack_deadline(&self) -> Duration {
            Duration::from_secs(60)
        }
    }

    fn start(queue: Arc<FakeQueue>, delay: Duration, interval: Duration) -> LeaseSustainer {
        LeaseSustainer::start(
            queue,
            "job1".to_string(),
            "ack1".to_string(),
            delay,
            interval,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn renews_on_the_interval_and_never_after_the_work() {
        let queue = FakeQueue::new(Mode::Healthy);
        // 2s lease, default 0.9 factor
        let sustainer = start(
            queue.clone(),
            Duration::from_secs(2),
            Duration::from_millis(1800),
        );

        // the job takes 5s, so renewals land at ~1.8s and ~3.6s
        tokio::time::sleep(Duration::from_secs(5)).await;
        sustainer.stop().await;
        assert_eq!(queue.attempts(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(queue.attempts(), 2);
    }

    #[tokio::test]
    async fn stop_does_not_wait_out_the_interval() {
        let queue = FakeQueue::new(Mode::Healthy);
        let sustainer = start(queue.clone(), Duration::from_secs(120), Duration::from_secs(108));

        tokio::time::timeout(Duration::from_secs(5), sustainer.stop())
            .await
            .expect("cancellation must be prompt");
        assert_eq!(queue.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_the_deadline() {
        let queue = FakeQueue::new(Mode::TransientUntil(3));
        let sustainer = start(queue.clone(), Duration::from_secs(10), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        sustainer.stop().await;
        // two transient failures, then the retry that succeeded
        assert_eq!(queue.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn a_non_transient_failure_stops_the_loop() {
        let queue = FakeQueue::new(Mode::NonTransient);
        let sustainer = start(queue.clone(), Duration::from_secs(10), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(4)).await;
        sustainer.stop().await;
        assert_eq!(queue.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_transient_failures_give_up_at_the_deadline() {
        let queue = FakeQueue::new(Mode::AlwaysTransient);
        let sustainer = start(queue.clone(), Duration::from_secs(1), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let after_deadline = queue.attempts();
        assert!(after_deadline >= 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.attempts(), after_deadline);
        sustainer.stop().await;
    }
}

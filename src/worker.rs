use std::sync::Arc;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{config::Config, notifier::Notifier, pipeline::Job, queue::Queue, storage::Storage};

// Shared handles every job borrows: the configuration and the queue,
// storage, and notifier backends behind their seams.
pub struct ProcessContext {
    pub config: Config,
    pub queue: Arc<dyn Queue>,
    pub storage: Arc<dyn Storage>,
    pub notifier: Arc<dyn Notifier>,
}

// The pull loop. Claims one message at a time and runs it through the
// pipeline; a failed job is logged and the loop moves on.
pub struct Worker {
    ctx: Arc<ProcessContext>,
}

impl Worker {
    pub fn new(ctx: Arc<ProcessContext>) -> Self {
        Worker { ctx: ctx }
    }

    pub async fn listen(&self) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                trigger.cancel();
            }
        });
        self.listen_until(shutdown).await
    }

    // A job in flight always runs to completion; the token is only
    // checked between messages.
    pub async fn listen_until(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Waiting for jobs, press ctrl-c to stop.");
        while !shutdown.is_cancelled() {
            if self.poll_once().await {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.ctx.config.job.pull_interval()) => {}
            }
        }
        info!("Shutting down.");
        Ok(())
    }

    // One queue round trip; true when a message was claimed.
    pub async fn poll_once(&self) -> bool {
        let message = match self.ctx.queue.pull().await {
            Ok(Some(message)) => message,
            Ok(None) => return false,
            Err(e) => {
                warn!("Failed to pull from the queue: {e}.");
                return false;
            }
        };
        if !message.validate() {
            warn!("Skipping a message without an id or ack id.");
            return true;
        }
        let id = message.id.clone();
        info!("Claimed job `{id}`.");
        if let Err(e) = Job::new(self.ctx.clone(), message).run().await {
            error!("Job `{id}` aborted: {e}.");
        }
        true
    }
}

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info};

use super::JobHandler;

/// Pulls jobs one at a time and runs each in its own task so a panic stays contained.
pub(super) struct QueueWorker<J: Send + 'static> {
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<J>>>,
    handler: Arc<dyn JobHandler<J>>,
}

impl<J: Clone + Send + 'static> QueueWorker<J> {
    pub(super) fn new(
        worker_id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<J>>>,
        handler: Arc<dyn JobHandler<J>>,
    ) -> Self {
        Self {
            worker_id,
            receiver,
            handler,
        }
    }

    pub(super) async fn run(self) {
        info!(worker_id = self.worker_id, "starting workflow worker");

        loop {
            let job = {
                let mut receiver = self.receiver.lock().await;
                receiver.recv().await
            };
            let Some(job) = job else {
                break;
            };

            let fallback = job.clone();
            let handler = Arc::clone(&self.handler);
            let outcome = tokio::spawn(async move { handler.handle(job).await }).await;

            if let Err(err) = outcome {
                let reason = if err.is_panic() {
                    "workflow run panicked".to_string()
                } else {
                    "workflow run was cancelled".to_string()
                };
                error!(worker_id = self.worker_id, error = %err, "{reason}");
                self.handler.abandon(fallback, reason).await;
            }
        }

        debug!(worker_id = self.worker_id, "workflow worker stopped");
    }
}

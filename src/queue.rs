//! Bounded run queue drained by a fixed pool of workers.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

mod worker;

use worker::QueueWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
}

/// Executes the jobs pulled off the queue.
#[async_trait]
pub trait JobHandler<J: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, job: J);

    /// Called with a copy of the job when `handle` panicked or was cancelled.
    async fn abandon(&self, job: J, reason: String);

    /// Called on shutdown for a job that was queued but never reached a worker.
    async fn discard(&self, job: J, reason: String);
}

/// A reserved queue slot. Dropping it releases the slot unused.
pub struct QueueSlot<'a, J> {
    permit: mpsc::Permit<'a, J>,
}

impl<J> QueueSlot<'_, J> {
    pub fn send(self, job: J) {
        self.permit.send(job);
    }
}

/// Reason handed to [`JobHandler::discard`] for jobs still queued at shutdown.
pub const SHUTDOWN_REASON: &str = "workflow queue shut down";

pub struct WorkflowQueue<J: Send + 'static> {
    sender: mpsc::Sender<J>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<J>>>,
    handler: Arc<dyn JobHandler<J>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<J: Clone + Send + 'static> WorkflowQueue<J> {
    /// Spawns `concurrency` workers over a queue holding at most `capacity` jobs.
    pub fn start(handler: Arc<dyn JobHandler<J>>, concurrency: usize, capacity: usize) -> Self {
        let concurrency = concurrency.max(1);
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let mut workers = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let worker =
                QueueWorker::new(worker_id, Arc::clone(&receiver), Arc::clone(&handler));
            workers.push(tokio::spawn(async move { worker.run().await }));
        }

        info!(concurrency, capacity, "workflow queue initialized");

        Self {
            sender,
            receiver,
            handler,
            workers: Mutex::new(workers),
        }
    }

    /// Takes a slot without waiting, so callers can fail before changing any state.
    ///
    /// # Errors
    /// `Full` when every slot is taken, `Closed` after shutdown.
    pub fn reserve(&self) -> Result<QueueSlot<'_, J>, QueueError> {
        match self.sender.try_reserve() {
            Ok(permit) => Ok(QueueSlot { permit }),
            Err(mpsc::error::TrySendError::Full(())) => Err(QueueError::Full),
            Err(mpsc::error::TrySendError::Closed(())) => Err(QueueError::Closed),
        }
    }

    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.sender.capacity()
    }

    /// Aborts all workers, closes the queue and discards the jobs still waiting in it.
    ///
    /// Runs already handed to a worker finish in the background.
    pub async fn shutdown(&self) {
        info!("shutting down workflow queue");
        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };

        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut discarded = 0_usize;
        while let Ok(job) = receiver.try_recv() {
            self.handler.discard(job, SHUTDOWN_REASON.to_string()).await;
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "discarded queued jobs on shutdown");
        }
    }
}

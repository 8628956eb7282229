use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::progress::{ProgressSnapshot, summarize};
use crate::store::dao::TaskDao;

/// Topic name under which a book's progress is pushed.
#[must_use]
pub fn progress_topic(book_id: Uuid) -> String {
    format!("/topic/progress/{book_id}")
}

/// Push side of progress reporting.
///
/// Delivery is best-effort: a publish never fails the run that triggered it.
pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, book_id: Uuid, snapshot: &ProgressSnapshot);
}

/// In-process fan-out with one broadcast channel per book.
#[derive(Debug)]
pub struct ProgressHub {
    capacity: usize,
    topics: Mutex<HashMap<Uuid, broadcast::Sender<ProgressSnapshot>>>,
}

impl ProgressHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, book_id: Uuid) -> broadcast::Receiver<ProgressSnapshot> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(book_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscription as a stream. Snapshots missed through lag are skipped,
    /// since each one carries the full state.
    pub fn stream(&self, book_id: Uuid) -> impl Stream<Item = ProgressSnapshot> + Send + 'static {
        let receiver = self.subscribe(book_id);
        futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(snapshot) => return Some((snapshot, receiver)),
                    Err(RecvError::Lagged(skipped)) => {
                        trace!(skipped, "progress subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }

    #[must_use]
    pub fn subscriber_count(&self, book_id: Uuid) -> usize {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .get(&book_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Drops topics nobody listens to anymore.
    pub fn prune(&self) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl ProgressPublisher for ProgressHub {
    fn publish(&self, book_id: Uuid, snapshot: &ProgressSnapshot) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = topics.get(&book_id) else {
            return;
        };
        if sender.send(snapshot.clone()).is_err() {
            topics.remove(&book_id);
            debug!(
                book_id = %book_id,
                topic = %progress_topic(book_id),
                "dropped progress topic without subscribers"
            );
        }
    }
}

/// Publishes the snapshot of the book's tasks as currently persisted.
pub(crate) async fn publish_current(
    tasks: &dyn TaskDao,
    publisher: &dyn ProgressPublisher,
    book_id: Uuid,
) {
    match tasks.find_by_book(book_id).await {
        Ok(current) => {
            if let Some(snapshot) = summarize(book_id, &current) {
                publisher.publish(book_id, &snapshot);
            }
        }
        Err(err) => {
            warn!(book_id = %book_id, error = %err, "failed to load tasks for progress publish");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    use crate::pipeline::progress::StepProgress;
    use crate::store::models::{Stage, TaskStatus};

    fn snapshot(book_id: Uuid, progress: u8) -> ProgressSnapshot {
        ProgressSnapshot {
            book_id,
            overall_status: TaskStatus::Processing,
            overall_progress: progress,
            steps: vec![StepProgress {
                stage: Stage::Story,
                status: TaskStatus::Processing,
                progress,
                message: None,
            }],
        }
    }

    #[tokio::test]
    async fn subscribers_receive_only_their_book() {
        let hub = ProgressHub::new(8);
        let book_a = Uuid::new_v4();
        let book_b = Uuid::new_v4();
        let mut rx_a = hub.subscribe(book_a);
        let mut rx_b = hub.subscribe(book_b);

        hub.publish(book_a, &snapshot(book_a, 10));

        assert_eq!(rx_a.recv().await.unwrap().overall_progress, 10);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_skips_lagged_snapshots() {
        let hub = ProgressHub::new(2);
        let book_id = Uuid::new_v4();
        let stream = hub.stream(book_id);

        for progress in [10, 20, 30, 40] {
            hub.publish(book_id, &snapshot(book_id, progress));
        }

        futures::pin_mut!(stream);
        assert_eq!(stream.next().await.unwrap().overall_progress, 30);
        assert_eq!(stream.next().await.unwrap().overall_progress, 40);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = ProgressHub::new(4);
        let book_id = Uuid::new_v4();
        hub.publish(book_id, &snapshot(book_id, 10));
        assert_eq!(hub.subscriber_count(book_id), 0);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = ProgressHub::new(4);
        let book_id = Uuid::new_v4();
        let receiver = hub.subscribe(book_id);
        assert_eq!(hub.subscriber_count(book_id), 1);

        drop(receiver);
        hub.prune();

        assert_eq!(hub.subscriber_count(book_id), 0);
        assert!(hub.topics.lock().unwrap().is_empty());
    }

    #[test]
    fn topic_name_is_per_book() {
        let book_id = Uuid::nil();
        assert_eq!(
            progress_topic(book_id),
            "/topic/progress/00000000-0000-0000-0000-000000000000"
        );
    }
}

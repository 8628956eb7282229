use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use super::broadcast::{ProgressPublisher, publish_current};
use super::{CreationSpec, RunKind, RunRequest, WorkflowError};
use crate::observability::Telemetry;
use crate::store::dao::{BookDao, TaskDao};
use crate::store::models::{Book, BookStatus, GenerationTask};

/// Re-runs a finished or failed book on its existing task rows.
pub struct RestartManager {
    books: Arc<dyn BookDao>,
    tasks: Arc<dyn TaskDao>,
    publisher: Arc<dyn ProgressPublisher>,
    telemetry: Telemetry,
}

impl RestartManager {
    pub fn new(
        books: Arc<dyn BookDao>,
        tasks: Arc<dyn TaskDao>,
        publisher: Arc<dyn ProgressPublisher>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            books,
            tasks,
            publisher,
            telemetry,
        }
    }

    /// # Errors
    /// `NotFound` when the book or its tasks do not exist.
    pub(crate) async fn load(
        &self,
        book_id: Uuid,
    ) -> Result<(Book, Vec<GenerationTask>), WorkflowError> {
        let book = self.books.get_book(book_id).await?;
        let tasks = self.tasks.find_by_book(book_id).await?;
        if tasks.is_empty() {
            return Err(WorkflowError::NotFound(book_id));
        }
        Ok((book, tasks))
    }

    /// Claims the book and puts every task back to `PENDING`.
    ///
    /// Subscribers see the reset snapshot before any stage of the new run.
    ///
    /// # Errors
    /// `ConflictingRun` while the book is `GENERATING`, `Store` when a reset
    /// could not be persisted (the book is then left `FAILED`).
    pub(crate) async fn reset(
        &self,
        book: Book,
        tasks: Vec<GenerationTask>,
    ) -> Result<RunRequest, WorkflowError> {
        let book_id = book.book_id;
        let previous = self
            .books
            .transition_status(book_id, &BookStatus::STARTABLE, BookStatus::Generating)
            .await?;

        let now = Utc::now();
        for mut task in tasks {
            task.reset(now);
            if let Err(err) = self.tasks.update_task(&task).await {
                if let Err(status_err) =
                    self.books.update_status(book_id, BookStatus::Failed).await
                {
                    error!(
                        book_id = %book_id,
                        error = %status_err,
                        "failed to mark book as failed after reset error"
                    );
                }
                return Err(err.into());
            }
        }

        publish_current(self.tasks.as_ref(), self.publisher.as_ref(), book_id).await;
        self.telemetry.record_restart();
        info!(
            book_id = %book_id,
            previous_status = %previous,
            num_scenes = book.num_scenes,
            "generation run restarted"
        );

        Ok(RunRequest::new(
            book_id,
            CreationSpec::from_book(&book),
            RunKind::Restart,
        ))
    }
}

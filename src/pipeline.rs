use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::observability::Telemetry;
use crate::queue::{QueueError, WorkflowQueue};
use crate::store::dao::{BookDao, TaskDao};
use crate::store::models::{Book, BookType};

pub mod broadcast;
mod error;
pub(crate) mod executor;
pub mod orchestrator;
pub mod ports;
pub mod progress;
pub mod restart;

pub use broadcast::{ProgressHub, ProgressPublisher, progress_topic};
pub use error::WorkflowError;
pub use orchestrator::{StagePorts, WorkflowCoordinator};
pub use ports::{ImagePort, PdfPort, StageFailure, StoryPort};
pub use progress::{ProgressAggregator, ProgressSnapshot, StepProgress};
pub use restart::RestartManager;

pub const DEFAULT_STYLE_PROMPT: &str = "A detailed digital artwork";
const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_PROGRESS_CAPACITY: usize = 32;

/// Parameters of one generation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationSpec {
    pub title: String,
    pub summary: String,
    pub num_scenes: u32,
    pub book_type: BookType,
    pub style_prompt: Option<String>,
    pub owner_id: Uuid,
}

impl CreationSpec {
    /// Rebuilds the spec a book was created with.
    #[must_use]
    pub fn from_book(book: &Book) -> Self {
        Self {
            title: book.title.clone(),
            summary: book.summary.clone(),
            num_scenes: book.num_scenes,
            book_type: book.book_type,
            style_prompt: book.style_prompt.clone(),
            owner_id: book.owner_id,
        }
    }

    /// First field on which the spec and the stored book disagree.
    ///
    /// Restart rebuilds the spec from the book, so a run may only start with
    /// the parameters the book carries.
    #[must_use]
    pub fn mismatch_with(&self, book: &Book) -> Option<&'static str> {
        if self.owner_id != book.owner_id {
            Some("owner_id")
        } else if self.book_type != book.book_type {
            Some("book_type")
        } else if self.num_scenes != book.num_scenes {
            Some("num_scenes")
        } else if self.title != book.title {
            Some("title")
        } else if self.summary != book.summary {
            Some("summary")
        } else if self.style_prompt != book.style_prompt {
            Some("style_prompt")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Start,
    Restart,
}

impl RunKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Start => "start",
            RunKind::Restart => "restart",
        }
    }
}

/// A run whose tasks are persisted and which waits for a worker.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub book_id: Uuid,
    pub spec: CreationSpec,
    pub kind: RunKind,
    pub accepted_at: Instant,
}

impl RunRequest {
    #[must_use]
    pub fn new(book_id: Uuid, spec: CreationSpec, kind: RunKind) -> Self {
        Self {
            book_id,
            spec,
            kind,
            accepted_at: Instant::now(),
        }
    }
}

impl From<QueueError> for WorkflowError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full => WorkflowError::QueueFull,
            QueueError::Closed => WorkflowError::QueueClosed,
        }
    }
}

/// Entry point for starting, restarting and observing generation runs.
pub struct Workflow {
    coordinator: Arc<WorkflowCoordinator>,
    restarts: RestartManager,
    progress: ProgressAggregator,
    queue: WorkflowQueue<RunRequest>,
    hub: Option<Arc<ProgressHub>>,
    telemetry: Telemetry,
}

impl Workflow {
    #[must_use]
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    /// Accepts a run for a persisted book and hands it to a worker.
    ///
    /// Returns once the book is `GENERATING` and its tasks exist; the stages
    /// themselves run in the background.
    ///
    /// # Errors
    /// `QueueFull`/`QueueClosed` before any state change, `NotFound` for an
    /// unknown book, `SpecMismatch` when `spec` does not describe the stored
    /// book, `ConflictingRun` when the book is already generating,
    /// `RestartRequired` when an earlier run left unfinished tasks behind.
    pub async fn start_workflow(
        &self,
        book_id: Uuid,
        spec: CreationSpec,
    ) -> Result<(), WorkflowError> {
        let slot = self.queue.reserve().map_err(|err| self.rejected(book_id, err.into()))?;
        let run = self
            .coordinator
            .begin_run(book_id, spec)
            .await
            .map_err(|err| self.rejected(book_id, err))?;
        slot.send(run);
        Ok(())
    }

    /// Resets every task of the book and runs the pipeline again.
    ///
    /// # Errors
    /// Same taxonomy as [`Workflow::start_workflow`].
    pub async fn restart(&self, book_id: Uuid) -> Result<(), WorkflowError> {
        let (book, tasks) = self.restarts.load(book_id).await?;
        let slot = self.queue.reserve().map_err(|err| self.rejected(book_id, err.into()))?;
        let run = self
            .restarts
            .reset(book, tasks)
            .await
            .map_err(|err| self.rejected(book_id, err))?;
        slot.send(run);
        Ok(())
    }

    /// # Errors
    /// `NotFound` when the book has no tasks.
    pub async fn get_progress(&self, book_id: Uuid) -> Result<ProgressSnapshot, WorkflowError> {
        self.progress.get_progress(book_id).await
    }

    /// The in-process hub, when the workflow publishes through one.
    #[must_use]
    pub fn progress_hub(&self) -> Option<&Arc<ProgressHub>> {
        self.hub.as_ref()
    }

    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    fn rejected(&self, book_id: Uuid, err: WorkflowError) -> WorkflowError {
        if matches!(
            err,
            WorkflowError::ConflictingRun { .. }
                | WorkflowError::RestartRequired { .. }
                | WorkflowError::SpecMismatch { .. }
                | WorkflowError::QueueFull
                | WorkflowError::QueueClosed
        ) {
            self.telemetry.record_rejected();
            warn!(book_id = %book_id, error = %err, "generation run rejected");
        }
        err
    }
}

/// Assembles a [`Workflow`]. `build` spawns the workers, so it needs a Tokio runtime.
pub struct WorkflowBuilder {
    books: Option<Arc<dyn BookDao>>,
    tasks: Option<Arc<dyn TaskDao>>,
    story: Option<Arc<dyn StoryPort>>,
    image: Option<Arc<dyn ImagePort>>,
    pdf: Option<Arc<dyn PdfPort>>,
    publisher: Option<Arc<dyn ProgressPublisher>>,
    hub: Option<Arc<ProgressHub>>,
    telemetry: Option<Telemetry>,
    concurrency: usize,
    queue_capacity: usize,
    default_style_prompt: String,
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            books: None,
            tasks: None,
            story: None,
            image: None,
            pdf: None,
            publisher: None,
            hub: None,
            telemetry: None,
            concurrency: num_cpus::get(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_style_prompt: DEFAULT_STYLE_PROMPT.to_string(),
        }
    }

    /// Uses one backend for both books and tasks.
    #[must_use]
    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: BookDao + TaskDao + 'static,
    {
        self.books = Some(store.clone());
        self.tasks = Some(store);
        self
    }

    #[must_use]
    pub fn with_book_dao(mut self, books: Arc<dyn BookDao>) -> Self {
        self.books = Some(books);
        self
    }

    #[must_use]
    pub fn with_task_dao(mut self, tasks: Arc<dyn TaskDao>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    #[must_use]
    pub fn with_story_port(mut self, port: Arc<dyn StoryPort>) -> Self {
        self.story = Some(port);
        self
    }

    #[must_use]
    pub fn with_image_port(mut self, port: Arc<dyn ImagePort>) -> Self {
        self.image = Some(port);
        self
    }

    #[must_use]
    pub fn with_pdf_port(mut self, port: Arc<dyn PdfPort>) -> Self {
        self.pdf = Some(port);
        self
    }

    #[must_use]
    pub fn with_progress_hub(mut self, hub: Arc<ProgressHub>) -> Self {
        self.publisher = Some(hub.clone());
        self.hub = Some(hub);
        self
    }

    /// Publishes through something other than the in-process hub.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn ProgressPublisher>) -> Self {
        self.publisher = Some(publisher);
        self.hub = None;
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_default_style_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.default_style_prompt = prompt.into();
        self
    }

    /// # Errors
    /// A store or stage port was never supplied, or metrics failed to register.
    pub fn build(self) -> Result<Workflow> {
        let books = self.books.context("workflow requires a book store")?;
        let tasks = self.tasks.context("workflow requires a task store")?;
        let ports = StagePorts {
            story: self.story.context("workflow requires a story port")?,
            image: self.image.context("workflow requires an image port")?,
            pdf: self.pdf.context("workflow requires a pdf port")?,
        };
        let telemetry = match self.telemetry {
            Some(telemetry) => telemetry,
            None => Telemetry::metrics_only()?,
        };
        let (publisher, hub) = match (self.publisher, self.hub) {
            (Some(publisher), hub) => (publisher, hub),
            (None, _) => {
                let hub = Arc::new(ProgressHub::new(DEFAULT_PROGRESS_CAPACITY));
                (hub.clone() as Arc<dyn ProgressPublisher>, Some(hub))
            }
        };

        let coordinator = Arc::new(WorkflowCoordinator::new(
            Arc::clone(&books),
            Arc::clone(&tasks),
            ports,
            Arc::clone(&publisher),
            telemetry.clone(),
            self.default_style_prompt,
        ));
        let restarts = RestartManager::new(
            books,
            Arc::clone(&tasks),
            publisher,
            telemetry.clone(),
        );
        let queue: WorkflowQueue<RunRequest> = WorkflowQueue::start(
            coordinator.clone(),
            self.concurrency,
            self.queue_capacity,
        );

        info!(
            concurrency = self.concurrency,
            queue_capacity = self.queue_capacity,
            "workflow coordinator ready"
        );

        Ok(Workflow {
            coordinator,
            restarts,
            progress: ProgressAggregator::new(tasks),
            queue,
            hub,
            telemetry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::BookStatus;

    #[test]
    fn creation_spec_comes_from_book() {
        let owner = Uuid::new_v4();
        let mut book = Book::draft(
            owner,
            "Moon Garden",
            "A girl plants seeds on the moon",
            BookType::TextOnly,
            7,
            Some("watercolor".to_string()),
        );
        book.status = BookStatus::Failed;

        let spec = CreationSpec::from_book(&book);

        assert_eq!(spec.num_scenes, 7);
        assert_eq!(spec.style_prompt.as_deref(), Some("watercolor"));
        assert_eq!(spec.book_type, BookType::TextOnly);
        assert_eq!(spec.owner_id, owner);
    }

    #[test]
    fn spec_must_describe_the_stored_book() {
        let book = Book::draft(
            Uuid::new_v4(),
            "Moon Garden",
            "A girl plants seeds on the moon",
            BookType::TextImage,
            7,
            None,
        );
        let matching = CreationSpec::from_book(&book);
        assert_eq!(matching.mismatch_with(&book), None);

        let other_type = CreationSpec {
            book_type: BookType::TextOnly,
            num_scenes: 3,
            ..matching.clone()
        };
        assert_eq!(other_type.mismatch_with(&book), Some("book_type"));

        let other_count = CreationSpec {
            num_scenes: 3,
            ..matching.clone()
        };
        assert_eq!(other_count.mismatch_with(&book), Some("num_scenes"));

        let other_style = CreationSpec {
            style_prompt: Some("ink".to_string()),
            ..matching
        };
        assert_eq!(other_style.mismatch_with(&book), Some("style_prompt"));
    }

    #[tokio::test]
    async fn build_requires_ports() {
        let store = Arc::new(crate::store::dao::InMemoryStore::new());
        let err = Workflow::builder().with_store(store).build().err().unwrap();
        assert!(err.to_string().contains("story port"));
    }
}

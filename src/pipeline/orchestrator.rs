use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::broadcast::{ProgressPublisher, publish_current};
use super::executor::StageExecutor;
use super::ports::{
    ImagePort, ImageRequest, ImageResult, PdfPort, PdfRequest, StoryPort, StoryRequest,
    merge_scene_images,
};
use super::{CreationSpec, RunKind, RunRequest, WorkflowError};
use crate::observability::Telemetry;
use crate::queue::JobHandler;
use crate::store::dao::{BookDao, TaskDao};
use crate::store::models::{BookStatus, GenerationTask, Stage, TaskStatus};

/// The three generation services a run talks to.
#[derive(Clone)]
pub struct StagePorts {
    pub story: Arc<dyn StoryPort>,
    pub image: Arc<dyn ImagePort>,
    pub pdf: Arc<dyn PdfPort>,
}

/// Asset keys a successful run leaves on the book.
struct RunAssets {
    pdf_asset_key: String,
    cover_asset_key: Option<String>,
}

/// Owns the run lifecycle: the guarded start and the stage sequence a worker executes.
pub struct WorkflowCoordinator {
    books: Arc<dyn BookDao>,
    tasks: Arc<dyn TaskDao>,
    ports: StagePorts,
    publisher: Arc<dyn ProgressPublisher>,
    telemetry: Telemetry,
    default_style_prompt: String,
}

impl WorkflowCoordinator {
    pub fn new(
        books: Arc<dyn BookDao>,
        tasks: Arc<dyn TaskDao>,
        ports: StagePorts,
        publisher: Arc<dyn ProgressPublisher>,
        telemetry: Telemetry,
        default_style_prompt: String,
    ) -> Self {
        Self {
            books,
            tasks,
            ports,
            publisher,
            telemetry,
            default_style_prompt,
        }
    }

    pub(crate) fn tasks(&self) -> &dyn TaskDao {
        self.tasks.as_ref()
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub(crate) async fn publish(&self, book_id: Uuid) {
        publish_current(self.tasks.as_ref(), self.publisher.as_ref(), book_id).await;
    }

    /// Moves the book to `GENERATING` and creates its task set.
    ///
    /// The spec has to match the stored book. On a task store failure the
    /// previous book status is put back.
    pub(crate) async fn begin_run(
        &self,
        book_id: Uuid,
        spec: CreationSpec,
    ) -> Result<RunRequest, WorkflowError> {
        let book = self.books.get_book(book_id).await?;
        if let Some(field) = spec.mismatch_with(&book) {
            return Err(WorkflowError::SpecMismatch { book_id, field });
        }

        let previous = self
            .books
            .transition_status(book_id, &BookStatus::STARTABLE, BookStatus::Generating)
            .await?;

        let stages = spec.book_type.pipeline();
        if let Err(err) = self
            .tasks
            .create_tasks(book_id, spec.owner_id, stages)
            .await
        {
            if let Err(restore) = self.books.update_status(book_id, previous).await {
                error!(
                    book_id = %book_id,
                    error = %restore,
                    "failed to restore book status after task creation failed"
                );
            }
            return Err(err.into());
        }

        self.publish(book_id).await;
        info!(
            book_id = %book_id,
            book_type = %spec.book_type,
            previous_status = %previous,
            "generation run accepted"
        );
        Ok(RunRequest::new(book_id, spec, RunKind::Start))
    }

    /// Worker side of a run. Never returns an error: every outcome ends in a
    /// final snapshot followed by a terminal book status.
    ///
    /// The snapshot goes out while the book is still `GENERATING`; once the
    /// status is written a restart may publish its own reset snapshot.
    #[instrument(skip_all, fields(book_id = %run.book_id, kind = run.kind.as_str()))]
    pub(crate) async fn execute_run(&self, run: RunRequest) {
        let book_id = run.book_id;
        self.telemetry.record_run_started();

        let succeeded = match self.run_stages(&run).await {
            Ok(assets) => {
                self.publish(book_id).await;
                self.complete_book(book_id, &assets).await
            }
            Err(WorkflowError::StageFailure { stage, source }) => {
                warn!(stage = %stage, error = %source, "generation run failed");
                self.publish(book_id).await;
                self.mark_book_failed(book_id).await;
                false
            }
            Err(err) => {
                error!(error = %err, "generation run aborted");
                self.fail_run(book_id, &err.to_string()).await;
                false
            }
        };

        self.telemetry
            .record_run_finished(succeeded, run.accepted_at.elapsed());
    }

    async fn run_stages(&self, run: &RunRequest) -> Result<RunAssets, WorkflowError> {
        let book_id = run.book_id;
        let spec = &run.spec;
        let executor = StageExecutor::new(self, book_id);

        let story_request = StoryRequest {
            summary: spec.summary.clone(),
            num_scenes: spec.num_scenes,
            owner_id: spec.owner_id,
            book_id,
        };
        let story = executor
            .run_stage(Stage::Story, || {
                self.ports.story.generate_story(&story_request)
            })
            .await?;

        let images = if spec.book_type.pipeline().contains(&Stage::Image) {
            let image_request = ImageRequest {
                subject_prompt: story.main_character.description.clone(),
                subject_tokens: story.main_character.tokens.clone(),
                scenes: story.scenes.clone(),
                style_prompt: self.style_prompt_for(spec),
                owner_id: spec.owner_id,
                book_id,
            };
            let images = executor
                .run_stage(Stage::Image, || {
                    self.ports.image.generate_images(&image_request)
                })
                .await?;
            Some(images)
        } else {
            None
        };

        let pdf_request = PdfRequest {
            title: spec.title.clone(),
            main_character_description: story.main_character.description.clone(),
            scenes: merge_scene_images(&story.scenes, images.as_ref()),
            template_type: spec.book_type.as_str().to_string(),
            owner_id: spec.owner_id,
            book_id,
        };
        let pdf = executor
            .run_stage(Stage::Pdf, || self.ports.pdf.generate_pdf(&pdf_request))
            .await?;

        Ok(RunAssets {
            cover_asset_key: images
                .as_ref()
                .and_then(ImageResult::cover_key)
                .map(str::to_string),
            pdf_asset_key: pdf.pdf_asset_key,
        })
    }

    async fn complete_book(&self, book_id: Uuid, assets: &RunAssets) -> bool {
        let cover = assets.cover_asset_key.as_deref();
        match self
            .books
            .complete_run(book_id, &assets.pdf_asset_key, cover)
            .await
        {
            Ok(()) => {
                info!(
                    pdf_asset_key = %assets.pdf_asset_key,
                    cover_asset_key = cover.unwrap_or_default(),
                    "generation run completed"
                );
                true
            }
            Err(err) => {
                error!(error = %err, "failed to store run assets");
                self.mark_book_failed(book_id).await;
                false
            }
        }
    }

    fn style_prompt_for(&self, spec: &CreationSpec) -> String {
        spec.style_prompt
            .as_deref()
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .unwrap_or(&self.default_style_prompt)
            .to_string()
    }

    /// Fails the unfinished part of a run, publishes, then marks the book `FAILED`.
    async fn fail_run(&self, book_id: Uuid, reason: &str) {
        self.fail_in_flight(book_id, reason).await;
        self.publish(book_id).await;
        self.mark_book_failed(book_id).await;
    }

    /// Fails whichever task was `PROCESSING` when the run broke down, or the
    /// first `PENDING` one when no stage had been picked up yet.
    async fn fail_in_flight(&self, book_id: Uuid, message: &str) {
        let tasks = match self.tasks.find_by_book(book_id).await {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(book_id = %book_id, error = %err, "failed to load tasks of aborted run");
                return;
            }
        };

        let processing: Vec<GenerationTask> = tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Processing)
            .cloned()
            .collect();
        let targets: Vec<GenerationTask> = if processing.is_empty() {
            tasks
                .into_iter()
                .find(|task| task.status == TaskStatus::Pending)
                .into_iter()
                .collect()
        } else {
            processing
        };

        for mut task in targets {
            if task.abort(message, Utc::now()).is_err() {
                continue;
            }
            if let Err(err) = self.tasks.update_task(&task).await {
                error!(
                    book_id = %book_id,
                    stage = %task.stage,
                    error = %err,
                    "failed to persist aborted task"
                );
            }
        }
    }

    async fn mark_book_failed(&self, book_id: Uuid) {
        if let Err(err) = self.books.update_status(book_id, BookStatus::Failed).await {
            error!(book_id = %book_id, error = %err, "failed to mark book as failed");
        }
    }
}

#[async_trait]
impl JobHandler<RunRequest> for WorkflowCoordinator {
    async fn handle(&self, run: RunRequest) {
        self.execute_run(run).await;
    }

    async fn abandon(&self, run: RunRequest, reason: String) {
        let book_id = run.book_id;
        error!(book_id = %book_id, reason = %reason, "generation run abandoned");
        self.fail_run(book_id, &reason).await;
        self.telemetry
            .record_run_finished(false, run.accepted_at.elapsed());
    }

    async fn discard(&self, run: RunRequest, reason: String) {
        let book_id = run.book_id;
        warn!(book_id = %book_id, reason = %reason, "queued generation run discarded");
        self.fail_run(book_id, &reason).await;
        self.telemetry.record_run_discarded();
    }
}

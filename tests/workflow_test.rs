use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use book_orchestrator::pipeline::ports::{
    GeneratedImage, ImagePort, ImageRequest, ImageResult, MainCharacter, PdfPort, PdfRequest,
    PdfResult, StageFailure, StoryPort, StoryRequest, StoryResult, StoryScene,
};
use book_orchestrator::store::dao::{BookDao, InMemoryStore, TaskDao};
use book_orchestrator::{
    Book, BookStatus, BookType, CreationSpec, ProgressHub, Stage, TaskStatus, Workflow,
    WorkflowError,
};
use tokio::sync::Notify;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

#[derive(Default)]
struct FakeStory {
    requests: Mutex<Vec<StoryRequest>>,
    failures_left: AtomicUsize,
    gate: Option<Arc<Gate>>,
}

impl FakeStory {
    fn failing_once() -> Self {
        Self {
            failures_left: AtomicUsize::new(1),
            ..Self::default()
        }
    }

    fn gated(gate: Arc<Gate>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<StoryRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl StoryPort for FakeStory {
    async fn generate_story(&self, request: &StoryRequest) -> Result<StoryResult, StageFailure> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StageFailure::new("LLM quota exceeded"));
        }

        Ok(StoryResult {
            scenes: (1..=request.num_scenes)
                .map(|number| StoryScene {
                    number,
                    narrative: format!("narrative {number}"),
                    scene_description: format!("description {number}"),
                })
                .collect(),
            main_character: MainCharacter {
                description: "a curious hedgehog".to_string(),
                tokens: vec!["hedgehog".to_string()],
            },
        })
    }
}

/// Illustrates every scene except those listed in `skip`.
#[derive(Default)]
struct FakeImages {
    requests: Mutex<Vec<ImageRequest>>,
    skip: Vec<u32>,
}

#[async_trait]
impl ImagePort for FakeImages {
    async fn generate_images(&self, request: &ImageRequest) -> Result<ImageResult, StageFailure> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(ImageResult {
            images: request
                .scenes
                .iter()
                .filter(|scene| !self.skip.contains(&scene.number))
                .map(|scene| GeneratedImage {
                    scene_number: scene.number,
                    image_url: format!("https://cdn.example.com/{}.png", scene.number),
                    image_key: format!("images/{}/{}.png", request.book_id, scene.number),
                })
                .collect(),
        })
    }
}

#[derive(Default)]
struct FakePdf {
    requests: Mutex<Vec<PdfRequest>>,
}

#[async_trait]
impl PdfPort for FakePdf {
    async fn generate_pdf(&self, request: &PdfRequest) -> Result<PdfResult, StageFailure> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(PdfResult {
            pdf_asset_key: format!("books/{}.pdf", request.book_id),
            pdf_url: None,
        })
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    hub: Arc<ProgressHub>,
    story: Arc<FakeStory>,
    images: Arc<FakeImages>,
    pdf: Arc<FakePdf>,
    workflow: Workflow,
}

impl Harness {
    fn new(story: FakeStory, images: FakeImages) -> Self {
        Self::with_pool(story, images, 2, 8)
    }

    fn with_pool(story: FakeStory, images: FakeImages, workers: usize, capacity: usize) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(ProgressHub::new(64));
        let story = Arc::new(story);
        let images = Arc::new(images);
        let pdf = Arc::new(FakePdf::default());
        let workflow = Workflow::builder()
            .with_store(store.clone())
            .with_story_port(story.clone())
            .with_image_port(images.clone())
            .with_pdf_port(pdf.clone())
            .with_progress_hub(hub.clone())
            .with_concurrency(workers)
            .with_queue_capacity(capacity)
            .build()
            .expect("workflow builds");

        Self {
            store,
            hub,
            story,
            images,
            pdf,
            workflow,
        }
    }

    async fn draft(&self, book_type: BookType, num_scenes: u32) -> Book {
        let book = Book::draft(
            Uuid::new_v4(),
            "The Hedgehog Who Counted Stars",
            "A hedgehog tries to count every star in the sky",
            book_type,
            num_scenes,
            None,
        );
        self.store.insert_book(&book).await.unwrap();
        book
    }

    async fn start(&self, book: &Book) -> Result<(), WorkflowError> {
        self.workflow
            .start_workflow(book.book_id, CreationSpec::from_book(book))
            .await
    }

    async fn wait_for_status(&self, book_id: Uuid, status: BookStatus) -> Book {
        tokio::time::timeout(WAIT, async {
            loop {
                let book = self.store.get_book(book_id).await.unwrap();
                if book.status == status {
                    return book;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("book {book_id} never reached {status}"))
    }
}

#[tokio::test]
async fn text_image_run_completes_with_cover() {
    let harness = Harness::new(FakeStory::default(), FakeImages::default());
    let book = harness.draft(BookType::TextImage, 3).await;

    harness.start(&book).await.unwrap();
    let done = harness
        .wait_for_status(book.book_id, BookStatus::Complete)
        .await;

    assert_eq!(
        done.pdf_asset_key,
        Some(format!("books/{}.pdf", book.book_id))
    );
    assert_eq!(
        done.cover_asset_key,
        Some(format!("images/{}/1.png", book.book_id))
    );

    let progress = harness.workflow.get_progress(book.book_id).await.unwrap();
    assert_eq!(progress.overall_status, TaskStatus::Completed);
    assert_eq!(progress.overall_progress, 100);
    assert_eq!(progress.steps.len(), 3);

    let image_request = harness.images.requests.lock().unwrap()[0].clone();
    assert_eq!(image_request.style_prompt, "A detailed digital artwork");
    assert_eq!(image_request.subject_prompt, "a curious hedgehog");
    assert_eq!(image_request.subject_tokens, vec!["hedgehog".to_string()]);

    let pdf_request = harness.pdf.requests.lock().unwrap()[0].clone();
    assert_eq!(pdf_request.template_type, "TEXT_IMAGE");
    assert_eq!(pdf_request.main_character_description, "a curious hedgehog");
    assert!(pdf_request.scenes.iter().all(|scene| scene.image_key.is_some()));
}

#[tokio::test]
async fn unmatched_scenes_reach_pdf_without_images() {
    let images = FakeImages {
        skip: vec![2],
        ..FakeImages::default()
    };
    let harness = Harness::new(FakeStory::default(), images);
    let book = harness.draft(BookType::TextImage, 3).await;

    harness.start(&book).await.unwrap();
    harness
        .wait_for_status(book.book_id, BookStatus::Complete)
        .await;

    let scenes = harness.pdf.requests.lock().unwrap()[0].scenes.clone();
    assert_eq!(scenes.len(), 3);
    assert!(scenes[0].image_url.is_some());
    assert!(scenes[1].image_url.is_none());
    assert!(scenes[1].image_key.is_none());
    assert_eq!(scenes[1].narrative, "narrative 2");
    assert!(scenes[2].image_key.is_some());
}

#[tokio::test]
async fn story_failure_stops_the_pipeline() {
    let harness = Harness::new(FakeStory::failing_once(), FakeImages::default());
    let book = harness.draft(BookType::TextImage, 3).await;

    harness.start(&book).await.unwrap();
    harness
        .wait_for_status(book.book_id, BookStatus::Failed)
        .await;

    let tasks = harness.store.find_by_book(book.book_id).await.unwrap();
    assert_eq!(tasks[0].stage, Stage::Story);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].error_message.as_deref(), Some("LLM quota exceeded"));
    assert!(tasks[0].completed_at.is_some());
    assert_eq!(tasks[1].status, TaskStatus::Pending);
    assert_eq!(tasks[2].status, TaskStatus::Pending);
    assert!(harness.images.requests.lock().unwrap().is_empty());
    assert!(harness.pdf.requests.lock().unwrap().is_empty());

    let progress = harness.workflow.get_progress(book.book_id).await.unwrap();
    assert_eq!(progress.overall_status, TaskStatus::Failed);
    assert_eq!(progress.steps[0].message.as_deref(), Some("LLM quota exceeded"));
}

#[tokio::test]
async fn text_only_skips_image_stage() {
    let harness = Harness::new(FakeStory::default(), FakeImages::default());
    let book = harness.draft(BookType::TextOnly, 2).await;

    harness.start(&book).await.unwrap();
    let done = harness
        .wait_for_status(book.book_id, BookStatus::Complete)
        .await;

    let stages: Vec<Stage> = harness
        .store
        .find_by_book(book.book_id)
        .await
        .unwrap()
        .iter()
        .map(|task| task.stage)
        .collect();
    assert_eq!(stages, vec![Stage::Story, Stage::Pdf]);
    assert!(harness.images.requests.lock().unwrap().is_empty());
    assert!(done.cover_asset_key.is_none());

    let pdf_request = harness.pdf.requests.lock().unwrap()[0].clone();
    assert_eq!(pdf_request.template_type, "TEXT_ONLY");
    assert!(pdf_request.scenes.iter().all(|scene| scene.image_url.is_none()));

    let progress = harness.workflow.get_progress(book.book_id).await.unwrap();
    assert_eq!(progress.overall_status, TaskStatus::Completed);
    assert_eq!(progress.overall_progress, 100);
    let steps: Vec<Stage> = progress.steps.iter().map(|step| step.stage).collect();
    assert_eq!(steps, vec![Stage::Story, Stage::Pdf]);
}

#[tokio::test]
async fn concurrent_start_is_rejected() {
    let gate = Arc::new(Gate::default());
    let harness = Harness::new(FakeStory::gated(gate.clone()), FakeImages::default());
    let book = harness.draft(BookType::TextImage, 2).await;

    harness.start(&book).await.unwrap();
    tokio::time::timeout(WAIT, gate.entered.notified())
        .await
        .expect("story stage started");

    let second = harness.start(&book).await.unwrap_err();
    assert!(matches!(second, WorkflowError::ConflictingRun { book_id } if book_id == book.book_id));
    let restart = harness.workflow.restart(book.book_id).await.unwrap_err();
    assert!(matches!(restart, WorkflowError::ConflictingRun { .. }));
    assert_eq!(
        harness.store.find_by_book(book.book_id).await.unwrap().len(),
        3
    );

    gate.release.notify_one();
    harness
        .wait_for_status(book.book_id, BookStatus::Complete)
        .await;
    assert_eq!(harness.story.calls().len(), 1);
}

#[tokio::test]
async fn restart_reruns_with_persisted_scene_count() {
    let harness = Harness::new(FakeStory::failing_once(), FakeImages::default());
    let book = harness.draft(BookType::TextImage, 7).await;

    harness.start(&book).await.unwrap();
    harness
        .wait_for_status(book.book_id, BookStatus::Failed)
        .await;

    let mut updates = harness.hub.subscribe(book.book_id);
    harness.workflow.restart(book.book_id).await.unwrap();

    let reset = updates.recv().await.unwrap();
    assert_eq!(reset.overall_status, TaskStatus::Pending);
    assert_eq!(reset.overall_progress, 0);
    assert!(reset.steps.iter().all(|step| step.message.is_none()));

    let done = harness
        .wait_for_status(book.book_id, BookStatus::Complete)
        .await;
    assert!(done.pdf_asset_key.is_some());

    let calls = harness.story.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].num_scenes, 7);
    assert_eq!(calls[1].owner_id, book.owner_id);

    let mut last = reset;
    while let Ok(snapshot) = updates.try_recv() {
        assert!(snapshot.overall_progress >= last.overall_progress);
        last = snapshot;
    }
    assert_eq!(last.overall_status, TaskStatus::Completed);
    assert_eq!(last.overall_progress, 100);
}

#[tokio::test]
async fn completed_book_can_start_again() {
    let harness = Harness::new(FakeStory::default(), FakeImages::default());
    let book = harness.draft(BookType::TextOnly, 1).await;

    harness.start(&book).await.unwrap();
    harness
        .wait_for_status(book.book_id, BookStatus::Complete)
        .await;
    harness.start(&book).await.unwrap();
    harness
        .wait_for_status(book.book_id, BookStatus::Complete)
        .await;

    assert_eq!(harness.story.calls().len(), 2);
    assert_eq!(
        harness.store.find_by_book(book.book_id).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn full_queue_rejects_without_state_change() {
    let gate = Arc::new(Gate::default());
    let harness = Harness::with_pool(FakeStory::gated(gate.clone()), FakeImages::default(), 1, 1);
    let running = harness.draft(BookType::TextOnly, 1).await;
    let queued = harness.draft(BookType::TextOnly, 1).await;
    let rejected = harness.draft(BookType::TextOnly, 1).await;

    harness.start(&running).await.unwrap();
    tokio::time::timeout(WAIT, gate.entered.notified())
        .await
        .expect("first run picked up");
    harness.start(&queued).await.unwrap();

    let err = harness.start(&rejected).await.unwrap_err();

    assert!(matches!(err, WorkflowError::QueueFull));
    assert_eq!(
        harness.store.get_book(rejected.book_id).await.unwrap().status,
        BookStatus::Draft
    );
    assert!(
        harness
            .store
            .find_by_book(rejected.book_id)
            .await
            .unwrap()
            .is_empty()
    );

    gate.release.notify_one();
    harness
        .wait_for_status(running.book_id, BookStatus::Complete)
        .await;
    gate.release.notify_one();
    harness
        .wait_for_status(queued.book_id, BookStatus::Complete)
        .await;
}

#[tokio::test]
async fn unknown_book_is_not_found() {
    let harness = Harness::new(FakeStory::default(), FakeImages::default());
    let missing = Uuid::new_v4();

    let spec = CreationSpec {
        title: "Nothing".to_string(),
        summary: "Nothing at all".to_string(),
        num_scenes: 1,
        book_type: BookType::TextOnly,
        style_prompt: None,
        owner_id: Uuid::new_v4(),
    };
    assert!(matches!(
        harness.workflow.start_workflow(missing, spec).await,
        Err(WorkflowError::NotFound(_))
    ));
    assert!(matches!(
        harness.workflow.restart(missing).await,
        Err(WorkflowError::NotFound(_))
    ));
    assert!(matches!(
        harness.workflow.get_progress(missing).await,
        Err(WorkflowError::NotFound(_))
    ));
}

#[tokio::test]
async fn shutdown_closes_the_queue() {
    let harness = Harness::new(FakeStory::default(), FakeImages::default());
    let book = harness.draft(BookType::TextOnly, 1).await;

    harness.workflow.shutdown().await;

    assert!(matches!(
        harness.start(&book).await,
        Err(WorkflowError::QueueClosed)
    ));
    assert_eq!(
        harness.store.get_book(book.book_id).await.unwrap().status,
        BookStatus::Draft
    );
}

#[tokio::test]
async fn start_rejects_spec_that_disagrees_with_book() {
    let harness = Harness::new(FakeStory::failing_once(), FakeImages::default());
    let book = harness.draft(BookType::TextImage, 7).await;
    let altered = CreationSpec {
        book_type: BookType::TextOnly,
        num_scenes: 3,
        ..CreationSpec::from_book(&book)
    };

    let err = harness
        .workflow
        .start_workflow(book.book_id, altered)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        WorkflowError::SpecMismatch { field: "book_type", .. }
    ));
    assert_eq!(
        harness.store.get_book(book.book_id).await.unwrap().status,
        BookStatus::Draft
    );
    assert!(harness.story.calls().is_empty());

    harness.start(&book).await.unwrap();
    harness
        .wait_for_status(book.book_id, BookStatus::Failed)
        .await;
    harness.workflow.restart(book.book_id).await.unwrap();
    harness
        .wait_for_status(book.book_id, BookStatus::Complete)
        .await;

    let scene_counts: Vec<u32> = harness
        .story
        .calls()
        .iter()
        .map(|call| call.num_scenes)
        .collect();
    assert_eq!(scene_counts, vec![7, 7]);
    assert_eq!(harness.images.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn partly_failed_book_needs_restart() {
    let harness = Harness::new(FakeStory::failing_once(), FakeImages::default());
    let book = harness.draft(BookType::TextImage, 2).await;

    harness.start(&book).await.unwrap();
    harness
        .wait_for_status(book.book_id, BookStatus::Failed)
        .await;

    let err = harness.start(&book).await.unwrap_err();
    assert!(matches!(err, WorkflowError::RestartRequired { book_id } if book_id == book.book_id));
    assert_eq!(
        harness.store.get_book(book.book_id).await.unwrap().status,
        BookStatus::Failed
    );

    harness.workflow.restart(book.book_id).await.unwrap();
    harness
        .wait_for_status(book.book_id, BookStatus::Complete)
        .await;
}

#[tokio::test]
async fn shutdown_fails_runs_still_queued() {
    let gate = Arc::new(Gate::default());
    let harness = Harness::with_pool(FakeStory::gated(gate.clone()), FakeImages::default(), 1, 2);
    let running = harness.draft(BookType::TextOnly, 1).await;
    let queued = harness.draft(BookType::TextOnly, 1).await;

    harness.start(&running).await.unwrap();
    tokio::time::timeout(WAIT, gate.entered.notified())
        .await
        .expect("first run picked up");
    harness.start(&queued).await.unwrap();

    harness.workflow.shutdown().await;

    let stored = harness.store.get_book(queued.book_id).await.unwrap();
    assert_eq!(stored.status, BookStatus::Failed);
    let progress = harness.workflow.get_progress(queued.book_id).await.unwrap();
    assert_eq!(progress.overall_status, TaskStatus::Failed);
    assert_eq!(
        progress.steps[0].message.as_deref(),
        Some("workflow queue shut down")
    );
    assert_eq!(progress.steps[1].status, TaskStatus::Pending);
    assert!(matches!(
        harness.workflow.restart(queued.book_id).await,
        Err(WorkflowError::QueueClosed)
    ));

    gate.release.notify_one();
    harness
        .wait_for_status(running.book_id, BookStatus::Complete)
        .await;
    assert_eq!(harness.story.calls().len(), 1);
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Book の状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookStatus {
    Draft,
    Generating,
    Complete,
    Failed,
}

impl BookStatus {
    pub const ALL: [BookStatus; 4] = [
        BookStatus::Draft,
        BookStatus::Generating,
        BookStatus::Complete,
        BookStatus::Failed,
    ];

    /// Statuses from which a new run may begin.
    pub const STARTABLE: [BookStatus; 3] =
        [BookStatus::Draft, BookStatus::Complete, BookStatus::Failed];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BookStatus::Draft => "DRAFT",
            BookStatus::Generating => "GENERATING",
            BookStatus::Complete => "COMPLETE",
            BookStatus::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookType {
    TextOnly,
    TextImage,
}

impl BookType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BookType::TextOnly => "TEXT_ONLY",
            BookType::TextImage => "TEXT_IMAGE",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TEXT_ONLY" => Some(BookType::TextOnly),
            "TEXT_IMAGE" => Some(BookType::TextImage),
            _ => None,
        }
    }

    /// The ordered stages a run of this book type goes through.
    #[must_use]
    pub fn pipeline(self) -> &'static [Stage] {
        match self {
            BookType::TextOnly => &[Stage::Story, Stage::Pdf],
            BookType::TextImage => &[Stage::Story, Stage::Image, Stage::Pdf],
        }
    }
}

impl fmt::Display for BookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage. The derived ordering is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Story,
    Image,
    Pdf,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Story => "STORY",
            Stage::Image => "IMAGE",
            Stage::Pdf => "PDF",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STORY" => Some(Stage::Story),
            "IMAGE" => Some(Stage::Image),
            "PDF" => Some(Stage::Pdf),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GenerationTask の状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "PROCESSING" => Some(TaskStatus::Processing),
            "COMPLETED" => Some(TaskStatus::Completed),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 生成リクエスト1件分の集約。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub book_id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub summary: String,
    pub book_type: BookType,
    pub status: BookStatus,
    /// Scene count requested at creation; restart reuses it.
    pub num_scenes: u32,
    pub style_prompt: Option<String>,
    pub cover_asset_key: Option<String>,
    pub pdf_asset_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    /// A freshly persisted book, as handed over by the upstream creation flow.
    #[must_use]
    pub fn draft(
        owner_id: Uuid,
        title: impl Into<String>,
        summary: impl Into<String>,
        book_type: BookType,
        num_scenes: u32,
        style_prompt: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            book_id: Uuid::now_v7(),
            owner_id,
            title: title.into(),
            summary: summary.into(),
            book_type,
            status: BookStatus::Draft,
            num_scenes,
            style_prompt,
            cover_asset_key: None,
            pdf_asset_key: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal {stage} task transition from {from} to {to}")]
pub struct InvalidTransition {
    pub stage: Stage,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// One tracked stage of one book's pipeline.
///
/// State changes go through the transition methods so that the monotonic
/// status order, the set-once timestamps and the non-decreasing progress hold
/// regardless of which store backs the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub task_id: Uuid,
    pub book_id: Uuid,
    pub owner_id: Uuid,
    pub stage: Stage,
    pub status: TaskStatus,
    pub progress: u8,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationTask {
    #[must_use]
    pub fn pending(book_id: Uuid, owner_id: Uuid, stage: Stage) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::now_v7(),
            book_id,
            owner_id,
            stage,
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn illegal(&self, to: TaskStatus) -> InvalidTransition {
        InvalidTransition {
            stage: self.stage,
            from: self.status,
            to,
        }
    }

    /// # Errors
    /// Fails when the task is already terminal.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status.is_terminal() {
            return Err(self.illegal(TaskStatus::Processing));
        }
        self.status = TaskStatus::Processing;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Raises progress; lower values are ignored. Capped at 100.
    pub fn advance_progress(&mut self, progress: u8, now: DateTime<Utc>) {
        let progress = progress.min(100);
        if progress > self.progress {
            self.progress = progress;
            self.updated_at = now;
        }
    }

    /// # Errors
    /// Fails unless the task is `PROCESSING`.
    pub fn mark_completed(
        &mut self,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if self.status != TaskStatus::Processing {
            return Err(self.illegal(TaskStatus::Completed));
        }
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Progress is left where it was when the stage failed.
    ///
    /// # Errors
    /// Fails unless the task is `PROCESSING`.
    pub fn mark_failed(
        &mut self,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if self.status != TaskStatus::Processing {
            return Err(self.illegal(TaskStatus::Failed));
        }
        self.status = TaskStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Fails a task the run never finished, whether it was picked up or not.
    ///
    /// # Errors
    /// Fails when the task is already terminal.
    pub fn abort(
        &mut self,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if self.status.is_terminal() {
            return Err(self.illegal(TaskStatus::Failed));
        }
        self.status = TaskStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Back to the freshly created state. Only restart calls this.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.result = None;
        self.error_message = None;
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = now;
    }
}

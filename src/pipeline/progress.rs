use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WorkflowError;
use crate::store::dao::TaskDao;
use crate::store::models::{GenerationTask, Stage, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    pub stage: Stage,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: Option<String>,
}

/// Point-in-time view of a book's run, derived only from its persisted tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub book_id: Uuid,
    pub overall_status: TaskStatus,
    pub overall_progress: u8,
    pub steps: Vec<StepProgress>,
}

/// Folds a task set into a snapshot. `None` when there are no tasks.
#[must_use]
pub fn summarize(book_id: Uuid, tasks: &[GenerationTask]) -> Option<ProgressSnapshot> {
    if tasks.is_empty() {
        return None;
    }

    let mut ordered: Vec<&GenerationTask> = tasks.iter().collect();
    ordered.sort_by_key(|task| task.stage);

    let total: usize = ordered.iter().map(|task| usize::from(task.progress)).sum();
    let overall_progress = u8::try_from(total / ordered.len()).unwrap_or(100);

    let overall_status = if ordered.iter().any(|t| t.status == TaskStatus::Failed) {
        TaskStatus::Failed
    } else if ordered.iter().all(|t| t.status == TaskStatus::Completed) {
        TaskStatus::Completed
    } else if ordered.iter().any(|t| t.status == TaskStatus::Processing) {
        TaskStatus::Processing
    } else {
        TaskStatus::Pending
    };

    let steps = ordered
        .into_iter()
        .map(|task| StepProgress {
            stage: task.stage,
            status: task.status,
            progress: task.progress,
            message: task.error_message.clone(),
        })
        .collect();

    Some(ProgressSnapshot {
        book_id,
        overall_status,
        overall_progress,
        steps,
    })
}

/// Read side of the task store.
#[derive(Clone)]
pub struct ProgressAggregator {
    tasks: Arc<dyn TaskDao>,
}

impl ProgressAggregator {
    pub fn new(tasks: Arc<dyn TaskDao>) -> Self {
        Self { tasks }
    }

    /// # Errors
    /// `NotFound` when the book has no tasks, `Store` on backend failure.
    pub async fn get_progress(&self, book_id: Uuid) -> Result<ProgressSnapshot, WorkflowError> {
        let tasks = self.tasks.find_by_book(book_id).await?;
        summarize(book_id, &tasks).ok_or(WorkflowError::NotFound(book_id))
    }
}

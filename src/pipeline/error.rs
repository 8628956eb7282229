use thiserror::Error;
use uuid::Uuid;

use super::ports::StageFailure;
use crate::store::dao::StoreError;
use crate::store::models::{InvalidTransition, Stage};

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The book, or its task set, does not exist.
    #[error("book {0} or its generation tasks were not found")]
    NotFound(Uuid),
    #[error("{stage} stage failed: {source}")]
    StageFailure {
        stage: Stage,
        #[source]
        source: StageFailure,
    },
    #[error("book {book_id} already has a generation run in flight")]
    ConflictingRun { book_id: Uuid },
    /// A previous run stopped part-way and left unfinished tasks; only restart resumes it.
    #[error("book {book_id} has an unfinished task set; restart it instead of starting anew")]
    RestartRequired { book_id: Uuid },
    /// The creation spec does not describe the persisted book.
    #[error("creation spec for book {book_id} disagrees with the stored book on {field}")]
    SpecMismatch { book_id: Uuid, field: &'static str },
    #[error("workflow queue is full")]
    QueueFull,
    #[error("workflow queue is closed")]
    QueueClosed,
    #[error(transparent)]
    Store(anyhow::Error),
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BookNotFound(book_id) | StoreError::TaskNotFound { book_id, .. } => {
                WorkflowError::NotFound(book_id)
            }
            StoreError::ActiveTasksExist(book_id) => WorkflowError::RestartRequired { book_id },
            StoreError::StatusConflict { book_id, .. } => {
                WorkflowError::ConflictingRun { book_id }
            }
            StoreError::Backend(err) => WorkflowError::Store(err),
        }
    }
}

impl From<InvalidTransition> for WorkflowError {
    fn from(err: InvalidTransition) -> Self {
        WorkflowError::Store(err.into())
    }
}

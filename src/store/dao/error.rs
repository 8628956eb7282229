use thiserror::Error;
use uuid::Uuid;

use crate::store::models::{BookStatus, Stage};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("book {0} not found")]
    BookNotFound(Uuid),
    #[error("no {stage} task for book {book_id}")]
    TaskNotFound { book_id: Uuid, stage: Stage },
    #[error("book {0} already has an active task set")]
    ActiveTasksExist(Uuid),
    #[error("book {book_id} is {actual}, expected one of {expected:?}")]
    StatusConflict {
        book_id: Uuid,
        actual: BookStatus,
        expected: Vec<BookStatus>,
    },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

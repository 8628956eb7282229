//! In-process store used when embedding the coordinator without Postgres, and by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BookDao, StoreError, TaskDao};
use crate::store::models::{Book, BookStatus, GenerationTask, Stage};

#[derive(Debug, Default)]
struct State {
    books: HashMap<Uuid, Book>,
    tasks: HashMap<Uuid, Vec<GenerationTask>>,
}

/// Both DAOs over one lock, so every per-book write is atomic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskDao for InMemoryStore {
    async fn create_tasks(
        &self,
        book_id: Uuid,
        owner_id: Uuid,
        stages: &[Stage],
    ) -> Result<Vec<GenerationTask>, StoreError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.tasks.get(&book_id) {
            if existing.iter().any(|task| !task.status.is_terminal()) {
                return Err(StoreError::ActiveTasksExist(book_id));
            }
        }

        let mut stages = stages.to_vec();
        stages.sort();
        stages.dedup();
        let created: Vec<GenerationTask> = stages
            .into_iter()
            .map(|stage| GenerationTask::pending(book_id, owner_id, stage))
            .collect();
        state.tasks.insert(book_id, created.clone());
        Ok(created)
    }

    async fn find_by_book(&self, book_id: Uuid) -> Result<Vec<GenerationTask>, StoreError> {
        let state = self.state.read().await;
        Ok(state.tasks.get(&book_id).cloned().unwrap_or_default())
    }

    async fn find_by_book_and_stage(
        &self,
        book_id: Uuid,
        stage: Stage,
    ) -> Result<GenerationTask, StoreError> {
        let state = self.state.read().await;
        state
            .tasks
            .get(&book_id)
            .and_then(|tasks| tasks.iter().find(|task| task.stage == stage))
            .cloned()
            .ok_or(StoreError::TaskNotFound { book_id, stage })
    }

    async fn update_task(&self, task: &GenerationTask) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let tasks = state.tasks.entry(task.book_id).or_default();
        match tasks.iter_mut().find(|existing| existing.stage == task.stage) {
            Some(existing) => *existing = task.clone(),
            None => {
                tasks.push(task.clone());
                tasks.sort_by_key(|task| task.stage);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BookDao for InMemoryStore {
    async fn insert_book(&self, book: &Book) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.books.insert(book.book_id, book.clone());
        Ok(())
    }

    async fn get_book(&self, book_id: Uuid) -> Result<Book, StoreError> {
        let state = self.state.read().await;
        state
            .books
            .get(&book_id)
            .cloned()
            .ok_or(StoreError::BookNotFound(book_id))
    }

    async fn transition_status(
        &self,
        book_id: Uuid,
        from: &[BookStatus],
        to: BookStatus,
    ) -> Result<BookStatus, StoreError> {
        let mut state = self.state.write().await;
        let book = state
            .books
            .get_mut(&book_id)
            .ok_or(StoreError::BookNotFound(book_id))?;
        let previous = book.status;
        if !from.contains(&previous) {
            return Err(StoreError::StatusConflict {
                book_id,
                actual: previous,
                expected: from.to_vec(),
            });
        }
        book.status = to;
        book.updated_at = Utc::now();
        Ok(previous)
    }

    async fn update_status(&self, book_id: Uuid, status: BookStatus) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let book = state
            .books
            .get_mut(&book_id)
            .ok_or(StoreError::BookNotFound(book_id))?;
        book.status = status;
        book.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_run(
        &self,
        book_id: Uuid,
        pdf_asset_key: &str,
        cover_asset_key: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let book = state
            .books
            .get_mut(&book_id)
            .ok_or(StoreError::BookNotFound(book_id))?;
        book.pdf_asset_key = Some(pdf_asset_key.to_string());
        book.cover_asset_key = cover_asset_key.map(str::to_string);
        book.status = BookStatus::Complete;
        book.updated_at = Utc::now();
        Ok(())
    }
}

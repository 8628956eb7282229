use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{BookDao, StoreError, TaskDao};
use crate::store::models::{Book, BookStatus, BookType, GenerationTask, Stage, TaskStatus};

const SCHEMA: &str = include_str!("../../../migrations/0001_generation.sql");

const TASK_COLUMNS: &str = r"
    task_id, book_id, owner_id, stage, status, progress, result, error_message,
    started_at, completed_at, created_at, updated_at
";

/// Postgres-backed implementation of both DAOs.
///
/// Per-book atomicity comes from locking the `books` row (`SELECT ... FOR UPDATE`)
/// inside a transaction before touching that book's tasks.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the tables when they do not exist yet.
    ///
    /// # Errors
    /// When the schema statements fail.
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply generation schema")?;
        Ok(())
    }

    async fn lock_book(
        tx: &mut Transaction<'_, Postgres>,
        book_id: Uuid,
    ) -> Result<BookStatus, StoreError> {
        let row = sqlx::query(
            r"
            SELECT status
            FROM books
            WHERE book_id = $1
            FOR UPDATE
            ",
        )
        .bind(book_id)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to lock book row")?;

        let Some(row) = row else {
            return Err(StoreError::BookNotFound(book_id));
        };
        let status: String = row.try_get("status").context("failed to read book status")?;
        Ok(parse_book_status(&status)?)
    }

    fn row_to_task(row: &PgRow) -> anyhow::Result<GenerationTask> {
        let stage: String = row.try_get("stage")?;
        let status: String = row.try_get("status")?;
        let progress: i16 = row.try_get("progress")?;

        Ok(GenerationTask {
            task_id: row.try_get("task_id")?,
            book_id: row.try_get("book_id")?,
            owner_id: row.try_get("owner_id")?,
            stage: Stage::parse(&stage).ok_or_else(|| anyhow!("unknown stage {stage}"))?,
            status: TaskStatus::parse(&status)
                .ok_or_else(|| anyhow!("unknown task status {status}"))?,
            progress: u8::try_from(progress.clamp(0, 100)).unwrap_or(0),
            result: row.try_get::<Option<Value>, _>("result")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_book(row: &PgRow) -> anyhow::Result<Book> {
        let book_type: String = row.try_get("book_type")?;
        let status: String = row.try_get("status")?;
        let num_scenes: i32 = row.try_get("num_scenes")?;

        Ok(Book {
            book_id: row.try_get("book_id")?,
            owner_id: row.try_get("owner_id")?,
            title: row.try_get("title")?,
            summary: row.try_get("summary")?,
            book_type: BookType::parse(&book_type)
                .ok_or_else(|| anyhow!("unknown book type {book_type}"))?,
            status: parse_book_status(&status)?,
            num_scenes: u32::try_from(num_scenes).context("negative num_scenes")?,
            style_prompt: row.try_get("style_prompt")?,
            cover_asset_key: row.try_get("cover_asset_key")?,
            pdf_asset_key: row.try_get("pdf_asset_key")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn parse_book_status(status: &str) -> anyhow::Result<BookStatus> {
    BookStatus::parse(status).ok_or_else(|| anyhow!("unknown book status {status}"))
}

#[async_trait]
impl TaskDao for PgStore {
    async fn create_tasks(
        &self,
        book_id: Uuid,
        owner_id: Uuid,
        stages: &[Stage],
    ) -> Result<Vec<GenerationTask>, StoreError> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        Self::lock_book(&mut tx, book_id).await?;

        let active: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*)
            FROM generation_tasks
            WHERE book_id = $1
              AND status IN ('PENDING', 'PROCESSING')
            ",
        )
        .bind(book_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to count active tasks")?;
        if active > 0 {
            return Err(StoreError::ActiveTasksExist(book_id));
        }

        sqlx::query("DELETE FROM generation_tasks WHERE book_id = $1")
            .bind(book_id)
            .execute(&mut *tx)
            .await
            .context("failed to drop finished task set")?;

        let mut stages = stages.to_vec();
        stages.sort();
        stages.dedup();

        let mut created = Vec::with_capacity(stages.len());
        for stage in stages {
            let task = GenerationTask::pending(book_id, owner_id, stage);
            sqlx::query(
                r"
                INSERT INTO generation_tasks
                    (task_id, book_id, owner_id, stage, status, progress, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, 0, $6, $6)
                ",
            )
            .bind(task.task_id)
            .bind(task.book_id)
            .bind(task.owner_id)
            .bind(task.stage.as_str())
            .bind(task.status.as_str())
            .bind(task.created_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert {stage} task"))?;
            created.push(task);
        }

        tx.commit().await.context("failed to commit task set")?;
        Ok(created)
    }

    async fn find_by_book(&self, book_id: Uuid) -> Result<Vec<GenerationTask>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {TASK_COLUMNS}
            FROM generation_tasks
            WHERE book_id = $1
            ",
        ))
        .bind(book_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load tasks")?;

        let mut tasks = rows
            .iter()
            .map(Self::row_to_task)
            .collect::<anyhow::Result<Vec<_>>>()?;
        tasks.sort_by_key(|task| task.stage);
        Ok(tasks)
    }

    async fn find_by_book_and_stage(
        &self,
        book_id: Uuid,
        stage: Stage,
    ) -> Result<GenerationTask, StoreError> {
        let row = sqlx::query(&format!(
            r"
            SELECT {TASK_COLUMNS}
            FROM generation_tasks
            WHERE book_id = $1 AND stage = $2
            ",
        ))
        .bind(book_id)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to load task")?;

        match row {
            Some(row) => Ok(Self::row_to_task(&row)?),
            None => Err(StoreError::TaskNotFound { book_id, stage }),
        }
    }

    async fn update_task(&self, task: &GenerationTask) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO generation_tasks
                (task_id, book_id, owner_id, stage, status, progress, result, error_message,
                 started_at, completed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (book_id, stage) DO UPDATE
            SET status = EXCLUDED.status,
                progress = EXCLUDED.progress,
                result = EXCLUDED.result,
                error_message = EXCLUDED.error_message,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(task.task_id)
        .bind(task.book_id)
        .bind(task.owner_id)
        .bind(task.stage.as_str())
        .bind(task.status.as_str())
        .bind(i16::from(task.progress))
        .bind(task.result.as_ref())
        .bind(task.error_message.as_deref())
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist {} task", task.stage))?;

        Ok(())
    }
}

#[async_trait]
impl BookDao for PgStore {
    async fn insert_book(&self, book: &Book) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO books
                (book_id, owner_id, title, summary, book_type, status, num_scenes,
                 style_prompt, cover_asset_key, pdf_asset_key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(book.book_id)
        .bind(book.owner_id)
        .bind(&book.title)
        .bind(&book.summary)
        .bind(book.book_type.as_str())
        .bind(book.status.as_str())
        .bind(i32::try_from(book.num_scenes).context("num_scenes out of range")?)
        .bind(book.style_prompt.as_deref())
        .bind(book.cover_asset_key.as_deref())
        .bind(book.pdf_asset_key.as_deref())
        .bind(book.created_at)
        .bind(book.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert book")?;

        Ok(())
    }

    async fn get_book(&self, book_id: Uuid) -> Result<Book, StoreError> {
        let row = sqlx::query(
            r"
            SELECT book_id, owner_id, title, summary, book_type, status, num_scenes,
                   style_prompt, cover_asset_key, pdf_asset_key, created_at, updated_at
            FROM books
            WHERE book_id = $1
            ",
        )
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load book")?;

        match row {
            Some(row) => Ok(Self::row_to_book(&row)?),
            None => Err(StoreError::BookNotFound(book_id)),
        }
    }

    async fn transition_status(
        &self,
        book_id: Uuid,
        from: &[BookStatus],
        to: BookStatus,
    ) -> Result<BookStatus, StoreError> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let previous = Self::lock_book(&mut tx, book_id).await?;
        if !from.contains(&previous) {
            return Err(StoreError::StatusConflict {
                book_id,
                actual: previous,
                expected: from.to_vec(),
            });
        }

        sqlx::query(
            r"
            UPDATE books
            SET status = $2,
                updated_at = NOW()
            WHERE book_id = $1
            ",
        )
        .bind(book_id)
        .bind(to.as_str())
        .execute(&mut *tx)
        .await
        .context("failed to update book status")?;

        tx.commit().await.context("failed to commit status change")?;
        Ok(previous)
    }

    async fn update_status(&self, book_id: Uuid, status: BookStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE books
            SET status = $2,
                updated_at = NOW()
            WHERE book_id = $1
            ",
        )
        .bind(book_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("failed to update book status")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::BookNotFound(book_id));
        }
        Ok(())
    }

    async fn complete_run(
        &self,
        book_id: Uuid,
        pdf_asset_key: &str,
        cover_asset_key: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE books
            SET status = 'COMPLETE',
                pdf_asset_key = $2,
                cover_asset_key = $3,
                updated_at = NOW()
            WHERE book_id = $1
            ",
        )
        .bind(book_id)
        .bind(pdf_asset_key)
        .bind(cover_asset_key)
        .execute(&self.pool)
        .await
        .context("failed to store run assets")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::BookNotFound(book_id));
        }
        Ok(())
    }
}

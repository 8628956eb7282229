//! TaskDao trait - generation task persistence

use async_trait::async_trait;
use uuid::Uuid;

use crate::store::dao::StoreError;
use crate::store::models::{GenerationTask, Stage};

/// TaskDao - 生成タスクのデータアクセス層
#[async_trait]
pub trait TaskDao: Send + Sync {
    /// 指定ステージ分の PENDING タスクをまとめて作成する。
    ///
    /// 未完了のタスクが残っている場合は `ActiveTasksExist` を返す。
    /// すべて終端状態の旧タスク群は同じ書き込みの中で置き換えられる。
    async fn create_tasks(
        &self,
        book_id: Uuid,
        owner_id: Uuid,
        stages: &[Stage],
    ) -> Result<Vec<GenerationTask>, StoreError>;

    /// Book のタスクを STORY, IMAGE, PDF の順で返す
    async fn find_by_book(&self, book_id: Uuid) -> Result<Vec<GenerationTask>, StoreError>;

    async fn find_by_book_and_stage(
        &self,
        book_id: Uuid,
        stage: Stage,
    ) -> Result<GenerationTask, StoreError>;

    /// タスク1件を丸ごと書き戻す
    async fn update_task(&self, task: &GenerationTask) -> Result<(), StoreError>;
}

//! BookDao trait - book status and asset references

use async_trait::async_trait;
use uuid::Uuid;

use crate::store::dao::StoreError;
use crate::store::models::{Book, BookStatus};

#[async_trait]
pub trait BookDao: Send + Sync {
    async fn insert_book(&self, book: &Book) -> Result<(), StoreError>;

    async fn get_book(&self, book_id: Uuid) -> Result<Book, StoreError>;

    /// Compare-and-set on the book status.
    ///
    /// Moves the book to `to` only when its current status is in `from` and
    /// returns the status it replaced. Otherwise fails with `StatusConflict`.
    async fn transition_status(
        &self,
        book_id: Uuid,
        from: &[BookStatus],
        to: BookStatus,
    ) -> Result<BookStatus, StoreError>;

    async fn update_status(&self, book_id: Uuid, status: BookStatus) -> Result<(), StoreError>;

    /// 成果物キーを保存し、同じ書き込みで COMPLETE にする
    async fn complete_run(
        &self,
        book_id: Uuid,
        pdf_asset_key: &str,
        cover_asset_key: Option<&str>,
    ) -> Result<(), StoreError>;
}

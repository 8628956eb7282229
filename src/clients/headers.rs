//! Idempotency-Key ヘッダーのヘルパー。
//!
//! 生成サービスは同じキーの再送を重複実行しない前提で再試行する。
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

use crate::store::models::Stage;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// `{book_id}:{stage}` の形式のキー。
#[must_use]
pub fn idempotency_key(book_id: Uuid, stage: Stage) -> String {
    format!("{book_id}:{stage}")
}

#[must_use]
pub fn build_idempotent_headers(book_id: Uuid, stage: Stage) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&idempotency_key(book_id, stage)) {
        headers.insert(HeaderName::from_static("idempotency-key"), value);
    }
    headers
}

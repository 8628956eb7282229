use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::info;

use super::StageHttpConfig;
use super::http::JsonStageClient;
use crate::pipeline::ports::{StageFailure, StoryPort, StoryRequest, StoryResult};
use crate::store::models::Stage;

/// Text generation service client.
#[derive(Debug, Clone)]
pub struct StoryClient {
    inner: JsonStageClient,
}

impl StoryClient {
    /// # Errors
    /// URLのパースまたはHTTPクライアントの構築に失敗した場合。
    pub fn new(config: &StageHttpConfig) -> Result<Self> {
        Ok(Self {
            inner: JsonStageClient::new("story-service", config)?,
        })
    }

    async fn request(&self, request: &StoryRequest) -> Result<StoryResult> {
        let result: StoryResult = self
            .inner
            .post_json("generate-story", request, request.book_id, Stage::Story)
            .await?;
        if result.scenes.is_empty() {
            bail!("malformed story-service response: no scenes");
        }
        info!(
            book_id = %request.book_id,
            scenes = result.scenes.len(),
            "story generated"
        );
        Ok(result)
    }
}

#[async_trait]
impl StoryPort for StoryClient {
    async fn generate_story(&self, request: &StoryRequest) -> Result<StoryResult, StageFailure> {
        self.request(request).await.map_err(StageFailure::from)
    }
}

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::StageHttpConfig;
use super::http::JsonStageClient;
use crate::pipeline::ports::{ImagePort, ImageRequest, ImageResult, StageFailure};
use crate::store::models::Stage;

#[derive(Debug, Clone)]
pub struct ImageClient {
    inner: JsonStageClient,
}

impl ImageClient {
    /// # Errors
    /// URLのパースまたはHTTPクライアントの構築に失敗した場合。
    pub fn new(config: &StageHttpConfig) -> Result<Self> {
        Ok(Self {
            inner: JsonStageClient::new("image-service", config)?,
        })
    }
}

#[async_trait]
impl ImagePort for ImageClient {
    async fn generate_images(&self, request: &ImageRequest) -> Result<ImageResult, StageFailure> {
        let result: ImageResult = self
            .inner
            .post_json("generate-images", request, request.book_id, Stage::Image)
            .await?;
        info!(
            book_id = %request.book_id,
            images = result.images.len(),
            "illustrations generated"
        );
        Ok(result)
    }
}

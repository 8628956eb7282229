use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::StageHttpConfig;
use super::http::JsonStageClient;
use crate::pipeline::ports::{PdfPort, PdfRequest, PdfResult, StageFailure};
use crate::store::models::Stage;

#[derive(Debug, Clone)]
pub struct PdfClient {
    inner: JsonStageClient,
}

impl PdfClient {
    /// # Errors
    /// URLのパースまたはHTTPクライアントの構築に失敗した場合。
    pub fn new(config: &StageHttpConfig) -> Result<Self> {
        Ok(Self {
            inner: JsonStageClient::new("pdf-service", config)?,
        })
    }
}

#[async_trait]
impl PdfPort for PdfClient {
    async fn generate_pdf(&self, request: &PdfRequest) -> Result<PdfResult, StageFailure> {
        let result: PdfResult = self
            .inner
            .post_json("generate-pdf", request, request.book_id, Stage::Pdf)
            .await?;
        info!(book_id = %request.book_id, pdf_asset_key = %result.pdf_asset_key, "pdf assembled");
        Ok(result)
    }
}

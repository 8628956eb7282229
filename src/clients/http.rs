use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::{Client, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use super::headers::build_idempotent_headers;
use crate::store::models::Stage;
use crate::util::retry::{RetryConfig, is_retryable_error, is_retryable_status};

/// 生成サービス1つ分の接続設定。
#[derive(Debug, Clone)]
pub struct StageHttpConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    pub retry: RetryConfig,
}

/// JSON を POST して JSON を受け取るだけの共通クライアント。
#[derive(Debug, Clone)]
pub(super) struct JsonStageClient {
    service: &'static str,
    client: Client,
    base_url: Url,
    retry: RetryConfig,
}

impl JsonStageClient {
    pub(super) fn new(service: &'static str, config: &StageHttpConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .with_context(|| format!("failed to build {service} HTTP client"))?;

        // Url::join drops the last path segment unless the base ends with '/'.
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).with_context(|| format!("invalid {service} base URL"))?;

        Ok(Self {
            service,
            client,
            base_url,
            retry: config.retry,
        })
    }

    pub(super) async fn post_json<Req, Resp>(
        &self,
        path: &str,
        body: &Req,
        book_id: Uuid,
        stage: Stage,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let service = self.service;
        let url = self
            .base_url
            .join(path)
            .with_context(|| format!("failed to build {service} URL"))?;

        let mut attempt = 0;
        loop {
            let delay = self.retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
            let retries_left = self.retry.can_retry(attempt);

            debug!(service, book_id = %book_id, stage = %stage, attempt, "sending stage request");
            let sent = self
                .client
                .post(url.clone())
                .headers(build_idempotent_headers(book_id, stage))
                .json(body)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(err) if retries_left && is_retryable_error(&err) => {
                    warn!(service, book_id = %book_id, attempt, error = %err, "stage request failed, retrying");
                    continue;
                }
                Err(err) => {
                    return Err(anyhow!(err)).with_context(|| format!("{service} request failed"));
                }
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<Resp>()
                    .await
                    .with_context(|| format!("malformed {service} response"));
            }

            let error_body = response.text().await.unwrap_or_default();
            if retries_left && is_retryable_status(status) {
                warn!(service, book_id = %book_id, attempt, status = %status, "stage request rejected, retrying");
                continue;
            }
            bail!("{service} returned error status {status}: {error_body}");
        }
    }
}

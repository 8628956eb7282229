use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::{
    clients::{ImageClient, PdfClient, StoryClient},
    config::Config,
    observability::Telemetry,
    pipeline::{ProgressHub, Workflow},
    store::dao::PgStore,
    store::models::Stage,
};

/// Everything a host process needs to drive generation runs.
pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    store: Arc<PgStore>,
    progress_hub: Arc<ProgressHub>,
    workflow: Workflow,
}

impl ComponentRegistry {
    /// Wires telemetry, the Postgres store, the stage clients and the workflow,
    /// then bootstraps the `books`/`generation_tasks` schema.
    ///
    /// Workers are spawned on the current Tokio runtime.
    ///
    /// # Errors
    /// When telemetry, a client or the pool cannot be configured, or the schema
    /// cannot be applied.
    pub async fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let telemetry = Telemetry::new(
            config.otel_exporter_endpoint(),
            config.otel_sampling_ratio(),
        )?;
        let registry = Self::build_with_telemetry(config, telemetry)?;
        registry
            .store
            .apply_schema()
            .await
            .context("failed to apply book_db schema")?;
        Ok(registry)
    }

    /// Same as [`ComponentRegistry::build`] for hosts that install their own
    /// subscriber. The pool connects lazily and the schema is left untouched.
    ///
    /// # Errors
    /// When a client or the pool cannot be configured.
    pub fn build_with_telemetry(config: Arc<Config>, telemetry: Telemetry) -> Result<Self> {
        let story = Arc::new(StoryClient::new(&config.stage_http(Stage::Story))?);
        let image = Arc::new(ImageClient::new(&config.stage_http(Stage::Image))?);
        let pdf = Arc::new(PdfClient::new(&config.stage_http(Stage::Pdf))?);

        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections())
            .min_connections(config.db_min_connections())
            .acquire_timeout(config.db_acquire_timeout())
            .idle_timeout(Some(config.db_idle_timeout()))
            .max_lifetime(Some(config.db_max_lifetime()))
            .test_before_acquire(true)
            .connect_lazy(config.db_dsn())
            .context("failed to configure book_db connection pool")?;
        let store = Arc::new(PgStore::new(pool));

        let progress_hub = Arc::new(ProgressHub::new(config.progress_channel_capacity()));
        let workflow = Workflow::builder()
            .with_store(Arc::clone(&store))
            .with_story_port(story)
            .with_image_port(image)
            .with_pdf_port(pdf)
            .with_progress_hub(Arc::clone(&progress_hub))
            .with_telemetry(telemetry.clone())
            .with_concurrency(config.worker_concurrency())
            .with_queue_capacity(config.queue_capacity())
            .with_default_style_prompt(config.default_style_prompt())
            .build()?;

        info!("component registry built");

        Ok(Self {
            config,
            telemetry,
            store,
            progress_hub,
            workflow,
        })
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    #[must_use]
    pub fn store(&self) -> Arc<PgStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub fn progress_hub(&self) -> Arc<ProgressHub> {
        Arc::clone(&self.progress_hub)
    }

    #[must_use]
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Stops the workers and flushes pending spans.
    pub async fn shutdown(&self) {
        self.workflow.shutdown().await;
        crate::observability::tracing::shutdown();
    }
}

pub mod metrics;
pub mod tracing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};

use self::metrics::Metrics;
use crate::store::models::Stage;

/// Telemetry（メトリクスとトレーシング）を管理する構造体。
#[derive(Debug, Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// トレーシングを初期化し、専用レジストリにメトリクスを登録する。
    ///
    /// # Errors
    /// サブスクライバまたはメトリクスの初期化に失敗した場合。
    pub fn new(otel_endpoint: Option<&str>, sampling_ratio: f64) -> Result<Self> {
        tracing::init(otel_endpoint, sampling_ratio)?;
        Self::metrics_only()
    }

    /// メトリクスのみ。サブスクライバは呼び出し側が用意する。
    ///
    /// # Errors
    /// メトリクスの登録に失敗した場合。
    pub fn metrics_only() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new(Arc::clone(&registry))?);
        Ok(Self { registry, metrics })
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn record_run_started(&self) {
        self.metrics.runs_started.inc();
        self.metrics.active_runs.inc();
    }

    pub fn record_run_finished(&self, succeeded: bool, elapsed: Duration) {
        self.metrics.active_runs.dec();
        self.metrics.run_duration.observe(elapsed.as_secs_f64());
        if succeeded {
            self.metrics.runs_completed.inc();
        } else {
            self.metrics.runs_failed.inc();
        }
    }

    pub fn record_stage(&self, stage: Stage, succeeded: bool, elapsed: Duration) {
        self.metrics
            .stage_duration
            .with_label_values(&[stage.as_str()])
            .observe(elapsed.as_secs_f64());
        if !succeeded {
            self.metrics
                .stage_failures
                .with_label_values(&[stage.as_str()])
                .inc();
        }
    }

    /// A queued run that never reached a worker counts as failed.
    pub fn record_run_discarded(&self) {
        self.metrics.runs_failed.inc();
    }

    pub fn record_restart(&self) {
        self.metrics.restarts.inc();
    }

    pub fn record_rejected(&self) {
        self.metrics.rejected_starts.inc();
    }

    /// Prometheusメトリクスをテキスト形式でレンダリングする。
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_stage() {
        let telemetry = Telemetry::metrics_only().unwrap();
        telemetry.record_run_started();
        telemetry.record_stage(Stage::Pdf, false, Duration::from_millis(1200));
        telemetry.record_run_finished(false, Duration::from_secs(3));

        let rendered = telemetry.render_prometheus();

        assert!(rendered.contains("book_generation_stage_failures_total{stage=\"PDF\"} 1"));
        assert!(rendered.contains("book_generation_runs_failed_total 1"));
        assert!(rendered.contains("book_generation_active_runs 0"));
    }
}

//! Prometheusメトリクス定義。
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry,
};
use std::sync::Arc;

const STAGE_BUCKETS: &[f64] = &[0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0];

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    pub runs_started: Counter,
    pub runs_completed: Counter,
    pub runs_failed: Counter,
    pub restarts: Counter,
    pub rejected_starts: Counter,
    pub stage_failures: CounterVec,

    pub stage_duration: HistogramVec,
    pub run_duration: Histogram,

    pub active_runs: Gauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    ///
    /// # Errors
    /// 同名のコレクターが既に登録されている場合はエラーを返す。
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            runs_started: register_counter_with_registry!(
                "book_generation_runs_started_total",
                "Generation runs accepted (start and restart)",
                registry
            )?,
            runs_completed: register_counter_with_registry!(
                "book_generation_runs_completed_total",
                "Generation runs that produced a PDF",
                registry
            )?,
            runs_failed: register_counter_with_registry!(
                "book_generation_runs_failed_total",
                "Generation runs that ended in FAILED",
                registry
            )?,
            restarts: register_counter_with_registry!(
                "book_generation_restarts_total",
                "Restart requests accepted",
                registry
            )?,
            rejected_starts: register_counter_with_registry!(
                "book_generation_rejected_total",
                "Start or restart requests rejected before any state change",
                registry
            )?,
            stage_failures: register_counter_vec_with_registry!(
                Opts::new(
                    "book_generation_stage_failures_total",
                    "Stage calls that ended in FAILED"
                ),
                &["stage"],
                registry
            )?,
            stage_duration: register_histogram_vec_with_registry!(
                HistogramOpts::new(
                    "book_generation_stage_duration_seconds",
                    "Wall time of a single stage call"
                )
                .buckets(STAGE_BUCKETS.to_vec()),
                &["stage"],
                registry
            )?,
            run_duration: register_histogram_with_registry!(
                HistogramOpts::new(
                    "book_generation_run_duration_seconds",
                    "Wall time of a whole generation run"
                )
                .buckets(STAGE_BUCKETS.to_vec()),
                registry
            )?,
            active_runs: register_gauge_with_registry!(
                "book_generation_active_runs",
                "Runs currently executing on a worker",
                registry
            )?,
        })
    }
}

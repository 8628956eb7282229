use std::future::Future;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::WorkflowError;
use super::orchestrator::WorkflowCoordinator;
use super::ports::StageFailure;
use crate::store::models::Stage;

/// Progress recorded as soon as a stage is picked up.
const STAGE_STARTED_PROGRESS: u8 = 10;
/// Progress recorded once the port answered, before the result is stored.
const STAGE_RETURNED_PROGRESS: u8 = 50;

/// ステージ1つ分のタスク遷移・永続化・通知を行うヘルパー
pub(crate) struct StageExecutor<'a> {
    coordinator: &'a WorkflowCoordinator,
    book_id: Uuid,
}

impl<'a> StageExecutor<'a> {
    pub(crate) fn new(coordinator: &'a WorkflowCoordinator, book_id: Uuid) -> Self {
        Self {
            coordinator,
            book_id,
        }
    }

    /// Runs one stage call between its `PROCESSING` and terminal task writes.
    ///
    /// Every write is persisted before the matching snapshot is published.
    pub(crate) async fn run_stage<T, F, Fut>(&self, stage: Stage, call: F) -> Result<T, WorkflowError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StageFailure>>,
    {
        let tasks = self.coordinator.tasks();
        let mut task = tasks.find_by_book_and_stage(self.book_id, stage).await?;

        let now = Utc::now();
        task.mark_processing(now)?;
        task.advance_progress(STAGE_STARTED_PROGRESS, now);
        tasks.update_task(&task).await?;
        self.coordinator.publish(self.book_id).await;
        info!(book_id = %self.book_id, stage = %stage, "stage started");

        let started = Instant::now();
        let outcome = call().await;
        let elapsed = started.elapsed();
        self.coordinator
            .telemetry()
            .record_stage(stage, outcome.is_ok(), elapsed);

        match outcome {
            Ok(output) => {
                let result = serde_json::to_value(&output)
                    .with_context(|| format!("failed to encode {stage} result"))
                    .map_err(WorkflowError::Store)?;

                task.advance_progress(STAGE_RETURNED_PROGRESS, Utc::now());
                tasks.update_task(&task).await?;
                self.coordinator.publish(self.book_id).await;

                task.mark_completed(result, Utc::now())?;
                tasks.update_task(&task).await?;
                self.coordinator.publish(self.book_id).await;
                info!(
                    book_id = %self.book_id,
                    stage = %stage,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "stage completed"
                );
                Ok(output)
            }
            Err(failure) => {
                task.mark_failed(failure.message.clone(), Utc::now())?;
                tasks.update_task(&task).await?;
                self.coordinator.publish(self.book_id).await;
                warn!(
                    book_id = %self.book_id,
                    stage = %stage,
                    error = %failure,
                    "stage failed"
                );
                Err(WorkflowError::StageFailure {
                    stage,
                    source: failure,
                })
            }
        }
    }
}

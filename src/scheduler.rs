//! Trigger scheduler: admits new executions for pipelines.
//!
//! The periodic sweep and signal ingestion share one admission gate with two
//! rules: at most one active execution per pipeline, and no new execution
//! until `interval_minutes` have passed since the last finished one.

use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::dispatch::{WorkDispatcher, WorkItem};
use crate::domain::{Execution, Pipeline, Snapshot};
use crate::error::{DroverError, Result};
use crate::ledger::{record_event_best_effort, ExecutionEvent, Ledger};

/// What the admission gate decided for one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerDecision {
    Triggered(Execution),
    /// Another execution already holds the pipeline's active slot
    SkippedActive,
    /// The last finished execution is still inside the rate-limit window
    SkippedRateLimited,
}

/// Summary of one trigger sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub evaluated: u32,
    pub triggered: u32,
    pub skipped_active: u32,
    pub skipped_rate_limited: u32,
    pub errors: u32,
}

pub struct TriggerScheduler {
    ledger: Arc<dyn Ledger>,
    dispatcher: Arc<dyn WorkDispatcher>,
}

impl TriggerScheduler {
    pub fn new(ledger: Arc<dyn Ledger>, dispatcher: Arc<dyn WorkDispatcher>) -> Self {
        Self { ledger, dispatcher }
    }

    /// One pass over every active periodic pipeline. A failure on one
    /// pipeline never blocks the rest.
    pub async fn sweep(&self) -> Result<SweepStats> {
        let pipelines = self.ledger.list_active_periodic().await?;
        let mut stats = SweepStats::default();

        for pipeline in pipelines {
            stats.evaluated += 1;
            match self.evaluate(&pipeline, None).await {
                Ok(TriggerDecision::Triggered(execution)) => {
                    stats.triggered += 1;
                    info!(
                        "Triggered pipeline {} -> execution {}",
                        pipeline.name, execution.id
                    );
                }
                Ok(TriggerDecision::SkippedActive) => stats.skipped_active += 1,
                Ok(TriggerDecision::SkippedRateLimited) => stats.skipped_rate_limited += 1,
                Err(e) => {
                    stats.errors += 1;
                    error!("Trigger evaluation failed for pipeline {}: {}", pipeline.id, e);
                }
            }
        }

        debug!(
            "Trigger sweep: {} evaluated, {} triggered, {} active, {} rate-limited, {} errors",
            stats.evaluated,
            stats.triggered,
            stats.skipped_active,
            stats.skipped_rate_limited,
            stats.errors
        );
        Ok(stats)
    }

    /// Signal-side entry: same gate as the sweep, snapshot seeded with the
    /// signal payload.
    pub async fn accept_signal_trigger(
        &self,
        pipeline_id: Uuid,
        payload: &Value,
    ) -> Result<TriggerDecision> {
        let pipeline = self
            .ledger
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| DroverError::NotFound(format!("pipeline {}", pipeline_id)))?;
        if !pipeline.is_active {
            return Err(DroverError::Validation(format!(
                "pipeline {} is not active",
                pipeline_id
            )));
        }
        self.evaluate(&pipeline, Some(payload)).await
    }

    /// The shared admission gate.
    async fn evaluate(
        &self,
        pipeline: &Pipeline,
        signal_payload: Option<&Value>,
    ) -> Result<TriggerDecision> {
        if let Some(active) = self.ledger.find_active_for_pipeline(pipeline.id).await? {
            debug!(
                "Pipeline {} holds active execution {} ({})",
                pipeline.id, active.id, active.status
            );
            return Ok(TriggerDecision::SkippedActive);
        }

        if let Some(last) = self.ledger.last_finished_for_pipeline(pipeline.id).await? {
            if let Some(finished_at) = last.completed_at {
                let window = Duration::minutes(pipeline.interval_minutes);
                if Utc::now() - finished_at < window {
                    debug!(
                        "Pipeline {} rate-limited: last finished {} within {}m window",
                        pipeline.id, finished_at, pipeline.interval_minutes
                    );
                    return Ok(TriggerDecision::SkippedRateLimited);
                }
            }
        }

        let mut execution = Execution::new(pipeline, pipeline.periodic_mode);
        if let Some(payload) = signal_payload {
            execution.pipeline_state = Snapshot::seeded_with_signal(payload);
        }
        self.ledger.create_execution(&execution).await?;
        record_event_best_effort(
            self.ledger.as_ref(),
            ExecutionEvent::new(execution.id, "triggered").with_message(match signal_payload {
                Some(_) => format!("signal trigger for pipeline {}", pipeline.name),
                None => format!("periodic trigger for pipeline {}", pipeline.name),
            }),
        )
        .await;
        self.dispatcher.enqueue(WorkItem::RunDecision {
            execution_id: execution.id,
        })?;
        Ok(TriggerDecision::Triggered(execution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MockWorkDispatcher;
    use crate::domain::{ExecutionMode, ExecutionStatus, TriggerMode};
    use crate::ledger::{ExecutionLedger, MemoryLedger, PipelineStore};
    use serde_json::json;

    fn periodic_pipeline() -> Pipeline {
        let mut pipeline = Pipeline::new(Uuid::new_v4(), "sweep-me", TriggerMode::Periodic);
        pipeline.interval_minutes = 5;
        pipeline
    }

    fn accepting_dispatcher() -> MockWorkDispatcher {
        let mut dispatcher = MockWorkDispatcher::new();
        dispatcher.expect_enqueue().returning(|_| Ok(()));
        dispatcher.expect_schedule().returning(|_, _| Ok(()));
        dispatcher
    }

    #[tokio::test]
    async fn test_sweep_triggers_idle_pipeline() {
        let ledger = Arc::new(MemoryLedger::new());
        let pipeline = periodic_pipeline();
        ledger.create_pipeline(&pipeline).await.unwrap();

        let scheduler = TriggerScheduler::new(ledger.clone(), Arc::new(accepting_dispatcher()));
        let stats = scheduler.sweep().await.unwrap();
        assert_eq!(stats.evaluated, 1);
        assert_eq!(stats.triggered, 1);

        let active = ledger.find_active_for_pipeline(pipeline.id).await.unwrap();
        let active = active.expect("execution should exist");
        assert_eq!(active.status, ExecutionStatus::Pending);
        assert_eq!(active.mode, pipeline.periodic_mode);
    }

    #[tokio::test]
    async fn test_active_execution_blocks_second_trigger() {
        let ledger = Arc::new(MemoryLedger::new());
        let pipeline = periodic_pipeline();
        ledger.create_pipeline(&pipeline).await.unwrap();
        // Park an execution in AWAITING_APPROVAL; it holds the slot too.
        let mut execution = Execution::new(&pipeline, ExecutionMode::Paper);
        execution.status = ExecutionStatus::AwaitingApproval;
        ledger.create_execution(&execution).await.unwrap();

        let scheduler = TriggerScheduler::new(ledger.clone(), Arc::new(accepting_dispatcher()));
        let stats = scheduler.sweep().await.unwrap();
        assert_eq!(stats.triggered, 0);
        assert_eq!(stats.skipped_active, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_window_blocks_then_admits() {
        let ledger = Arc::new(MemoryLedger::new());
        let pipeline = periodic_pipeline();
        ledger.create_pipeline(&pipeline).await.unwrap();

        // Finished two minutes ago: inside the 5 minute window.
        let mut finished = Execution::new(&pipeline, ExecutionMode::Paper);
        finished.status = ExecutionStatus::Completed;
        finished.completed_at = Some(Utc::now() - Duration::minutes(2));
        ledger.create_execution(&finished).await.unwrap();

        let scheduler = TriggerScheduler::new(ledger.clone(), Arc::new(accepting_dispatcher()));
        let stats = scheduler.sweep().await.unwrap();
        assert_eq!(stats.skipped_rate_limited, 1);
        assert_eq!(stats.triggered, 0);

        // Push the finish outside the window and the pipeline is admitted.
        let mut rows = ledger
            .list_by_status(&[ExecutionStatus::Completed])
            .await
            .unwrap();
        let mut old = rows.remove(0);
        old.completed_at = Some(Utc::now() - Duration::minutes(6));
        ledger.create_execution(&old).await.unwrap();

        let stats = scheduler.sweep().await.unwrap();
        assert_eq!(stats.triggered, 1);
    }

    #[tokio::test]
    async fn test_failed_executions_also_rate_limit() {
        let ledger = Arc::new(MemoryLedger::new());
        let pipeline = periodic_pipeline();
        ledger.create_pipeline(&pipeline).await.unwrap();

        let mut failed = Execution::new(&pipeline, ExecutionMode::Paper);
        failed.status = ExecutionStatus::Failed;
        failed.completed_at = Some(Utc::now() - Duration::minutes(1));
        ledger.create_execution(&failed).await.unwrap();

        let scheduler = TriggerScheduler::new(ledger.clone(), Arc::new(accepting_dispatcher()));
        let stats = scheduler.sweep().await.unwrap();
        assert_eq!(stats.skipped_rate_limited, 1);
    }

    #[tokio::test]
    async fn test_signal_trigger_seeds_snapshot_and_respects_gate() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut pipeline = Pipeline::new(Uuid::new_v4(), "signals", TriggerMode::Signal);
        pipeline.signal_subscriptions = vec!["NVDA".to_string()];
        ledger.create_pipeline(&pipeline).await.unwrap();

        let scheduler = TriggerScheduler::new(ledger.clone(), Arc::new(accepting_dispatcher()));
        let payload = json!({ "symbol": "NVDA", "strength": 0.9 });
        let decision = scheduler
            .accept_signal_trigger(pipeline.id, &payload)
            .await
            .unwrap();
        let execution = match decision {
            TriggerDecision::Triggered(execution) => execution,
            other => panic!("expected trigger, got {:?}", other),
        };
        assert_eq!(execution.pipeline_state["signal"]["symbol"], "NVDA");

        // Second signal while the first run is active is turned away.
        let decision = scheduler
            .accept_signal_trigger(pipeline.id, &payload)
            .await
            .unwrap();
        assert_eq!(decision, TriggerDecision::SkippedActive);
    }

    #[tokio::test]
    async fn test_signal_trigger_rejects_inactive_pipeline() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut pipeline = Pipeline::new(Uuid::new_v4(), "dormant", TriggerMode::Signal);
        pipeline.is_active = false;
        ledger.create_pipeline(&pipeline).await.unwrap();

        let scheduler = TriggerScheduler::new(ledger.clone(), Arc::new(accepting_dispatcher()));
        let err = scheduler
            .accept_signal_trigger(pipeline.id, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::Validation(_)));
    }
}

//! Housekeeping: stale execution cleanup, terminal-row retention, and
//! calendar resets of per-user spend counters.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::ExecutionStatus;
use crate::error::{DroverError, Result};
use crate::ledger::{record_event_best_effort, BudgetResetStats, ExecutionEvent, Ledger};

/// Summary of one full maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceStats {
    pub stale_failed: u32,
    pub purged: u64,
    pub daily_resets: u64,
    pub monthly_resets: u64,
}

pub struct MaintenanceSweep {
    ledger: Arc<dyn Ledger>,
    stale_after_minutes: i64,
    retention_days: i64,
}

impl MaintenanceSweep {
    pub fn new(ledger: Arc<dyn Ledger>, stale_after_minutes: i64, retention_days: i64) -> Self {
        Self {
            ledger,
            stale_after_minutes,
            retention_days,
        }
    }

    /// Fail PENDING and RUNNING executions that have not made progress
    /// within the stale window. These are rows orphaned by a crash; failing
    /// them releases the pipeline's active slot.
    pub async fn fail_stale(&self) -> Result<u32> {
        let cutoff = Utc::now() - Duration::minutes(self.stale_after_minutes);
        let mut failed = 0u32;
        for row in self.ledger.stale_executions(cutoff).await? {
            let message = format!(
                "stalled in {} for over {} minutes",
                row.status, self.stale_after_minutes
            );
            match self
                .ledger
                .mark_failed(
                    row.id,
                    &[ExecutionStatus::Pending, ExecutionStatus::Running],
                    &message,
                )
                .await
            {
                Ok(_) => {
                    failed += 1;
                    record_event_best_effort(
                        self.ledger.as_ref(),
                        ExecutionEvent::new(row.id, "stale_failed")
                            .with_transition(row.status, ExecutionStatus::Failed)
                            .with_message(message.clone()),
                    )
                    .await;
                    warn!("Failed stale execution {}: {}", row.id, message);
                }
                Err(DroverError::InvalidState { .. }) => {
                    debug!("Execution {} progressed before stale cleanup", row.id);
                }
                Err(e) => {
                    warn!("Stale cleanup failed for execution {}: {}", row.id, e);
                }
            }
        }
        Ok(failed)
    }

    /// Delete terminal executions past the retention window.
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(self.retention_days);
        let deleted = self.ledger.delete_terminal_older_than(cutoff).await?;
        if deleted > 0 {
            info!(
                "Purged {} execution(s) older than {} days",
                deleted, self.retention_days
            );
        }
        Ok(deleted)
    }

    /// All three passes back to back. One-shot invocations use this; the
    /// resident process queues each pass as its own work item instead.
    pub async fn run_all(&self) -> Result<MaintenanceStats> {
        let stale_failed = self.fail_stale().await?;
        let purged = self.purge_expired().await?;
        let budgets = self.reset_budgets().await?;
        Ok(MaintenanceStats {
            stale_failed,
            purged,
            daily_resets: budgets.daily_reset,
            monthly_resets: budgets.monthly_reset,
        })
    }

    /// Zero spend counters whose UTC day or month has rolled over.
    pub async fn reset_budgets(&self) -> Result<BudgetResetStats> {
        let stats = self
            .ledger
            .reset_due_budgets(Utc::now().date_naive())
            .await?;
        if stats.daily_reset > 0 || stats.monthly_reset > 0 {
            info!(
                "Budget reset: {} daily, {} monthly",
                stats.daily_reset, stats.monthly_reset
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Execution, ExecutionMode, Pipeline, TriggerMode};
    use crate::ledger::{ExecutionLedger, MemoryLedger, PipelineStore};
    use uuid::Uuid;

    async fn seeded(
        ledger: &MemoryLedger,
        status: ExecutionStatus,
        age: Duration,
    ) -> Execution {
        let pipeline = Pipeline::new(Uuid::new_v4(), "aging", TriggerMode::Periodic);
        ledger.create_pipeline(&pipeline).await.unwrap();
        let mut execution = Execution::new(&pipeline, ExecutionMode::Paper);
        execution.status = status;
        execution.created_at = Utc::now() - age;
        if status == ExecutionStatus::Running {
            execution.started_at = Some(execution.created_at);
        }
        if status.is_terminal() {
            execution.completed_at = Some(execution.created_at);
        }
        ledger.create_execution(&execution).await.unwrap();
        execution
    }

    #[tokio::test]
    async fn test_stale_rows_fail_with_reason() {
        let ledger = Arc::new(MemoryLedger::new());
        let stuck_pending = seeded(&ledger, ExecutionStatus::Pending, Duration::hours(3)).await;
        let stuck_running = seeded(&ledger, ExecutionStatus::Running, Duration::hours(3)).await;
        let fresh = seeded(&ledger, ExecutionStatus::Pending, Duration::minutes(5)).await;

        let sweep = MaintenanceSweep::new(ledger.clone(), 120, 30);
        assert_eq!(sweep.fail_stale().await.unwrap(), 2);

        let row = ledger
            .get_execution(stuck_pending.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ExecutionStatus::Failed);
        assert!(row.error.as_deref().unwrap().contains("stalled in PENDING"));

        let row = ledger
            .get_execution(stuck_running.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ExecutionStatus::Failed);
        assert!(row.error.as_deref().unwrap().contains("stalled in RUNNING"));

        let row = ledger.get_execution(fresh.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn test_monitoring_rows_survive_stale_cleanup() {
        let ledger = Arc::new(MemoryLedger::new());
        let watched = seeded(&ledger, ExecutionStatus::Monitoring, Duration::days(2)).await;

        let sweep = MaintenanceSweep::new(ledger.clone(), 120, 30);
        assert_eq!(sweep.fail_stale().await.unwrap(), 0);

        let row = ledger.get_execution(watched.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Monitoring);
    }

    #[tokio::test]
    async fn test_retention_purges_only_old_terminal_rows() {
        let ledger = Arc::new(MemoryLedger::new());
        let old_done = seeded(&ledger, ExecutionStatus::Completed, Duration::days(40)).await;
        let recent_done = seeded(&ledger, ExecutionStatus::Completed, Duration::days(3)).await;
        let old_open = seeded(&ledger, ExecutionStatus::Monitoring, Duration::days(40)).await;

        let sweep = MaintenanceSweep::new(ledger.clone(), 120, 30);
        assert_eq!(sweep.purge_expired().await.unwrap(), 1);

        assert!(ledger.get_execution(old_done.id).await.unwrap().is_none());
        assert!(ledger
            .get_execution(recent_done.id)
            .await
            .unwrap()
            .is_some());
        assert!(ledger.get_execution(old_open.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fresh_budgets_are_not_reset() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .add_spend(Uuid::new_v4(), rust_decimal_macros::dec!(10))
            .await
            .unwrap();

        let sweep = MaintenanceSweep::new(ledger.clone(), 120, 30);
        let stats = sweep.reset_budgets().await.unwrap();
        assert_eq!(stats, BudgetResetStats::default());
    }
}

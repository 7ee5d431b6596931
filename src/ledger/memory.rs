//! In-memory ledger for simulation runs and tests.
//!
//! Same guarded-update semantics as the Postgres adapter, minus durability.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{
    ApprovalStatus, Execution, ExecutionPhase, ExecutionStatus, Pipeline, TriggerMode,
};
use crate::error::{DroverError, Result};

use super::{BudgetResetStats, ExecutionEvent, ExecutionLedger, PipelineStore, UserBudget};

#[derive(Default)]
pub struct MemoryLedger {
    pipelines: RwLock<HashMap<Uuid, Pipeline>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
    events: RwLock<Vec<ExecutionEvent>>,
    budgets: RwLock<HashMap<Uuid, UserBudget>>,
    // Fault injection for tests: refuse spend writes while set.
    #[cfg(test)]
    pub(crate) refuse_spend_writes: std::sync::atomic::AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a guarded transition under the write lock.
    async fn update_guarded<F>(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        apply: F,
    ) -> Result<Execution>
    where
        F: FnOnce(&mut Execution),
    {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| DroverError::NotFound(format!("execution {}", id)))?;
        if !from.contains(&execution.status) {
            return Err(DroverError::InvalidState {
                from: execution.status.to_string(),
                to: to.to_string(),
            });
        }
        execution.status = to;
        apply(execution);
        Ok(execution.clone())
    }
}

#[async_trait]
impl PipelineStore for MemoryLedger {
    async fn create_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        self.pipelines
            .write()
            .await
            .insert(pipeline.id, pipeline.clone());
        Ok(())
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>> {
        Ok(self.pipelines.read().await.get(&id).cloned())
    }

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        let mut pipelines: Vec<_> = self.pipelines.read().await.values().cloned().collect();
        pipelines.sort_by_key(|p| p.created_at);
        Ok(pipelines)
    }

    async fn list_active_periodic(&self) -> Result<Vec<Pipeline>> {
        let mut pipelines: Vec<_> = self
            .pipelines
            .read()
            .await
            .values()
            .filter(|p| p.is_active && p.trigger_mode == TriggerMode::Periodic)
            .cloned()
            .collect();
        pipelines.sort_by_key(|p| p.created_at);
        Ok(pipelines)
    }
}

#[async_trait]
impl ExecutionLedger for MemoryLedger {
    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn find_by_approval_token(&self, token: &str) -> Result<Option<Execution>> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .find(|e| e.approval_token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_active_for_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Execution>> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.pipeline_id == pipeline_id && e.status.is_active())
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn last_finished_for_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Execution>> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|e| {
                e.pipeline_id == pipeline_id
                    && matches!(
                        e.status,
                        ExecutionStatus::Completed | ExecutionStatus::Failed
                    )
            })
            .max_by_key(|e| e.completed_at)
            .cloned())
    }

    async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>> {
        let mut executions: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| statuses.contains(&e.status))
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.created_at);
        Ok(executions)
    }

    async fn recent_executions(&self, limit: i64) -> Result<Vec<Execution>> {
        let mut executions: Vec<_> = self.executions.read().await.values().cloned().collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        executions.truncate(limit.max(0) as usize);
        Ok(executions)
    }

    async fn mark_running(&self, id: Uuid) -> Result<Execution> {
        self.update_guarded(id, &[ExecutionStatus::Pending], ExecutionStatus::Running, |e| {
            e.started_at = Some(Utc::now());
            e.phase = Some(ExecutionPhase::Execute);
        })
        .await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        report: Option<&str>,
        final_cost: Option<Decimal>,
    ) -> Result<Execution> {
        self.update_guarded(id, from, ExecutionStatus::Completed, |e| {
            e.completed_at = Some(Utc::now());
            if let Some(report) = report {
                e.executive_report = Some(report.to_string());
            }
            if final_cost.is_some() {
                e.cost = final_cost;
            }
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        error: &str,
    ) -> Result<Execution> {
        self.update_guarded(id, from, ExecutionStatus::Failed, |e| {
            e.completed_at = Some(Utc::now());
            e.error = Some(error.to_string());
        })
        .await
    }

    async fn mark_cancelled(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        reason: Option<&str>,
    ) -> Result<Execution> {
        self.update_guarded(id, from, ExecutionStatus::Cancelled, |e| {
            e.completed_at = Some(Utc::now());
            if let Some(reason) = reason {
                e.error = Some(reason.to_string());
            }
        })
        .await
    }

    async fn mark_monitoring(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        symbol: &str,
        cost: Option<Decimal>,
        next_check_at: DateTime<Utc>,
    ) -> Result<Execution> {
        self.update_guarded(id, from, ExecutionStatus::Monitoring, |e| {
            e.phase = Some(ExecutionPhase::Monitor);
            e.symbol = Some(symbol.to_string());
            e.cost = cost;
            e.next_check_at = Some(next_check_at);
        })
        .await
    }

    async fn mark_paused(&self, id: Uuid) -> Result<Execution> {
        self.update_guarded(id, &[ExecutionStatus::Monitoring], ExecutionStatus::Paused, |_| {})
            .await
    }

    async fn resume_monitoring(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        next_check_at: DateTime<Utc>,
    ) -> Result<Execution> {
        self.update_guarded(id, from, ExecutionStatus::Monitoring, |e| {
            e.phase = Some(ExecutionPhase::Monitor);
            e.next_check_at = Some(next_check_at);
        })
        .await
    }

    async fn mark_needs_reconciliation(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        detail: &str,
    ) -> Result<Execution> {
        self.update_guarded(id, from, ExecutionStatus::NeedsReconciliation, |e| {
            e.error = Some(detail.to_string());
        })
        .await
    }

    async fn mark_communication_error(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
    ) -> Result<Execution> {
        self.update_guarded(id, from, ExecutionStatus::CommunicationError, |_| {})
            .await
    }

    async fn reschedule_check(&self, id: Uuid, next_check_at: DateTime<Utc>) -> Result<Execution> {
        self.update_guarded(
            id,
            &[ExecutionStatus::Monitoring],
            ExecutionStatus::Monitoring,
            |e| {
                e.next_check_at = Some(next_check_at);
            },
        )
        .await
    }

    async fn request_approval(
        &self,
        id: Uuid,
        token: &str,
        requested_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Execution> {
        self.update_guarded(
            id,
            &[ExecutionStatus::Running],
            ExecutionStatus::AwaitingApproval,
            |e| {
                e.approval_status = Some(ApprovalStatus::Pending);
                e.approval_token = Some(token.to_string());
                e.approval_requested_at = Some(requested_at);
                e.approval_expires_at = Some(expires_at);
                e.approval_responded_at = None;
            },
        )
        .await
    }

    async fn resolve_approval(&self, id: Uuid, resolution: ApprovalStatus) -> Result<Execution> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| DroverError::NotFound(format!("execution {}", id)))?;
        match execution.approval_status {
            Some(ApprovalStatus::Pending) => {}
            Some(_) => {
                return Err(DroverError::AlreadyResolved(format!("execution {}", id)));
            }
            None => {
                return Err(DroverError::InvalidState {
                    from: execution.status.to_string(),
                    to: ExecutionStatus::AwaitingApproval.to_string(),
                });
            }
        }
        if execution.status != ExecutionStatus::AwaitingApproval {
            return Err(DroverError::InvalidState {
                from: execution.status.to_string(),
                to: ExecutionStatus::AwaitingApproval.to_string(),
            });
        }
        execution.approval_status = Some(resolution);
        execution.approval_responded_at = Some(Utc::now());
        Ok(execution.clone())
    }

    async fn save_snapshot(
        &self,
        id: Uuid,
        state: &Value,
        analysis: Option<&Value>,
        expected_version: i32,
    ) -> Result<Execution> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| DroverError::NotFound(format!("execution {}", id)))?;
        if execution.version != expected_version {
            return Err(DroverError::StaleWrite {
                id: id.to_string(),
                expected: expected_version,
            });
        }
        execution.pipeline_state = state.clone();
        if let Some(analysis) = analysis {
            execution.trade_analysis = Some(analysis.clone());
        }
        execution.version += 1;
        Ok(execution.clone())
    }

    async fn stale_executions(&self, cutoff: DateTime<Utc>) -> Result<Vec<Execution>> {
        let mut stale: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| {
                matches!(e.status, ExecutionStatus::Pending | ExecutionStatus::Running)
                    && e.started_at.unwrap_or(e.created_at) < cutoff
            })
            .cloned()
            .collect();
        stale.sort_by_key(|e| e.created_at);
        Ok(stale)
    }

    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, e| !(e.status.is_terminal() && e.created_at < cutoff));
        Ok((before - executions.len()) as u64)
    }

    async fn users_with_reconcilable(&self) -> Result<Vec<Uuid>> {
        let mut users: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| ExecutionStatus::RECONCILABLE.contains(&e.status))
            .map(|e| e.user_id)
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    async fn reconcilable_for_user(&self, user_id: Uuid) -> Result<Vec<Execution>> {
        let mut executions: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.user_id == user_id && ExecutionStatus::RECONCILABLE.contains(&e.status))
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.created_at);
        Ok(executions)
    }

    async fn record_event(&self, event: &ExecutionEvent) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn events_for_execution(
        &self,
        execution_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ExecutionEvent>> {
        let events = self.events.read().await;
        let mut matching: Vec<_> = events
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn add_spend(&self, user_id: Uuid, amount: Decimal) -> Result<()> {
        #[cfg(test)]
        if self
            .refuse_spend_writes
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            return Err(DroverError::Internal("budget store unavailable".to_string()));
        }
        let mut budgets = self.budgets.write().await;
        let today = Utc::now().date_naive();
        let budget = budgets.entry(user_id).or_insert_with(|| UserBudget {
            user_id,
            daily_spend: Decimal::ZERO,
            monthly_spend: Decimal::ZERO,
            daily_reset_on: today,
            monthly_reset_on: first_of_month(today),
        });
        budget.daily_spend += amount;
        budget.monthly_spend += amount;
        Ok(())
    }

    async fn get_budget(&self, user_id: Uuid) -> Result<Option<UserBudget>> {
        Ok(self.budgets.read().await.get(&user_id).cloned())
    }

    async fn reset_due_budgets(&self, today: NaiveDate) -> Result<BudgetResetStats> {
        let mut budgets = self.budgets.write().await;
        let mut stats = BudgetResetStats::default();
        for budget in budgets.values_mut() {
            if budget.daily_reset_on < today {
                budget.daily_spend = Decimal::ZERO;
                budget.daily_reset_on = today;
                stats.daily_reset += 1;
            }
            if first_of_month(budget.monthly_reset_on) < first_of_month(today) {
                budget.monthly_spend = Decimal::ZERO;
                budget.monthly_reset_on = first_of_month(today);
                stats.monthly_reset += 1;
            }
        }
        Ok(stats)
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date)
}

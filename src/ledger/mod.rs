//! Durable record of pipelines, executions, audit events, and spend.
//!
//! Every status change goes through a guarded update: the write carries the
//! set of statuses it is valid from, and an unmatched guard surfaces as
//! `NotFound` or `InvalidState` instead of silently clobbering a
//! concurrent transition. Work handlers rely on this for idempotency.

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{ApprovalStatus, Execution, ExecutionStatus, Pipeline};
use crate::error::Result;

/// Append-only lifecycle event attached to an execution.
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    pub event_type: String,
    pub from_status: Option<ExecutionStatus>,
    pub to_status: Option<ExecutionStatus>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(execution_id: Uuid, event_type: impl Into<String>) -> Self {
        Self {
            execution_id,
            event_type: event_type.into(),
            from_status: None,
            to_status: None,
            message: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_transition(mut self, from: ExecutionStatus, to: ExecutionStatus) -> Self {
        self.from_status = Some(from);
        self.to_status = Some(to);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Per-user spend counters with their reset markers.
#[derive(Debug, Clone)]
pub struct UserBudget {
    pub user_id: Uuid,
    pub daily_spend: Decimal,
    pub monthly_spend: Decimal,
    pub daily_reset_on: NaiveDate,
    pub monthly_reset_on: NaiveDate,
}

/// Counters from one budget reset pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetResetStats {
    pub daily_reset: u64,
    pub monthly_reset: u64,
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn create_pipeline(&self, pipeline: &Pipeline) -> Result<()>;
    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>>;
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>>;
    /// Active pipelines the periodic trigger sweep evaluates.
    async fn list_active_periodic(&self) -> Result<Vec<Pipeline>>;
}

#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    async fn create_execution(&self, execution: &Execution) -> Result<()>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>>;
    async fn find_by_approval_token(&self, token: &str) -> Result<Option<Execution>>;
    /// Any execution currently holding the pipeline's single active slot.
    async fn find_active_for_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Execution>>;
    /// Most recently finished (COMPLETED or FAILED) execution, for the
    /// trigger rate limit.
    async fn last_finished_for_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Execution>>;
    async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>>;
    async fn recent_executions(&self, limit: i64) -> Result<Vec<Execution>>;

    // Guarded status transitions. `from` is the set of statuses the write is
    // valid from; a row in any other status leaves the write unapplied.
    async fn mark_running(&self, id: Uuid) -> Result<Execution>;
    async fn mark_completed(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        report: Option<&str>,
        final_cost: Option<Decimal>,
    ) -> Result<Execution>;
    async fn mark_failed(&self, id: Uuid, from: &[ExecutionStatus], error: &str)
        -> Result<Execution>;
    async fn mark_cancelled(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        reason: Option<&str>,
    ) -> Result<Execution>;
    async fn mark_monitoring(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        symbol: &str,
        cost: Option<Decimal>,
        next_check_at: DateTime<Utc>,
    ) -> Result<Execution>;
    async fn mark_paused(&self, id: Uuid) -> Result<Execution>;
    async fn resume_monitoring(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        next_check_at: DateTime<Utc>,
    ) -> Result<Execution>;
    async fn mark_needs_reconciliation(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        detail: &str,
    ) -> Result<Execution>;
    async fn mark_communication_error(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
    ) -> Result<Execution>;
    /// Move the monitoring clock; only valid while MONITORING.
    async fn reschedule_check(&self, id: Uuid, next_check_at: DateTime<Utc>) -> Result<Execution>;

    // Approval stamps
    async fn request_approval(
        &self,
        id: Uuid,
        token: &str,
        requested_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Execution>;
    /// Stamp a pending approval exactly once; a second resolution comes back
    /// as `AlreadyResolved`.
    async fn resolve_approval(&self, id: Uuid, resolution: ApprovalStatus) -> Result<Execution>;

    /// Compare-and-set snapshot write. The version must match what the caller
    /// read; on conflict the caller re-reads and re-derives.
    async fn save_snapshot(
        &self,
        id: Uuid,
        state: &Value,
        analysis: Option<&Value>,
        expected_version: i32,
    ) -> Result<Execution>;

    // Sweep queries
    async fn stale_executions(&self, cutoff: DateTime<Utc>) -> Result<Vec<Execution>>;
    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
    async fn users_with_reconcilable(&self) -> Result<Vec<Uuid>>;
    async fn reconcilable_for_user(&self, user_id: Uuid) -> Result<Vec<Execution>>;

    // Audit trail
    async fn record_event(&self, event: &ExecutionEvent) -> Result<()>;
    async fn events_for_execution(
        &self,
        execution_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ExecutionEvent>>;

    // Spend counters
    async fn add_spend(&self, user_id: Uuid, amount: Decimal) -> Result<()>;
    async fn get_budget(&self, user_id: Uuid) -> Result<Option<UserBudget>>;
    /// Zero counters whose UTC day or month boundary has passed.
    async fn reset_due_budgets(&self, today: NaiveDate) -> Result<BudgetResetStats>;
}

/// Full persistence surface the orchestrator works against.
pub trait Ledger: ExecutionLedger + PipelineStore {}

impl<T: ExecutionLedger + PipelineStore> Ledger for T {}

/// Audit events never fail the operation that emits them.
pub async fn record_event_best_effort(ledger: &dyn Ledger, event: ExecutionEvent) {
    if let Err(e) = ledger.record_event(&event).await {
        warn!(
            "Failed to record {} event for execution {}: {}",
            event.event_type, event.execution_id, e
        );
    }
}

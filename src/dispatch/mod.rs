//! Work items and the dispatcher seam between components.
//!
//! Delivery is at-least-once: a crash can replay an item and a lost timer can
//! drop one until the next sweep re-arms it. Handlers therefore re-check
//! ledger state before acting, never trust the item itself.

pub mod pool;

pub use pool::TokioDispatcher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use crate::error::Result;

/// One unit of orchestrator work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkItem {
    /// Evaluate every active periodic pipeline
    TriggerSweep,
    /// Drive a PENDING execution through its decision phase
    RunDecision { execution_id: Uuid },
    /// Place the order for an approved execution
    ResumeDecision { execution_id: Uuid },
    /// Deferred approval expiry check
    ApprovalTimeout { execution_id: Uuid },
    /// Deferred position check
    MonitorCheck { execution_id: Uuid },
    /// Fan out per-user reconciliation
    ReconcileSweep,
    /// Reconcile one user's flagged executions
    ReconcileUser { user_id: Uuid },
    /// Fail executions that stopped making progress
    MaintenanceStale,
    /// Delete terminal executions past retention
    MaintenanceRetention,
    /// Reset spend counters whose UTC boundary passed
    MaintenanceBudgetReset,
}

impl WorkItem {
    /// Stable identity for delayed scheduling: a newly scheduled item replaces
    /// any pending timer with the same key.
    pub fn key(&self) -> String {
        match self {
            WorkItem::TriggerSweep => "trigger_sweep".to_string(),
            WorkItem::RunDecision { execution_id } => format!("run_decision:{}", execution_id),
            WorkItem::ResumeDecision { execution_id } => {
                format!("resume_decision:{}", execution_id)
            }
            WorkItem::ApprovalTimeout { execution_id } => {
                format!("approval_timeout:{}", execution_id)
            }
            WorkItem::MonitorCheck { execution_id } => format!("monitor_check:{}", execution_id),
            WorkItem::ReconcileSweep => "reconcile_sweep".to_string(),
            WorkItem::ReconcileUser { user_id } => format!("reconcile_user:{}", user_id),
            WorkItem::MaintenanceStale => "maintenance_stale".to_string(),
            WorkItem::MaintenanceRetention => "maintenance_retention".to_string(),
            WorkItem::MaintenanceBudgetReset => "maintenance_budget_reset".to_string(),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Consumes work items; implemented by the orchestrator.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, item: WorkItem) -> Result<()>;
}

/// Hands work to the pool, immediately or at a fixed future instant.
#[cfg_attr(test, mockall::automock)]
pub trait WorkDispatcher: Send + Sync {
    /// Queue an item for immediate handling.
    fn enqueue(&self, item: WorkItem) -> Result<()>;

    /// Queue an item to be handled no earlier than `fire_at`.
    fn schedule(&self, item: WorkItem, fire_at: DateTime<Utc>) -> Result<()>;
}

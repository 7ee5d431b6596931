//! PostgreSQL ledger adapter.
//!
//! All status changes are single guarded UPDATEs (`WHERE status = ANY(...)
//! RETURNING *`), so concurrent workers cannot clobber each other's
//! transitions. A write whose guard does not match re-reads the row to report
//! what actually happened.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::{
    ApprovalChannel, ApprovalStatus, Execution, ExecutionMode, ExecutionPhase, ExecutionStatus,
    Pipeline, TriggerMode,
};
use crate::error::{DroverError, Result};

use super::{BudgetResetStats, ExecutionEvent, ExecutionLedger, PipelineStore, UserBudget};

const EXECUTION_COLUMNS: &str = "id, pipeline_id, user_id, mode, status, phase, created_at, \
     started_at, completed_at, next_check_at, monitor_interval_minutes, approval_status, \
     approval_token, approval_requested_at, approval_responded_at, approval_expires_at, \
     pipeline_state, version, symbol, cost, error, trade_analysis, executive_report";

const PIPELINE_COLUMNS: &str = "id, user_id, name, trigger_mode, scanner_id, \
     signal_subscriptions, is_active, interval_minutes, periodic_mode, \
     monitor_interval_minutes, require_approval, approval_modes, approval_timeout_minutes, \
     approval_channels, approval_phone, notify_on_completion, created_at, updated_at";

/// PostgreSQL-backed ledger
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Create a new ledger with a connection pool
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create from an existing pool (useful for testing)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get a reference to the pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ==================== Row mapping ====================

    fn map_execution(row: &PgRow) -> Result<Execution> {
        let status: String = row.get("status");
        let mode: String = row.get("mode");
        Ok(Execution {
            id: row.get("id"),
            pipeline_id: row.get("pipeline_id"),
            user_id: row.get("user_id"),
            mode: ExecutionMode::try_from(mode.as_str()).map_err(DroverError::Internal)?,
            status: ExecutionStatus::try_from(status.as_str()).map_err(DroverError::Internal)?,
            phase: row
                .get::<Option<String>, _>("phase")
                .and_then(|s| ExecutionPhase::try_from(s.as_str()).ok()),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            next_check_at: row.get("next_check_at"),
            monitor_interval_minutes: row.get("monitor_interval_minutes"),
            approval_status: row
                .get::<Option<String>, _>("approval_status")
                .and_then(|s| ApprovalStatus::try_from(s.as_str()).ok()),
            approval_token: row.get("approval_token"),
            approval_requested_at: row.get("approval_requested_at"),
            approval_responded_at: row.get("approval_responded_at"),
            approval_expires_at: row.get("approval_expires_at"),
            pipeline_state: row.get("pipeline_state"),
            version: row.get("version"),
            symbol: row.get("symbol"),
            cost: row.get("cost"),
            error: row.get("error"),
            trade_analysis: row.get("trade_analysis"),
            executive_report: row.get("executive_report"),
        })
    }

    fn map_pipeline(row: &PgRow) -> Result<Pipeline> {
        let trigger_mode: String = row.get("trigger_mode");
        let periodic_mode: String = row.get("periodic_mode");
        Ok(Pipeline {
            id: row.get("id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
            trigger_mode: TriggerMode::try_from(trigger_mode.as_str())
                .map_err(DroverError::Internal)?,
            scanner_id: row.get("scanner_id"),
            signal_subscriptions: row.get("signal_subscriptions"),
            is_active: row.get("is_active"),
            interval_minutes: row.get("interval_minutes"),
            periodic_mode: ExecutionMode::try_from(periodic_mode.as_str())
                .map_err(DroverError::Internal)?,
            monitor_interval_minutes: row.get("monitor_interval_minutes"),
            require_approval: row.get("require_approval"),
            approval_modes: row
                .get::<Vec<String>, _>("approval_modes")
                .iter()
                .filter_map(|s| ExecutionMode::try_from(s.as_str()).ok())
                .collect(),
            approval_timeout_minutes: row.get("approval_timeout_minutes"),
            approval_channels: row
                .get::<Vec<String>, _>("approval_channels")
                .iter()
                .filter_map(|s| ApprovalChannel::try_from(s.as_str()).ok())
                .collect(),
            approval_phone: row.get("approval_phone"),
            notify_on_completion: row.get("notify_on_completion"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn map_event(row: &PgRow) -> ExecutionEvent {
        ExecutionEvent {
            execution_id: row.get("execution_id"),
            event_type: row.get("event_type"),
            from_status: row
                .get::<Option<String>, _>("from_status")
                .and_then(|s| ExecutionStatus::try_from(s.as_str()).ok()),
            to_status: row
                .get::<Option<String>, _>("to_status")
                .and_then(|s| ExecutionStatus::try_from(s.as_str()).ok()),
            message: row.get("message"),
            created_at: row.get("created_at"),
        }
    }

    /// A guarded UPDATE matched no row. Re-read to tell the caller whether
    /// the row is gone or just in another status.
    async fn transition_failure(&self, id: Uuid, to: ExecutionStatus) -> DroverError {
        match self.get_execution(id).await {
            Ok(Some(current)) => DroverError::InvalidState {
                from: current.status.to_string(),
                to: to.to_string(),
            },
            Ok(None) => DroverError::NotFound(format!("execution {}", id)),
            Err(e) => e,
        }
    }
}

fn status_strings(statuses: &[ExecutionStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl PipelineStore for PostgresLedger {
    #[instrument(skip(self, pipeline))]
    async fn create_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipelines (
                id, user_id, name, trigger_mode, scanner_id, signal_subscriptions,
                is_active, interval_minutes, periodic_mode, monitor_interval_minutes,
                require_approval, approval_modes, approval_timeout_minutes,
                approval_channels, approval_phone, notify_on_completion,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(pipeline.id)
        .bind(pipeline.user_id)
        .bind(&pipeline.name)
        .bind(pipeline.trigger_mode.as_str())
        .bind(pipeline.scanner_id)
        .bind(&pipeline.signal_subscriptions)
        .bind(pipeline.is_active)
        .bind(pipeline.interval_minutes)
        .bind(pipeline.periodic_mode.as_str())
        .bind(pipeline.monitor_interval_minutes)
        .bind(pipeline.require_approval)
        .bind(
            pipeline
                .approval_modes
                .iter()
                .map(|m| m.as_str().to_string())
                .collect::<Vec<_>>(),
        )
        .bind(pipeline.approval_timeout_minutes)
        .bind(
            pipeline
                .approval_channels
                .iter()
                .map(|c| c.as_str().to_string())
                .collect::<Vec<_>>(),
        )
        .bind(&pipeline.approval_phone)
        .bind(pipeline.notify_on_completion)
        .bind(pipeline.created_at)
        .bind(pipeline.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>> {
        let sql = format!("SELECT {} FROM pipelines WHERE id = $1", PIPELINE_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| Self::map_pipeline(&r)).transpose()
    }

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        let sql = format!("SELECT {} FROM pipelines ORDER BY created_at", PIPELINE_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::map_pipeline).collect()
    }

    async fn list_active_periodic(&self) -> Result<Vec<Pipeline>> {
        let sql = format!(
            "SELECT {} FROM pipelines WHERE is_active AND trigger_mode = 'PERIODIC' ORDER BY created_at",
            PIPELINE_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::map_pipeline).collect()
    }
}

#[async_trait]
impl ExecutionLedger for PostgresLedger {
    #[instrument(skip(self, execution))]
    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, pipeline_id, user_id, mode, status, phase, created_at,
                started_at, completed_at, next_check_at, monitor_interval_minutes,
                approval_status, approval_token, approval_requested_at,
                approval_responded_at, approval_expires_at, pipeline_state,
                version, symbol, cost, error, trade_analysis, executive_report
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22, $23)
            "#,
        )
        .bind(execution.id)
        .bind(execution.pipeline_id)
        .bind(execution.user_id)
        .bind(execution.mode.as_str())
        .bind(execution.status.as_str())
        .bind(execution.phase.map(|p| p.as_str()))
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.next_check_at)
        .bind(execution.monitor_interval_minutes)
        .bind(execution.approval_status.map(|s| s.as_str()))
        .bind(&execution.approval_token)
        .bind(execution.approval_requested_at)
        .bind(execution.approval_responded_at)
        .bind(execution.approval_expires_at)
        .bind(&execution.pipeline_state)
        .bind(execution.version)
        .bind(&execution.symbol)
        .bind(execution.cost)
        .bind(&execution.error)
        .bind(&execution.trade_analysis)
        .bind(&execution.executive_report)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        let sql = format!("SELECT {} FROM executions WHERE id = $1", EXECUTION_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| Self::map_execution(&r)).transpose()
    }

    async fn find_by_approval_token(&self, token: &str) -> Result<Option<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions WHERE approval_token = $1",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::map_execution(&r)).transpose()
    }

    async fn find_active_for_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions WHERE pipeline_id = $1 AND status = ANY($2) \
             ORDER BY created_at DESC LIMIT 1",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(pipeline_id)
            .bind(status_strings(&ExecutionStatus::ACTIVE))
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::map_execution(&r)).transpose()
    }

    async fn last_finished_for_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions \
             WHERE pipeline_id = $1 AND status IN ('COMPLETED', 'FAILED') \
             ORDER BY completed_at DESC NULLS LAST LIMIT 1",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(pipeline_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::map_execution(&r)).transpose()
    }

    async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions WHERE status = ANY($1) ORDER BY created_at",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status_strings(statuses))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_execution).collect()
    }

    async fn recent_executions(&self, limit: i64) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions ORDER BY created_at DESC LIMIT $1",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_execution).collect()
    }

    // ==================== Guarded transitions ====================

    async fn mark_running(&self, id: Uuid) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions \
             SET status = 'RUNNING', phase = 'execute', started_at = NOW() \
             WHERE id = $1 AND status = 'PENDING' \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Self::map_execution(&row),
            None => Err(self.transition_failure(id, ExecutionStatus::Running).await),
        }
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        report: Option<&str>,
        final_cost: Option<Decimal>,
    ) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions \
             SET status = 'COMPLETED', completed_at = NOW(), \
                 executive_report = COALESCE($3, executive_report), \
                 cost = COALESCE($4, cost) \
             WHERE id = $1 AND status = ANY($2) \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status_strings(from))
            .bind(report)
            .bind(final_cost)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Self::map_execution(&row),
            None => Err(self.transition_failure(id, ExecutionStatus::Completed).await),
        }
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        error: &str,
    ) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions \
             SET status = 'FAILED', completed_at = NOW(), error = $3 \
             WHERE id = $1 AND status = ANY($2) \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status_strings(from))
            .bind(error)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Self::map_execution(&row),
            None => Err(self.transition_failure(id, ExecutionStatus::Failed).await),
        }
    }

    async fn mark_cancelled(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        reason: Option<&str>,
    ) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions \
             SET status = 'CANCELLED', completed_at = NOW(), error = COALESCE($3, error) \
             WHERE id = $1 AND status = ANY($2) \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status_strings(from))
            .bind(reason)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Self::map_execution(&row),
            None => Err(self.transition_failure(id, ExecutionStatus::Cancelled).await),
        }
    }

    async fn mark_monitoring(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        symbol: &str,
        cost: Option<Decimal>,
        next_check_at: DateTime<Utc>,
    ) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions \
             SET status = 'MONITORING', phase = 'monitor', symbol = $3, cost = $4, \
                 next_check_at = $5 \
             WHERE id = $1 AND status = ANY($2) \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status_strings(from))
            .bind(symbol)
            .bind(cost)
            .bind(next_check_at)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Self::map_execution(&row),
            None => Err(self.transition_failure(id, ExecutionStatus::Monitoring).await),
        }
    }

    async fn mark_paused(&self, id: Uuid) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions SET status = 'PAUSED' \
             WHERE id = $1 AND status = 'MONITORING' \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Self::map_execution(&row),
            None => Err(self.transition_failure(id, ExecutionStatus::Paused).await),
        }
    }

    async fn resume_monitoring(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        next_check_at: DateTime<Utc>,
    ) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions \
             SET status = 'MONITORING', phase = 'monitor', next_check_at = $3 \
             WHERE id = $1 AND status = ANY($2) \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status_strings(from))
            .bind(next_check_at)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Self::map_execution(&row),
            None => Err(self.transition_failure(id, ExecutionStatus::Monitoring).await),
        }
    }

    async fn mark_needs_reconciliation(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        detail: &str,
    ) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions \
             SET status = 'NEEDS_RECONCILIATION', error = $3 \
             WHERE id = $1 AND status = ANY($2) \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status_strings(from))
            .bind(detail)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Self::map_execution(&row),
            None => Err(self
                .transition_failure(id, ExecutionStatus::NeedsReconciliation)
                .await),
        }
    }

    async fn mark_communication_error(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
    ) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions SET status = 'COMMUNICATION_ERROR' \
             WHERE id = $1 AND status = ANY($2) \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status_strings(from))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Self::map_execution(&row),
            None => Err(self
                .transition_failure(id, ExecutionStatus::CommunicationError)
                .await),
        }
    }

    async fn reschedule_check(&self, id: Uuid, next_check_at: DateTime<Utc>) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions SET next_check_at = $2 \
             WHERE id = $1 AND status = 'MONITORING' \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(next_check_at)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Self::map_execution(&row),
            None => Err(self.transition_failure(id, ExecutionStatus::Monitoring).await),
        }
    }

    // ==================== Approval stamps ====================

    #[instrument(skip(self, token))]
    async fn request_approval(
        &self,
        id: Uuid,
        token: &str,
        requested_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions \
             SET status = 'AWAITING_APPROVAL', approval_status = 'pending', \
                 approval_token = $2, approval_requested_at = $3, \
                 approval_expires_at = $4, approval_responded_at = NULL \
             WHERE id = $1 AND status = 'RUNNING' \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(token)
            .bind(requested_at)
            .bind(expires_at)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Self::map_execution(&row),
            None => Err(self
                .transition_failure(id, ExecutionStatus::AwaitingApproval)
                .await),
        }
    }

    async fn resolve_approval(&self, id: Uuid, resolution: ApprovalStatus) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions \
             SET approval_status = $2, approval_responded_at = NOW() \
             WHERE id = $1 AND status = 'AWAITING_APPROVAL' AND approval_status = 'pending' \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(resolution.as_str())
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            return Self::map_execution(&row);
        }
        // Tell the caller why the stamp did not land.
        match self.get_execution(id).await? {
            Some(current) => match current.approval_status {
                Some(ApprovalStatus::Pending) | None => Err(DroverError::InvalidState {
                    from: current.status.to_string(),
                    to: ExecutionStatus::AwaitingApproval.to_string(),
                }),
                Some(_) => Err(DroverError::AlreadyResolved(format!("execution {}", id))),
            },
            None => Err(DroverError::NotFound(format!("execution {}", id))),
        }
    }

    // ==================== Snapshot ====================

    #[instrument(skip(self, state, analysis))]
    async fn save_snapshot(
        &self,
        id: Uuid,
        state: &Value,
        analysis: Option<&Value>,
        expected_version: i32,
    ) -> Result<Execution> {
        let sql = format!(
            "UPDATE executions \
             SET pipeline_state = $2, trade_analysis = COALESCE($3, trade_analysis), \
                 version = version + 1 \
             WHERE id = $1 AND version = $4 \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(state)
            .bind(analysis)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            return Self::map_execution(&row);
        }
        match self.get_execution(id).await? {
            Some(_) => Err(DroverError::StaleWrite {
                id: id.to_string(),
                expected: expected_version,
            }),
            None => Err(DroverError::NotFound(format!("execution {}", id))),
        }
    }

    // ==================== Sweep queries ====================

    async fn stale_executions(&self, cutoff: DateTime<Utc>) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions \
             WHERE status IN ('PENDING', 'RUNNING') \
               AND COALESCE(started_at, created_at) < $1 \
             ORDER BY created_at",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_execution).collect()
    }

    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM executions \
             WHERE status IN ('COMPLETED', 'FAILED', 'CANCELLED') AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn users_with_reconcilable(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT DISTINCT user_id FROM executions WHERE status = ANY($1) ORDER BY user_id",
        )
        .bind(status_strings(&ExecutionStatus::RECONCILABLE))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("user_id")).collect())
    }

    async fn reconcilable_for_user(&self, user_id: Uuid) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions \
             WHERE user_id = $1 AND status = ANY($2) ORDER BY created_at",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(status_strings(&ExecutionStatus::RECONCILABLE))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_execution).collect()
    }

    // ==================== Audit trail ====================

    async fn record_event(&self, event: &ExecutionEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_events (
                execution_id, event_type, from_status, to_status, message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.execution_id)
        .bind(&event.event_type)
        .bind(event.from_status.map(|s| s.as_str()))
        .bind(event.to_status.map(|s| s.as_str()))
        .bind(&event.message)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_for_execution(
        &self,
        execution_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ExecutionEvent>> {
        let rows = sqlx::query(
            "SELECT execution_id, event_type, from_status, to_status, message, created_at \
             FROM execution_events \
             WHERE execution_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(execution_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::map_event).collect())
    }

    // ==================== Spend counters ====================

    async fn add_spend(&self, user_id: Uuid, amount: Decimal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_budgets (user_id, daily_spend, monthly_spend, daily_reset_on, monthly_reset_on)
            VALUES ($1, $2, $2, CURRENT_DATE, date_trunc('month', CURRENT_DATE)::date)
            ON CONFLICT (user_id) DO UPDATE SET
                daily_spend = user_budgets.daily_spend + EXCLUDED.daily_spend,
                monthly_spend = user_budgets.monthly_spend + EXCLUDED.monthly_spend,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_budget(&self, user_id: Uuid) -> Result<Option<UserBudget>> {
        let row = sqlx::query(
            "SELECT user_id, daily_spend, monthly_spend, daily_reset_on, monthly_reset_on \
             FROM user_budgets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| UserBudget {
            user_id: r.get("user_id"),
            daily_spend: r.get("daily_spend"),
            monthly_spend: r.get("monthly_spend"),
            daily_reset_on: r.get("daily_reset_on"),
            monthly_reset_on: r.get("monthly_reset_on"),
        }))
    }

    async fn reset_due_budgets(&self, today: NaiveDate) -> Result<BudgetResetStats> {
        let daily = sqlx::query(
            "UPDATE user_budgets \
             SET daily_spend = 0, daily_reset_on = $1, updated_at = NOW() \
             WHERE daily_reset_on < $1",
        )
        .bind(today)
        .execute(&self.pool)
        .await?;

        let monthly = sqlx::query(
            "UPDATE user_budgets \
             SET monthly_spend = 0, monthly_reset_on = date_trunc('month', $1::date)::date, \
                 updated_at = NOW() \
             WHERE monthly_reset_on < date_trunc('month', $1::date)::date",
        )
        .bind(today)
        .execute(&self.pool)
        .await?;

        Ok(BudgetResetStats {
            daily_reset: daily.rows_affected(),
            monthly_reset: monthly.rows_affected(),
        })
    }
}

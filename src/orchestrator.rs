//! Top-level orchestrator: owns every component, consumes the work queue,
//! and exposes the operations callers drive executions with.
//!
//! Work handlers re-read ledger state before acting, so replayed or stale
//! items degrade to no-ops instead of double writes.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::{BrokerClient, DecisionOutcome, DecisionRunner, Notifier, ResumeOutcome};
use crate::approval::{ApprovalDecision, ApprovalGate};
use crate::config::AppConfig;
use crate::dispatch::{TokioDispatcher, WorkDispatcher, WorkHandler, WorkItem};
use crate::domain::{ApprovalStatus, Execution, ExecutionStatus, Pipeline, PreTradeReport};
use crate::error::{DroverError, Result};
use crate::ledger::{record_event_best_effort, ExecutionEvent, Ledger};
use crate::maintenance::{MaintenanceStats, MaintenanceSweep};
use crate::monitor::PositionMonitor;
use crate::reconcile::{ReconcileStats, ReconciliationSweep};
use crate::scheduler::{SweepStats, TriggerDecision, TriggerScheduler};

/// Statuses a user may stop out of.
const STOPPABLE: [ExecutionStatus; 7] = [
    ExecutionStatus::Pending,
    ExecutionStatus::Running,
    ExecutionStatus::AwaitingApproval,
    ExecutionStatus::Monitoring,
    ExecutionStatus::Paused,
    ExecutionStatus::NeedsReconciliation,
    ExecutionStatus::CommunicationError,
];

pub struct Orchestrator {
    ledger: Arc<dyn Ledger>,
    runner: Arc<dyn DecisionRunner>,
    broker: Arc<dyn BrokerClient>,
    dispatcher: Arc<TokioDispatcher>,
    scheduler: TriggerScheduler,
    gate: ApprovalGate,
    monitor: PositionMonitor,
    reconciliation: ReconciliationSweep,
    maintenance: MaintenanceSweep,
    config: AppConfig,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        ledger: Arc<dyn Ledger>,
        runner: Arc<dyn DecisionRunner>,
        broker: Arc<dyn BrokerClient>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Arc<Self> {
        let dispatcher = TokioDispatcher::new(config.dispatch.workers);
        let dispatch: Arc<dyn WorkDispatcher> = dispatcher.clone();

        let scheduler = TriggerScheduler::new(ledger.clone(), dispatch.clone());
        let gate = ApprovalGate::new(
            ledger.clone(),
            dispatch.clone(),
            notifier.clone(),
            config.approval.base_url.clone(),
            config.approval.default_timeout_minutes,
        );
        let monitor = PositionMonitor::new(
            ledger.clone(),
            broker.clone(),
            dispatch.clone(),
            notifier,
        );
        let reconciliation = ReconciliationSweep::new(
            ledger.clone(),
            broker.clone(),
            dispatch,
            config.reconciliation.per_user_concurrency,
        );
        let maintenance = MaintenanceSweep::new(
            ledger.clone(),
            config.maintenance.stale_after_minutes,
            config.maintenance.retention_days,
        );

        Arc::new(Self {
            ledger,
            runner,
            broker,
            dispatcher,
            scheduler,
            gate,
            monitor,
            reconciliation,
            maintenance,
            config,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    // ==================== Lifecycle ====================

    /// Re-arm deferred work, start the worker pool, and start the periodic
    /// sweep tickers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already running");
            return Ok(());
        }
        self.rearm_deferred().await?;

        let handler: Arc<dyn WorkHandler> = self.clone();
        let dispatcher = self.dispatcher.clone();
        let pool = tokio::spawn(async move { dispatcher.run(handler).await });

        let mut tasks = vec![pool];
        tasks.push(self.spawn_ticker(
            self.config.scheduler.sweep_interval_secs,
            vec![WorkItem::TriggerSweep],
        ));
        tasks.push(self.spawn_ticker(
            self.config.reconciliation.sweep_interval_secs,
            vec![WorkItem::ReconcileSweep],
        ));
        tasks.push(self.spawn_ticker(
            self.config.maintenance.sweep_interval_secs,
            vec![
                WorkItem::MaintenanceStale,
                WorkItem::MaintenanceRetention,
                WorkItem::MaintenanceBudgetReset,
            ],
        ));
        if let Ok(mut slot) = self.tasks.lock() {
            *slot = tasks;
        }

        info!(
            "Orchestrator started with {} worker(s)",
            self.config.dispatch.workers
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.dispatcher.shutdown();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!("Orchestrator stopped");
    }

    fn spawn_ticker(self: &Arc<Self>, interval_secs: u64, items: Vec<WorkItem>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(StdDuration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !orchestrator.running.load(Ordering::SeqCst) {
                    break;
                }
                for item in &items {
                    if let Err(e) = orchestrator.dispatcher.enqueue(item.clone()) {
                        error!("Failed to queue {}: {}", item, e);
                    }
                }
            }
        })
    }

    /// Rebuild in-process timers and queue entries from ledger state after
    /// a restart. Timers do not survive the process; the rows do.
    async fn rearm_deferred(&self) -> Result<()> {
        let now = Utc::now();
        let mut rearmed = 0u32;

        for row in self
            .ledger
            .list_by_status(&[ExecutionStatus::Pending])
            .await?
        {
            self.dispatcher
                .enqueue(WorkItem::RunDecision { execution_id: row.id })?;
            rearmed += 1;
        }

        for row in self
            .ledger
            .list_by_status(&[ExecutionStatus::Monitoring])
            .await?
        {
            let at = match row.next_check_at {
                Some(at) if at > now => at,
                _ => now,
            };
            self.dispatcher
                .schedule(WorkItem::MonitorCheck { execution_id: row.id }, at)?;
            rearmed += 1;
        }

        for row in self
            .ledger
            .list_by_status(&[ExecutionStatus::AwaitingApproval])
            .await?
        {
            match row.approval_status {
                Some(ApprovalStatus::Approved) => {
                    self.dispatcher
                        .enqueue(WorkItem::ResumeDecision { execution_id: row.id })?;
                    rearmed += 1;
                }
                Some(ApprovalStatus::Pending) => {
                    let at = row.approval_expires_at.unwrap_or(now);
                    self.dispatcher
                        .schedule(WorkItem::ApprovalTimeout { execution_id: row.id }, at)?;
                    rearmed += 1;
                }
                // A resolution stamped the approval but the process died
                // before the cancel write; finish the cancellation here.
                Some(ApprovalStatus::Rejected) | Some(ApprovalStatus::TimedOut) => {
                    let (reason, event_type) =
                        if row.approval_status == Some(ApprovalStatus::Rejected) {
                            ("approval rejected", "approval_rejected")
                        } else {
                            ("approval timed out", "approval_timed_out")
                        };
                    self.ledger
                        .mark_cancelled(
                            row.id,
                            &[ExecutionStatus::AwaitingApproval],
                            Some(reason),
                        )
                        .await?;
                    record_event_best_effort(
                        self.ledger.as_ref(),
                        ExecutionEvent::new(row.id, event_type)
                            .with_transition(
                                ExecutionStatus::AwaitingApproval,
                                ExecutionStatus::Cancelled,
                            )
                            .with_message(reason),
                    )
                    .await;
                    warn!(
                        "Execution {} was {} but never cancelled; cancelled on restart",
                        row.id, reason
                    );
                    rearmed += 1;
                }
                None => {}
            }
        }

        if rearmed > 0 {
            info!("Re-armed {} deferred work item(s) from the ledger", rearmed);
        }
        Ok(())
    }

    // ==================== Triggering ====================

    pub async fn trigger_check(&self) -> Result<SweepStats> {
        self.scheduler.sweep().await
    }

    /// Sweep and then drive the admitted executions to rest in-process.
    /// One-shot invocations use this; the queue dies with the process.
    pub async fn trigger_check_inline(&self) -> Result<SweepStats> {
        let stats = self.scheduler.sweep().await?;
        for row in self
            .ledger
            .list_by_status(&[ExecutionStatus::Pending])
            .await?
        {
            if let Err(e) = self.run_decision(row.id).await {
                error!("Decision run failed for execution {}: {}", row.id, e);
            }
        }
        Ok(stats)
    }

    pub async fn accept_signal_trigger(
        &self,
        pipeline_id: Uuid,
        payload: &Value,
    ) -> Result<TriggerDecision> {
        self.scheduler.accept_signal_trigger(pipeline_id, payload).await
    }

    // ==================== Approvals ====================

    pub async fn resolve_approval(
        &self,
        token: &str,
        decision: ApprovalDecision,
        reason: Option<&str>,
    ) -> Result<Execution> {
        self.gate.resolve(token, decision, reason).await
    }

    /// Resolve and, on approval, place the order before returning.
    pub async fn resolve_approval_inline(
        &self,
        token: &str,
        decision: ApprovalDecision,
        reason: Option<&str>,
    ) -> Result<Execution> {
        let resolved = self.gate.resolve(token, decision, reason).await?;
        if decision == ApprovalDecision::Approve {
            self.resume_decision(resolved.id).await?;
            if let Some(row) = self.ledger.get_execution(resolved.id).await? {
                return Ok(row);
            }
        }
        Ok(resolved)
    }

    pub async fn pre_trade_report(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<PreTradeReport> {
        let execution = self.owned_execution(execution_id, user_id).await?;
        Ok(PreTradeReport::from_snapshot(&execution.pipeline_state))
    }

    // ==================== User control ====================

    /// Cancel an execution on behalf of its owner. Already-cancelled rows
    /// return unchanged; other terminal rows are an error.
    pub async fn stop(&self, execution_id: Uuid, user_id: Uuid) -> Result<Execution> {
        let execution = self.owned_execution(execution_id, user_id).await?;
        if execution.status == ExecutionStatus::Cancelled {
            return Ok(execution);
        }
        if !STOPPABLE.contains(&execution.status) {
            return Err(DroverError::InvalidState {
                from: execution.status.to_string(),
                to: ExecutionStatus::Cancelled.to_string(),
            });
        }

        let updated = self
            .ledger
            .mark_cancelled(execution.id, &STOPPABLE, Some("stopped by user"))
            .await?;
        if updated.symbol.is_some() {
            if let Err(e) = self.broker.cancel(&updated).await {
                warn!("Broker cancel failed for execution {}: {}", execution_id, e);
            }
        }
        record_event_best_effort(
            self.ledger.as_ref(),
            ExecutionEvent::new(execution.id, "stopped")
                .with_transition(execution.status, ExecutionStatus::Cancelled)
                .with_message("stopped by user"),
        )
        .await;
        info!("Execution {} stopped by its owner", execution_id);
        Ok(updated)
    }

    /// Suspend monitoring without touching the position.
    pub async fn pause(&self, execution_id: Uuid, user_id: Uuid) -> Result<Execution> {
        self.owned_execution(execution_id, user_id).await?;
        let updated = self.ledger.mark_paused(execution_id).await?;
        record_event_best_effort(
            self.ledger.as_ref(),
            ExecutionEvent::new(execution_id, "paused")
                .with_transition(ExecutionStatus::Monitoring, ExecutionStatus::Paused),
        )
        .await;
        info!("Execution {} paused", execution_id);
        Ok(updated)
    }

    pub async fn resume(&self, execution_id: Uuid, user_id: Uuid) -> Result<Execution> {
        let execution = self.owned_execution(execution_id, user_id).await?;
        let next = Utc::now() + execution.monitor_interval();
        let updated = self
            .ledger
            .resume_monitoring(execution_id, &[ExecutionStatus::Paused], next)
            .await?;
        self.dispatcher
            .schedule(WorkItem::MonitorCheck { execution_id }, next)?;
        record_event_best_effort(
            self.ledger.as_ref(),
            ExecutionEvent::new(execution_id, "resumed")
                .with_transition(ExecutionStatus::Paused, ExecutionStatus::Monitoring),
        )
        .await;
        info!("Execution {} resumed, next check {}", execution_id, next);
        Ok(updated)
    }

    // ==================== One-shot sweeps ====================

    pub async fn reconcile_now(&self) -> Result<ReconcileStats> {
        self.reconciliation.reconcile_all().await
    }

    pub async fn maintenance_now(&self) -> Result<MaintenanceStats> {
        self.maintenance.run_all().await
    }

    pub async fn execution_events(
        &self,
        execution_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ExecutionEvent>> {
        self.ledger.events_for_execution(execution_id, limit).await
    }

    // ==================== Decision flow ====================

    /// Drive a PENDING execution through its decision phase.
    async fn run_decision(&self, execution_id: Uuid) -> Result<()> {
        let execution = match self.ledger.mark_running(execution_id).await {
            Ok(execution) => execution,
            Err(DroverError::InvalidState { from, .. }) => {
                debug!("Decision run no-op for execution {} in {}", execution_id, from);
                return Ok(());
            }
            Err(DroverError::NotFound(_)) => {
                warn!("Decision run for unknown execution {}", execution_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let Some(pipeline) = self.ledger.get_pipeline(execution.pipeline_id).await? else {
            return self.fail(&execution, "pipeline no longer exists").await;
        };

        match self.runner.run(&execution, &pipeline).await {
            Ok(DecisionOutcome::NoAction { summary }) => {
                self.ledger
                    .mark_completed(
                        execution.id,
                        &[ExecutionStatus::Running],
                        Some(&summary),
                        None,
                    )
                    .await?;
                record_event_best_effort(
                    self.ledger.as_ref(),
                    ExecutionEvent::new(execution.id, "no_action")
                        .with_transition(ExecutionStatus::Running, ExecutionStatus::Completed)
                        .with_message(summary),
                )
                .await;
                info!("Execution {} completed without action", execution.id);
                Ok(())
            }
            Ok(DecisionOutcome::TradeAction { proposal, snapshot }) => {
                let updated = self
                    .ledger
                    .save_snapshot(
                        execution.id,
                        &snapshot,
                        proposal.analysis.as_ref(),
                        execution.version,
                    )
                    .await?;
                if ApprovalGate::should_require_approval(&pipeline, execution.mode) {
                    self.gate.initiate(&updated, &pipeline).await?;
                    Ok(())
                } else {
                    self.place_order(&updated, &pipeline, &[ExecutionStatus::Running])
                        .await
                }
            }
            Err(e) => {
                self.fail(&execution, &format!("decision run failed: {}", e))
                    .await
            }
        }
    }

    /// Place the order an approved or approval-free decision described.
    async fn place_order(
        &self,
        execution: &Execution,
        pipeline: &Pipeline,
        from: &[ExecutionStatus],
    ) -> Result<()> {
        match self
            .runner
            .resume(execution, pipeline, &execution.pipeline_state)
            .await
        {
            Ok(ResumeOutcome::OrderPlaced {
                symbol,
                cost,
                snapshot,
            }) => {
                let updated = self
                    .ledger
                    .save_snapshot(execution.id, &snapshot, None, execution.version)
                    .await?;
                let next = Utc::now() + updated.monitor_interval();
                let updated = self
                    .ledger
                    .mark_monitoring(updated.id, from, &symbol, cost, next)
                    .await?;
                self.dispatcher.schedule(
                    WorkItem::MonitorCheck {
                        execution_id: updated.id,
                    },
                    next,
                )?;
                record_event_best_effort(
                    self.ledger.as_ref(),
                    ExecutionEvent::new(execution.id, "order_placed")
                        .with_transition(execution.status, ExecutionStatus::Monitoring)
                        .with_message(match cost {
                            Some(cost) => format!("{} at estimated {}", symbol, cost),
                            None => symbol.clone(),
                        }),
                )
                .await;
                info!(
                    "Execution {} placed order for {}, next check {}",
                    execution.id, symbol, next
                );
                Ok(())
            }
            Ok(ResumeOutcome::NoOrder { summary }) => {
                self.ledger
                    .mark_completed(execution.id, from, Some(&summary), None)
                    .await?;
                record_event_best_effort(
                    self.ledger.as_ref(),
                    ExecutionEvent::new(execution.id, "no_order")
                        .with_transition(execution.status, ExecutionStatus::Completed)
                        .with_message(summary),
                )
                .await;
                info!("Execution {} completed without an order", execution.id);
                Ok(())
            }
            Err(e) => {
                self.fail(execution, &format!("order placement failed: {}", e))
                    .await
            }
        }
    }

    /// Pick an approved execution back up and place its order.
    async fn resume_decision(&self, execution_id: Uuid) -> Result<()> {
        let Some(execution) = self.ledger.get_execution(execution_id).await? else {
            warn!("Resume for unknown execution {}", execution_id);
            return Ok(());
        };
        if execution.status != ExecutionStatus::AwaitingApproval
            || execution.approval_status != Some(ApprovalStatus::Approved)
        {
            debug!(
                "Resume no-op for execution {} ({}, approval {:?})",
                execution_id, execution.status, execution.approval_status
            );
            return Ok(());
        }
        let Some(pipeline) = self.ledger.get_pipeline(execution.pipeline_id).await? else {
            return self.fail(&execution, "pipeline no longer exists").await;
        };
        self.place_order(&execution, &pipeline, &[ExecutionStatus::AwaitingApproval])
            .await
    }

    /// Fail an execution unless it already settled.
    async fn fail(&self, execution: &Execution, reason: &str) -> Result<()> {
        let from = [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::AwaitingApproval,
        ];
        match self.ledger.mark_failed(execution.id, &from, reason).await {
            Ok(_) => {
                record_event_best_effort(
                    self.ledger.as_ref(),
                    ExecutionEvent::new(execution.id, "failed")
                        .with_transition(execution.status, ExecutionStatus::Failed)
                        .with_message(reason),
                )
                .await;
                error!("Execution {} failed: {}", execution.id, reason);
                Ok(())
            }
            Err(DroverError::InvalidState { .. }) => {
                debug!("Execution {} settled before failure write", execution.id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn owned_execution(&self, execution_id: Uuid, user_id: Uuid) -> Result<Execution> {
        let execution = self
            .ledger
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| DroverError::NotFound(format!("execution {}", execution_id)))?;
        if execution.user_id != user_id {
            return Err(DroverError::PermissionDenied(format!(
                "execution {} belongs to another user",
                execution_id
            )));
        }
        Ok(execution)
    }
}

#[async_trait]
impl WorkHandler for Orchestrator {
    async fn handle(&self, item: WorkItem) -> Result<()> {
        match item {
            WorkItem::TriggerSweep => {
                self.scheduler.sweep().await?;
            }
            WorkItem::RunDecision { execution_id } => self.run_decision(execution_id).await?,
            WorkItem::ResumeDecision { execution_id } => {
                self.resume_decision(execution_id).await?
            }
            WorkItem::ApprovalTimeout { execution_id } => {
                self.gate.timeout_check(execution_id).await?
            }
            WorkItem::MonitorCheck { execution_id } => {
                self.monitor.check(execution_id).await?;
            }
            WorkItem::ReconcileSweep => {
                self.reconciliation.sweep().await?;
            }
            WorkItem::ReconcileUser { user_id } => {
                self.reconciliation.reconcile_user(user_id).await?;
            }
            WorkItem::MaintenanceStale => {
                self.maintenance.fail_stale().await?;
            }
            WorkItem::MaintenanceRetention => {
                self.maintenance.purge_expired().await?;
            }
            WorkItem::MaintenanceBudgetReset => {
                self.maintenance.reset_budgets().await?;
            }
        }
        Ok(())
    }
}

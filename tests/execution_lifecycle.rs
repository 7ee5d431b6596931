//! End-to-end lifecycle coverage over the public orchestrator surface,
//! driven against the in-memory ledger and dry-run collaborators.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use drover::adapters::{BrokerClient, PositionStatus, SimulatedBroker, SimulatedRunner};
use drover::approval::ApprovalDecision;
use drover::config::AppConfig;
use drover::domain::{
    ApprovalStatus, Execution, ExecutionMode, ExecutionStatus, Pipeline, TriggerMode,
};
use drover::error::{DroverError, Result};
use drover::ledger::{ExecutionLedger, MemoryLedger, PipelineStore};
use drover::orchestrator::Orchestrator;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};
use uuid::Uuid;

/// Broker stub whose verdict the test swaps as the scenario advances.
struct ScriptedBroker {
    verdict: Mutex<PositionStatus>,
}

impl ScriptedBroker {
    fn new(initial: PositionStatus) -> Arc<Self> {
        Arc::new(Self {
            verdict: Mutex::new(initial),
        })
    }

    fn set(&self, verdict: PositionStatus) {
        *self.verdict.lock().unwrap() = verdict;
    }
}

#[async_trait]
impl BrokerClient for ScriptedBroker {
    async fn position_status(&self, _execution: &Execution) -> PositionStatus {
        self.verdict.lock().unwrap().clone()
    }

    async fn cancel(&self, _execution: &Execution) -> Result<()> {
        Ok(())
    }
}

fn simulated_orchestrator(
    ledger: Arc<MemoryLedger>,
    broker: Arc<dyn BrokerClient>,
) -> Arc<Orchestrator> {
    Orchestrator::new(
        AppConfig::default(),
        ledger,
        Arc::new(SimulatedRunner::default()),
        broker,
        None,
    )
}

async fn seed_pipeline(ledger: &MemoryLedger, configure: impl FnOnce(&mut Pipeline)) -> Pipeline {
    let mut pipeline = Pipeline::new(Uuid::new_v4(), "lifecycle", TriggerMode::Periodic);
    configure(&mut pipeline);
    ledger.create_pipeline(&pipeline).await.unwrap();
    pipeline
}

/// The pipeline's execution in the given status, or a panic naming what
/// was expected.
async fn execution_in(
    ledger: &MemoryLedger,
    pipeline: &Pipeline,
    status: ExecutionStatus,
) -> Execution {
    ledger
        .list_by_status(&[status])
        .await
        .unwrap()
        .into_iter()
        .find(|row| row.pipeline_id == pipeline.id)
        .unwrap_or_else(|| panic!("no execution of pipeline {} in {}", pipeline.id, status))
}

#[tokio::test]
async fn trigger_decision_and_order_leave_the_run_monitoring() {
    let ledger = Arc::new(MemoryLedger::new());
    let pipeline = seed_pipeline(&ledger, |_| {}).await;
    let orchestrator = simulated_orchestrator(ledger.clone(), Arc::new(SimulatedBroker::new(9)));

    let stats = orchestrator.trigger_check_inline().await.unwrap();
    assert_eq!(stats.evaluated, 1);
    assert_eq!(stats.triggered, 1);

    let row = execution_in(&ledger, &pipeline, ExecutionStatus::Monitoring).await;
    assert_eq!(row.symbol.as_deref(), Some("SIM"));
    assert_eq!(row.cost, Some(dec!(25.00)));
    assert!(row.next_check_at.unwrap() > Utc::now());
    // Snapshot written twice: once by the decision, once at order time.
    assert_eq!(row.version, 2);

    let events = orchestrator.execution_events(row.id, 50).await.unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(kinds.contains(&"triggered"), "events: {:?}", kinds);
    assert!(kinds.contains(&"order_placed"), "events: {:?}", kinds);
}

#[tokio::test]
async fn active_run_blocks_further_triggers() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_pipeline(&ledger, |_| {}).await;
    let orchestrator = simulated_orchestrator(ledger.clone(), Arc::new(SimulatedBroker::new(9)));

    orchestrator.trigger_check_inline().await.unwrap();
    let stats = orchestrator.trigger_check_inline().await.unwrap();
    assert_eq!(stats.triggered, 0);
    assert_eq!(stats.skipped_active, 1);

    let all = ledger.recent_executions(10).await.unwrap();
    assert_eq!(all.len(), 1, "second trigger must not create a second run");
}

#[tokio::test]
async fn filled_position_completes_the_run_and_records_spend() {
    let ledger = Arc::new(MemoryLedger::new());
    let pipeline = seed_pipeline(&ledger, |_| {}).await;
    // First status query already reports the fill.
    let orchestrator = simulated_orchestrator(ledger.clone(), Arc::new(SimulatedBroker::new(0)));

    orchestrator.trigger_check_inline().await.unwrap();
    let stats = orchestrator.reconcile_now().await.unwrap();
    assert_eq!(stats.examined, 1);
    assert_eq!(stats.completed, 1);

    let row = execution_in(&ledger, &pipeline, ExecutionStatus::Completed).await;
    assert!(row.completed_at.is_some());
    assert_eq!(row.cost, Some(dec!(25.00)));

    let budget = ledger.get_budget(pipeline.user_id).await.unwrap().unwrap();
    assert_eq!(budget.daily_spend, dec!(25.00));
    assert_eq!(budget.monthly_spend, dec!(25.00));

    // The finished run now rate-limits the pipeline.
    let stats = orchestrator.trigger_check_inline().await.unwrap();
    assert_eq!(stats.triggered, 0);
    assert_eq!(stats.skipped_rate_limited, 1);
}

#[tokio::test]
async fn gated_run_parks_until_approved() {
    let ledger = Arc::new(MemoryLedger::new());
    let pipeline = seed_pipeline(&ledger, |p| {
        p.require_approval = true;
        p.approval_timeout_minutes = 30;
    })
    .await;
    let orchestrator = simulated_orchestrator(ledger.clone(), Arc::new(SimulatedBroker::new(9)));

    orchestrator.trigger_check_inline().await.unwrap();
    let parked = execution_in(&ledger, &pipeline, ExecutionStatus::AwaitingApproval).await;
    assert_eq!(parked.approval_status, Some(ApprovalStatus::Pending));
    assert!(parked.symbol.is_none(), "no order before the approval");
    let token = parked.approval_token.clone().expect("token must be issued");
    assert_eq!(token.len(), 43);

    // The owner can read the pre-trade report while the run is parked.
    let report = orchestrator
        .pre_trade_report(parked.id, pipeline.user_id)
        .await
        .unwrap();
    assert_eq!(report.action.as_deref(), Some("BUY"));
    assert_eq!(report.symbol.as_deref(), Some("SIM"));
    assert_eq!(report.entry_price, Some(dec!(25.00)));

    let resolved = orchestrator
        .resolve_approval_inline(&token, ApprovalDecision::Approve, None)
        .await
        .unwrap();
    assert_eq!(resolved.status, ExecutionStatus::Monitoring);
    assert_eq!(resolved.approval_status, Some(ApprovalStatus::Approved));
    assert_eq!(resolved.symbol.as_deref(), Some("SIM"));

    // Tokens are single-use.
    let err = orchestrator
        .resolve_approval(&token, ApprovalDecision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DroverError::AlreadyResolved(_)));
}

#[tokio::test]
async fn approval_mode_filter_exempts_other_modes() {
    let ledger = Arc::new(MemoryLedger::new());
    let pipeline = seed_pipeline(&ledger, |p| {
        p.require_approval = true;
        // Only live runs are gated; periodic runs stay in paper mode.
        p.approval_modes = vec![ExecutionMode::Live];
    })
    .await;
    let orchestrator = simulated_orchestrator(ledger.clone(), Arc::new(SimulatedBroker::new(9)));

    orchestrator.trigger_check_inline().await.unwrap();
    let row = execution_in(&ledger, &pipeline, ExecutionStatus::Monitoring).await;
    assert_eq!(row.mode, ExecutionMode::Paper);
    assert_eq!(row.approval_token, None);
    assert_eq!(row.approval_status, None);
}

#[tokio::test]
async fn rejected_run_cancels_without_an_order() {
    let ledger = Arc::new(MemoryLedger::new());
    let pipeline = seed_pipeline(&ledger, |p| p.require_approval = true).await;
    let orchestrator = simulated_orchestrator(ledger.clone(), Arc::new(SimulatedBroker::new(9)));

    orchestrator.trigger_check_inline().await.unwrap();
    let parked = execution_in(&ledger, &pipeline, ExecutionStatus::AwaitingApproval).await;
    let token = parked.approval_token.unwrap();

    let rejected = orchestrator
        .resolve_approval(&token, ApprovalDecision::Reject, Some("position too large"))
        .await
        .unwrap();
    assert_eq!(rejected.status, ExecutionStatus::Cancelled);
    assert_eq!(rejected.approval_status, Some(ApprovalStatus::Rejected));
    assert_eq!(rejected.error.as_deref(), Some("position too large"));
    assert!(rejected.symbol.is_none(), "no order after a rejection");
}

#[tokio::test]
async fn expired_approval_cancels_on_late_resolution() {
    let ledger = Arc::new(MemoryLedger::new());
    let pipeline = seed_pipeline(&ledger, |p| p.require_approval = true).await;
    let orchestrator = simulated_orchestrator(ledger.clone(), Arc::new(SimulatedBroker::new(9)));

    orchestrator.trigger_check_inline().await.unwrap();
    let mut parked = execution_in(&ledger, &pipeline, ExecutionStatus::AwaitingApproval).await;
    let token = parked.approval_token.clone().unwrap();

    // The window lapsed and the timeout timer was lost with a restart.
    parked.approval_expires_at = Some(Utc::now() - Duration::minutes(1));
    ledger.create_execution(&parked).await.unwrap();

    let err = orchestrator
        .resolve_approval(&token, ApprovalDecision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DroverError::Expired(_)));

    let row = ledger.get_execution(parked.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Cancelled);
    assert_eq!(row.approval_status, Some(ApprovalStatus::TimedOut));
    assert_eq!(row.error.as_deref(), Some("approval timed out"));
}

#[tokio::test]
async fn unreachable_broker_parks_the_run_until_it_recovers() {
    let ledger = Arc::new(MemoryLedger::new());
    let pipeline = seed_pipeline(&ledger, |_| {}).await;
    let broker = ScriptedBroker::new(PositionStatus::Unreachable);
    let orchestrator = simulated_orchestrator(ledger.clone(), broker.clone());

    orchestrator.trigger_check_inline().await.unwrap();
    let stats = orchestrator.reconcile_now().await.unwrap();
    assert_eq!(stats.unreachable, 1);
    let row = execution_in(&ledger, &pipeline, ExecutionStatus::CommunicationError).await;

    // Still down: the row stays parked without another write.
    let stats = orchestrator.reconcile_now().await.unwrap();
    assert_eq!(stats.unreachable, 1);

    broker.set(PositionStatus::Filled { cost: None });
    let stats = orchestrator.reconcile_now().await.unwrap();
    assert_eq!(stats.completed, 1);
    let row = ledger.get_execution(row.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
    // The fill reported no cost, so the estimate from order time stands.
    assert_eq!(row.cost, Some(dec!(25.00)));
}

#[tokio::test]
async fn mismatched_position_is_flagged_then_resumes_when_clean() {
    let ledger = Arc::new(MemoryLedger::new());
    let pipeline = seed_pipeline(&ledger, |_| {}).await;
    let broker = ScriptedBroker::new(PositionStatus::Mismatched {
        detail: "broker shows 2 lots, ledger expects 1".to_string(),
    });
    let orchestrator = simulated_orchestrator(ledger.clone(), broker.clone());

    orchestrator.trigger_check_inline().await.unwrap();
    let stats = orchestrator.reconcile_now().await.unwrap();
    assert_eq!(stats.flagged, 1);
    let row = execution_in(&ledger, &pipeline, ExecutionStatus::NeedsReconciliation).await;
    assert_eq!(
        row.error.as_deref(),
        Some("broker shows 2 lots, ledger expects 1")
    );

    broker.set(PositionStatus::Open);
    let stats = orchestrator.reconcile_now().await.unwrap();
    assert_eq!(stats.recovered, 1);
    let row = ledger.get_execution(row.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Monitoring);
    assert!(row.next_check_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn stop_requires_the_owner_and_tolerates_repeats() {
    let ledger = Arc::new(MemoryLedger::new());
    let pipeline = seed_pipeline(&ledger, |_| {}).await;
    let orchestrator = simulated_orchestrator(ledger.clone(), Arc::new(SimulatedBroker::new(9)));

    orchestrator.trigger_check_inline().await.unwrap();
    let row = execution_in(&ledger, &pipeline, ExecutionStatus::Monitoring).await;

    let denied = orchestrator.stop(row.id, Uuid::new_v4()).await;
    assert!(matches!(denied, Err(DroverError::PermissionDenied(_))));

    let stopped = orchestrator.stop(row.id, pipeline.user_id).await.unwrap();
    assert_eq!(stopped.status, ExecutionStatus::Cancelled);
    assert_eq!(stopped.error.as_deref(), Some("stopped by user"));

    let again = orchestrator.stop(row.id, pipeline.user_id).await.unwrap();
    assert_eq!(again.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn paused_run_is_left_alone_until_resumed() {
    let ledger = Arc::new(MemoryLedger::new());
    let pipeline = seed_pipeline(&ledger, |_| {}).await;
    // A broker that would fill on the first query must not touch a paused run.
    let orchestrator = simulated_orchestrator(ledger.clone(), Arc::new(SimulatedBroker::new(0)));

    orchestrator.trigger_check_inline().await.unwrap();
    let row = execution_in(&ledger, &pipeline, ExecutionStatus::Monitoring).await;

    orchestrator.pause(row.id, pipeline.user_id).await.unwrap();
    let stats = orchestrator.reconcile_now().await.unwrap();
    assert_eq!(stats.examined, 0, "paused runs are not reconcilable");
    let paused = ledger.get_execution(row.id).await.unwrap().unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);

    let resumed = orchestrator.resume(row.id, pipeline.user_id).await.unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Monitoring);
    assert!(resumed.next_check_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn maintenance_fails_stale_runs_and_purges_old_terminal_rows() {
    let ledger = Arc::new(MemoryLedger::new());
    let pipeline = seed_pipeline(&ledger, |_| {}).await;
    let orchestrator = simulated_orchestrator(ledger.clone(), Arc::new(SimulatedBroker::new(9)));

    // A run that never left PENDING; its worker died hours ago.
    let mut stuck = Execution::new(&pipeline, ExecutionMode::Paper);
    stuck.created_at = Utc::now() - Duration::hours(3);
    ledger.create_execution(&stuck).await.unwrap();

    // A finished run past the retention horizon, and a fresh one inside it.
    let mut ancient = Execution::new(&pipeline, ExecutionMode::Paper);
    ancient.status = ExecutionStatus::Completed;
    ancient.created_at = Utc::now() - Duration::days(40);
    ancient.completed_at = Some(ancient.created_at);
    ledger.create_execution(&ancient).await.unwrap();

    let mut recent = Execution::new(&pipeline, ExecutionMode::Paper);
    recent.status = ExecutionStatus::Completed;
    recent.completed_at = Some(Utc::now());
    ledger.create_execution(&recent).await.unwrap();

    let stats = orchestrator.maintenance_now().await.unwrap();
    assert_eq!(stats.stale_failed, 1);
    assert_eq!(stats.purged, 1);

    let failed = ledger.get_execution(stuck.id).await.unwrap().unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("stalled"));

    assert!(ledger.get_execution(ancient.id).await.unwrap().is_none());
    assert!(ledger.get_execution(recent.id).await.unwrap().is_some());
}

#[tokio::test]
async fn resident_orchestrator_drives_a_pipeline_to_completion() {
    let ledger = Arc::new(MemoryLedger::new());
    let pipeline = seed_pipeline(&ledger, |p| {
        // Tight cadence so the whole lifecycle fits in the test budget.
        p.monitor_interval_minutes = 0.002;
    })
    .await;

    let mut config = AppConfig::default();
    config.scheduler.sweep_interval_secs = 1;
    config.reconciliation.sweep_interval_secs = 1;
    let orchestrator = Orchestrator::new(
        config,
        ledger.clone(),
        Arc::new(SimulatedRunner::default()),
        Arc::new(SimulatedBroker::new(1)),
        None,
    );
    orchestrator.start().await.unwrap();

    let row = wait_for_finished(&ledger, pipeline.id).await;
    assert_eq!(row.status, ExecutionStatus::Completed);
    assert_eq!(row.symbol.as_deref(), Some("SIM"));

    let budget = ledger.get_budget(pipeline.user_id).await.unwrap().unwrap();
    assert_eq!(budget.daily_spend, dec!(25.00));

    orchestrator.shutdown();
}

async fn wait_for_finished(ledger: &Arc<MemoryLedger>, pipeline_id: Uuid) -> Execution {
    let deadline = Instant::now() + StdDuration::from_secs(15);
    loop {
        let rows = ledger
            .list_by_status(&[ExecutionStatus::Completed, ExecutionStatus::Failed])
            .await
            .unwrap();
        if let Some(row) = rows.into_iter().find(|r| r.pipeline_id == pipeline_id) {
            return row;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for pipeline {} to finish",
            pipeline_id
        );
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }
}

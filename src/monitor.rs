//! Deferred position checks for executions in MONITORING.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{BrokerClient, Notifier, NotifyOutcome, PositionStatus};
use crate::dispatch::{WorkDispatcher, WorkItem};
use crate::domain::{ApprovalChannel, Execution, ExecutionStatus};
use crate::error::Result;
use crate::ledger::{record_event_best_effort, ExecutionEvent, Ledger};

/// What a single deferred check did.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Position closed; execution completed
    Completed,
    /// Still open; next check armed
    Rescheduled(DateTime<Utc>),
    /// Broker disagrees with the ledger; flagged for reconciliation
    Flagged,
    /// Broker unreachable; parked as COMMUNICATION_ERROR
    Unreachable,
    /// Row no longer MONITORING (paused, cancelled, raced); nothing done
    Skipped,
}

pub struct PositionMonitor {
    ledger: Arc<dyn Ledger>,
    broker: Arc<dyn BrokerClient>,
    dispatcher: Arc<dyn WorkDispatcher>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl PositionMonitor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        broker: Arc<dyn BrokerClient>,
        dispatcher: Arc<dyn WorkDispatcher>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            ledger,
            broker,
            dispatcher,
            notifier,
        }
    }

    /// One deferred check for one execution. Always re-reads the row first:
    /// a stale timer for a paused or finished execution must do nothing.
    pub async fn check(&self, execution_id: Uuid) -> Result<CheckOutcome> {
        let Some(execution) = self.ledger.get_execution(execution_id).await? else {
            warn!("Monitor check for unknown execution {}", execution_id);
            return Ok(CheckOutcome::Skipped);
        };
        if execution.status != ExecutionStatus::Monitoring {
            debug!(
                "Monitor check no-op for execution {} in {}",
                execution_id, execution.status
            );
            return Ok(CheckOutcome::Skipped);
        }

        match self.broker.position_status(&execution).await {
            PositionStatus::Filled { cost } => {
                self.complete(&execution, cost).await?;
                Ok(CheckOutcome::Completed)
            }
            PositionStatus::Open => {
                let next = next_check_after(&execution);
                self.ledger.reschedule_check(execution.id, next).await?;
                self.dispatcher
                    .schedule(WorkItem::MonitorCheck { execution_id }, next)?;
                debug!("Execution {} still open, next check {}", execution_id, next);
                Ok(CheckOutcome::Rescheduled(next))
            }
            PositionStatus::Mismatched { detail } => {
                self.ledger
                    .mark_needs_reconciliation(
                        execution.id,
                        &[ExecutionStatus::Monitoring],
                        &detail,
                    )
                    .await?;
                record_event_best_effort(
                    self.ledger.as_ref(),
                    ExecutionEvent::new(execution.id, "flagged_mismatch")
                        .with_transition(
                            ExecutionStatus::Monitoring,
                            ExecutionStatus::NeedsReconciliation,
                        )
                        .with_message(detail.clone()),
                )
                .await;
                warn!(
                    "Execution {} flagged for reconciliation: {}",
                    execution_id, detail
                );
                Ok(CheckOutcome::Flagged)
            }
            PositionStatus::Unreachable => {
                self.ledger
                    .mark_communication_error(execution.id, &[ExecutionStatus::Monitoring])
                    .await?;
                record_event_best_effort(
                    self.ledger.as_ref(),
                    ExecutionEvent::new(execution.id, "broker_unreachable").with_transition(
                        ExecutionStatus::Monitoring,
                        ExecutionStatus::CommunicationError,
                    ),
                )
                .await;
                warn!(
                    "Execution {} parked: broker unreachable; reconciliation will retry",
                    execution_id
                );
                Ok(CheckOutcome::Unreachable)
            }
        }
    }

    async fn complete(&self, execution: &Execution, fill_cost: Option<Decimal>) -> Result<()> {
        let updated = self
            .ledger
            .mark_completed(
                execution.id,
                &[ExecutionStatus::Monitoring],
                None,
                fill_cost,
            )
            .await?;
        record_event_best_effort(
            self.ledger.as_ref(),
            ExecutionEvent::new(execution.id, "position_closed")
                .with_transition(ExecutionStatus::Monitoring, ExecutionStatus::Completed),
        )
        .await;
        if let Some(cost) = updated.cost {
            if let Err(e) = self.ledger.add_spend(updated.user_id, cost).await {
                warn!("Failed to record spend for user {}: {}", updated.user_id, e);
                // Leave a trace so the budget drift can be reconciled later.
                record_event_best_effort(
                    self.ledger.as_ref(),
                    ExecutionEvent::new(execution.id, "spend_unrecorded")
                        .with_message(format!("{} not added to budget: {}", cost, e)),
                )
                .await;
            }
        }
        self.notify_completion(&updated).await;
        info!(
            "Execution {} completed ({})",
            execution.id,
            updated.symbol.as_deref().unwrap_or("?")
        );
        Ok(())
    }

    async fn notify_completion(&self, execution: &Execution) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let pipeline = match self.ledger.get_pipeline(execution.pipeline_id).await {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    "Completion notice lookup failed for execution {}: {}",
                    execution.id, e
                );
                return;
            }
        };
        if !pipeline.notify_on_completion {
            return;
        }
        let Some(phone) = &pipeline.approval_phone else {
            return;
        };
        let message = match execution.cost {
            Some(cost) => format!(
                "Execution complete: {} {} for {}",
                pipeline.name,
                execution.symbol.as_deref().unwrap_or("?"),
                cost
            ),
            None => format!(
                "Execution complete: {} {}",
                pipeline.name,
                execution.symbol.as_deref().unwrap_or("?")
            ),
        };
        if notifier.send(ApprovalChannel::Sms, phone, &message).await == NotifyOutcome::Failed {
            warn!("Completion notice failed for execution {}", execution.id);
        }
    }
}

/// Next check instant: the previous slot plus the cadence, so a check that
/// runs a little late stays on its grid. A row overdue by more than one
/// interval (process outage, long pause) skips ahead to now plus the cadence
/// instead of replaying every missed slot.
pub fn next_check_after(execution: &Execution) -> DateTime<Utc> {
    let interval = execution.monitor_interval();
    let now = Utc::now();
    let next = execution.next_check_at.unwrap_or(now) + interval;
    if next < now {
        now + interval
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockBrokerClient, MockNotifier};
    use crate::dispatch::MockWorkDispatcher;
    use crate::domain::{ExecutionMode, Pipeline, TriggerMode};
    use crate::ledger::{ExecutionLedger, MemoryLedger, PipelineStore};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn monitoring_fixture(
        ledger: &MemoryLedger,
        interval_minutes: f64,
    ) -> (Pipeline, Execution) {
        let mut pipeline = Pipeline::new(Uuid::new_v4(), "monitored", TriggerMode::Periodic);
        pipeline.monitor_interval_minutes = interval_minutes;
        ledger.create_pipeline(&pipeline).await.unwrap();

        let mut execution = Execution::new(&pipeline, ExecutionMode::Paper);
        execution.status = ExecutionStatus::Monitoring;
        execution.symbol = Some("NVDA".to_string());
        execution.cost = Some(dec!(1200));
        execution.next_check_at = Some(Utc::now());
        ledger.create_execution(&execution).await.unwrap();
        (pipeline, execution)
    }

    fn idle_dispatcher() -> Arc<MockWorkDispatcher> {
        let mut dispatcher = MockWorkDispatcher::new();
        dispatcher.expect_enqueue().returning(|_| Ok(()));
        dispatcher.expect_schedule().returning(|_, _| Ok(()));
        Arc::new(dispatcher)
    }

    #[tokio::test]
    async fn test_filled_position_completes_and_records_spend() {
        let ledger = Arc::new(MemoryLedger::new());
        let (_, execution) = monitoring_fixture(&ledger, 5.0).await;

        let mut broker = MockBrokerClient::new();
        broker.expect_position_status().returning(|_| {
            PositionStatus::Filled {
                cost: Some(dec!(1180.50)),
            }
        });

        let monitor = PositionMonitor::new(
            ledger.clone(),
            Arc::new(broker),
            idle_dispatcher(),
            None,
        );
        let outcome = monitor.check(execution.id).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Completed);

        let row = ledger.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert_eq!(row.cost, Some(dec!(1180.50)));
        assert!(row.completed_at.is_some());

        let budget = ledger.get_budget(execution.user_id).await.unwrap().unwrap();
        assert_eq!(budget.daily_spend, dec!(1180.50));
    }

    #[tokio::test]
    async fn test_open_position_rearms_from_previous_slot() {
        let ledger = Arc::new(MemoryLedger::new());
        let (_, execution) = monitoring_fixture(&ledger, 0.5).await;
        let slot = execution.next_check_at.unwrap();

        let mut broker = MockBrokerClient::new();
        broker
            .expect_position_status()
            .returning(|_| PositionStatus::Open);

        let mut dispatcher = MockWorkDispatcher::new();
        dispatcher
            .expect_schedule()
            .withf(move |item, fire_at| {
                matches!(item, WorkItem::MonitorCheck { .. })
                    && *fire_at == slot + Duration::seconds(30)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let monitor = PositionMonitor::new(
            ledger.clone(),
            Arc::new(broker),
            Arc::new(dispatcher),
            None,
        );
        let outcome = monitor.check(execution.id).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Rescheduled(slot + Duration::seconds(30)));

        let row = ledger.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.next_check_at, Some(slot + Duration::seconds(30)));
        assert_eq!(row.status, ExecutionStatus::Monitoring);
    }

    #[test]
    fn test_overdue_row_skips_missed_slots() {
        let pipeline = Pipeline::new(Uuid::new_v4(), "lagged", TriggerMode::Periodic);
        let mut execution = Execution::new(&pipeline, ExecutionMode::Paper);
        execution.monitor_interval_minutes = 5.0;
        // Two days behind at a 5-minute cadence; one check, not ~576.
        execution.next_check_at = Some(Utc::now() - Duration::days(2));

        let before = Utc::now();
        let next = next_check_after(&execution);
        assert!(next >= before + Duration::minutes(5));
        assert!(next <= Utc::now() + Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_spend_write_failure_leaves_an_audit_event() {
        let ledger = Arc::new(MemoryLedger::new());
        let (_, execution) = monitoring_fixture(&ledger, 5.0).await;
        ledger
            .refuse_spend_writes
            .store(true, std::sync::atomic::Ordering::Relaxed);

        let mut broker = MockBrokerClient::new();
        broker.expect_position_status().returning(|_| {
            PositionStatus::Filled {
                cost: Some(dec!(1180.50)),
            }
        });

        let monitor = PositionMonitor::new(
            ledger.clone(),
            Arc::new(broker),
            idle_dispatcher(),
            None,
        );
        let outcome = monitor.check(execution.id).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Completed);

        // Completion stands, the budget is untouched, and the miss is
        // visible in the audit trail.
        let row = ledger.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert!(ledger.get_budget(execution.user_id).await.unwrap().is_none());
        let events = ledger
            .events_for_execution(execution.id, 10)
            .await
            .unwrap();
        assert!(events.iter().any(|e| e.event_type == "spend_unrecorded"));
    }

    #[tokio::test]
    async fn test_mismatch_flags_for_reconciliation() {
        let ledger = Arc::new(MemoryLedger::new());
        let (_, execution) = monitoring_fixture(&ledger, 5.0).await;

        let mut broker = MockBrokerClient::new();
        broker.expect_position_status().returning(|_| {
            PositionStatus::Mismatched {
                detail: "broker reports no position".to_string(),
            }
        });

        let monitor = PositionMonitor::new(
            ledger.clone(),
            Arc::new(broker),
            idle_dispatcher(),
            None,
        );
        let outcome = monitor.check(execution.id).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Flagged);

        let row = ledger.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::NeedsReconciliation);
        assert_eq!(row.error.as_deref(), Some("broker reports no position"));
    }

    #[tokio::test]
    async fn test_unreachable_broker_parks_execution() {
        let ledger = Arc::new(MemoryLedger::new());
        let (_, execution) = monitoring_fixture(&ledger, 5.0).await;

        let mut broker = MockBrokerClient::new();
        broker
            .expect_position_status()
            .returning(|_| PositionStatus::Unreachable);

        let monitor = PositionMonitor::new(
            ledger.clone(),
            Arc::new(broker),
            idle_dispatcher(),
            None,
        );
        let outcome = monitor.check(execution.id).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Unreachable);

        let row = ledger.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::CommunicationError);
    }

    #[tokio::test]
    async fn test_stale_timer_for_paused_execution_is_skipped() {
        let ledger = Arc::new(MemoryLedger::new());
        let (_, execution) = monitoring_fixture(&ledger, 5.0).await;
        ledger.mark_paused(execution.id).await.unwrap();

        let mut broker = MockBrokerClient::new();
        broker.expect_position_status().times(0);

        let monitor = PositionMonitor::new(
            ledger.clone(),
            Arc::new(broker),
            idle_dispatcher(),
            None,
        );
        let outcome = monitor.check(execution.id).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_completion_notice_respects_pipeline_flag() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut pipeline = Pipeline::new(Uuid::new_v4(), "loud", TriggerMode::Periodic);
        pipeline.notify_on_completion = true;
        pipeline.approval_phone = Some("+15550100".to_string());
        ledger.create_pipeline(&pipeline).await.unwrap();

        let mut execution = Execution::new(&pipeline, ExecutionMode::Paper);
        execution.status = ExecutionStatus::Monitoring;
        execution.symbol = Some("NVDA".to_string());
        execution.next_check_at = Some(Utc::now());
        ledger.create_execution(&execution).await.unwrap();

        let mut broker = MockBrokerClient::new();
        broker.expect_position_status().returning(|_| {
            PositionStatus::Filled {
                cost: Some(dec!(900)),
            }
        });

        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .withf(|channel, recipient, message| {
                *channel == ApprovalChannel::Sms
                    && recipient == "+15550100"
                    && message.contains("NVDA")
            })
            .times(1)
            .returning(|_, _, _| NotifyOutcome::Delivered);

        let monitor = PositionMonitor::new(
            ledger.clone(),
            Arc::new(broker),
            idle_dispatcher(),
            Some(Arc::new(notifier)),
        );
        monitor.check(execution.id).await.unwrap();
    }
}

//! Reconciliation of executions whose broker state may have drifted from
//! the ledger: flagged mismatches, parked communication errors, and
//! monitoring rows whose check clock has fallen behind.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{BrokerClient, PositionStatus};
use crate::dispatch::{WorkDispatcher, WorkItem};
use crate::domain::{Execution, ExecutionStatus};
use crate::error::{DroverError, Result};
use crate::ledger::{record_event_best_effort, ExecutionEvent, Ledger};

/// Per-execution verdict of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
enum RowOutcome {
    Completed,
    Recovered,
    StillFlagged,
    Unreachable,
    /// Row was healthy, or moved on under us; nothing written
    Unchanged,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ReconcileStats {
    pub examined: u32,
    pub completed: u32,
    pub recovered: u32,
    pub flagged: u32,
    pub unreachable: u32,
    pub errors: u32,
}

impl ReconcileStats {
    fn merge(&mut self, other: ReconcileStats) {
        self.examined += other.examined;
        self.completed += other.completed;
        self.recovered += other.recovered;
        self.flagged += other.flagged;
        self.unreachable += other.unreachable;
        self.errors += other.errors;
    }
}

pub struct ReconciliationSweep {
    ledger: Arc<dyn Ledger>,
    broker: Arc<dyn BrokerClient>,
    dispatcher: Arc<dyn WorkDispatcher>,
    per_user_concurrency: usize,
}

impl ReconciliationSweep {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        broker: Arc<dyn BrokerClient>,
        dispatcher: Arc<dyn WorkDispatcher>,
        per_user_concurrency: usize,
    ) -> Self {
        Self {
            ledger,
            broker,
            dispatcher,
            per_user_concurrency: per_user_concurrency.max(1),
        }
    }

    /// Queue one work item per user holding reconcilable executions, so a
    /// slow broker for one account never stalls the others.
    pub async fn sweep(&self) -> Result<usize> {
        let users = self.ledger.users_with_reconcilable().await?;
        for user_id in &users {
            self.dispatcher
                .enqueue(WorkItem::ReconcileUser { user_id: *user_id })?;
        }
        if !users.is_empty() {
            debug!("Reconciliation sweep queued {} user(s)", users.len());
        }
        Ok(users.len())
    }

    pub async fn reconcile_user(&self, user_id: Uuid) -> Result<ReconcileStats> {
        let rows = self.ledger.reconcilable_for_user(user_id).await?;
        let mut stats = ReconcileStats {
            examined: rows.len() as u32,
            ..Default::default()
        };

        let results: Vec<(Uuid, Result<RowOutcome>)> = stream::iter(rows)
            .map(|execution| async move {
                let id = execution.id;
                (id, self.reconcile_one(execution).await)
            })
            .buffer_unordered(self.per_user_concurrency)
            .collect()
            .await;

        for (id, result) in results {
            match result {
                Ok(RowOutcome::Completed) => stats.completed += 1,
                Ok(RowOutcome::Recovered) => stats.recovered += 1,
                Ok(RowOutcome::StillFlagged) => stats.flagged += 1,
                Ok(RowOutcome::Unreachable) => stats.unreachable += 1,
                Ok(RowOutcome::Unchanged) => {}
                Err(e) => {
                    stats.errors += 1;
                    warn!("Reconciliation failed for execution {}: {}", id, e);
                }
            }
        }

        if stats.completed + stats.recovered + stats.flagged + stats.unreachable + stats.errors > 0
        {
            info!(
                user_id = %user_id,
                examined = stats.examined,
                completed = stats.completed,
                recovered = stats.recovered,
                flagged = stats.flagged,
                unreachable = stats.unreachable,
                errors = stats.errors,
                "Reconciliation pass finished"
            );
        }
        Ok(stats)
    }

    /// Reconcile every user in-process, skipping the work queue. Used by
    /// one-shot invocations that exit when the call returns.
    pub async fn reconcile_all(&self) -> Result<ReconcileStats> {
        let mut total = ReconcileStats::default();
        for user_id in self.ledger.users_with_reconcilable().await? {
            total.merge(self.reconcile_user(user_id).await?);
        }
        Ok(total)
    }

    async fn reconcile_one(&self, execution: Execution) -> Result<RowOutcome> {
        match self.broker.position_status(&execution).await {
            PositionStatus::Filled { cost } => {
                let Some(updated) = unless_raced(
                    self.ledger
                        .mark_completed(execution.id, &ExecutionStatus::RECONCILABLE, None, cost)
                        .await,
                )?
                else {
                    return Ok(RowOutcome::Unchanged);
                };
                record_event_best_effort(
                    self.ledger.as_ref(),
                    ExecutionEvent::new(execution.id, "reconciled_completed")
                        .with_transition(execution.status, ExecutionStatus::Completed),
                )
                .await;
                if let Some(cost) = updated.cost {
                    if let Err(e) = self.ledger.add_spend(updated.user_id, cost).await {
                        warn!("Failed to record spend for user {}: {}", updated.user_id, e);
                        record_event_best_effort(
                            self.ledger.as_ref(),
                            ExecutionEvent::new(execution.id, "spend_unrecorded")
                                .with_message(format!("{} not added to budget: {}", cost, e)),
                        )
                        .await;
                    }
                }
                info!("Reconciliation completed execution {}", execution.id);
                Ok(RowOutcome::Completed)
            }
            PositionStatus::Open => self.restore_monitoring(&execution).await,
            PositionStatus::Mismatched { detail } => {
                if execution.status == ExecutionStatus::NeedsReconciliation {
                    return Ok(RowOutcome::StillFlagged);
                }
                if unless_raced(
                    self.ledger
                        .mark_needs_reconciliation(
                            execution.id,
                            &[
                                ExecutionStatus::Monitoring,
                                ExecutionStatus::CommunicationError,
                            ],
                            &detail,
                        )
                        .await,
                )?
                .is_none()
                {
                    return Ok(RowOutcome::Unchanged);
                }
                record_event_best_effort(
                    self.ledger.as_ref(),
                    ExecutionEvent::new(execution.id, "flagged_mismatch")
                        .with_transition(execution.status, ExecutionStatus::NeedsReconciliation)
                        .with_message(detail),
                )
                .await;
                Ok(RowOutcome::StillFlagged)
            }
            PositionStatus::Unreachable => {
                if execution.status == ExecutionStatus::CommunicationError {
                    return Ok(RowOutcome::Unreachable);
                }
                if unless_raced(
                    self.ledger
                        .mark_communication_error(
                            execution.id,
                            &[
                                ExecutionStatus::Monitoring,
                                ExecutionStatus::NeedsReconciliation,
                            ],
                        )
                        .await,
                )?
                .is_none()
                {
                    return Ok(RowOutcome::Unchanged);
                }
                record_event_best_effort(
                    self.ledger.as_ref(),
                    ExecutionEvent::new(execution.id, "broker_unreachable")
                        .with_transition(execution.status, ExecutionStatus::CommunicationError),
                )
                .await;
                Ok(RowOutcome::Unreachable)
            }
        }
    }

    /// The position is open at the broker. Parked rows go back to
    /// MONITORING; live rows only get a push if their check clock is
    /// overdue (a lost timer after a restart, or a check that errored out).
    async fn restore_monitoring(&self, execution: &Execution) -> Result<RowOutcome> {
        let now = chrono::Utc::now();
        let next = now + execution.monitor_interval();

        if execution.status == ExecutionStatus::Monitoring {
            let overdue = match execution.next_check_at {
                Some(at) => at < now,
                None => true,
            };
            if !overdue {
                return Ok(RowOutcome::Unchanged);
            }
            if unless_raced(self.ledger.reschedule_check(execution.id, next).await)?.is_none() {
                return Ok(RowOutcome::Unchanged);
            }
            self.dispatcher.schedule(
                WorkItem::MonitorCheck {
                    execution_id: execution.id,
                },
                next,
            )?;
            debug!(
                "Reconciliation re-armed overdue check for execution {}",
                execution.id
            );
            return Ok(RowOutcome::Recovered);
        }

        if unless_raced(
            self.ledger
                .resume_monitoring(
                    execution.id,
                    &[
                        ExecutionStatus::NeedsReconciliation,
                        ExecutionStatus::CommunicationError,
                    ],
                    next,
                )
                .await,
        )?
        .is_none()
        {
            return Ok(RowOutcome::Unchanged);
        }
        self.dispatcher.schedule(
            WorkItem::MonitorCheck {
                execution_id: execution.id,
            },
            next,
        )?;
        record_event_best_effort(
            self.ledger.as_ref(),
            ExecutionEvent::new(execution.id, "reconciled_resumed")
                .with_transition(execution.status, ExecutionStatus::Monitoring),
        )
        .await;
        info!(
            "Reconciliation resumed monitoring for execution {}",
            execution.id
        );
        Ok(RowOutcome::Recovered)
    }
}

/// Guarded updates lose to concurrent transitions; that is not an error
/// here, just a row that no longer needs us.
fn unless_raced(result: Result<Execution>) -> Result<Option<Execution>> {
    match result {
        Ok(row) => Ok(Some(row)),
        Err(DroverError::InvalidState { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

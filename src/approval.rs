//! Approval gate: parks an execution until a human signs off.
//!
//! The armed timeout timer is a hint, not the authority. Expiry is always
//! recomputed from `approval_expires_at` on the row, so lost or early timers
//! cannot time out an approval that is still live, and a dead process cannot
//! leave one pending forever once the re-arm pass runs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use std::sync::Arc;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{Notifier, NotifyOutcome};
use crate::dispatch::{WorkDispatcher, WorkItem};
use crate::domain::{
    ApprovalChannel, ApprovalStatus, Execution, ExecutionMode, ExecutionStatus, Pipeline,
    PreTradeReport,
};
use crate::error::{DroverError, Result};
use crate::ledger::{record_event_best_effort, ExecutionEvent, Ledger};

/// Decision submitted against a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

pub struct ApprovalGate {
    ledger: Arc<dyn Ledger>,
    dispatcher: Arc<dyn WorkDispatcher>,
    notifier: Option<Arc<dyn Notifier>>,
    base_url: String,
    default_timeout_minutes: i64,
}

impl ApprovalGate {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        dispatcher: Arc<dyn WorkDispatcher>,
        notifier: Option<Arc<dyn Notifier>>,
        base_url: String,
        default_timeout_minutes: i64,
    ) -> Self {
        Self {
            ledger,
            dispatcher,
            notifier,
            base_url,
            default_timeout_minutes,
        }
    }

    /// Whether this pipeline and mode combination needs human sign-off.
    /// An empty mode filter means every mode does.
    pub fn should_require_approval(pipeline: &Pipeline, mode: ExecutionMode) -> bool {
        pipeline.require_approval
            && (pipeline.approval_modes.is_empty() || pipeline.approval_modes.contains(&mode))
    }

    /// 32 random bytes, URL-safe base64, no padding.
    pub fn generate_token() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn approval_url(&self, token: &str) -> String {
        format!("{}/approvals/{}", self.base_url.trim_end_matches('/'), token)
    }

    /// Park a RUNNING execution until someone resolves the approval. The
    /// caller has already persisted the snapshot the decision came from.
    pub async fn initiate(&self, execution: &Execution, pipeline: &Pipeline) -> Result<Execution> {
        let token = Self::generate_token();
        let timeout_minutes = if pipeline.approval_timeout_minutes > 0 {
            pipeline.approval_timeout_minutes
        } else {
            self.default_timeout_minutes
        };
        let requested_at = Utc::now();
        let expires_at = requested_at + Duration::minutes(timeout_minutes);

        let updated = self
            .ledger
            .request_approval(execution.id, &token, requested_at, expires_at)
            .await?;
        record_event_best_effort(
            self.ledger.as_ref(),
            ExecutionEvent::new(execution.id, "approval_requested")
                .with_transition(ExecutionStatus::Running, ExecutionStatus::AwaitingApproval)
                .with_message(format!("expires at {}", expires_at)),
        )
        .await;

        self.dispatcher.schedule(
            WorkItem::ApprovalTimeout {
                execution_id: execution.id,
            },
            expires_at,
        )?;
        self.notify_channels(&updated, pipeline, &token).await;
        info!(
            "Execution {} awaiting approval, times out at {}",
            execution.id, expires_at
        );
        Ok(updated)
    }

    async fn notify_channels(&self, execution: &Execution, pipeline: &Pipeline, token: &str) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let link = self.approval_url(token);
        for channel in &pipeline.approval_channels {
            match channel {
                // Web approvals are pulled, not pushed: the pending row and
                // its report are already visible to the owner.
                ApprovalChannel::Web => {}
                ApprovalChannel::Sms => {
                    let Some(phone) = &pipeline.approval_phone else {
                        warn!(
                            "Pipeline {} requests SMS approval but has no phone number",
                            pipeline.id
                        );
                        continue;
                    };
                    let report = PreTradeReport::from_snapshot(&execution.pipeline_state);
                    let message = report.render_sms(&link);
                    match notifier.send(ApprovalChannel::Sms, phone, &message).await {
                        NotifyOutcome::Delivered => {
                            debug!("Approval SMS delivered for execution {}", execution.id)
                        }
                        NotifyOutcome::Skipped => {
                            debug!("Approval SMS skipped for execution {}", execution.id)
                        }
                        NotifyOutcome::Failed => warn!(
                            "Approval SMS failed for execution {}; web channel remains",
                            execution.id
                        ),
                    }
                }
            }
        }
    }

    /// Resolve a pending approval by token.
    ///
    /// Approving stamps the approval and queues order placement; the status
    /// moves off AWAITING_APPROVAL only once the order is actually placed.
    /// Rejecting cancels immediately.
    pub async fn resolve(
        &self,
        token: &str,
        decision: ApprovalDecision,
        reason: Option<&str>,
    ) -> Result<Execution> {
        let execution = self
            .ledger
            .find_by_approval_token(token)
            .await?
            .ok_or_else(|| DroverError::NotFound("approval token".to_string()))?;

        match execution.approval_status {
            Some(ApprovalStatus::Pending) => {}
            _ => {
                return Err(DroverError::AlreadyResolved(format!(
                    "execution {}",
                    execution.id
                )))
            }
        }
        if let Some(expires_at) = execution.approval_expires_at {
            if Utc::now() > expires_at {
                // The timer should have fired; run the same check it would
                // have so the row does not stay pending.
                if let Err(e) = self.timeout_check(execution.id).await {
                    warn!(
                        "Timeout backfill failed for execution {}: {}",
                        execution.id, e
                    );
                }
                return Err(DroverError::Expired(format!("execution {}", execution.id)));
            }
        }

        match decision {
            ApprovalDecision::Approve => {
                let updated = self
                    .ledger
                    .resolve_approval(execution.id, ApprovalStatus::Approved)
                    .await?;
                record_event_best_effort(
                    self.ledger.as_ref(),
                    ExecutionEvent::new(execution.id, "approval_granted")
                        .with_message(reason.unwrap_or("approved").to_string()),
                )
                .await;
                self.dispatcher.enqueue(WorkItem::ResumeDecision {
                    execution_id: execution.id,
                })?;
                info!("Execution {} approved", execution.id);
                Ok(updated)
            }
            ApprovalDecision::Reject => {
                self.ledger
                    .resolve_approval(execution.id, ApprovalStatus::Rejected)
                    .await?;
                let updated = self
                    .ledger
                    .mark_cancelled(
                        execution.id,
                        &[ExecutionStatus::AwaitingApproval],
                        Some(reason.unwrap_or("approval rejected")),
                    )
                    .await?;
                record_event_best_effort(
                    self.ledger.as_ref(),
                    ExecutionEvent::new(execution.id, "approval_rejected")
                        .with_transition(
                            ExecutionStatus::AwaitingApproval,
                            ExecutionStatus::Cancelled,
                        )
                        .with_message(reason.unwrap_or("approval rejected").to_string()),
                )
                .await;
                info!("Execution {} rejected", execution.id);
                Ok(updated)
            }
        }
    }

    /// Deferred expiry check. Everything is re-derived from the row: a timer
    /// that fires late, early, twice, or for a resolved approval is harmless.
    pub async fn timeout_check(&self, execution_id: Uuid) -> Result<()> {
        let Some(execution) = self.ledger.get_execution(execution_id).await? else {
            warn!("Approval timeout for unknown execution {}", execution_id);
            return Ok(());
        };
        if execution.approval_status != Some(ApprovalStatus::Pending) {
            debug!(
                "Approval timeout no-op for execution {}: not pending",
                execution_id
            );
            return Ok(());
        }
        match execution.approval_expires_at {
            Some(expires_at) if Utc::now() < expires_at => {
                // Fired early relative to the authoritative expiry; re-arm.
                debug!(
                    "Approval timeout for execution {} re-armed to {}",
                    execution_id, expires_at
                );
                self.dispatcher
                    .schedule(WorkItem::ApprovalTimeout { execution_id }, expires_at)?;
                return Ok(());
            }
            None => warn!(
                "Execution {} pending approval without an expiry; timing out",
                execution_id
            ),
            _ => {}
        }

        match self
            .ledger
            .resolve_approval(execution_id, ApprovalStatus::TimedOut)
            .await
        {
            Ok(_) => {}
            // Raced a resolution that beat us to the stamp.
            Err(DroverError::AlreadyResolved(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.ledger
            .mark_cancelled(
                execution_id,
                &[ExecutionStatus::AwaitingApproval],
                Some("approval timed out"),
            )
            .await?;
        record_event_best_effort(
            self.ledger.as_ref(),
            ExecutionEvent::new(execution_id, "approval_timed_out")
                .with_transition(ExecutionStatus::AwaitingApproval, ExecutionStatus::Cancelled),
        )
        .await;
        info!("Execution {} approval timed out", execution_id);
        Ok(())
    }
}

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::pipeline::{ExecutionMode, Pipeline};

/// Execution lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created, waiting for a worker to pick it up
    Pending,
    /// Decision pipeline in progress
    Running,
    /// Order placed, position re-checked on a cadence
    Monitoring,
    /// Suspended until a human signs off on the proposed trade
    AwaitingApproval,
    /// Suspended by the user; resumed manually
    Paused,
    /// Ledger and broker disagree about the position
    NeedsReconciliation,
    /// Broker unreachable past the client's retry budget
    CommunicationError,
    /// Finished normally
    Completed,
    /// Finished with an unrecoverable error
    Failed,
    /// Stopped by the user or by an approval rejection/timeout
    Cancelled,
}

impl ExecutionStatus {
    /// Statuses that hold the one-execution-per-pipeline slot.
    pub const ACTIVE: [ExecutionStatus; 4] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Monitoring,
        ExecutionStatus::AwaitingApproval,
    ];

    /// Statuses the reconciliation sweep re-checks against the broker.
    pub const RECONCILABLE: [ExecutionStatus; 3] = [
        ExecutionStatus::Monitoring,
        ExecutionStatus::NeedsReconciliation,
        ExecutionStatus::CommunicationError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Monitoring => "MONITORING",
            ExecutionStatus::AwaitingApproval => "AWAITING_APPROVAL",
            ExecutionStatus::Paused => "PAUSED",
            ExecutionStatus::NeedsReconciliation => "NEEDS_RECONCILIATION",
            ExecutionStatus::CommunicationError => "COMMUNICATION_ERROR",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }

    /// No transitions leave a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// Check if transition to another status is valid
    pub fn can_transition_to(&self, target: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, target),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, AwaitingApproval)
                | (Running, Monitoring)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (AwaitingApproval, Monitoring)
                | (AwaitingApproval, Completed)
                | (AwaitingApproval, Failed)
                | (AwaitingApproval, Cancelled)
                | (Monitoring, Completed)
                | (Monitoring, NeedsReconciliation)
                | (Monitoring, CommunicationError)
                | (Monitoring, Paused)
                | (Monitoring, Cancelled)
                | (Paused, Monitoring)
                | (Paused, Cancelled)
                | (NeedsReconciliation, Monitoring)
                | (NeedsReconciliation, CommunicationError)
                | (NeedsReconciliation, Completed)
                | (NeedsReconciliation, Cancelled)
                | (CommunicationError, Monitoring)
                | (CommunicationError, NeedsReconciliation)
                | (CommunicationError, Completed)
                | (CommunicationError, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ExecutionStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "MONITORING" => Ok(ExecutionStatus::Monitoring),
            "AWAITING_APPROVAL" => Ok(ExecutionStatus::AwaitingApproval),
            "PAUSED" => Ok(ExecutionStatus::Paused),
            "NEEDS_RECONCILIATION" => Ok(ExecutionStatus::NeedsReconciliation),
            "COMMUNICATION_ERROR" => Ok(ExecutionStatus::CommunicationError),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            _ => Err(format!("Unknown execution status: {}", s)),
        }
    }
}

/// Where a pending approval stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ApprovalStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            "timed_out" => Ok(ApprovalStatus::TimedOut),
            _ => Err(format!("Unknown approval status: {}", s)),
        }
    }
}

/// Coarse phase marker for dashboards; the status column stays authoritative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPhase {
    Execute,
    Monitor,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Execute => "execute",
            ExecutionPhase::Monitor => "monitor",
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ExecutionPhase {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "execute" => Ok(ExecutionPhase::Execute),
            "monitor" => Ok(ExecutionPhase::Monitor),
            _ => Err(format!("Unknown execution phase: {}", s)),
        }
    }
}

/// One run of a pipeline, from trigger to terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub user_id: Uuid,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub phase: Option<ExecutionPhase>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When the next monitoring check is due (MONITORING only)
    pub next_check_at: Option<DateTime<Utc>>,
    /// Cadence copied from the pipeline at trigger time
    pub monitor_interval_minutes: f64,
    pub approval_status: Option<ApprovalStatus>,
    pub approval_token: Option<String>,
    pub approval_requested_at: Option<DateTime<Utc>>,
    pub approval_responded_at: Option<DateTime<Utc>>,
    pub approval_expires_at: Option<DateTime<Utc>>,
    /// Opaque decision-pipeline snapshot; resumes and reports read it
    pub pipeline_state: serde_json::Value,
    /// Bumped on every snapshot write; writers pass the version they read
    pub version: i32,
    pub symbol: Option<String>,
    pub cost: Option<Decimal>,
    pub error: Option<String>,
    pub trade_analysis: Option<serde_json::Value>,
    pub executive_report: Option<String>,
}

impl Execution {
    /// New PENDING execution for a pipeline, cadence and mode copied from it.
    pub fn new(pipeline: &Pipeline, mode: ExecutionMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id,
            user_id: pipeline.user_id,
            mode,
            status: ExecutionStatus::Pending,
            phase: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            next_check_at: None,
            monitor_interval_minutes: pipeline.monitor_interval_minutes,
            approval_status: None,
            approval_token: None,
            approval_requested_at: None,
            approval_responded_at: None,
            approval_expires_at: None,
            pipeline_state: serde_json::Value::Object(Default::default()),
            version: 0,
            symbol: None,
            cost: None,
            error: None,
            trade_analysis: None,
            executive_report: None,
        }
    }

    /// Monitoring cadence as a duration; fractional minutes are honored.
    pub fn monitor_interval(&self) -> Duration {
        minutes_to_duration(self.monitor_interval_minutes)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Convert real-valued minutes into a millisecond-precision duration.
pub fn minutes_to_duration(minutes: f64) -> Duration {
    Duration::milliseconds((minutes.max(0.0) * 60_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pipeline::TriggerMode;

    #[test]
    fn test_valid_transitions() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(AwaitingApproval));
        assert!(Running.can_transition_to(Monitoring));
        assert!(AwaitingApproval.can_transition_to(Monitoring));
        assert!(AwaitingApproval.can_transition_to(Cancelled));
        assert!(Monitoring.can_transition_to(Completed));
        assert!(Monitoring.can_transition_to(NeedsReconciliation));
        assert!(Monitoring.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Monitoring));
        assert!(CommunicationError.can_transition_to(Monitoring));
        assert!(NeedsReconciliation.can_transition_to(Completed));
    }

    #[test]
    fn test_invalid_transitions() {
        use ExecutionStatus::*;
        assert!(!Pending.can_transition_to(Monitoring));
        assert!(!Pending.can_transition_to(AwaitingApproval));
        assert!(!Monitoring.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!AwaitingApproval.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Monitoring));
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        use ExecutionStatus::*;
        let all = [
            Pending,
            Running,
            Monitoring,
            AwaitingApproval,
            Paused,
            NeedsReconciliation,
            CommunicationError,
            Completed,
            Failed,
            Cancelled,
        ];
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for target in all {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn test_active_statuses() {
        assert!(ExecutionStatus::Pending.is_active());
        assert!(ExecutionStatus::AwaitingApproval.is_active());
        assert!(!ExecutionStatus::Paused.is_active());
        assert!(!ExecutionStatus::NeedsReconciliation.is_active());
        assert!(!ExecutionStatus::Completed.is_active());
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!(
            ExecutionStatus::try_from("AWAITING_APPROVAL"),
            Ok(ExecutionStatus::AwaitingApproval)
        );
        assert_eq!(ExecutionStatus::AwaitingApproval.as_str(), "AWAITING_APPROVAL");
        assert_eq!(ApprovalStatus::try_from("timed_out"), Ok(ApprovalStatus::TimedOut));
        assert!(ExecutionStatus::try_from("SLEEPING").is_err());
    }

    #[test]
    fn test_fractional_minutes() {
        assert_eq!(minutes_to_duration(0.5), Duration::seconds(30));
        assert_eq!(minutes_to_duration(5.0), Duration::minutes(5));
        assert_eq!(minutes_to_duration(0.1), Duration::seconds(6));
        assert_eq!(minutes_to_duration(-1.0), Duration::zero());
    }

    #[test]
    fn test_new_execution_copies_pipeline_settings() {
        let mut pipeline = Pipeline::new(Uuid::new_v4(), "breakout", TriggerMode::Periodic);
        pipeline.monitor_interval_minutes = 2.5;
        let execution = Execution::new(&pipeline, ExecutionMode::Paper);
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.pipeline_id, pipeline.id);
        assert_eq!(execution.user_id, pipeline.user_id);
        assert_eq!(execution.monitor_interval_minutes, 2.5);
        assert_eq!(execution.version, 0);
        assert!(execution.pipeline_state.as_object().is_some_and(|o| o.is_empty()));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// How a pipeline's executions get started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerMode {
    /// Started by an external signal matching the pipeline's subscriptions
    Signal,
    /// Evaluated by the trigger scheduler on its sweep cadence
    Periodic,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Signal => "SIGNAL",
            TriggerMode::Periodic => "PERIODIC",
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TriggerMode {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "SIGNAL" => Ok(TriggerMode::Signal),
            "PERIODIC" => Ok(TriggerMode::Periodic),
            _ => Err(format!("Unknown trigger mode: {}", s)),
        }
    }
}

/// How real the money is for a given run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Real orders against the live broker
    Live,
    /// Paper account, real market data
    Paper,
    /// Fully simulated fills
    Simulation,
    /// Dry run that stops before order placement
    Validation,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Live => "live",
            ExecutionMode::Paper => "paper",
            ExecutionMode::Simulation => "simulation",
            ExecutionMode::Validation => "validation",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ExecutionMode {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "live" => Ok(ExecutionMode::Live),
            "paper" => Ok(ExecutionMode::Paper),
            "simulation" => Ok(ExecutionMode::Simulation),
            "validation" => Ok(ExecutionMode::Validation),
            _ => Err(format!("Unknown execution mode: {}", s)),
        }
    }
}

/// Channel an approval request is delivered on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalChannel {
    /// Pending approvals are discoverable through the execution row
    Web,
    /// Rendered report plus approval link pushed to the pipeline's phone
    Sms,
}

impl ApprovalChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalChannel::Web => "web",
            ApprovalChannel::Sms => "sms",
        }
    }
}

impl fmt::Display for ApprovalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ApprovalChannel {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "web" => Ok(ApprovalChannel::Web),
            "sms" => Ok(ApprovalChannel::Sms),
            _ => Err(format!("Unknown approval channel: {}", s)),
        }
    }
}

/// A configured trading pipeline owned by one user.
///
/// The orchestrator only reads these; pipeline editing happens upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub trigger_mode: TriggerMode,
    /// Scanner that feeds candidates into the decision run, if any
    pub scanner_id: Option<Uuid>,
    /// Signal topics this pipeline listens on (SIGNAL mode only)
    pub signal_subscriptions: Vec<String>,
    pub is_active: bool,
    /// Minimum minutes between runs, measured from the last finished execution
    pub interval_minutes: i64,
    /// Mode new periodic executions run in
    pub periodic_mode: ExecutionMode,
    /// Monitoring cadence in minutes; fractional values are honored
    pub monitor_interval_minutes: f64,
    pub require_approval: bool,
    /// Modes that need sign-off; empty means every mode does
    pub approval_modes: Vec<ExecutionMode>,
    pub approval_timeout_minutes: i64,
    pub approval_channels: Vec<ApprovalChannel>,
    pub approval_phone: Option<String>,
    pub notify_on_completion: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(user_id: Uuid, name: impl Into<String>, trigger_mode: TriggerMode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            trigger_mode,
            scanner_id: None,
            signal_subscriptions: Vec::new(),
            is_active: true,
            interval_minutes: 5,
            periodic_mode: ExecutionMode::Paper,
            monitor_interval_minutes: 5.0,
            require_approval: false,
            approval_modes: Vec::new(),
            approval_timeout_minutes: 15,
            approval_channels: vec![ApprovalChannel::Web],
            approval_phone: None,
            notify_on_completion: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing_is_case_insensitive() {
        assert_eq!(ExecutionMode::try_from("PAPER"), Ok(ExecutionMode::Paper));
        assert_eq!(ExecutionMode::try_from("live"), Ok(ExecutionMode::Live));
        assert_eq!(TriggerMode::try_from("periodic"), Ok(TriggerMode::Periodic));
        assert!(ExecutionMode::try_from("margin").is_err());
    }

    #[test]
    fn test_new_pipeline_defaults() {
        let pipeline = Pipeline::new(Uuid::new_v4(), "momentum", TriggerMode::Periodic);
        assert!(pipeline.is_active);
        assert_eq!(pipeline.interval_minutes, 5);
        assert_eq!(pipeline.periodic_mode, ExecutionMode::Paper);
        assert_eq!(pipeline.approval_timeout_minutes, 15);
        assert_eq!(pipeline.approval_channels, vec![ApprovalChannel::Web]);
        assert!(!pipeline.require_approval);
    }
}

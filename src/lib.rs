pub mod adapters;
pub mod approval;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod maintenance;
pub mod monitor;
pub mod orchestrator;
pub mod reconcile;
pub mod scheduler;

pub use approval::{ApprovalDecision, ApprovalGate};
pub use config::AppConfig;
pub use domain::{
    ApprovalStatus, Execution, ExecutionMode, ExecutionStatus, Pipeline, PreTradeReport,
    TriggerMode,
};
pub use error::{DroverError, Result};
pub use ledger::{ExecutionLedger, Ledger, MemoryLedger, PipelineStore, PostgresLedger};
pub use orchestrator::Orchestrator;
pub use scheduler::{TriggerDecision, TriggerScheduler};

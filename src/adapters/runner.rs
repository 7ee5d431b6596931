//! Seam to the decision pipeline that actually evaluates trades.
//!
//! The orchestrator never interprets the snapshot it carries between `run`
//! and `resume`; the runner owns that format end to end.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::domain::{Execution, Pipeline};
use crate::error::Result;

/// Proposed trade emitted by a decision run.
#[derive(Debug, Clone)]
pub struct TradeProposal {
    pub symbol: String,
    pub estimated_cost: Option<Decimal>,
    /// Supporting analysis, persisted alongside the execution for reporting
    pub analysis: Option<Value>,
}

/// Outcome of the decision phase of a run.
#[derive(Debug, Clone)]
pub enum DecisionOutcome {
    /// Pipeline decided there is nothing worth trading right now
    NoAction { summary: String },
    /// Pipeline proposes a trade; `snapshot` carries everything a later
    /// `resume` needs to place it
    TradeAction {
        proposal: TradeProposal,
        snapshot: Value,
    },
}

/// Outcome of resuming a run from its persisted snapshot.
#[derive(Debug, Clone)]
pub enum ResumeOutcome {
    /// Order is live at the broker
    OrderPlaced {
        symbol: String,
        cost: Option<Decimal>,
        snapshot: Value,
    },
    /// Conditions moved; the run ends without an order
    NoOrder { summary: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionRunner: Send + Sync {
    /// Run the decision phase for a freshly started execution.
    async fn run(&self, execution: &Execution, pipeline: &Pipeline) -> Result<DecisionOutcome>;

    /// Resume from a persisted snapshot and place the order it describes.
    async fn resume(
        &self,
        execution: &Execution,
        pipeline: &Pipeline,
        snapshot: &Value,
    ) -> Result<ResumeOutcome>;
}

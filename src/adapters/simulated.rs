//! Dry-run collaborators for simulation mode and tests.
//!
//! The runner always proposes the same paper trade and the broker reports the
//! position open for a fixed number of checks before filling it, which is
//! enough to exercise every monitoring path without a real upstream.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::domain::{Execution, Pipeline};
use crate::error::Result;

use super::broker::{BrokerClient, PositionStatus};
use super::runner::{DecisionOutcome, DecisionRunner, ResumeOutcome, TradeProposal};

/// Decision runner that proposes one fixed paper trade per run.
pub struct SimulatedRunner {
    pub symbol: String,
    pub cost: Decimal,
}

impl SimulatedRunner {
    pub fn new(symbol: impl Into<String>, cost: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            cost,
        }
    }
}

impl Default for SimulatedRunner {
    fn default() -> Self {
        Self::new("SIM", dec!(25.00))
    }
}

#[async_trait]
impl DecisionRunner for SimulatedRunner {
    async fn run(&self, execution: &Execution, pipeline: &Pipeline) -> Result<DecisionOutcome> {
        let snapshot = json!({
            "trade_proposal": {
                "action": "BUY",
                "symbol": self.symbol,
                "entry_price": self.cost.to_string(),
                "confidence": 0.75,
                "risk_notes": "simulated run",
            },
            "pipeline": pipeline.name,
            "execution": execution.id,
        });
        Ok(DecisionOutcome::TradeAction {
            proposal: TradeProposal {
                symbol: self.symbol.clone(),
                estimated_cost: Some(self.cost),
                analysis: Some(json!({ "source": "simulated" })),
            },
            snapshot,
        })
    }

    async fn resume(
        &self,
        _execution: &Execution,
        _pipeline: &Pipeline,
        snapshot: &Value,
    ) -> Result<ResumeOutcome> {
        let mut placed = snapshot.clone();
        if let Some(map) = placed.as_object_mut() {
            map.insert("order_placed".to_string(), json!(true));
        }
        Ok(ResumeOutcome::OrderPlaced {
            symbol: self.symbol.clone(),
            cost: Some(self.cost),
            snapshot: placed,
        })
    }
}

/// Broker that keeps a position open for `close_after_checks` status queries,
/// then reports it filled.
pub struct SimulatedBroker {
    close_after_checks: u32,
    checks: DashMap<Uuid, u32>,
}

impl SimulatedBroker {
    pub fn new(close_after_checks: u32) -> Self {
        Self {
            close_after_checks,
            checks: DashMap::new(),
        }
    }
}

impl Default for SimulatedBroker {
    fn default() -> Self {
        Self::new(2)
    }
}

#[async_trait]
impl BrokerClient for SimulatedBroker {
    async fn position_status(&self, execution: &Execution) -> PositionStatus {
        let mut seen = self.checks.entry(execution.id).or_insert(0);
        *seen += 1;
        if *seen > self.close_after_checks {
            PositionStatus::Filled {
                cost: execution.cost,
            }
        } else {
            PositionStatus::Open
        }
    }

    async fn cancel(&self, execution: &Execution) -> Result<()> {
        self.checks.remove(&execution.id);
        Ok(())
    }
}

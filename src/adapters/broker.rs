//! Seam to the brokerage holding the positions.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::Execution;
use crate::error::Result;

/// Authoritative position state as the broker reports it.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionStatus {
    /// Order working or position still held
    Open,
    /// Position closed out; `cost` is the realized total when known
    Filled { cost: Option<Decimal> },
    /// Broker state contradicts what the ledger believes
    Mismatched { detail: String },
    /// Broker could not be reached
    Unreachable,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Query the authoritative state of the position tied to an execution.
    ///
    /// Implementations own their retry budget; `Unreachable` means it is
    /// already spent.
    async fn position_status(&self, execution: &Execution) -> PositionStatus;

    /// Best-effort cancel of any broker-side order for an execution.
    async fn cancel(&self, execution: &Execution) -> Result<()>;
}

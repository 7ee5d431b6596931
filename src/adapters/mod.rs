pub mod broker;
pub mod notify;
pub mod runner;
pub mod simulated;

pub use broker::{BrokerClient, PositionStatus};
pub use notify::{Notifier, NotifyOutcome, SmsNotifier};
pub use runner::{DecisionOutcome, DecisionRunner, ResumeOutcome, TradeProposal};
pub use simulated::{SimulatedBroker, SimulatedRunner};

#[cfg(test)]
pub use broker::MockBrokerClient;
#[cfg(test)]
pub use notify::MockNotifier;
#[cfg(test)]
pub use runner::MockDecisionRunner;

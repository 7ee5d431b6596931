use serde_json::{json, Value};

use super::execution::Execution;

/// Versioned view of an execution's decision snapshot.
///
/// The blob belongs to the decision pipeline; the orchestrator only stores it
/// and hands the version back as the compare-and-set token.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: Value,
    pub version: i32,
}

impl Snapshot {
    /// Seed state for a signal-triggered execution.
    pub fn seeded_with_signal(payload: &Value) -> Value {
        json!({ "signal": payload })
    }
}

impl Execution {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.pipeline_state.clone(),
            version: self.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_seed_wraps_payload() {
        let payload = json!({ "symbol": "NVDA", "strength": 0.9 });
        let state = Snapshot::seeded_with_signal(&payload);
        assert_eq!(state["signal"]["symbol"], "NVDA");
        assert_eq!(state["signal"]["strength"], 0.9);
    }
}

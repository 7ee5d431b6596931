use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed projection of a decision snapshot, shown to a human before they
/// approve a trade.
///
/// Every field is optional: the snapshot layout belongs to the decision
/// pipeline and older snapshots may miss newer fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreTradeReport {
    pub action: Option<String>,
    pub symbol: Option<String>,
    pub entry_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub confidence: Option<f64>,
    pub position_size: Option<Decimal>,
    pub risk_notes: Option<String>,
}

impl PreTradeReport {
    /// Project a snapshot into the report, tolerating missing fields.
    ///
    /// Looks under `trade_proposal` first and falls back to the top level, so
    /// both nested and flat snapshot layouts render.
    pub fn from_snapshot(snapshot: &Value) -> Self {
        let root = snapshot.get("trade_proposal").unwrap_or(snapshot);
        Self {
            action: str_field(root, "action"),
            symbol: str_field(root, "symbol"),
            entry_price: decimal_field(root, "entry_price"),
            stop_price: decimal_field(root, "stop_price"),
            target_price: decimal_field(root, "target_price"),
            confidence: root.get("confidence").and_then(Value::as_f64),
            position_size: decimal_field(root, "position_size"),
            risk_notes: str_field(root, "risk_notes"),
        }
    }

    /// Compact rendering for the SMS channel.
    pub fn render_sms(&self, approval_url: &str) -> String {
        let mut lines = vec![format!(
            "Trade approval needed: {} {}",
            self.action.as_deref().unwrap_or("?"),
            self.symbol.as_deref().unwrap_or("?")
        )];
        if let Some(entry) = self.entry_price {
            lines.push(format!("Entry: {}", entry));
        }
        if let Some(stop) = self.stop_price {
            lines.push(format!("Stop: {}", stop));
        }
        if let Some(target) = self.target_price {
            lines.push(format!("Target: {}", target));
        }
        if let Some(size) = self.position_size {
            lines.push(format!("Size: {}", size));
        }
        if let Some(confidence) = self.confidence {
            lines.push(format!("Confidence: {:.0}%", confidence * 100.0));
        }
        if let Some(notes) = &self.risk_notes {
            lines.push(format!("Risk: {}", notes));
        }
        lines.push(format!("Approve or reject: {}", approval_url));
        lines.join("\n")
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(|s| s.to_string())
}

// Prices arrive either as JSON numbers or as decimal strings depending on the
// decision pipeline version.
fn decimal_field(value: &Value, key: &str) -> Option<Decimal> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64().and_then(Decimal::from_f64_retain),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_projects_nested_snapshot() {
        let snapshot = json!({
            "cursor": 3,
            "trade_proposal": {
                "action": "BUY",
                "symbol": "NVDA",
                "entry_price": "480.25",
                "stop_price": 470.5,
                "confidence": 0.82,
                "risk_notes": "earnings in 4 days"
            }
        });
        let report = PreTradeReport::from_snapshot(&snapshot);
        assert_eq!(report.action.as_deref(), Some("BUY"));
        assert_eq!(report.symbol.as_deref(), Some("NVDA"));
        assert_eq!(report.entry_price, Some(dec!(480.25)));
        assert_eq!(report.stop_price, Some(dec!(470.5)));
        assert_eq!(report.confidence, Some(0.82));
        assert_eq!(report.risk_notes.as_deref(), Some("earnings in 4 days"));
        assert_eq!(report.target_price, None);
    }

    #[test]
    fn test_projects_flat_snapshot() {
        let snapshot = json!({ "action": "SELL", "symbol": "TSLA" });
        let report = PreTradeReport::from_snapshot(&snapshot);
        assert_eq!(report.action.as_deref(), Some("SELL"));
        assert_eq!(report.symbol.as_deref(), Some("TSLA"));
    }

    #[test]
    fn test_empty_snapshot_yields_empty_report() {
        let report = PreTradeReport::from_snapshot(&json!({}));
        assert_eq!(report, PreTradeReport::default());
    }

    #[test]
    fn test_sms_rendering_includes_link() {
        let report = PreTradeReport {
            action: Some("BUY".to_string()),
            symbol: Some("NVDA".to_string()),
            entry_price: Some(dec!(480.25)),
            confidence: Some(0.82),
            ..Default::default()
        };
        let message = report.render_sms("https://drover.example/approvals/abc123");
        assert!(message.starts_with("Trade approval needed: BUY NVDA"));
        assert!(message.contains("Entry: 480.25"));
        assert!(message.contains("Confidence: 82%"));
        assert!(message.ends_with("https://drover.example/approvals/abc123"));
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Position side opened by an order on this side in long/short mode
    pub fn position_side(&self) -> &'static str {
        match self {
            Side::Buy => "long",
            Side::Sell => "short",
        }
    }

    pub fn parse(value: &str) -> Option<Side> {
        match value.to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum OrderKind {
    Market,
    TakeProfit { trigger_price: f64 },
    StopLoss { trigger_price: f64 },
}

/// A single order to place
///
/// For protective kinds `side` is the side of the position being protected;
/// the order itself goes out on the opposite side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderIntent {
    pub asset: String,
    pub side: Side,
    pub coin_amount: f64,
    pub kind: OrderKind,
}

/// Trade decision handed over by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeIntent {
    pub asset: String,
    pub side: Side,
    pub coin_amount: f64,
    #[serde(default)]
    pub take_profit_price: Option<f64>,
    #[serde(default)]
    pub stop_loss_price: Option<f64>,
}

/// Reference to a live order; algo orders cancel through a different endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OrderHandle {
    pub order_id: String,
    pub is_algo: bool,
}

/// Outcome of a placement: handles parsed from the response plus the raw payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub handles: Vec<OrderHandle>,
    pub raw: Value,
}

impl PlacedOrder {
    pub fn order_ids(&self) -> Vec<&str> {
        self.handles.iter().map(|h| h.order_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionSnapshot {
    pub asset: String,
    /// Coins; positive long, negative short
    pub signed_quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: Option<f64>,
    pub liquidation_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSnapshot {
    /// Available USDT
    pub balance: f64,
    pub total_equity: f64,
    pub positions: Vec<PositionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub asset: String,
    pub order_id: String,
    pub is_algo: bool,
    pub side: Side,
    pub coin_size: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub order_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub asset: String,
    pub side: Side,
    pub coin_size: f64,
    pub price: f64,
    pub timestamp: Option<i64>,
    pub order_id: Option<String>,
    pub trade_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CancelAllSummary {
    pub regular_cancelled: usize,
    pub algo_cancelled: usize,
}

impl CancelAllSummary {
    pub fn total(&self) -> usize {
        self.regular_cancelled + self.algo_cancelled
    }
}

/// Entry plus protective orders for one trade intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub entry: PlacedOrder,
    pub take_profit: Option<PlacedOrder>,
    pub stop_loss: Option<PlacedOrder>,
    /// Failures placing TP/SL after the entry already went through
    pub protective_errors: Vec<String>,
}

impl ExecutionReport {
    pub fn order_ids(&self) -> Vec<String> {
        [Some(&self.entry), self.take_profit.as_ref(), self.stop_loss.as_ref()]
            .into_iter()
            .flatten()
            .flat_map(|placed| placed.handles.iter().map(|h| h.order_id.clone()))
            .collect()
    }

    pub fn is_fully_protected(&self) -> bool {
        self.protective_errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_side_helpers() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.position_side(), "short");
        assert_eq!(Side::parse("SELL"), Some(Side::Sell));
        assert_eq!(Side::parse("hold"), None);
    }

    #[test]
    fn test_trade_intent_optional_prices() {
        let intent: TradeIntent = serde_json::from_value(json!({
            "asset": "ETH",
            "side": "buy",
            "coin_amount": 0.5
        }))
        .unwrap();

        assert_eq!(intent.side, Side::Buy);
        assert!(intent.take_profit_price.is_none());
        assert!(intent.stop_loss_price.is_none());
    }

    #[test]
    fn test_report_collects_ids() {
        let placed = |id: &str, is_algo| PlacedOrder {
            handles: vec![OrderHandle {
                order_id: id.to_string(),
                is_algo,
            }],
            raw: Value::Null,
        };
        let report = ExecutionReport {
            entry: placed("1", false),
            take_profit: Some(placed("2", true)),
            stop_loss: None,
            protective_errors: vec!["stop loss rejected".to_string()],
        };

        assert_eq!(report.order_ids(), vec!["1", "2"]);
        assert!(!report.is_fully_protected());
    }
}

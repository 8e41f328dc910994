//! Flow events: position-changing trades by tracked traders.

use serde::{Deserialize, Serialize};

/// What a trade did to the trader's position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowAction {
    /// Opened a position from flat.
    Open,
    /// Increased an existing position.
    Add,
    /// Decreased an existing position without closing it.
    Reduce,
    /// Closed the position to flat.
    Close,
    /// Closed and reopened on the opposite side in one trade.
    Flip,
}

/// Direction of a position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    /// Long exposure.
    Long,
    /// Short exposure.
    Short,
}

/// A single position-changing trade observed for a tracked trader.
///
/// Events are immutable once published. `id` is unique per
/// (source wallet, timestamp) pair and is the only key used for
/// deduplication on the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEvent {
    /// Deduplication key, `"<address>-<timestamp>"`.
    pub id: String,
    /// Trade time in epoch milliseconds.
    pub timestamp: i64,
    /// Instrument symbol (e.g. `"BTC"`).
    pub symbol: String,
    /// Trader wallet address.
    pub address: String,
    /// Effect of the trade on the position.
    pub action: FlowAction,
    /// Side of the trade.
    pub side: PositionSide,
    /// Fill price.
    pub price: f64,
    /// Fill size in instrument units.
    pub size: f64,
    /// Fill notional in USD.
    pub size_usd: f64,
    /// Position notional before the trade.
    pub old_position_usd: f64,
    /// Position notional after the trade.
    pub new_position_usd: f64,
    /// Side after the trade; `None` when the position is now flat.
    pub new_side: Option<PositionSide>,
    /// Average entry price of the resulting position.
    pub avg_entry_px: f64,
    /// Leaderboard rank, when the trader is ranked.
    pub trader_rank: Option<u32>,
    /// Trailing 30-day PnL in USD.
    #[serde(rename = "pnl30d")]
    pub pnl_30d: Option<f64>,
    /// Trailing 30-day win rate in `[0, 1]`.
    #[serde(rename = "winRate30d")]
    pub win_rate_30d: Option<f64>,
}

impl FlowEvent {
    /// Canonical event id for a wallet and trade timestamp.
    pub fn event_id(address: &str, timestamp: i64) -> String {
        format!("{address}-{timestamp}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::flow_event;

    #[test]
    fn event_id_format() {
        assert_eq!(FlowEvent::event_id("w1", 1000), "w1-1000");
    }

    #[test]
    fn serializes_camel_case_fields() {
        let event = flow_event("w1-1000", "BTC");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["id"], "w1-1000");
        assert_eq!(json["symbol"], "BTC");
        assert_eq!(json["action"], "open");
        assert_eq!(json["side"], "long");
        assert!(json.get("sizeUsd").is_some());
        assert!(json.get("oldPositionUsd").is_some());
        assert!(json.get("newPositionUsd").is_some());
        assert!(json.get("avgEntryPx").is_some());
        assert!(json.get("pnl30d").is_some());
        assert!(json.get("winRate30d").is_some());
        assert!(json.get("traderRank").is_some());
    }

    #[test]
    fn deserializes_without_optional_fields() {
        let json = r#"{
            "id": "0xabc-1700000000000",
            "timestamp": 1700000000000,
            "symbol": "ETH",
            "address": "0xabc",
            "action": "close",
            "side": "short",
            "price": 2000.5,
            "size": 1.5,
            "sizeUsd": 3000.75,
            "oldPositionUsd": 3000.75,
            "newPositionUsd": 0.0,
            "avgEntryPx": 2100.0
        }"#;
        let event: FlowEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.action, FlowAction::Close);
        assert_eq!(event.side, PositionSide::Short);
        assert!(event.new_side.is_none());
        assert!(event.trader_rank.is_none());
        assert!(event.pnl_30d.is_none());
    }

    #[test]
    fn flat_position_serializes_null_side() {
        let mut event = flow_event("w1-1", "SOL");
        event.new_side = None;
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["newSide"].is_null());
    }
}

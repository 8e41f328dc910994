//! Fixtures for tests in this and downstream crates.

use crate::events::{FlowAction, FlowEvent, PositionSide};

/// Build a plausible long-open [`FlowEvent`] with the given id and symbol.
pub fn flow_event(id: &str, symbol: &str) -> FlowEvent {
    FlowEvent {
        id: id.to_string(),
        timestamp: 1_700_000_000_000,
        symbol: symbol.to_string(),
        address: "0x0000000000000000000000000000000000000001".to_string(),
        action: FlowAction::Open,
        side: PositionSide::Long,
        price: 100.0,
        size: 2.0,
        size_usd: 200.0,
        old_position_usd: 0.0,
        new_position_usd: 200.0,
        new_side: Some(PositionSide::Long),
        avg_entry_px: 100.0,
        trader_rank: Some(7),
        pnl_30d: Some(12_500.0),
        win_rate_30d: Some(0.62),
    }
}

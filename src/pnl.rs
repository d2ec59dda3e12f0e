// =============================================================================
// PnL & Thresholds — unrealized loss/gain and the close decision
// =============================================================================
//
// Sign convention (sign = +1 long, -1 short):
//   loss_usd = (entry - mark) * quantity * sign
//   gain_pct = (mark - entry) / entry * 100 * sign
//
// A positive loss_usd is money lost; a positive gain_pct is profit. The two
// always have opposite signs for the same snapshot.
// =============================================================================

use crate::types::{ExitReason, OpenPosition, Side};

/// A position observed at a single mark price.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub position_id: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_value: f64,
    pub mark_price: f64,
    pub loss_usd: f64,
    pub gain_pct: f64,
}

impl PositionSnapshot {
    pub fn new(position: &OpenPosition, mark_price: f64) -> Self {
        Self {
            symbol: position.symbol.clone(),
            position_id: position.position_id.clone(),
            side: position.side,
            entry_price: position.entry_price,
            quantity: position.quantity,
            entry_value: position.entry_value,
            mark_price,
            loss_usd: loss_usd(position.side, position.entry_price, mark_price, position.quantity),
            gain_pct: gain_pct(position.side, position.entry_price, mark_price),
        }
    }
}

/// Unrealized loss in quote currency. Negative when the position is in profit.
pub fn loss_usd(side: Side, entry: f64, mark: f64, quantity: f64) -> f64 {
    (entry - mark) * quantity * side.sign()
}

/// Unrealized gain as a percentage of the entry price. Negative when losing.
pub fn gain_pct(side: Side, entry: f64, mark: f64) -> f64 {
    if entry <= 0.0 {
        return 0.0;
    }
    (mark - entry) / entry * 100.0 * side.sign()
}

/// Close thresholds for a guarded position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Maximum tolerated loss in USD (> 0).
    pub stop_loss_usd: f64,
    /// Gain percentage at which to take profit. `None` disables take-profit.
    pub take_profit_pct: Option<f64>,
}

impl Thresholds {
    /// Decide whether `snapshot` breaches a threshold. Stop-loss wins when both
    /// would fire (they cannot for a consistent snapshot, but the order is
    /// fixed anyway).
    pub fn evaluate(&self, snapshot: &PositionSnapshot) -> Option<ExitReason> {
        if snapshot.loss_usd >= self.stop_loss_usd {
            return Some(ExitReason::StopLoss);
        }
        match self.take_profit_pct {
            Some(tp) if snapshot.gain_pct >= tp => Some(ExitReason::TakeProfit),
            _ => None,
        }
    }
}

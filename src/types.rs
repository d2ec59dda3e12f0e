// =============================================================================
// Shared types used across the position guard
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a futures position.
///
/// Bitunix reports positions with the side of the opening order, so a long is
/// `BUY` and a short is `SELL`. Some endpoints spell them `LONG` / `SHORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY", alias = "LONG", alias = "buy", alias = "long")]
    Long,
    #[serde(rename = "SELL", alias = "SHORT", alias = "sell", alias = "short")]
    Short,
}

impl Side {
    /// +1 for longs, -1 for shorts.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Order side that reduces a position of this direction.
    pub fn closing_order_side(self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// An open position as reported by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenPosition {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    /// Notional value at entry (`entry_price * quantity` as the exchange
    /// accounts for it).
    pub entry_value: f64,
}

/// Market order that closes the full quantity of a tracked position.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseOrder {
    pub symbol: String,
    pub position_id: String,
    pub side: Side,
    pub quantity: f64,
}

impl CloseOrder {
    pub fn for_position(position: &OpenPosition) -> Self {
        Self {
            symbol: position.symbol.clone(),
            position_id: position.position_id.clone(),
            side: position.side,
            quantity: position.quantity,
        }
    }
}

/// Why the guard decided to close a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "StopLoss"),
            Self::TakeProfit => write!(f, "TakeProfit"),
        }
    }
}

/// How a guarded position ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    /// Our market close order was confirmed by the position disappearing.
    ClosedByGuard { reason: ExitReason, order_id: String },
    /// The position vanished without a close order from us (manual close,
    /// liquidation, or an exchange-side TP/SL).
    ClosedExternally,
}

impl std::fmt::Display for GuardOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClosedByGuard { reason, order_id } => {
                write!(f, "ClosedByGuard({reason}, order_id={order_id})")
            }
            Self::ClosedExternally => write!(f, "ClosedExternally"),
        }
    }
}

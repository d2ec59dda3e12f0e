// =============================================================================
// Protective Orders — exchange-side TP/SL backstop for the guarded position
// =============================================================================
//
// Optional. While the guard polls, a position-linked TP/SL order sits on the
// exchange at the same thresholds, so the position stays protected if this
// process dies. The order is replaced whenever the position's entry value
// changes (first sighting, or the position was added to).
//
// Failures here never interrupt the guard loop; they are logged.
// =============================================================================

use tracing::{debug, info, warn};

use crate::exchange::FuturesExchange;
use crate::pnl::Thresholds;
use crate::precision;
use crate::types::{OpenPosition, Side};

/// Trigger price at which the position has lost `stop_loss_usd`.
///
/// `None` when the position would need a non-positive price to lose that
/// much (a long smaller than the stop amount).
pub fn stop_price(side: Side, entry_price: f64, entry_value: f64, stop_loss_usd: f64) -> Option<f64> {
    if entry_value <= 0.0 {
        return None;
    }
    let variation = entry_price * (stop_loss_usd / entry_value);
    let price = entry_price - variation * side.sign();
    (price > 0.0).then_some(price)
}

/// Trigger price at which the position has gained `take_profit_pct` percent.
pub fn take_profit_price(side: Side, entry_price: f64, take_profit_pct: f64) -> f64 {
    entry_price + entry_price * (take_profit_pct / 100.0) * side.sign()
}

/// Tracks what has been placed so orders are only replaced on change.
#[derive(Debug, Default)]
pub struct ProtectiveOrders {
    synced_entry_value: Option<f64>,
    precision: Option<(String, u32)>,
}

impl ProtectiveOrders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure the exchange holds a TP/SL order matching `position`.
    pub async fn sync<E: FuturesExchange>(
        &mut self,
        exchange: &E,
        position: &OpenPosition,
        thresholds: &Thresholds,
    ) {
        if self.synced_entry_value == Some(position.entry_value) {
            return;
        }

        info!(
            symbol = %position.symbol,
            entry_value = position.entry_value,
            "position value changed — replacing protective TP/SL"
        );

        let quote_precision = self.quote_precision(exchange, &position.symbol).await;

        let sl_price = match stop_price(
            position.side,
            position.entry_price,
            position.entry_value,
            thresholds.stop_loss_usd,
        ) {
            Some(p) => render(p, quote_precision),
            None => {
                warn!(
                    symbol = %position.symbol,
                    stop_loss_usd = thresholds.stop_loss_usd,
                    entry_value = position.entry_value,
                    "computed stop price is zero or negative — no exchange stop placed"
                );
                None
            }
        };

        let tp_price = thresholds
            .take_profit_pct
            .map(|tp| take_profit_price(position.side, position.entry_price, tp))
            .and_then(|p| render(p, quote_precision));

        if sl_price.is_none() && tp_price.is_none() {
            self.synced_entry_value = Some(position.entry_value);
            return;
        }

        match exchange.cancel_position_tpsl(&position.symbol).await {
            Ok(count) => debug!(symbol = %position.symbol, count, "old protective orders cancelled"),
            Err(e) => warn!(symbol = %position.symbol, error = %e, "failed to cancel old protective orders"),
        }

        match exchange
            .place_position_tpsl(
                &position.symbol,
                &position.position_id,
                sl_price.as_deref(),
                tp_price.as_deref(),
            )
            .await
        {
            Ok(()) => {
                info!(
                    symbol = %position.symbol,
                    sl_price = ?sl_price,
                    tp_price = ?tp_price,
                    "protective TP/SL placed"
                );
                self.synced_entry_value = Some(position.entry_value);
            }
            Err(e) if e.is_transient() => {
                warn!(symbol = %position.symbol, error = %e, "protective TP/SL failed — will retry next cycle");
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "protective TP/SL rejected");
                self.synced_entry_value = Some(position.entry_value);
            }
        }
    }

    /// Remove leftover orders once the position is gone.
    pub async fn cleanup<E: FuturesExchange>(&mut self, exchange: &E, symbol: &str) {
        match exchange.cancel_all_orders(symbol).await {
            Ok(()) => info!(symbol, "remaining orders cancelled"),
            Err(e) => warn!(symbol, error = %e, "failed to cancel remaining orders"),
        }
        self.synced_entry_value = None;
    }

    async fn quote_precision<E: FuturesExchange>(&mut self, exchange: &E, symbol: &str) -> Option<u32> {
        if let Some((cached, p)) = &self.precision {
            if cached == symbol {
                return Some(*p);
            }
        }
        match exchange.quote_precision(symbol).await {
            Ok(p) => {
                self.precision = Some((symbol.to_string(), p));
                Some(p)
            }
            Err(e) => {
                warn!(symbol, error = %e, "could not fetch price precision — using raw prices");
                None
            }
        }
    }
}

fn render(price: f64, quote_precision: Option<u32>) -> Option<String> {
    match precision::format_price(price, quote_precision) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(price, error = %e, "price could not be formatted");
            None
        }
    }
}

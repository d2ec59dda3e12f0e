// =============================================================================
// Price precision — snap trigger prices onto the exchange tick grid
// =============================================================================
//
// Bitunix rejects trigger prices with more decimals than the pair's
// `quotePrecision`. Prices are floored to the tick (10^-precision) in decimal
// arithmetic so that e.g. 0.1 + 0.2 style float noise never leaks into the
// order payload.
// =============================================================================

use anyhow::{Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// Upper bound on the precision `rust_decimal` can represent.
const MAX_PRECISION: u32 = 28;

/// Tick size for a quote precision, e.g. 4 -> 0.0001.
pub fn tick_size(quote_precision: u32) -> Decimal {
    Decimal::new(1, quote_precision.min(MAX_PRECISION))
}

/// Floor `price` to a multiple of the tick for `quote_precision`.
pub fn round_down_to_tick(price: f64, quote_precision: u32) -> Result<Decimal> {
    let value = Decimal::from_f64(price)
        .with_context(|| format!("price {price} is not representable as a decimal"))?;
    let tick = tick_size(quote_precision);
    value
        .checked_div(tick)
        .and_then(|steps| steps.trunc().checked_mul(tick))
        .with_context(|| format!("price {price} overflows at precision {quote_precision}"))
}

/// Render a price for an order payload, falling back to the raw float when the
/// pair precision is unknown.
pub fn format_price(price: f64, quote_precision: Option<u32>) -> Result<String> {
    match quote_precision {
        Some(p) => Ok(round_down_to_tick(price, p)?.normalize().to_string()),
        None => Ok(price.to_string()),
    }
}

// =============================================================================
// Exchange seam — what the guard needs from a futures venue
// =============================================================================

use crate::bitunix::ApiError;
use crate::types::{CloseOrder, OpenPosition};

/// Operations the position guard performs against the exchange.
///
/// The guard awaits each call to completion before issuing the next, so
/// implementations never see overlapping requests.
#[allow(async_fn_in_trait)]
pub trait FuturesExchange {
    /// Open positions with non-zero quantity, optionally for one symbol.
    async fn open_positions(&self, symbol: Option<&str>) -> Result<Vec<OpenPosition>, ApiError>;

    /// Current mark price.
    async fn mark_price(&self, symbol: &str) -> Result<f64, ApiError>;

    /// Number of decimals allowed in a price for `symbol`.
    async fn quote_precision(&self, symbol: &str) -> Result<u32, ApiError>;

    /// Submit a market close; returns the exchange order id.
    async fn place_close_order(&self, order: &CloseOrder) -> Result<String, ApiError>;

    /// Cancel pending position-linked TP/SL orders; returns the count.
    async fn cancel_position_tpsl(&self, symbol: &str) -> Result<usize, ApiError>;

    async fn place_position_tpsl(
        &self,
        symbol: &str,
        position_id: &str,
        sl_price: Option<&str>,
        tp_price: Option<&str>,
    ) -> Result<(), ApiError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ApiError>;
}

// =============================================================================
// Bitunix Futures REST Client — double-SHA256 signed requests
// =============================================================================
//
// Every request (public or private) carries the four auth headers:
//   api-key, nonce, timestamp, sign
// where
//   digest = sha256_hex(nonce + timestamp + api_key + sorted_query + body)
//   sign   = sha256_hex(digest + secret_key)
//
// `sorted_query` is the GET parameters sorted by key and concatenated as
// k1v1k2v2 with no separators. `body` is the exact compact JSON sent on POST.
//
// SECURITY: the secret key is never logged or serialised.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::error::ApiError;
use crate::exchange::FuturesExchange;
use crate::types::{CloseOrder, OpenPosition, Side};

/// Production futures endpoint.
pub const DEFAULT_BASE_URL: &str = "https://fapi.bitunix.com";

/// Per-request timeout. A hung request counts as a transient failure.
const REQUEST_TIMEOUT_SECS: u64 = 10;

const PENDING_POSITIONS: &str = "/api/v1/futures/position/get_pending_positions";
const TICKERS: &str = "/api/v1/futures/market/tickers";
const TRADING_PAIRS: &str = "/api/v1/futures/market/trading_pairs";
const PLACE_ORDER: &str = "/api/v1/futures/trade/place_order";
const CANCEL_ORDERS: &str = "/api/v1/futures/trade/cancel_orders";
const CANCEL_ALL_ORDERS: &str = "/api/v1/futures/trade/cancel_all_orders";
const PENDING_TPSL: &str = "/api/v1/futures/tpsl/get_pending_orders";
const PLACE_POSITION_TPSL: &str = "/api/v1/futures/tpsl/position/place_order";

// -----------------------------------------------------------------------------
// Signing
// -----------------------------------------------------------------------------

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Compute the `sign` header for a request.
pub fn sign(
    api_key: &str,
    secret_key: &str,
    nonce: &str,
    timestamp: &str,
    sorted_query: &str,
    body: &str,
) -> String {
    let digest = sha256_hex(&format!("{nonce}{timestamp}{api_key}{sorted_query}{body}"));
    sha256_hex(&format!("{digest}{secret_key}"))
}

/// Concatenate query parameters sorted by key, without separators.
pub fn sorted_query(params: &[(&str, String)]) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted.iter().map(|(k, v)| format!("{k}{v}")).collect()
}

/// 32-character random nonce.
fn nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

// -----------------------------------------------------------------------------
// Client
// -----------------------------------------------------------------------------

/// Bitunix futures REST client.
#[derive(Clone)]
pub struct BitunixClient {
    api_key: String,
    secret_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl BitunixClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key`    — sent in the `api-key` header.
    /// * `secret_key` — used only to compute the `sign` header.
    /// * `base_url`   — e.g. [`DEFAULT_BASE_URL`]; a trailing slash is dropped.
    pub fn new(
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert("language", HeaderValue::from_static("en-US"));
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build HTTP client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "BitunixClient initialised");

        Ok(Self {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            base_url,
            client,
        })
    }

    fn auth_headers(&self, sorted_query: &str, body: &str) -> Result<HeaderMap, ApiError> {
        let nonce = nonce();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let sign = sign(&self.api_key, &self.secret_key, &nonce, &timestamp, sorted_query, body);

        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("api-key", self.api_key.as_str()),
            ("nonce", nonce.as_str()),
            ("timestamp", timestamp.as_str()),
            ("sign", sign.as_str()),
        ] {
            let value = HeaderValue::from_str(value)
                .map_err(|_| ApiError::InvalidHeader { name: name.to_string() })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Signed GET; returns the envelope's `data` field.
    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ApiError> {
        let headers = self.auth_headers(&sorted_query(params), "")?;
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .query(params)
            .headers(headers)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                path: path.to_string(),
                source,
            })?;

        Self::unwrap_envelope(path, resp).await
    }

    /// Signed POST of a JSON body; returns the envelope's `data` field.
    async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        // Sign exactly the bytes we send.
        let body = serde_json::to_string(body).map_err(|e| ApiError::decode(path, e))?;
        let headers = self.auth_headers("", &body)?;
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                path: path.to_string(),
                source,
            })?;

        Self::unwrap_envelope(path, resp).await
    }

    /// Check HTTP status and the `{code, msg, data}` envelope.
    async fn unwrap_envelope(path: &str, resp: reqwest::Response) -> Result<Value, ApiError> {
        let status = resp.status();
        let text = resp.text().await.map_err(|source| ApiError::Transport {
            path: path.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(ApiError::Status {
                path: path.to_string(),
                status,
                body: text,
            });
        }

        let mut envelope: Value =
            serde_json::from_str(&text).map_err(|e| ApiError::decode(path, e))?;
        parse_envelope(path, &mut envelope)
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// GET pending positions, optionally filtered to one symbol.
    #[instrument(skip(self), name = "bitunix::get_pending_positions")]
    pub async fn get_pending_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<OpenPosition>, ApiError> {
        let params: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbol", s.to_uppercase())])
            .unwrap_or_default();
        let data = self.get(PENDING_POSITIONS, &params).await?;

        let mut positions = Vec::new();
        for entry in as_list(&data) {
            let position = parse_position(PENDING_POSITIONS, entry)?;
            if position.quantity == 0.0 {
                continue;
            }
            positions.push(position);
        }

        debug!(count = positions.len(), "pending positions retrieved");
        Ok(positions)
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET the current mark price for `symbol`.
    #[instrument(skip(self), name = "bitunix::get_mark_price")]
    pub async fn get_mark_price(&self, symbol: &str) -> Result<f64, ApiError> {
        let data = self
            .get(TICKERS, &[("symbols", symbol.to_uppercase())])
            .await?;

        let ticker = find_symbol(&data, symbol)
            .ok_or_else(|| ApiError::decode(TICKERS, format!("no ticker for {symbol}")))?;
        let mark = parse_num(TICKERS, "markPrice", &ticker["markPrice"])?;

        debug!(symbol, mark, "mark price retrieved");
        Ok(mark)
    }

    /// GET `quotePrecision` for `symbol` from the trading-pair listing.
    #[instrument(skip(self), name = "bitunix::get_quote_precision")]
    pub async fn get_quote_precision(&self, symbol: &str) -> Result<u32, ApiError> {
        let data = self
            .get(TRADING_PAIRS, &[("symbols", symbol.to_uppercase())])
            .await?;

        let pair = find_symbol(&data, symbol)
            .ok_or_else(|| ApiError::decode(TRADING_PAIRS, format!("no trading pair {symbol}")))?;
        let precision = parse_num(TRADING_PAIRS, "quotePrecision", &pair["quotePrecision"])?;

        Ok(precision.max(0.0) as u32)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST a MARKET order closing the full position; returns the order id.
    #[instrument(skip(self), name = "bitunix::place_close_order")]
    pub async fn place_close_order(&self, order: &CloseOrder) -> Result<String, ApiError> {
        let body = json!({
            "symbol": order.symbol,
            "side": order.side.closing_order_side(),
            "orderType": "MARKET",
            "qty": order.quantity.to_string(),
            "tradeSide": "CLOSE",
            "positionId": order.position_id,
        });

        let data = self.post(PLACE_ORDER, &body).await?;
        let order_id = match &data["orderId"] {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => {
                warn!(symbol = %order.symbol, "close order accepted without an orderId");
                String::new()
            }
        };

        debug!(symbol = %order.symbol, order_id = %order_id, "close order placed");
        Ok(order_id)
    }

    /// Cancel every pending position TP/SL order on `symbol`; returns how many
    /// were cancelled.
    #[instrument(skip(self), name = "bitunix::cancel_position_tpsl")]
    pub async fn cancel_position_tpsl(&self, symbol: &str) -> Result<usize, ApiError> {
        let data = self
            .get(PENDING_TPSL, &[("symbol", symbol.to_uppercase())])
            .await?;

        let order_list: Vec<Value> = as_list(&data)
            .iter()
            .filter_map(|o| match &o["id"] {
                Value::String(s) => Some(json!({ "orderId": s })),
                Value::Number(n) => Some(json!({ "orderId": n.to_string() })),
                _ => None,
            })
            .collect();

        if order_list.is_empty() {
            debug!(symbol, "no pending TP/SL orders");
            return Ok(0);
        }

        let count = order_list.len();
        self.post(CANCEL_ORDERS, &json!({ "symbol": symbol, "orderList": order_list }))
            .await?;

        debug!(symbol, count, "pending TP/SL orders cancelled");
        Ok(count)
    }

    /// POST a TP/SL order attached to a position. When triggered the exchange
    /// closes the whole position at market.
    #[instrument(skip(self), name = "bitunix::place_position_tpsl")]
    pub async fn place_position_tpsl(
        &self,
        symbol: &str,
        position_id: &str,
        sl_price: Option<&str>,
        tp_price: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut body = json!({ "symbol": symbol, "positionId": position_id });
        if let Some(sl) = sl_price {
            body["slPrice"] = json!(sl);
        }
        if let Some(tp) = tp_price {
            body["tpPrice"] = json!(tp);
        }

        self.post(PLACE_POSITION_TPSL, &body).await?;
        debug!(symbol, position_id, sl_price, tp_price, "position TP/SL placed");
        Ok(())
    }

    /// POST cancel-all for `symbol`.
    #[instrument(skip(self), name = "bitunix::cancel_all_orders")]
    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ApiError> {
        self.post(CANCEL_ALL_ORDERS, &json!({ "symbol": symbol.to_uppercase() }))
            .await?;
        debug!(symbol, "all orders cancelled");
        Ok(())
    }
}

impl std::fmt::Debug for BitunixClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitunixClient")
            .field("api_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl FuturesExchange for BitunixClient {
    async fn open_positions(&self, symbol: Option<&str>) -> Result<Vec<OpenPosition>, ApiError> {
        self.get_pending_positions(symbol).await
    }

    async fn mark_price(&self, symbol: &str) -> Result<f64, ApiError> {
        self.get_mark_price(symbol).await
    }

    async fn quote_precision(&self, symbol: &str) -> Result<u32, ApiError> {
        self.get_quote_precision(symbol).await
    }

    async fn place_close_order(&self, order: &CloseOrder) -> Result<String, ApiError> {
        BitunixClient::place_close_order(self, order).await
    }

    async fn cancel_position_tpsl(&self, symbol: &str) -> Result<usize, ApiError> {
        BitunixClient::cancel_position_tpsl(self, symbol).await
    }

    async fn place_position_tpsl(
        &self,
        symbol: &str,
        position_id: &str,
        sl_price: Option<&str>,
        tp_price: Option<&str>,
    ) -> Result<(), ApiError> {
        BitunixClient::place_position_tpsl(self, symbol, position_id, sl_price, tp_price).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ApiError> {
        BitunixClient::cancel_all_orders(self, symbol).await
    }
}

// -----------------------------------------------------------------------------
// Response parsing
// -----------------------------------------------------------------------------

/// Validate `{code, msg, data}` and take `data` out of it.
fn parse_envelope(path: &str, envelope: &mut Value) -> Result<Value, ApiError> {
    let code = envelope["code"]
        .as_i64()
        .or_else(|| envelope["code"].as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| ApiError::decode(path, "envelope missing 'code'"))?;

    if code != 0 {
        return Err(ApiError::Business {
            path: path.to_string(),
            code,
            msg: envelope["msg"].as_str().unwrap_or("").to_string(),
        });
    }

    Ok(envelope["data"].take())
}

/// `data` is usually a list; tolerate a bare object or null.
fn as_list(data: &Value) -> Vec<&Value> {
    match data {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn find_symbol<'a>(data: &'a Value, symbol: &str) -> Option<&'a Value> {
    let items = as_list(data);
    items
        .iter()
        .find(|v| {
            v["symbol"]
                .as_str()
                .is_some_and(|s| s.eq_ignore_ascii_case(symbol))
        })
        .copied()
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_num(path: &str, field: &str, val: &Value) -> Result<f64, ApiError> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| ApiError::decode(path, format!("field '{field}': '{s}' is not a number")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(ApiError::decode(path, format!("field '{field}': expected string or number, got {val}")))
    }
}

fn parse_position(path: &str, entry: &Value) -> Result<OpenPosition, ApiError> {
    let position_id = match &entry["positionId"] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(ApiError::decode(path, format!("bad positionId {other}"))),
    };
    let symbol = entry["symbol"]
        .as_str()
        .ok_or_else(|| ApiError::decode(path, "position missing 'symbol'"))?
        .to_string();
    let side: Side = serde_json::from_value(entry["side"].clone())
        .map_err(|e| ApiError::decode(path, format!("field 'side': {e}")))?;

    let entry_price = parse_num(path, "avgOpenPrice", &entry["avgOpenPrice"])?;
    let quantity = parse_num(path, "qty", &entry["qty"])?;
    let entry_value = match &entry["entryValue"] {
        Value::Null => entry_price * quantity,
        v => parse_num(path, "entryValue", v)?,
    };

    Ok(OpenPosition {
        position_id,
        symbol,
        side,
        entry_price,
        quantity,
        entry_value,
    })
}

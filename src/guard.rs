// =============================================================================
// Position Guard Loop — poll, evaluate, close
// =============================================================================
//
// One cycle:
//   1. Fetch the open position for the guarded symbol.
//   2. None open: keep waiting if we never saw one, otherwise the position
//      has closed and the loop ends.
//   3. Fetch the mark price and compute loss (USD) / gain (%).
//   4. Optionally refresh the exchange-side TP/SL backstop.
//   5. On a threshold breach, submit a market close for the full quantity.
//
// At most one close order is in flight. It is confirmed by the position
// disappearing on the following cycle; if the position is still there the
// order is treated as unfilled and the cycle re-evaluates from scratch.
//
// Transient API failures back off exponentially and are retried up to
// `max_retries` consecutive times. Auth failures and rejected reads abort.
// =============================================================================

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bitunix::{ApiError, ErrorKind};
use crate::exchange::FuturesExchange;
use crate::guard_config::GuardConfig;
use crate::pnl::{PositionSnapshot, Thresholds};
use crate::protective::ProtectiveOrders;
use crate::retry::Backoff;
use crate::types::{CloseOrder, ExitReason, GuardOutcome, OpenPosition};

#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("giving up after {attempts} consecutive transient failures: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: ApiError,
    },

    #[error("position on {symbol} still open after {attempts} close submissions")]
    CloseAttemptsExhausted {
        symbol: String,
        attempts: u32,
        /// Set when the last submission itself was refused.
        #[source]
        source: Option<ApiError>,
    },

    #[error("{count} open positions on {symbol}; hedge mode is not supported")]
    HedgeMode { symbol: String, count: usize },

    #[error("open positions on {symbols:?}; set `symbol` in the config to pick one")]
    AmbiguousPosition { symbols: Vec<String> },
}

/// Loop parameters, split from [`GuardConfig`] so tests can use zero delays.
#[derive(Debug, Clone)]
pub struct GuardSettings {
    pub thresholds: Thresholds,
    pub symbol: Option<String>,
    pub poll_interval: Duration,
    pub backoff: Backoff,
    pub max_retries: u32,
    pub max_close_attempts: u32,
    pub exchange_side_orders: bool,
}

impl From<&GuardConfig> for GuardSettings {
    fn from(config: &GuardConfig) -> Self {
        Self {
            thresholds: config.thresholds(),
            symbol: config.symbol.clone(),
            poll_interval: config.poll_interval(),
            backoff: config.backoff(),
            max_retries: config.max_retries,
            max_close_attempts: config.max_close_attempts,
            exchange_side_orders: config.exchange_side_orders,
        }
    }
}

/// Result of a single successful cycle.
#[derive(Debug)]
enum Cycle {
    Waiting,
    Holding,
    CloseSubmitted,
    CloseFailed,
    Closed(GuardOutcome),
}

#[derive(Debug)]
struct PendingClose {
    order_id: String,
    reason: ExitReason,
}

/// Watches one position and closes it when a threshold is crossed.
pub struct PositionGuard<E> {
    exchange: E,
    settings: GuardSettings,
    symbol: Option<String>,
    protective: Option<ProtectiveOrders>,
    tracked: Option<OpenPosition>,
    pending_close: Option<PendingClose>,
    close_attempts: u32,
}

impl<E: FuturesExchange> PositionGuard<E> {
    pub fn new(exchange: E, settings: GuardSettings) -> Self {
        let protective = settings.exchange_side_orders.then(ProtectiveOrders::new);
        Self {
            exchange,
            symbol: settings.symbol.clone(),
            settings,
            protective,
            tracked: None,
            pending_close: None,
            close_attempts: 0,
        }
    }

    /// Run until the position is closed or an unrecoverable error occurs.
    pub async fn run(&mut self) -> Result<GuardOutcome, GuardError> {
        info!(
            symbol = ?self.symbol,
            stop_loss_usd = self.settings.thresholds.stop_loss_usd,
            take_profit_pct = ?self.settings.thresholds.take_profit_pct,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "position guard started"
        );

        let mut failures: u32 = 0;

        loop {
            match self.cycle().await {
                Ok(Cycle::Closed(outcome)) => {
                    info!(outcome = %outcome, "position closed — guard stopping");
                    return Ok(outcome);
                }
                Ok(cycle) => {
                    if failures > 0 {
                        info!(after_failures = failures, "exchange reachable again");
                    }
                    failures = 0;
                    debug!(?cycle, "cycle complete");
                }
                Err(GuardError::Api(e)) if e.is_transient() => {
                    failures += 1;
                    if failures > self.settings.max_retries {
                        error!(attempts = failures, error = %e, "transient failures exhausted retry budget");
                        return Err(GuardError::RetriesExhausted {
                            attempts: failures,
                            source: e,
                        });
                    }
                    let delay = self.settings.backoff.delay(failures);
                    warn!(
                        attempt = failures,
                        max_retries = self.settings.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient exchange error — backing off"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "fatal guard error");
                    return Err(e);
                }
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn cycle(&mut self) -> Result<Cycle, GuardError> {
        let Some(position) = self.observe().await? else {
            if self.tracked.is_some() {
                return Ok(Cycle::Closed(self.finish().await));
            }
            debug!(symbol = ?self.symbol, "no open position — waiting");
            return Ok(Cycle::Waiting);
        };

        // A different position id means the one we guarded is gone.
        if let Some(prev) = &self.tracked {
            if prev.position_id != position.position_id {
                info!(
                    previous = %prev.position_id,
                    current = %position.position_id,
                    "guarded position replaced by a new one"
                );
                return Ok(Cycle::Closed(self.finish().await));
            }
        }

        if let Some(pending) = self.pending_close.take() {
            warn!(
                symbol = %position.symbol,
                order_id = %pending.order_id,
                reason = %pending.reason,
                remaining_qty = position.quantity,
                "close order not reflected — position still open"
            );
        }

        if self.tracked.is_none() {
            info!(
                symbol = %position.symbol,
                position_id = %position.position_id,
                side = %position.side,
                entry_price = position.entry_price,
                quantity = position.quantity,
                "open position found — guarding"
            );
        }
        self.tracked = Some(position.clone());

        let mark = self.exchange.mark_price(&position.symbol).await?;
        let snapshot = PositionSnapshot::new(&position, mark);

        if let Some(protective) = self.protective.as_mut() {
            protective
                .sync(&self.exchange, &position, &self.settings.thresholds)
                .await;
        }

        match self.settings.thresholds.evaluate(&snapshot) {
            None => {
                debug!(
                    symbol = %snapshot.symbol,
                    mark = snapshot.mark_price,
                    loss_usd = format!("{:.4}", snapshot.loss_usd),
                    gain_pct = format!("{:.4}", snapshot.gain_pct),
                    "within thresholds"
                );
                Ok(Cycle::Holding)
            }
            Some(reason) => {
                info!(
                    symbol = %snapshot.symbol,
                    side = %snapshot.side,
                    entry_price = snapshot.entry_price,
                    mark = snapshot.mark_price,
                    loss_usd = format!("{:.4}", snapshot.loss_usd),
                    gain_pct = format!("{:.4}", snapshot.gain_pct),
                    reason = %reason,
                    "THRESHOLD CROSSED — closing position"
                );
                self.submit_close(&position, reason).await
            }
        }
    }

    /// Fetch the single guarded position, locking onto a symbol on first
    /// sighting when none was configured.
    async fn observe(&mut self) -> Result<Option<OpenPosition>, GuardError> {
        let mut positions = self.exchange.open_positions(self.symbol.as_deref()).await?;

        if let Some(symbol) = &self.symbol {
            positions.retain(|p| p.symbol.eq_ignore_ascii_case(symbol));
            if positions.len() > 1 {
                return Err(GuardError::HedgeMode {
                    symbol: symbol.clone(),
                    count: positions.len(),
                });
            }
            return Ok(positions.pop());
        }

        match positions.len() {
            0 => Ok(None),
            1 => {
                let position = positions.remove(0);
                info!(symbol = %position.symbol, "no symbol configured — locking onto the only open position");
                self.symbol = Some(position.symbol.clone());
                Ok(Some(position))
            }
            count => {
                let mut symbols: Vec<String> = positions.into_iter().map(|p| p.symbol).collect();
                symbols.sort();
                symbols.dedup();
                if symbols.len() == 1 {
                    return Err(GuardError::HedgeMode {
                        symbol: symbols.remove(0),
                        count,
                    });
                }
                Err(GuardError::AmbiguousPosition { symbols })
            }
        }
    }

    async fn submit_close(
        &mut self,
        position: &OpenPosition,
        reason: ExitReason,
    ) -> Result<Cycle, GuardError> {
        let order = CloseOrder::for_position(position);
        // Accepted-but-unfilled submissions count against the budget too.
        if self.close_attempts >= self.settings.max_close_attempts {
            error!(
                symbol = %order.symbol,
                attempts = self.close_attempts,
                "close budget spent and position still open"
            );
            return Err(GuardError::CloseAttemptsExhausted {
                symbol: order.symbol,
                attempts: self.close_attempts,
                source: None,
            });
        }
        self.close_attempts += 1;

        match self.exchange.place_close_order(&order).await {
            Ok(order_id) => {
                info!(
                    symbol = %order.symbol,
                    order_id = %order_id,
                    quantity = order.quantity,
                    attempt = self.close_attempts,
                    "market close submitted"
                );
                self.pending_close = Some(PendingClose { order_id, reason });
                Ok(Cycle::CloseSubmitted)
            }
            Err(e) if e.kind() == ErrorKind::Auth => Err(e.into()),
            Err(e) => {
                if self.close_attempts >= self.settings.max_close_attempts {
                    return Err(GuardError::CloseAttemptsExhausted {
                        symbol: order.symbol,
                        attempts: self.close_attempts,
                        source: Some(e),
                    });
                }
                if e.is_transient() {
                    warn!(
                        symbol = %order.symbol,
                        attempt = self.close_attempts,
                        error = %e,
                        "close order hit a transient error"
                    );
                    // Let `run` back off instead of resubmitting at poll pace.
                    return Err(e.into());
                }
                warn!(
                    symbol = %order.symbol,
                    attempt = self.close_attempts,
                    max_attempts = self.settings.max_close_attempts,
                    error = %e,
                    "close order rejected — retrying next cycle"
                );
                Ok(Cycle::CloseFailed)
            }
        }
    }

    /// The guarded position is gone. Only talks to the exchange again when
    /// protective orders may have been left behind.
    async fn finish(&mut self) -> GuardOutcome {
        let outcome = match self.pending_close.take() {
            Some(PendingClose { order_id, reason }) => GuardOutcome::ClosedByGuard { reason, order_id },
            None => GuardOutcome::ClosedExternally,
        };

        if let (Some(protective), Some(tracked)) = (self.protective.as_mut(), self.tracked.as_ref()) {
            protective.cleanup(&self.exchange, &tracked.symbol).await;
        }

        self.tracked = None;
        outcome
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;
    use reqwest::StatusCode;

    use super::*;
    use crate::types::Side;

    /// Scripted exchange. Each queue is consumed in order; running out of
    /// scripted positions is a test bug and panics.
    #[derive(Default)]
    struct MockExchange {
        positions: Mutex<VecDeque<Result<Vec<OpenPosition>, ApiError>>>,
        marks: Mutex<VecDeque<f64>>,
        closes: Mutex<VecDeque<Result<String, ApiError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockExchange {
        fn with_positions(self, items: Vec<Result<Vec<OpenPosition>, ApiError>>) -> Self {
            self.positions.lock().extend(items);
            self
        }

        fn with_marks(self, marks: &[f64]) -> Self {
            self.marks.lock().extend(marks.iter().copied());
            self
        }

        fn with_closes(self, items: Vec<Result<String, ApiError>>) -> Self {
            self.closes.lock().extend(items);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    impl FuturesExchange for &MockExchange {
        async fn open_positions(&self, symbol: Option<&str>) -> Result<Vec<OpenPosition>, ApiError> {
            self.calls.lock().push(format!("open_positions({})", symbol.unwrap_or("*")));
            self.positions
                .lock()
                .pop_front()
                .expect("unscripted open_positions call")
        }

        async fn mark_price(&self, symbol: &str) -> Result<f64, ApiError> {
            self.calls.lock().push(format!("mark_price({symbol})"));
            Ok(self.marks.lock().pop_front().expect("unscripted mark_price call"))
        }

        async fn quote_precision(&self, symbol: &str) -> Result<u32, ApiError> {
            self.calls.lock().push(format!("quote_precision({symbol})"));
            Ok(2)
        }

        async fn place_close_order(&self, order: &CloseOrder) -> Result<String, ApiError> {
            self.calls
                .lock()
                .push(format!("place_close_order({},{})", order.symbol, order.quantity));
            self.closes
                .lock()
                .pop_front()
                .expect("unscripted place_close_order call")
        }

        async fn cancel_position_tpsl(&self, symbol: &str) -> Result<usize, ApiError> {
            self.calls.lock().push(format!("cancel_position_tpsl({symbol})"));
            Ok(1)
        }

        async fn place_position_tpsl(
            &self,
            symbol: &str,
            _position_id: &str,
            sl_price: Option<&str>,
            tp_price: Option<&str>,
        ) -> Result<(), ApiError> {
            self.calls.lock().push(format!(
                "place_position_tpsl({symbol},{},{})",
                sl_price.unwrap_or("-"),
                tp_price.unwrap_or("-")
            ));
            Ok(())
        }

        async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ApiError> {
            self.calls.lock().push(format!("cancel_all_orders({symbol})"));
            Ok(())
        }
    }

    fn long(symbol: &str, entry: f64, qty: f64) -> OpenPosition {
        OpenPosition {
            position_id: format!("{symbol}-1"),
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: entry,
            quantity: qty,
            entry_value: entry * qty,
        }
    }

    fn btc_long() -> OpenPosition {
        long("BTCUSDT", 100.0, 1.0)
    }

    fn settings(stop_loss_usd: f64, take_profit_pct: Option<f64>) -> GuardSettings {
        GuardSettings {
            thresholds: Thresholds { stop_loss_usd, take_profit_pct },
            symbol: Some("BTCUSDT".into()),
            poll_interval: Duration::ZERO,
            backoff: Backoff::new(Duration::ZERO, Duration::ZERO),
            max_retries: 3,
            max_close_attempts: 3,
            exchange_side_orders: false,
        }
    }

    fn unavailable() -> ApiError {
        ApiError::Status {
            path: "/p".into(),
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        }
    }

    fn business(code: i64) -> ApiError {
        ApiError::Business {
            path: "/p".into(),
            code,
            msg: "refused".into(),
        }
    }

    #[tokio::test]
    async fn stop_loss_closes_and_stops_without_further_calls() {
        let mock = MockExchange::default()
            .with_positions(vec![Ok(vec![btc_long()]), Ok(vec![])])
            .with_marks(&[89.0])
            .with_closes(vec![Ok("o-1".into())]);

        let outcome = PositionGuard::new(&mock, settings(10.0, None)).run().await.unwrap();

        assert_eq!(
            outcome,
            GuardOutcome::ClosedByGuard {
                reason: ExitReason::StopLoss,
                order_id: "o-1".into()
            }
        );
        assert_eq!(
            mock.calls(),
            vec![
                "open_positions(BTCUSDT)",
                "mark_price(BTCUSDT)",
                "place_close_order(BTCUSDT,1)",
                "open_positions(BTCUSDT)",
            ]
        );
    }

    #[tokio::test]
    async fn take_profit_closes_position() {
        let mock = MockExchange::default()
            .with_positions(vec![Ok(vec![btc_long()]), Ok(vec![])])
            .with_marks(&[101.5])
            .with_closes(vec![Ok("o-tp".into())]);

        let outcome = PositionGuard::new(&mock, settings(10.0, Some(1.0))).run().await.unwrap();

        assert_eq!(
            outcome,
            GuardOutcome::ClosedByGuard {
                reason: ExitReason::TakeProfit,
                order_id: "o-tp".into()
            }
        );
    }

    #[tokio::test]
    async fn within_thresholds_keeps_polling_without_orders() {
        let mock = MockExchange::default()
            .with_positions(vec![
                Ok(vec![btc_long()]),
                Ok(vec![btc_long()]),
                Ok(vec![btc_long()]),
                Ok(vec![]),
            ])
            .with_marks(&[95.0, 103.0, 99.0]);

        let outcome = PositionGuard::new(&mock, settings(10.0, Some(5.0))).run().await.unwrap();

        assert_eq!(outcome, GuardOutcome::ClosedExternally);
        assert_eq!(mock.count("open_positions"), 4);
        assert_eq!(mock.count("place_close_order"), 0);
    }

    #[tokio::test]
    async fn without_take_profit_only_stop_loss_can_close() {
        let mock = MockExchange::default()
            .with_positions(vec![Ok(vec![btc_long()]), Ok(vec![btc_long()]), Ok(vec![])])
            .with_marks(&[150.0, 85.0])
            .with_closes(vec![Ok("o-sl".into())]);

        let outcome = PositionGuard::new(&mock, settings(10.0, None)).run().await.unwrap();

        assert_eq!(
            outcome,
            GuardOutcome::ClosedByGuard {
                reason: ExitReason::StopLoss,
                order_id: "o-sl".into()
            }
        );
        assert_eq!(mock.count("place_close_order"), 1);
    }

    #[tokio::test]
    async fn waits_for_a_position_to_appear() {
        let mock = MockExchange::default()
            .with_positions(vec![Ok(vec![]), Ok(vec![]), Ok(vec![btc_long()]), Ok(vec![])])
            .with_marks(&[100.0]);

        let outcome = PositionGuard::new(&mock, settings(10.0, None)).run().await.unwrap();

        assert_eq!(outcome, GuardOutcome::ClosedExternally);
        assert_eq!(mock.count("mark_price"), 1);
    }

    #[tokio::test]
    async fn rejected_close_is_retried_next_cycle() {
        let mock = MockExchange::default()
            .with_positions(vec![Ok(vec![btc_long()]), Ok(vec![btc_long()]), Ok(vec![])])
            .with_marks(&[80.0, 80.0])
            .with_closes(vec![Err(business(20003)), Ok("o-2".into())]);

        let outcome = PositionGuard::new(&mock, settings(10.0, None)).run().await.unwrap();

        assert_eq!(
            outcome,
            GuardOutcome::ClosedByGuard {
                reason: ExitReason::StopLoss,
                order_id: "o-2".into()
            }
        );
        assert_eq!(mock.count("place_close_order"), 2);
    }

    #[tokio::test]
    async fn close_attempts_are_bounded() {
        let mut s = settings(10.0, None);
        s.max_close_attempts = 2;
        let mock = MockExchange::default()
            .with_positions(vec![Ok(vec![btc_long()]), Ok(vec![btc_long()])])
            .with_marks(&[80.0, 80.0])
            .with_closes(vec![Err(business(20003)), Err(business(20003))]);

        let err = PositionGuard::new(&mock, s).run().await.unwrap_err();

        assert!(matches!(
            err,
            GuardError::CloseAttemptsExhausted { attempts: 2, source: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn accepted_closes_that_never_fill_are_bounded() {
        let mut s = settings(10.0, None);
        s.max_close_attempts = 2;
        let mock = MockExchange::default()
            .with_positions(vec![
                Ok(vec![btc_long()]),
                Ok(vec![btc_long()]),
                Ok(vec![btc_long()]),
            ])
            .with_marks(&[80.0, 80.0, 80.0])
            .with_closes(vec![Ok("o-1".into()), Ok("o-2".into())]);

        let err = PositionGuard::new(&mock, s).run().await.unwrap_err();

        assert!(matches!(
            err,
            GuardError::CloseAttemptsExhausted { attempts: 2, source: None, .. }
        ));
        assert_eq!(mock.count("place_close_order"), 2);
    }

    #[tokio::test]
    async fn rate_limited_close_backs_off_without_resetting_failures() {
        let mut s = settings(10.0, None);
        s.max_retries = 2;
        let rate_limited = ApiError::Status {
            path: "/p".into(),
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        let mock = MockExchange::default()
            .with_positions(vec![Err(unavailable()), Ok(vec![btc_long()]), Err(unavailable())])
            .with_marks(&[80.0])
            .with_closes(vec![Err(rate_limited)]);

        let err = PositionGuard::new(&mock, s).run().await.unwrap_err();

        assert!(matches!(err, GuardError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(mock.count("place_close_order"), 1);
    }

    #[tokio::test]
    async fn replaced_position_ends_guard() {
        let mut replacement = btc_long();
        replacement.position_id = "BTCUSDT-2".into();
        let mock = MockExchange::default()
            .with_positions(vec![Ok(vec![btc_long()]), Ok(vec![replacement])])
            .with_marks(&[95.0]);

        let outcome = PositionGuard::new(&mock, settings(10.0, None)).run().await.unwrap();

        assert_eq!(outcome, GuardOutcome::ClosedExternally);
        assert_eq!(
            mock.calls(),
            vec![
                "open_positions(BTCUSDT)",
                "mark_price(BTCUSDT)",
                "open_positions(BTCUSDT)",
            ]
        );
    }

    #[tokio::test]
    async fn unfilled_close_is_resubmitted_one_at_a_time() {
        let mock = MockExchange::default()
            .with_positions(vec![Ok(vec![btc_long()]), Ok(vec![btc_long()]), Ok(vec![])])
            .with_marks(&[70.0, 70.0])
            .with_closes(vec![Ok("o-1".into()), Ok("o-2".into())]);

        let outcome = PositionGuard::new(&mock, settings(10.0, None)).run().await.unwrap();

        assert_eq!(
            outcome,
            GuardOutcome::ClosedByGuard {
                reason: ExitReason::StopLoss,
                order_id: "o-2".into()
            }
        );

        // Every close submission is preceded by a fresh position check.
        let calls = mock.calls();
        for (i, call) in calls.iter().enumerate() {
            if call.starts_with("place_close_order") {
                let last_close = calls[..i].iter().rposition(|c| c.starts_with("place_close_order"));
                let last_poll = calls[..i].iter().rposition(|c| c.starts_with("open_positions"));
                assert!(last_poll > last_close, "overlapping close orders: {calls:?}");
            }
        }
    }

    #[tokio::test]
    async fn transient_errors_back_off_and_recover() {
        let mock = MockExchange::default()
            .with_positions(vec![
                Err(unavailable()),
                Err(business(10006)),
                Ok(vec![btc_long()]),
                Err(unavailable()),
                Ok(vec![]),
            ])
            .with_marks(&[100.0]);

        let outcome = PositionGuard::new(&mock, settings(10.0, None)).run().await.unwrap();

        assert_eq!(outcome, GuardOutcome::ClosedExternally);
    }

    #[tokio::test]
    async fn transient_errors_exhaust_retry_budget() {
        let mut s = settings(10.0, None);
        s.max_retries = 2;
        let mock = MockExchange::default().with_positions(vec![
            Err(unavailable()),
            Err(unavailable()),
            Err(unavailable()),
        ]);

        let err = PositionGuard::new(&mock, s).run().await.unwrap_err();

        assert!(matches!(err, GuardError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(mock.count("open_positions"), 3);
    }

    #[tokio::test]
    async fn auth_failure_aborts_immediately() {
        let mock = MockExchange::default().with_positions(vec![Err(business(10003))]);

        let err = PositionGuard::new(&mock, settings(10.0, None)).run().await.unwrap_err();

        match err {
            GuardError::Api(e) => assert_eq!(e.kind(), ErrorKind::Auth),
            other => panic!("expected auth error, got {other:?}"),
        }
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn hedge_mode_is_rejected() {
        let mut short = btc_long();
        short.side = Side::Short;
        short.position_id = "BTCUSDT-2".into();
        let mock = MockExchange::default().with_positions(vec![Ok(vec![btc_long(), short])]);

        let err = PositionGuard::new(&mock, settings(10.0, None)).run().await.unwrap_err();

        assert!(matches!(err, GuardError::HedgeMode { count: 2, .. }));
    }

    #[tokio::test]
    async fn locks_onto_single_position_when_symbol_unset() {
        let mut s = settings(10.0, None);
        s.symbol = None;
        let eth = long("ETHUSDT", 2000.0, 0.5);
        let mock = MockExchange::default()
            .with_positions(vec![Ok(vec![]), Ok(vec![eth.clone()]), Ok(vec![])])
            .with_marks(&[1990.0]);

        let outcome = PositionGuard::new(&mock, s).run().await.unwrap();

        assert_eq!(outcome, GuardOutcome::ClosedExternally);
        assert_eq!(
            mock.calls(),
            vec![
                "open_positions(*)",
                "open_positions(*)",
                "mark_price(ETHUSDT)",
                "open_positions(ETHUSDT)",
            ]
        );
    }

    #[tokio::test]
    async fn several_symbols_without_config_is_ambiguous() {
        let mut s = settings(10.0, None);
        s.symbol = None;
        let mock = MockExchange::default().with_positions(vec![Ok(vec![
            long("ETHUSDT", 2000.0, 0.5),
            long("BTCUSDT", 100.0, 1.0),
        ])]);

        let err = PositionGuard::new(&mock, s).run().await.unwrap_err();

        match err {
            GuardError::AmbiguousPosition { symbols } => {
                assert_eq!(symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn protective_orders_placed_once_and_cleaned_up() {
        let mut s = settings(10.0, Some(5.0));
        s.exchange_side_orders = true;
        let mock = MockExchange::default()
            .with_positions(vec![Ok(vec![btc_long()]), Ok(vec![btc_long()]), Ok(vec![])])
            .with_marks(&[98.0, 97.0]);

        let outcome = PositionGuard::new(&mock, s).run().await.unwrap();

        assert_eq!(outcome, GuardOutcome::ClosedExternally);
        assert_eq!(mock.count("quote_precision"), 1);
        assert_eq!(mock.count("cancel_position_tpsl"), 1);
        assert!(mock
            .calls()
            .contains(&"place_position_tpsl(BTCUSDT,90,105)".to_string()));
        assert_eq!(mock.calls().last().map(String::as_str), Some("cancel_all_orders(BTCUSDT)"));
    }
}

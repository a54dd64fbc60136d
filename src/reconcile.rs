// =============================================================================
// Reconciler — diff broker positions against the ledger's active trades
// =============================================================================
//
// Runs inside every cycle. Each active ledger row is evaluated independently
// against the broker's position for its ticker:
//
//   broker has shares, row PENDING/SUBMITTED  -> FILLED (+ swing entry log)
//   broker has shares, row FILLED             -> refresh unrealized PnL
//   broker flat,       row FILLED             -> position closed externally:
//                                                infer close reason, compute
//                                                realized PnL and R-multiple
//   broker flat,       row SUBMITTED          -> expire stale entry orders
//                                                (DAY after 1 day, swing
//                                                brackets after ~2 days)
//
// Every ledger write is best-effort: a failure on one trade is logged and
// the pass continues with the next. Re-running over identical state writes
// nothing (the fill transition and PnL refresh are both guarded).
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::broker::BrokerGateway;
use crate::datastore::Datastore;
use crate::entry_log;
use crate::services::market::MarketDataApi;
use crate::types::{
    CloseReason, EnrichedPosition, EntryTriggerType, Trade, TradeMode, TradeSignal, TradeStatus,
};

/// Unfilled DAY orders expire after this long.
const DAY_ORDER_MAX_AGE_HOURS: i64 = 24;

/// Unfilled swing bracket orders expire after roughly two trading days.
const SWING_BRACKET_MAX_AGE_HOURS: i64 = 48;

/// Writes only happen when a recomputed value moved at least this much.
const PNL_WRITE_EPSILON: f64 = 1e-6;

/// Counts of what one reconciliation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub filled: u32,
    pub pnl_updates: u32,
    pub closed: u32,
    pub expired: u32,
    pub errors: u32,
}

impl ReconcileSummary {
    /// True when the pass wrote nothing — the idempotence check.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reconciler<'a> {
    pub datastore: &'a dyn Datastore,
    pub broker: &'a dyn BrokerGateway,
    pub market: &'a dyn MarketDataApi,
    pub now: DateTime<Utc>,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        datastore: &'a dyn Datastore,
        broker: &'a dyn BrokerGateway,
        market: &'a dyn MarketDataApi,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            datastore,
            broker,
            market,
            now,
        }
    }

    /// Reconcile `active` ledger rows against `positions`.
    pub async fn run(&self, positions: &[EnrichedPosition], active: &[Trade]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        // Zero-quantity stubs the gateway reports after a close count as
        // "no position".
        let by_ticker: HashMap<&str, &EnrichedPosition> = positions
            .iter()
            .filter(|p| p.position != 0.0)
            .map(|p| (p.symbol.as_str(), p))
            .collect();

        for trade in active {
            let result = match by_ticker.get(trade.ticker.as_str()) {
                Some(position) => self.reconcile_held(trade, position, &mut summary).await,
                None => self.reconcile_flat(trade, &mut summary).await,
            };
            if let Err(e) = result {
                warn!(
                    ticker = %trade.ticker,
                    trade_id = %trade.id,
                    error = %e,
                    "reconcile step failed — continuing with next trade"
                );
                summary.errors += 1;
            }
        }

        info!(
            filled = summary.filled,
            pnl_updates = summary.pnl_updates,
            closed = summary.closed,
            expired = summary.expired,
            errors = summary.errors,
            "reconciliation pass completed"
        );
        summary
    }

    // -------------------------------------------------------------------------
    // Broker holds shares for this ticker
    // -------------------------------------------------------------------------

    async fn reconcile_held(
        &self,
        trade: &Trade,
        position: &EnrichedPosition,
        summary: &mut ReconcileSummary,
    ) -> anyhow::Result<()> {
        match trade.status {
            TradeStatus::Pending | TradeStatus::Submitted => {
                let mut updated = trade.clone();
                updated.status = TradeStatus::Filled;
                updated.fill_price = Some(position.avg_cost);
                updated.filled_at = Some(self.now);

                if trade.mode == TradeMode::SwingTrade {
                    let metrics =
                        entry_log::compute(self.market, &trade.ticker, position.avg_cost).await;
                    updated.entry_ma20_dist_pct = metrics.ma20_dist_pct;
                    updated.entry_macd_slope = metrics.macd_slope;
                    updated.entry_volume_ratio_10d = metrics.volume_ratio_10d;
                    updated.entry_regime_alignment = metrics.regime_alignment;
                }

                self.datastore.update_trade(&updated).await?;
                info!(
                    ticker = %trade.ticker,
                    fill_price = position.avg_cost,
                    mode = %trade.mode,
                    "trade filled"
                );
                summary.filled += 1;
            }
            TradeStatus::Filled => {
                let (Some(fill_price), mkt_price) = (trade.fill_price, position.mkt_price) else {
                    return Ok(());
                };
                if mkt_price <= 0.0 || fill_price <= 0.0 {
                    return Ok(());
                }

                let direction = trade.signal.direction();
                let pnl = direction * (mkt_price - fill_price) * trade.quantity as f64;
                let pnl_percent = direction * (mkt_price - fill_price) / fill_price * 100.0;

                let unchanged = trade
                    .pnl
                    .is_some_and(|prev| (prev - pnl).abs() < PNL_WRITE_EPSILON);
                if unchanged {
                    return Ok(());
                }

                let mut updated = trade.clone();
                updated.pnl = Some(pnl);
                updated.pnl_percent = Some(pnl_percent);
                self.datastore.update_trade(&updated).await?;
                summary.pnl_updates += 1;
            }
            _ => {}
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Broker is flat for this ticker
    // -------------------------------------------------------------------------

    async fn reconcile_flat(
        &self,
        trade: &Trade,
        summary: &mut ReconcileSummary,
    ) -> anyhow::Result<()> {
        match trade.status {
            TradeStatus::Filled => self.close_externally(trade, summary).await,
            TradeStatus::Submitted => self.expire_if_stale(trade, summary).await,
            _ => Ok(()),
        }
    }

    /// The position left the book without us doing it — a bracket child hit
    /// or a manual close at the broker.
    async fn close_externally(
        &self,
        trade: &Trade,
        summary: &mut ReconcileSummary,
    ) -> anyhow::Result<()> {
        let fill_price = trade.fill_price.unwrap_or(0.0);
        // Best-effort close price; falling back to the fill produces zero
        // PnL rather than a fabricated one.
        let close_price = self
            .market
            .quote(&trade.ticker)
            .await
            .unwrap_or(fill_price);

        let direction = trade.signal.direction();
        let pnl = if fill_price > 0.0 {
            direction * (close_price - fill_price) * trade.quantity as f64
        } else {
            0.0
        };
        let pnl_percent = if fill_price > 0.0 {
            direction * (close_price - fill_price) / fill_price * 100.0
        } else {
            0.0
        };

        let reason = infer_close_reason(trade.signal, close_price, trade.stop_loss, trade.target_price, pnl);

        let mut updated = trade.clone();
        updated.status = match reason {
            CloseReason::TargetHit => TradeStatus::TargetHit,
            CloseReason::StopLoss => TradeStatus::Stopped,
            CloseReason::Manual => TradeStatus::Closed,
        };
        updated.close_price = Some(close_price);
        updated.close_reason = Some(reason);
        updated.closed_at = Some(self.now);
        updated.pnl = Some(pnl);
        updated.pnl_percent = Some(pnl_percent);
        updated.r_multiple = r_multiple(trade, close_price);

        self.datastore.update_trade(&updated).await?;
        info!(
            ticker = %trade.ticker,
            close_price,
            pnl,
            reason = ?reason,
            "position closed externally"
        );
        summary.closed += 1;
        Ok(())
    }

    /// Expire entry orders the broker never filled.
    async fn expire_if_stale(
        &self,
        trade: &Trade,
        summary: &mut ReconcileSummary,
    ) -> anyhow::Result<()> {
        let age = self.now - trade.opened_at;

        let note = match trade.mode {
            TradeMode::DayTrade if age > Duration::hours(DAY_ORDER_MAX_AGE_HOURS) => {
                "Expired: DAY order not filled within 1 day"
            }
            TradeMode::SwingTrade
                if trade.entry_trigger_type == EntryTriggerType::BracketLimit
                    && age > Duration::hours(SWING_BRACKET_MAX_AGE_HOURS) =>
            {
                // The bracket is still working at the broker; pull it before
                // closing the row.
                if let Some(order_id) = &trade.ib_order_id {
                    if let Err(e) = self.broker.cancel_order(order_id).await {
                        warn!(
                            ticker = %trade.ticker,
                            order_id = %order_id,
                            error = %e,
                            "cancel of stale bracket failed"
                        );
                    }
                }
                "Expired: bracket order not filled within 2 trading days"
            }
            _ => return Ok(()),
        };

        let mut updated = trade.clone();
        updated.status = TradeStatus::Closed;
        updated.close_reason = Some(CloseReason::Manual);
        updated.closed_at = Some(self.now);
        // Never filled: carry the order price through so the row closes
        // flat instead of with fabricated PnL.
        let basis = trade.entry_price.unwrap_or(0.0);
        updated.fill_price = trade.fill_price.or(Some(basis));
        updated.close_price = Some(basis);
        updated.pnl = Some(0.0);
        updated.pnl_percent = Some(0.0);
        updated.notes = Some(match &trade.notes {
            Some(existing) => format!("{existing} | {note}"),
            None => note.to_string(),
        });

        self.datastore.update_trade(&updated).await?;
        info!(ticker = %trade.ticker, mode = %trade.mode, note, "stale order expired");
        summary.expired += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Close-reason inference
// ---------------------------------------------------------------------------

/// Infer why a position closed. Stop/target inequalities win when both
/// levels are known and the close landed beyond one of them; otherwise the
/// PnL sign decides.
fn infer_close_reason(
    signal: TradeSignal,
    close_price: f64,
    stop_loss: Option<f64>,
    target_price: Option<f64>,
    pnl: f64,
) -> CloseReason {
    if let (Some(stop), Some(target)) = (stop_loss, target_price) {
        match signal {
            TradeSignal::Buy => {
                if close_price >= target {
                    return CloseReason::TargetHit;
                }
                if close_price <= stop {
                    return CloseReason::StopLoss;
                }
            }
            TradeSignal::Sell => {
                if close_price <= target {
                    return CloseReason::TargetHit;
                }
                if close_price >= stop {
                    return CloseReason::StopLoss;
                }
            }
        }
    }

    if pnl > 0.0 {
        CloseReason::TargetHit
    } else if pnl < 0.0 {
        CloseReason::StopLoss
    } else {
        CloseReason::Manual
    }
}

/// Realized profit in units of the initial per-share risk.
fn r_multiple(trade: &Trade, close_price: f64) -> Option<f64> {
    let entry = trade.entry_price?;
    let stop = trade.stop_loss?;
    let fill = trade.fill_price?;
    let risk = (entry - stop).abs();
    if risk <= f64::EPSILON {
        return None;
    }
    Some(trade.signal.direction() * (close_price - fill) / risk)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::datastore::memory::MemoryDatastore;
    use crate::services::market::stub::StubMarket;

    fn utc(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn position(symbol: &str, qty: f64, avg_cost: f64, mkt_price: f64) -> EnrichedPosition {
        EnrichedPosition {
            symbol: symbol.into(),
            position: qty,
            avg_cost,
            contract_id: Some(1),
            mkt_price,
            mkt_value: qty * mkt_price,
            unrealized_pnl: (mkt_price - avg_cost) * qty,
        }
    }

    fn submitted_trade(ticker: &str, mode: TradeMode) -> Trade {
        Trade {
            id: uuid::Uuid::new_v4().to_string(),
            ticker: ticker.into(),
            mode,
            signal: TradeSignal::Buy,
            strategy_source: None,
            strategy_url: None,
            strategy_video_id: None,
            strategy_video_heading: None,
            scanner_confidence: None,
            fa_confidence: None,
            fa_recommendation: None,
            entry_price: Some(100.0),
            stop_loss: Some(97.0),
            target_price: Some(106.0),
            target_price_2: None,
            risk_reward: Some("1:2".into()),
            quantity: 50,
            position_size: 5_000.0,
            ib_order_id: Some("1001".into()),
            status: TradeStatus::Submitted,
            fill_price: None,
            close_price: None,
            pnl: None,
            pnl_percent: None,
            r_multiple: None,
            opened_at: utc("2026-03-02T15:00:00Z"),
            filled_at: None,
            closed_at: None,
            close_reason: None,
            entry_trigger_type: EntryTriggerType::BracketLimit,
            notes: None,
            entry_ma20_dist_pct: None,
            entry_macd_slope: None,
            entry_volume_ratio_10d: None,
            entry_regime_alignment: None,
            analyzed_at: None,
        }
    }

    fn filled_trade(ticker: &str, fill: f64) -> Trade {
        let mut t = submitted_trade(ticker, TradeMode::SwingTrade);
        t.status = TradeStatus::Filled;
        t.fill_price = Some(fill);
        t.filled_at = Some(utc("2026-03-02T15:30:00Z"));
        t
    }

    async fn run_once(
        ds: &MemoryDatastore,
        broker: &MockBroker,
        market: &StubMarket,
        positions: &[EnrichedPosition],
        now: &str,
    ) -> ReconcileSummary {
        let active = ds.active_trades().await.unwrap();
        Reconciler::new(ds, broker, market, utc(now))
            .run(positions, &active)
            .await
    }

    #[tokio::test]
    async fn submitted_trade_fills_from_broker_position() {
        let ds = MemoryDatastore::new();
        let trade = submitted_trade("ABC", TradeMode::DayTrade);
        let id = trade.id.clone();
        ds.push_trade(trade);

        let broker = MockBroker::new();
        let market = StubMarket::new();
        let positions = vec![position("ABC", 50.0, 100.2, 101.0)];

        let summary = run_once(&ds, &broker, &market, &positions, "2026-03-02T16:00:00Z").await;
        assert_eq!(summary.filled, 1);

        let updated = ds.trade(&id).unwrap();
        assert_eq!(updated.status, TradeStatus::Filled);
        assert_eq!(updated.fill_price, Some(100.2));
        assert!(updated.filled_at.is_some());
    }

    #[tokio::test]
    async fn filled_trade_gets_pnl_refresh_idempotently() {
        let ds = MemoryDatastore::new();
        let trade = filled_trade("ABC", 100.0);
        let id = trade.id.clone();
        ds.push_trade(trade);

        let broker = MockBroker::new();
        let market = StubMarket::new();
        let positions = vec![position("ABC", 50.0, 100.0, 104.0)];

        let summary = run_once(&ds, &broker, &market, &positions, "2026-03-02T16:00:00Z").await;
        assert_eq!(summary.pnl_updates, 1);
        let updated = ds.trade(&id).unwrap();
        assert_eq!(updated.pnl, Some(200.0)); // (104-100) x 50
        assert_eq!(updated.pnl_percent, Some(4.0));

        // Identical state again: nothing to write.
        let summary = run_once(&ds, &broker, &market, &positions, "2026-03-02T16:15:00Z").await;
        assert!(summary.is_noop());
    }

    #[tokio::test]
    async fn short_trade_pnl_is_sign_flipped() {
        let ds = MemoryDatastore::new();
        let mut trade = filled_trade("ABC", 100.0);
        trade.signal = TradeSignal::Sell;
        let id = trade.id.clone();
        ds.push_trade(trade);

        let broker = MockBroker::new();
        let market = StubMarket::new();
        let positions = vec![position("ABC", -50.0, 100.0, 104.0)];

        run_once(&ds, &broker, &market, &positions, "2026-03-02T16:00:00Z").await;
        // Short against a rising market loses money.
        assert_eq!(ds.trade(&id).unwrap().pnl, Some(-200.0));
    }

    #[tokio::test]
    async fn external_close_infers_target_hit_from_levels() {
        let ds = MemoryDatastore::new();
        let trade = filled_trade("ABC", 100.0);
        let id = trade.id.clone();
        ds.push_trade(trade);

        let broker = MockBroker::new();
        let market = StubMarket::new().with_quote("ABC", 106.5);

        let summary = run_once(&ds, &broker, &market, &[], "2026-03-03T16:00:00Z").await;
        assert_eq!(summary.closed, 1);

        let updated = ds.trade(&id).unwrap();
        assert_eq!(updated.status, TradeStatus::TargetHit);
        assert_eq!(updated.close_reason, Some(CloseReason::TargetHit));
        assert!(updated.closed_at.is_some());
        // R-multiple: (106.5 - 100) / |100 - 97| = 2.1666...
        assert!((updated.r_multiple.unwrap() - 6.5 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn external_close_infers_stop_for_short() {
        let ds = MemoryDatastore::new();
        let mut trade = filled_trade("ABC", 100.0);
        trade.signal = TradeSignal::Sell;
        trade.stop_loss = Some(103.0);
        trade.target_price = Some(94.0);
        let id = trade.id.clone();
        ds.push_trade(trade);

        let broker = MockBroker::new();
        let market = StubMarket::new().with_quote("ABC", 103.5);

        run_once(&ds, &broker, &market, &[], "2026-03-03T16:00:00Z").await;
        let updated = ds.trade(&id).unwrap();
        assert_eq!(updated.status, TradeStatus::Stopped);
        // Short stopped above entry: negative R.
        assert!(updated.r_multiple.unwrap() < 0.0);
    }

    #[tokio::test]
    async fn external_close_without_quote_closes_flat() {
        let ds = MemoryDatastore::new();
        let mut trade = filled_trade("ABC", 100.0);
        trade.stop_loss = None;
        trade.target_price = None;
        let id = trade.id.clone();
        ds.push_trade(trade);

        let broker = MockBroker::new();
        let market = StubMarket::new(); // no quote available

        run_once(&ds, &broker, &market, &[], "2026-03-03T16:00:00Z").await;
        let updated = ds.trade(&id).unwrap();
        // Fallback to fill price: zero PnL, manual close.
        assert_eq!(updated.status, TradeStatus::Closed);
        assert_eq!(updated.close_reason, Some(CloseReason::Manual));
        assert_eq!(updated.pnl, Some(0.0));
    }

    #[tokio::test]
    async fn day_order_expires_after_one_day() {
        let ds = MemoryDatastore::new();
        let mut trade = submitted_trade("ABC", TradeMode::DayTrade);
        trade.opened_at = utc("2026-03-02T15:00:00Z");
        let id = trade.id.clone();
        ds.push_trade(trade);

        let broker = MockBroker::new();
        let market = StubMarket::new();

        // 23 hours old: untouched.
        let summary = run_once(&ds, &broker, &market, &[], "2026-03-03T14:00:00Z").await;
        assert!(summary.is_noop());

        // 25 hours old: expired.
        let summary = run_once(&ds, &broker, &market, &[], "2026-03-03T16:00:00Z").await;
        assert_eq!(summary.expired, 1);

        let updated = ds.trade(&id).unwrap();
        assert_eq!(updated.status, TradeStatus::Closed);
        assert_eq!(updated.close_reason, Some(CloseReason::Manual));
        assert!(updated
            .notes
            .unwrap()
            .contains("Expired: DAY order not filled within 1 day"));
        // No cancel for DAY orders — the broker already dropped them.
        assert!(broker.cancelled.lock().is_empty());
    }

    #[tokio::test]
    async fn stale_swing_bracket_cancelled_then_closed() {
        let ds = MemoryDatastore::new();
        let mut trade = submitted_trade("ABC", TradeMode::SwingTrade);
        trade.opened_at = utc("2026-03-02T15:00:00Z");
        let id = trade.id.clone();
        ds.push_trade(trade);

        let broker = MockBroker::new();
        let market = StubMarket::new();

        // 49 hours old.
        let summary = run_once(&ds, &broker, &market, &[], "2026-03-04T16:00:00Z").await;
        assert_eq!(summary.expired, 1);

        assert_eq!(broker.cancelled.lock().as_slice(), &["1001".to_string()]);
        let updated = ds.trade(&id).unwrap();
        assert_eq!(updated.status, TradeStatus::Closed);
        assert!(updated.notes.unwrap().contains("bracket order not filled"));

        // Second pass: the row is terminal, nothing happens, no second
        // cancel.
        let summary = run_once(&ds, &broker, &market, &[], "2026-03-04T17:00:00Z").await;
        assert!(summary.is_noop());
        assert_eq!(broker.cancelled.lock().len(), 1);
    }

    #[tokio::test]
    async fn swing_market_entry_never_expires_via_bracket_rule() {
        let ds = MemoryDatastore::new();
        let mut trade = submitted_trade("ABC", TradeMode::SwingTrade);
        trade.entry_trigger_type = EntryTriggerType::Market;
        trade.opened_at = utc("2026-03-02T15:00:00Z");
        ds.push_trade(trade);

        let broker = MockBroker::new();
        let market = StubMarket::new();
        let summary = run_once(&ds, &broker, &market, &[], "2026-03-05T15:00:00Z").await;
        assert!(summary.is_noop());
    }

    #[tokio::test]
    async fn full_pass_is_idempotent_over_identical_state() {
        let ds = MemoryDatastore::new();
        ds.push_trade(submitted_trade("NEW", TradeMode::DayTrade));
        ds.push_trade(filled_trade("HELD", 100.0));
        ds.push_trade(filled_trade("GONE", 100.0));

        let broker = MockBroker::new();
        let market = StubMarket::new().with_quote("GONE", 106.5);
        let positions = vec![
            position("NEW", 10.0, 99.5, 100.0),
            position("HELD", 50.0, 100.0, 102.0),
        ];

        let first = run_once(&ds, &broker, &market, &positions, "2026-03-02T16:00:00Z").await;
        assert_eq!(first.filled, 1);
        assert_eq!(first.pnl_updates, 1);
        assert_eq!(first.closed, 1);

        // Second pass only refreshes PnL on the trade that just filled.
        let second = run_once(&ds, &broker, &market, &positions, "2026-03-02T16:05:00Z").await;
        assert_eq!(
            second,
            ReconcileSummary {
                pnl_updates: 1,
                ..Default::default()
            }
        );

        // From here the state is converged: no additional writes.
        let third = run_once(&ds, &broker, &market, &positions, "2026-03-02T16:10:00Z").await;
        assert!(third.is_noop(), "third pass wrote: {third:?}");
    }
}

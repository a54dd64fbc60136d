// =============================================================================
// Risk gate — layered pre-trade checks protecting capital
// =============================================================================
//
// Portfolio-wide, once per cycle:
//   drawdown multiplier from unrealized PnL vs cost basis (critical level
//   blocks all new entries).
//
// Per trade, in order, first failure rejects:
//   1. Allocation cap   — 95 % circuit breaker, then the absolute cap.
//   2. Daily cap        — dollars deployed this ET day.
//   3. Sector cap       — only when max_sector_pct < 100; unknown industry
//                         passes.
//   4. Earnings blackout — upcoming report inside the blackout window.
//   5. Strategy deactivation (external signals only) — consecutive net-loss
//      ET days per (source, video, mode) scope, then (source, mode).
//
// External lookups fail open: no calendar, no industry, no bars => the
// corresponding gate passes.
// =============================================================================

use chrono::Duration;
use tracing::{debug, warn};

use crate::config::AutoTraderConfig;
use crate::datastore::Datastore;
use crate::services::market::MarketDataApi;
use crate::time_rules;
use crate::types::{EnrichedPosition, Trade, TradeMode};

/// How far ahead the earnings calendar is queried.
const EARNINGS_LOOKAHEAD_DAYS: i64 = 30;

/// Closed trades fetched per deactivation scope.
const DEACTIVATION_LOOKBACK_TRADES: usize = 10;

// ---------------------------------------------------------------------------
// Drawdown assessment (portfolio-wide)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawdownLevel {
    Normal,
    Caution,
    Defensive,
    Critical,
}

impl std::fmt::Display for DrawdownLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Caution => "caution",
            Self::Defensive => "defensive",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Sizing factor derived from portfolio unrealized PnL.
#[derive(Debug, Clone, Copy)]
pub struct DrawdownAssessment {
    pub level: DrawdownLevel,
    pub multiplier: f64,
    pub pnl_pct: f64,
}

impl DrawdownAssessment {
    /// Critical drawdown short-circuits every new entry.
    pub fn blocks_entries(&self) -> bool {
        self.level == DrawdownLevel::Critical
    }
}

/// Assess portfolio drawdown from the cycle's enriched positions.
pub fn assess_drawdown(positions: &[EnrichedPosition]) -> DrawdownAssessment {
    let cost_basis: f64 = positions.iter().map(|p| p.cost_basis()).sum();
    let unrealized: f64 = positions.iter().map(|p| p.unrealized_pnl).sum();

    let pnl_pct = if cost_basis > 0.0 {
        unrealized / cost_basis * 100.0
    } else {
        0.0
    };

    let (level, multiplier) = if pnl_pct <= -5.0 {
        (DrawdownLevel::Critical, 0.0)
    } else if pnl_pct <= -3.0 {
        (DrawdownLevel::Defensive, 0.5)
    } else if pnl_pct <= -1.0 {
        (DrawdownLevel::Caution, 0.75)
    } else {
        (DrawdownLevel::Normal, 1.0)
    };

    if level != DrawdownLevel::Normal {
        warn!(pnl_pct, level = %level, multiplier, "portfolio drawdown detected");
    }

    DrawdownAssessment {
        level,
        multiplier,
        pnl_pct,
    }
}

// ---------------------------------------------------------------------------
// Gate verdict
// ---------------------------------------------------------------------------

/// Outcome of the layered per-trade checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    Reject {
        /// Machine-readable slug for events (`skip_reason`).
        slug: &'static str,
        /// Human-readable reason persisted on signals/events.
        reason: String,
    },
}

impl GateVerdict {
    fn reject(slug: &'static str, reason: impl Into<String>) -> Self {
        Self::Reject {
            slug,
            reason: reason.into(),
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Everything the per-trade gates need to see about the current cycle.
pub struct TradeCheck<'a> {
    pub ticker: &'a str,
    /// Dollar size of the proposed entry.
    pub new_size: f64,
    pub positions: &'a [EnrichedPosition],
    pub active_trades: &'a [Trade],
    /// Locally recorded dollars from orders placed this cycle run, not yet
    /// visible at the broker.
    pub pending_deployed: f64,
    /// Dollars deployed so far this ET day.
    pub daily_deployed: f64,
}

// ---------------------------------------------------------------------------
// Gate runner
// ---------------------------------------------------------------------------

pub struct RiskGate<'a> {
    pub cfg: &'a AutoTraderConfig,
    pub market: &'a dyn MarketDataApi,
}

impl<'a> RiskGate<'a> {
    pub fn new(cfg: &'a AutoTraderConfig, market: &'a dyn MarketDataApi) -> Self {
        Self { cfg, market }
    }

    /// Dollars currently committed: broker truth when positions exist,
    /// otherwise the ledger's view, plus locally pending orders.
    pub fn deployed_dollars(check: &TradeCheck<'_>) -> f64 {
        let broker: f64 = check.positions.iter().map(|p| p.cost_basis()).sum();
        let base = if broker > 0.0 {
            broker
        } else {
            check
                .active_trades
                .iter()
                .map(|t| t.position_size)
                .sum::<f64>()
        };
        base + check.pending_deployed
    }

    /// Gate 1 alone: the 95 % circuit breaker and the absolute allocation
    /// cap. Dip-buy add-ons consult only this gate.
    pub fn check_allocation(cfg: &AutoTraderConfig, check: &TradeCheck<'_>) -> GateVerdict {
        let deployed = Self::deployed_dollars(check);
        let cap = cfg.max_total_allocation;

        if deployed >= 0.95 * cap {
            return GateVerdict::reject(
                "circuit_breaker",
                format!(
                    "Circuit breaker: at cap limit (${deployed:.0} of ${cap:.0} deployed)"
                ),
            );
        }
        if deployed + check.new_size > cap {
            return GateVerdict::reject(
                "allocation_cap",
                format!(
                    "Allocation cap: ${deployed:.0} deployed + ${:.0} would exceed ${cap:.0}",
                    check.new_size
                ),
            );
        }
        GateVerdict::Pass
    }

    /// Run gates 1–4. Deactivation (gate 5) is external-signal-only and
    /// runs separately via [`check_deactivation`].
    pub async fn evaluate(&self, check: &TradeCheck<'_>) -> GateVerdict {
        // --- 1. Allocation cap ------------------------------------------------
        if let verdict @ GateVerdict::Reject { .. } = Self::check_allocation(self.cfg, check) {
            return verdict;
        }

        // --- 2. Daily cap -----------------------------------------------------
        if check.daily_deployed + check.new_size > self.cfg.max_daily_deployment {
            return GateVerdict::reject(
                "daily_cap",
                format!(
                    "Daily deployment cap: ${:.0} today + ${:.0} would exceed ${:.0}",
                    check.daily_deployed, check.new_size, self.cfg.max_daily_deployment
                ),
            );
        }

        // --- 3. Sector cap ----------------------------------------------------
        if self.cfg.max_sector_pct < 100.0 {
            if let Some(verdict) = self.sector_gate(check).await {
                return verdict;
            }
        }

        // --- 4. Earnings blackout ---------------------------------------------
        if self.cfg.earnings_avoid_enabled {
            if let Some(verdict) = self.earnings_gate(check.ticker).await {
                return verdict;
            }
        }

        GateVerdict::Pass
    }

    async fn sector_gate(&self, check: &TradeCheck<'_>) -> Option<GateVerdict> {
        // Unknown industry passes.
        let industry = self.market.industry(check.ticker).await?;

        let mut sector_total = 0.0;
        for trade in check.active_trades {
            if trade.ticker == check.ticker {
                sector_total += trade.position_size;
                continue;
            }
            if let Some(label) = self.market.industry(&trade.ticker).await {
                if label == industry {
                    sector_total += trade.position_size;
                }
            }
        }

        let limit = self.cfg.portfolio_value * self.cfg.max_sector_pct / 100.0;
        if sector_total + check.new_size > limit {
            return Some(GateVerdict::reject(
                "sector_cap",
                format!(
                    "Sector cap: {industry} holds ${sector_total:.0}, adding ${:.0} would exceed ${limit:.0}",
                    check.new_size
                ),
            ));
        }
        debug!(ticker = check.ticker, industry = %industry, sector_total, "sector gate passed");
        None
    }

    async fn earnings_gate(&self, ticker: &str) -> Option<GateVerdict> {
        let today = time_rules::et_date(chrono::Utc::now());
        let to = today + Duration::days(EARNINGS_LOOKAHEAD_DAYS);

        // No calendar => fail open.
        let dates = self.market.upcoming_earnings(ticker, today, to).await?;
        let blackout = Duration::days(self.cfg.earnings_blackout_days as i64);

        for date in dates {
            if date >= today && date - today <= blackout {
                return Some(GateVerdict::reject(
                    "earnings_blackout",
                    format!("Earnings on {date} within {} day blackout", self.cfg.earnings_blackout_days),
                ));
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Strategy auto-deactivation (external signals only)
// ---------------------------------------------------------------------------

/// Count consecutive net-loss ET days walking backwards from the most
/// recently closed trade. Trades are expected newest-first by `closed_at`.
pub fn consecutive_loss_days(trades: &[Trade]) -> u32 {
    let mut days = 0u32;
    let mut current_day = None;
    let mut day_pnl = 0.0;

    for trade in trades {
        let Some(closed_at) = trade.closed_at else {
            continue;
        };
        let day = time_rules::et_date(closed_at);

        match current_day {
            None => {
                current_day = Some(day);
                day_pnl = trade.pnl.unwrap_or(0.0);
            }
            Some(d) if d == day => {
                day_pnl += trade.pnl.unwrap_or(0.0);
            }
            Some(_) => {
                if day_pnl < 0.0 {
                    days += 1;
                } else {
                    return days;
                }
                current_day = Some(day);
                day_pnl = trade.pnl.unwrap_or(0.0);
            }
        }
    }

    // The oldest bucket never saw a day change; settle it here.
    if current_day.is_some() && day_pnl < 0.0 {
        days += 1;
    }
    days
}

/// Scope that tripped deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivationScope {
    Video,
    Source,
}

/// Check the auto-deactivation gate for one external signal. Returns the
/// tripped scope and loss-day count, or `None` when trading may proceed.
pub async fn check_deactivation(
    datastore: &dyn Datastore,
    cfg: &AutoTraderConfig,
    source_name: &str,
    strategy_video_id: Option<&str>,
    mode: TradeMode,
    exempt: bool,
) -> anyhow::Result<Option<(DeactivationScope, u32)>> {
    if exempt {
        return Ok(None);
    }
    let threshold = cfg.deactivation_loss_days;
    if threshold == 0 {
        return Ok(None);
    }

    // Narrow scope first: this video's trades only.
    if let Some(video_id) = strategy_video_id {
        let trades = datastore
            .recent_closed_trades(source_name, Some(video_id), mode, DEACTIVATION_LOOKBACK_TRADES)
            .await?;
        let days = consecutive_loss_days(&trades);
        if days >= threshold {
            return Ok(Some((DeactivationScope::Video, days)));
        }
    }

    // Wider scope: everything from the source in this mode.
    let trades = datastore
        .recent_closed_trades(source_name, None, mode, DEACTIVATION_LOOKBACK_TRADES)
        .await?;
    let days = consecutive_loss_days(&trades);
    if days >= threshold {
        return Ok(Some((DeactivationScope::Source, days)));
    }

    Ok(None)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::datastore::memory::MemoryDatastore;
    use crate::services::market::stub::StubMarket;
    use crate::types::{EntryTriggerType, TradeSignal, TradeStatus};

    fn position(symbol: &str, qty: f64, avg_cost: f64, unrealized: f64) -> EnrichedPosition {
        EnrichedPosition {
            symbol: symbol.into(),
            position: qty,
            avg_cost,
            contract_id: None,
            mkt_price: avg_cost,
            mkt_value: qty * avg_cost,
            unrealized_pnl: unrealized,
        }
    }

    fn trade(ticker: &str, size: f64) -> Trade {
        Trade {
            id: uuid::Uuid::new_v4().to_string(),
            ticker: ticker.into(),
            mode: TradeMode::DayTrade,
            signal: TradeSignal::Buy,
            strategy_source: None,
            strategy_url: None,
            strategy_video_id: None,
            strategy_video_heading: None,
            scanner_confidence: None,
            fa_confidence: None,
            fa_recommendation: None,
            entry_price: None,
            stop_loss: None,
            target_price: None,
            target_price_2: None,
            risk_reward: None,
            quantity: 1,
            position_size: size,
            ib_order_id: None,
            status: TradeStatus::Filled,
            fill_price: Some(size),
            close_price: None,
            pnl: None,
            pnl_percent: None,
            r_multiple: None,
            opened_at: Utc::now(),
            filled_at: Some(Utc::now()),
            closed_at: None,
            close_reason: None,
            entry_trigger_type: EntryTriggerType::Market,
            notes: None,
            entry_ma20_dist_pct: None,
            entry_macd_slope: None,
            entry_volume_ratio_10d: None,
            entry_regime_alignment: None,
            analyzed_at: None,
        }
    }

    fn closed_trade(source: &str, mode: TradeMode, pnl: f64, closed_at: &str) -> Trade {
        let mut t = trade("XYZ", 1_000.0);
        t.mode = mode;
        t.strategy_source = Some(source.into());
        t.status = TradeStatus::Closed;
        t.pnl = Some(pnl);
        t.closed_at = Some(
            DateTime::parse_from_rfc3339(closed_at)
                .unwrap()
                .with_timezone(&Utc),
        );
        t
    }

    fn cfg() -> AutoTraderConfig {
        let mut cfg = AutoTraderConfig::default();
        cfg.max_total_allocation = 500_000.0;
        cfg.max_daily_deployment = 50_000.0;
        cfg.portfolio_value = 1_000_000.0;
        cfg
    }

    // --- Drawdown ----------------------------------------------------------

    #[test]
    fn drawdown_levels() {
        let mk = |unrealized: f64| vec![position("A", 100.0, 100.0, unrealized)];

        let a = assess_drawdown(&mk(0.0));
        assert_eq!(a.level, DrawdownLevel::Normal);
        assert_eq!(a.multiplier, 1.0);

        let a = assess_drawdown(&mk(-150.0)); // -1.5%
        assert_eq!(a.level, DrawdownLevel::Caution);
        assert_eq!(a.multiplier, 0.75);

        let a = assess_drawdown(&mk(-350.0)); // -3.5%
        assert_eq!(a.level, DrawdownLevel::Defensive);
        assert_eq!(a.multiplier, 0.5);

        let a = assess_drawdown(&mk(-600.0)); // -6%
        assert_eq!(a.level, DrawdownLevel::Critical);
        assert_eq!(a.multiplier, 0.0);
        assert!(a.blocks_entries());
    }

    #[test]
    fn drawdown_empty_portfolio_is_normal() {
        let a = assess_drawdown(&[]);
        assert_eq!(a.level, DrawdownLevel::Normal);
    }

    // --- Allocation & daily caps -------------------------------------------

    #[tokio::test]
    async fn circuit_breaker_at_95_pct() {
        let cfg = cfg();
        let market = StubMarket::new();
        let gate = RiskGate::new(&cfg, &market);

        let positions = vec![position("AAA", 4_750.0, 100.0, 0.0)]; // 475k at cost
        let check = TradeCheck {
            ticker: "NEW",
            new_size: 50_000.0,
            positions: &positions,
            active_trades: &[],
            pending_deployed: 0.0,
            daily_deployed: 0.0,
        };
        match gate.evaluate(&check).await {
            GateVerdict::Reject { slug, reason } => {
                assert_eq!(slug, "circuit_breaker");
                assert!(reason.contains("Circuit breaker: at cap limit"));
            }
            GateVerdict::Pass => panic!("expected circuit breaker"),
        }
    }

    #[tokio::test]
    async fn allocation_cap_counts_pending() {
        let cfg = cfg();
        let market = StubMarket::new();
        let gate = RiskGate::new(&cfg, &market);

        let check = TradeCheck {
            ticker: "NEW",
            new_size: 30_000.0,
            positions: &[],
            active_trades: &[],
            pending_deployed: 440_000.0,
            daily_deployed: 0.0,
        };
        // 440k pending + 30k = 470k < 475k breaker and < 500k cap but the
        // breaker trips first at 95% of cap? 440k < 475k, total fits: pass.
        assert!(gate.evaluate(&check).await.passed());

        let check = TradeCheck {
            new_size: 80_000.0,
            ..check
        };
        match gate.evaluate(&check).await {
            GateVerdict::Reject { slug, .. } => assert_eq!(slug, "allocation_cap"),
            GateVerdict::Pass => panic!("expected allocation rejection"),
        }
    }

    #[tokio::test]
    async fn ledger_fallback_when_no_broker_positions() {
        let cfg = cfg();
        let market = StubMarket::new();
        let gate = RiskGate::new(&cfg, &market);

        let active = vec![trade("AAA", 480_000.0)];
        let check = TradeCheck {
            ticker: "NEW",
            new_size: 10_000.0,
            positions: &[],
            active_trades: &active,
            pending_deployed: 0.0,
            daily_deployed: 0.0,
        };
        match gate.evaluate(&check).await {
            GateVerdict::Reject { slug, .. } => assert_eq!(slug, "circuit_breaker"),
            GateVerdict::Pass => panic!("ledger deployment should trip breaker"),
        }
    }

    #[tokio::test]
    async fn daily_cap_rejects() {
        let cfg = cfg();
        let market = StubMarket::new();
        let gate = RiskGate::new(&cfg, &market);

        let check = TradeCheck {
            ticker: "NEW",
            new_size: 20_000.0,
            positions: &[],
            active_trades: &[],
            pending_deployed: 0.0,
            daily_deployed: 35_000.0,
        };
        match gate.evaluate(&check).await {
            GateVerdict::Reject { slug, .. } => assert_eq!(slug, "daily_cap"),
            GateVerdict::Pass => panic!("expected daily cap rejection"),
        }
    }

    // --- Sector cap --------------------------------------------------------

    #[tokio::test]
    async fn sector_cap_blocks_concentration() {
        let mut cfg = cfg();
        cfg.max_sector_pct = 10.0; // $100k limit of 1M portfolio
        let market = StubMarket::new()
            .with_industry("NEW", "Semiconductors")
            .with_industry("CHIP", "Semiconductors")
            .with_industry("BANK", "Banks");
        let gate = RiskGate::new(&cfg, &market);

        let active = vec![trade("CHIP", 90_000.0), trade("BANK", 200_000.0)];
        let check = TradeCheck {
            ticker: "NEW",
            new_size: 20_000.0,
            positions: &[],
            active_trades: &active,
            pending_deployed: 0.0,
            daily_deployed: 0.0,
        };
        match gate.evaluate(&check).await {
            GateVerdict::Reject { slug, .. } => assert_eq!(slug, "sector_cap"),
            GateVerdict::Pass => panic!("expected sector rejection"),
        }
    }

    #[tokio::test]
    async fn unknown_industry_passes_sector_gate() {
        let mut cfg = cfg();
        cfg.max_sector_pct = 10.0;
        let market = StubMarket::new(); // no industries known
        let gate = RiskGate::new(&cfg, &market);

        let check = TradeCheck {
            ticker: "NEW",
            new_size: 20_000.0,
            positions: &[],
            active_trades: &[],
            pending_deployed: 0.0,
            daily_deployed: 0.0,
        };
        assert!(gate.evaluate(&check).await.passed());
    }

    // --- Earnings blackout --------------------------------------------------

    #[tokio::test]
    async fn earnings_inside_blackout_rejects() {
        let mut cfg = cfg();
        cfg.earnings_avoid_enabled = true;
        cfg.earnings_blackout_days = 5;

        let today = time_rules::et_date(Utc::now());
        let market =
            StubMarket::new().with_earnings("NEW", vec![today + Duration::days(2)]);
        let gate = RiskGate::new(&cfg, &market);

        let check = TradeCheck {
            ticker: "NEW",
            new_size: 1_000.0,
            positions: &[],
            active_trades: &[],
            pending_deployed: 0.0,
            daily_deployed: 0.0,
        };
        match gate.evaluate(&check).await {
            GateVerdict::Reject { slug, .. } => assert_eq!(slug, "earnings_blackout"),
            GateVerdict::Pass => panic!("expected earnings rejection"),
        }
    }

    #[tokio::test]
    async fn earnings_beyond_blackout_passes() {
        let mut cfg = cfg();
        cfg.earnings_avoid_enabled = true;
        cfg.earnings_blackout_days = 3;

        let today = time_rules::et_date(Utc::now());
        let market =
            StubMarket::new().with_earnings("NEW", vec![today + Duration::days(20)]);
        let gate = RiskGate::new(&cfg, &market);

        let check = TradeCheck {
            ticker: "NEW",
            new_size: 1_000.0,
            positions: &[],
            active_trades: &[],
            pending_deployed: 0.0,
            daily_deployed: 0.0,
        };
        assert!(gate.evaluate(&check).await.passed());
    }

    // --- Consecutive loss days ----------------------------------------------

    #[test]
    fn loss_days_counted_day_by_day() {
        // Three loss days, newest first; the walk stops at the winning day.
        let trades = vec![
            closed_trade("S", TradeMode::DayTrade, -50.0, "2026-03-05T20:00:00Z"),
            closed_trade("S", TradeMode::DayTrade, -30.0, "2026-03-04T20:00:00Z"),
            closed_trade("S", TradeMode::DayTrade, 10.0, "2026-03-04T19:00:00Z"),
            closed_trade("S", TradeMode::DayTrade, -60.0, "2026-03-04T18:00:00Z"),
            closed_trade("S", TradeMode::DayTrade, -10.0, "2026-03-03T20:00:00Z"),
            closed_trade("S", TradeMode::DayTrade, 500.0, "2026-03-02T20:00:00Z"),
            closed_trade("S", TradeMode::DayTrade, -999.0, "2026-03-01T20:00:00Z"),
        ];
        // 03-05: -50 (loss). 03-04: -30+10-60 = -80 (loss). 03-03: -10
        // (loss). 03-02: +500 stops the streak.
        assert_eq!(consecutive_loss_days(&trades), 3);
    }

    #[test]
    fn winning_most_recent_day_means_zero() {
        let trades = vec![
            closed_trade("S", TradeMode::DayTrade, 80.0, "2026-03-05T20:00:00Z"),
            closed_trade("S", TradeMode::DayTrade, -30.0, "2026-03-04T20:00:00Z"),
        ];
        assert_eq!(consecutive_loss_days(&trades), 0);
    }

    #[test]
    fn single_loss_day_counts_one() {
        let trades = vec![closed_trade(
            "S",
            TradeMode::DayTrade,
            -30.0,
            "2026-03-05T20:00:00Z",
        )];
        assert_eq!(consecutive_loss_days(&trades), 1);
        assert_eq!(consecutive_loss_days(&[]), 0);
    }

    #[tokio::test]
    async fn deactivation_trips_source_scope() {
        let cfg = cfg();
        let ds = MemoryDatastore::new();
        for (pnl, at) in [
            (-50.0, "2026-03-05T20:00:00Z"),
            (-30.0, "2026-03-04T20:00:00Z"),
            (-10.0, "2026-03-03T20:00:00Z"),
        ] {
            ds.push_trade(closed_trade("Chart Sensei", TradeMode::DayTrade, pnl, at));
        }

        let tripped = check_deactivation(&ds, &cfg, "Chart Sensei", None, TradeMode::DayTrade, false)
            .await
            .unwrap();
        assert_eq!(tripped, Some((DeactivationScope::Source, 3)));

        // Exempt sources bypass the gate entirely.
        let exempt = check_deactivation(&ds, &cfg, "Chart Sensei", None, TradeMode::DayTrade, true)
            .await
            .unwrap();
        assert_eq!(exempt, None);

        // A different mode is a different scope.
        let other = check_deactivation(&ds, &cfg, "Chart Sensei", None, TradeMode::SwingTrade, false)
            .await
            .unwrap();
        assert_eq!(other, None);
    }

    #[tokio::test]
    async fn deactivation_video_scope_checked_first() {
        let cfg = cfg();
        let ds = MemoryDatastore::new();
        for (pnl, at) in [
            (-50.0, "2026-03-05T20:00:00Z"),
            (-30.0, "2026-03-04T20:00:00Z"),
            (-10.0, "2026-03-03T20:00:00Z"),
        ] {
            let mut t = closed_trade("Chart Sensei", TradeMode::DayTrade, pnl, at);
            t.strategy_video_id = Some("vid-1".into());
            ds.push_trade(t);
        }
        // Plenty of winners from other videos keep the source scope healthy.
        let mut winner = closed_trade("Chart Sensei", TradeMode::DayTrade, 900.0, "2026-03-06T20:00:00Z");
        winner.strategy_video_id = Some("vid-2".into());
        ds.push_trade(winner);

        let tripped = check_deactivation(
            &ds,
            &cfg,
            "Chart Sensei",
            Some("vid-1"),
            TradeMode::DayTrade,
            false,
        )
        .await
        .unwrap();
        assert_eq!(tripped, Some((DeactivationScope::Video, 3)));
    }
}

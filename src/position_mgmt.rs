// =============================================================================
// Position manager — dip-buy, profit-take, and loss-cut tiers
// =============================================================================
//
// Three independent, idempotent subloops over active ledger trades joined
// against broker positions by ticker:
//
//   dip-buy     (long-term)          add to the initial entry as it falls;
//                                    cooldown + allocation cap + per-tier
//                                    size, Gold Mine rows handled cautiously
//   profit-take (long-term)          trim winners tier by tier, never below
//                                    the minimum hold
//   loss-cut    (long-term + swing)  scale out of losers after a minimum
//                                    hold, full exit at 100 %
//
// Tier idempotence comes from the event log: each executed tier writes an
// event carrying `metadata.tier`, and later cycles skip tiers already seen.
// =============================================================================

use std::collections::HashMap;

use chrono::Duration;
use tracing::{debug, info};

use crate::candidates::{Decision, SourceContext};
use crate::config::Tier;
use crate::execution::{EntryOrder, ExecutionOutcome};
use crate::risk::{GateVerdict, RiskGate, TradeCheck};
use crate::types::{
    EnrichedPosition, EntryTriggerType, EventAction, EventSource, Trade, TradeMode, TradeSignal,
};

/// Events fetched per ticker when looking for prior tier executions.
const TIER_EVENT_LOOKBACK: usize = 20;

/// Run all three subloops. Returns per-ticker outcomes for the cycle log.
pub async fn run(ctx: &SourceContext<'_>) -> Vec<(String, Decision)> {
    let mut outcomes = Vec::new();
    let active = ctx.active_trades().await;

    if ctx.cfg.dip_buy_enabled {
        outcomes.extend(run_dip_buys(ctx, &active).await);
    }
    if ctx.cfg.profit_take_enabled {
        outcomes.extend(run_profit_takes(ctx, &active).await);
    }
    if ctx.cfg.loss_cut_enabled {
        outcomes.extend(run_loss_cuts(ctx, &active).await);
    }
    outcomes
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn positions_by_ticker<'p>(
    positions: &'p [EnrichedPosition],
) -> HashMap<&'p str, &'p EnrichedPosition> {
    positions
        .iter()
        .filter(|p| p.position != 0.0 && p.mkt_price > 0.0)
        .map(|p| (p.symbol.as_str(), p))
        .collect()
}

/// Pick the deepest tier whose threshold `magnitude` has crossed.
/// Tiers are ordered shallowest-first; `max_tier` caps how deep to look.
fn highest_triggered(tiers: &[Tier; 3], magnitude: f64, max_tier: u8) -> Option<Tier> {
    tiers
        .iter()
        .filter(|t| t.index <= max_tier)
        .filter(|t| magnitude >= t.trigger_pct)
        .last()
        .copied()
}

/// Whether an executed event for `tier` already exists for this source.
async fn tier_already_executed(
    ctx: &SourceContext<'_>,
    ticker: &str,
    source: EventSource,
    tier: u8,
) -> bool {
    match ctx
        .datastore
        .recent_events(ticker, source, TIER_EVENT_LOOKBACK)
        .await
    {
        Ok(events) => events.iter().any(|e| {
            e.action == EventAction::Executed
                && e.metadata.get("tier").and_then(|t| t.as_u64()) == Some(tier as u64)
        }),
        Err(e) => {
            // Assume executed: double-trimming is worse than waiting a
            // cycle for the event log to come back.
            tracing::warn!(ticker, error = %e, "tier event lookup failed");
            true
        }
    }
}

/// Sum of entry-side quantities for a ticker (initial entry plus add-ons).
fn original_quantity(active: &[Trade], ticker: &str, entry_side: TradeSignal) -> i64 {
    active
        .iter()
        .filter(|t| t.ticker == ticker && t.signal == entry_side)
        .map(|t| t.quantity)
        .sum()
}

// ---------------------------------------------------------------------------
// Dip-buy
// ---------------------------------------------------------------------------

async fn run_dip_buys(ctx: &SourceContext<'_>, active: &[Trade]) -> Vec<(String, Decision)> {
    let mut outcomes = Vec::new();

    if ctx.drawdown.blocks_entries() {
        info!("dip-buys suppressed: critical drawdown");
        return outcomes;
    }

    let by_ticker = positions_by_ticker(ctx.positions);

    // Only the initial long-term entry per ticker qualifies.
    let initial_entries: Vec<&Trade> = active
        .iter()
        .filter(|t| t.mode == TradeMode::LongTerm && !t.is_dip_buy_row())
        .filter(|t| t.signal == TradeSignal::Buy)
        .collect();

    for trade in initial_entries {
        let Some(position) = by_ticker.get(trade.ticker.as_str()) else {
            continue;
        };
        let dip_pct = (position.mkt_price - position.avg_cost) / position.avg_cost * 100.0;
        if dip_pct >= 0.0 {
            continue;
        }

        let gold_mine = trade
            .notes
            .as_deref()
            .map(|n| n.contains("(Gold Mine)"))
            .unwrap_or(false);
        let max_tier = if gold_mine { 2 } else { 3 };
        let Some(mut tier) = highest_triggered(&ctx.cfg.dip_tiers(), -dip_pct, max_tier) else {
            continue;
        };
        if gold_mine && tier.index == 2 {
            tier.size_pct /= 2.0;
        }

        let decision = dip_buy_one(ctx, active, trade, position, tier, dip_pct).await;
        outcomes.push((trade.ticker.clone(), decision));
    }
    outcomes
}

async fn dip_buy_one(
    ctx: &SourceContext<'_>,
    active: &[Trade],
    trade: &Trade,
    position: &EnrichedPosition,
    tier: Tier,
    dip_pct: f64,
) -> Decision {
    let ticker = trade.ticker.as_str();

    // Cooldown from the most recent executed dip-buy event.
    match ctx
        .datastore
        .recent_events(ticker, EventSource::DipBuy, TIER_EVENT_LOOKBACK)
        .await
    {
        Ok(events) => {
            let cooldown = Duration::hours(ctx.cfg.dip_buy_cooldown_hours as i64);
            if let Some(last) = events.iter().find(|e| e.action == EventAction::Executed) {
                if ctx.now - last.created_at < cooldown {
                    debug!(ticker, "dip-buy inside cooldown window");
                    return Decision::skip("cooldown");
                }
            }
        }
        Err(e) => {
            tracing::warn!(ticker, error = %e, "dip-buy cooldown lookup failed");
            return Decision::skip("cooldown lookup failed");
        }
    }

    // Position already at its per-name ceiling.
    let position_cap = (ctx.cfg.portfolio_value * ctx.cfg.max_position_pct / 100.0)
        .min(ctx.cfg.hard_position_cap());
    let current_value = position.position.abs() * position.mkt_price;
    if current_value >= position_cap {
        return Decision::skip("at max position size");
    }

    let add_qty = ((trade.quantity as f64 * tier.size_pct / 100.0).floor() as i64).max(1);
    let add_dollars = add_qty as f64 * position.mkt_price;

    let (pending, daily) = {
        let ledger = ctx.state.ledger.lock();
        (ledger.pending_deployed_dollar, ledger.daily_deployed_dollar)
    };
    let check = TradeCheck {
        ticker,
        new_size: add_dollars,
        positions: ctx.positions,
        active_trades: active,
        pending_deployed: pending,
        daily_deployed: daily,
    };
    if let GateVerdict::Reject { slug, reason } = RiskGate::check_allocation(ctx.cfg, &check) {
        ctx.record_skip(ticker, TradeMode::LongTerm, EventSource::DipBuy, slug, &reason)
            .await;
        return Decision::skip(reason);
    }

    let mut order = EntryOrder::new(
        ticker,
        TradeMode::LongTerm,
        TradeSignal::Buy,
        add_qty,
        add_dollars,
        EventSource::DipBuy,
    );
    order.trigger_override = Some(EntryTriggerType::DipBuy);
    order.notes = Some(format!(
        "Dip buy tier {} at {dip_pct:.1}% below cost",
        tier.index
    ));
    order.event_metadata = serde_json::json!({
        "tier": tier.index,
        "dip_pct": dip_pct,
        "initial_trade_id": trade.id,
    });

    match ctx.executor.place_entry(order).await {
        ExecutionOutcome::Placed(_) => {
            info!(ticker, tier = tier.index, dip_pct, add_qty, "dip-buy executed");
            Decision::executed()
        }
        ExecutionOutcome::NoContract => Decision::fail("no_contract"),
        ExecutionOutcome::PlacementFailed(msg) => Decision::fail(msg),
    }
}

// ---------------------------------------------------------------------------
// Profit-take
// ---------------------------------------------------------------------------

async fn run_profit_takes(ctx: &SourceContext<'_>, active: &[Trade]) -> Vec<(String, Decision)> {
    let mut outcomes = Vec::new();
    let by_ticker = positions_by_ticker(ctx.positions);

    let mut seen: Vec<&str> = Vec::new();
    for trade in active
        .iter()
        .filter(|t| t.mode == TradeMode::LongTerm && t.signal == TradeSignal::Buy)
    {
        let ticker = trade.ticker.as_str();
        if seen.contains(&ticker) {
            continue;
        }
        seen.push(ticker);

        let Some(position) = by_ticker.get(ticker) else {
            continue;
        };
        let gain_pct = (position.mkt_price - position.avg_cost) / position.avg_cost * 100.0;
        if gain_pct <= 0.0 {
            continue;
        }
        let Some(tier) = highest_triggered(&ctx.cfg.profit_tiers(), gain_pct, 3) else {
            continue;
        };
        if tier_already_executed(ctx, ticker, EventSource::ProfitTake, tier.index).await {
            continue;
        }

        let current_qty = position.position.abs() as i64;
        let original_qty = original_quantity(active, ticker, TradeSignal::Buy);
        let min_hold =
            ((original_qty as f64 * ctx.cfg.min_hold_pct / 100.0).ceil()) as i64;
        let mut trim_qty = (current_qty as f64 * tier.size_pct / 100.0).floor() as i64;
        trim_qty = trim_qty.min((current_qty - min_hold).max(0));
        if trim_qty < 1 {
            outcomes.push((ticker.to_string(), Decision::skip("at minimum hold")));
            continue;
        }

        let mut order = EntryOrder::new(
            ticker,
            TradeMode::LongTerm,
            TradeSignal::Sell,
            trim_qty,
            trim_qty as f64 * position.mkt_price,
            EventSource::ProfitTake,
        );
        order.trigger_override = Some(EntryTriggerType::ProfitTake);
        order.notes = Some(format!(
            "Profit take tier {} at +{gain_pct:.1}%",
            tier.index
        ));
        order.event_metadata = serde_json::json!({
            "tier": tier.index,
            "gain_pct": gain_pct,
            "trim_qty": trim_qty,
        });

        let decision = match ctx.executor.place_entry(order).await {
            ExecutionOutcome::Placed(_) => {
                info!(ticker, tier = tier.index, gain_pct, trim_qty, "profit-take executed");
                Decision::executed()
            }
            ExecutionOutcome::NoContract => Decision::fail("no_contract"),
            ExecutionOutcome::PlacementFailed(msg) => Decision::fail(msg),
        };
        outcomes.push((ticker.to_string(), decision));
    }
    outcomes
}

// ---------------------------------------------------------------------------
// Loss-cut
// ---------------------------------------------------------------------------

async fn run_loss_cuts(ctx: &SourceContext<'_>, active: &[Trade]) -> Vec<(String, Decision)> {
    let mut outcomes = Vec::new();
    let by_ticker = positions_by_ticker(ctx.positions);

    let mut seen: Vec<&str> = Vec::new();
    for trade in active
        .iter()
        .filter(|t| matches!(t.mode, TradeMode::LongTerm | TradeMode::SwingTrade))
    {
        let ticker = trade.ticker.as_str();
        if seen.contains(&ticker) {
            continue;
        }
        seen.push(ticker);

        let Some(position) = by_ticker.get(ticker) else {
            continue;
        };

        let long = position.position > 0.0;
        let direction = if long { 1.0 } else { -1.0 };
        let pnl_pct =
            direction * (position.mkt_price - position.avg_cost) / position.avg_cost * 100.0;
        if pnl_pct >= 0.0 {
            continue;
        }
        let loss_pct = -pnl_pct;

        // A fresh position gets room to breathe before the cut tiers apply.
        let held_since = trade.filled_at.unwrap_or(trade.opened_at);
        let hold_days = (ctx.now - held_since).num_days();
        if hold_days < ctx.cfg.loss_cut_min_hold_days {
            debug!(ticker, hold_days, "loss-cut deferred by minimum hold");
            continue;
        }

        let Some(tier) = highest_triggered(&ctx.cfg.loss_tiers(), loss_pct, 3) else {
            continue;
        };
        if tier_already_executed(ctx, ticker, EventSource::LossCut, tier.index).await {
            continue;
        }

        let current_qty = position.position.abs() as i64;
        let sell_qty = if tier.size_pct >= 100.0 {
            current_qty
        } else {
            ((current_qty as f64 * tier.size_pct / 100.0).floor() as i64).max(1)
        };
        if sell_qty < 1 {
            continue;
        }

        let side = if long { TradeSignal::Sell } else { TradeSignal::Buy };
        let mut order = EntryOrder::new(
            ticker,
            trade.mode,
            side,
            sell_qty,
            sell_qty as f64 * position.mkt_price,
            EventSource::LossCut,
        );
        order.trigger_override = Some(EntryTriggerType::LossCut);
        order.notes = Some(format!(
            "Loss cut tier {} at -{loss_pct:.1}%",
            tier.index
        ));
        order.event_metadata = serde_json::json!({
            "tier": tier.index,
            "loss_pct": loss_pct,
            "sell_qty": sell_qty,
            "full_exit": tier.size_pct >= 100.0,
        });

        let decision = match ctx.executor.place_entry(order).await {
            ExecutionOutcome::Placed(_) => {
                info!(ticker, tier = tier.index, loss_pct, sell_qty, "loss-cut executed");
                Decision::executed()
            }
            ExecutionOutcome::NoContract => Decision::fail("no_contract"),
            ExecutionOutcome::PlacementFailed(msg) => Decision::fail(msg),
        };
        outcomes.push((ticker.to_string(), decision));
    }
    outcomes
}

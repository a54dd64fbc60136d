// =============================================================================
// Suggested finds — curated daily long-term candidates
// =============================================================================
//
// Once per ET morning the cached suggestion list is reduced to a small set
// of long-term entries. Compounders and gold mines are handled asymmetrically:
// gold mines are blocked outright in a weak macro regime, their conviction
// bar rises when they flood the list, and their total exposure is capped at
// 40 % of the allocation. A fresh-analysis verification runs before each
// entry but is advisory: if the verification itself is unavailable, the
// cached conviction stands.
// =============================================================================

use tracing::{debug, info};

use super::{Decision, SourceContext};
use crate::execution::{EntryOrder, ExecutionOutcome};
use crate::risk::GateVerdict;
use crate::services::market::RegimeCache;
use crate::services::signals::{DailySuggestions, Recommendation, SuggestedFind};
use crate::sizing::{self, SizeRequest};
use crate::types::{EventSource, Trade, TradeMode, TradeSignal};

/// Gold-mine exposure may not exceed this share of the total allocation.
const GOLD_MINE_ALLOCATION_SHARE: f64 = 0.40;

/// Conviction at or above this makes the top pick of each list eligible
/// regardless of valuation tag.
const TOP_PICK_CONVICTION: f64 = 8.0;

/// A fresh-analysis conviction drop of this much rejects the entry.
const VERIFICATION_DROP_LIMIT: f64 = 3.0;

/// Ledger-note marker for gold-mine rows; exposure sums key off it.
const GOLD_MINE_MARKER: &str = "(Gold Mine)";

// ---------------------------------------------------------------------------
// Selection (pure)
// ---------------------------------------------------------------------------

/// A suggestion that cleared intake selection.
#[derive(Debug, Clone)]
pub struct SelectedFind {
    pub find: SuggestedFind,
    pub gold_mine: bool,
}

fn undervalued(find: &SuggestedFind) -> bool {
    matches!(
        find.valuation_tag.as_deref().map(|t| t.to_lowercase()),
        Some(ref tag) if tag == "deep value" || tag == "undervalued"
    )
}

fn top_of(list: &[SuggestedFind]) -> Option<&SuggestedFind> {
    list.iter().max_by(|a, b| {
        a.conviction
            .partial_cmp(&b.conviction)
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// Apply the selection rules to the cached suggestion lists.
///
/// `market_above_200d`: `Some(false)` blocks every gold mine; `None`
/// (regime unavailable) fails open.
pub fn select_finds(
    suggestions: &DailySuggestions,
    min_conviction: f64,
    market_above_200d: Option<bool>,
) -> Vec<SelectedFind> {
    let mut selected: Vec<SelectedFind> = Vec::new();

    // Gold mines crowding the list raise their own bar.
    let gm_min_conviction =
        if suggestions.gold_mines.len() > 2 * suggestions.compounders.len() {
            min_conviction + 1.0
        } else {
            min_conviction
        };
    let gold_mines_blocked = market_above_200d == Some(false);

    let top_compounder = top_of(&suggestions.compounders).map(|f| f.ticker.clone());
    let top_gold_mine = top_of(&suggestions.gold_mines).map(|f| f.ticker.clone());

    for find in &suggestions.compounders {
        let is_top = top_compounder.as_deref() == Some(&find.ticker)
            && find.conviction >= TOP_PICK_CONVICTION;
        if is_top || (find.conviction >= min_conviction && undervalued(find)) {
            selected.push(SelectedFind {
                find: find.clone(),
                gold_mine: false,
            });
        }
    }

    for find in &suggestions.gold_mines {
        if gold_mines_blocked {
            debug!(ticker = %find.ticker, "gold mine blocked by macro regime");
            continue;
        }
        let is_top = top_gold_mine.as_deref() == Some(&find.ticker)
            && find.conviction >= TOP_PICK_CONVICTION;
        if is_top || (find.conviction >= gm_min_conviction && undervalued(find)) {
            selected.push(SelectedFind {
                find: find.clone(),
                gold_mine: true,
            });
        }
    }

    selected
}

/// Dollars currently committed to gold-mine rows.
pub fn gold_mine_exposure(active: &[Trade]) -> f64 {
    active
        .iter()
        .filter(|t| {
            t.notes
                .as_deref()
                .map(|n| n.contains(GOLD_MINE_MARKER))
                .unwrap_or(false)
        })
        .map(|t| t.position_size)
        .sum()
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Fetch, select, verify, and execute the day's suggested finds.
pub async fn run(ctx: &SourceContext<'_>, regime: &RegimeCache) -> Vec<(String, Decision)> {
    let mut outcomes = Vec::new();

    let Some(suggestions) = ctx.signals_api.daily_suggestions().await else {
        debug!("no cached daily suggestions available");
        return outcomes;
    };

    if ctx.drawdown.blocks_entries() {
        info!("suggested finds suppressed: critical drawdown");
        return outcomes;
    }

    let market_above_200d = regime.market_above_200d(ctx.market).await;
    let selected = select_finds(
        &suggestions,
        ctx.cfg.min_suggested_finds_conviction,
        market_above_200d,
    );
    info!(
        compounders = suggestions.compounders.len(),
        gold_mines = suggestions.gold_mines.len(),
        selected = selected.len(),
        "suggested finds selected"
    );

    for pick in selected {
        let ticker = pick.find.ticker.clone();
        let decision = execute_one(ctx, &pick).await;
        outcomes.push((ticker, decision));
    }
    outcomes
}

async fn execute_one(ctx: &SourceContext<'_>, pick: &SelectedFind) -> Decision {
    let find = &pick.find;
    let ticker = find.ticker.as_str();
    let mode = TradeMode::LongTerm;

    let active = ctx.active_trades().await;
    if active.iter().any(|t| t.ticker == ticker) {
        return Decision::skip("duplicate");
    }
    if ctx.state.ledger.lock().is_processed(ticker) {
        return Decision::skip("already processed today");
    }

    // Pre-execute conviction verification — advisory, so an unavailable
    // analysis proceeds on the cached conviction.
    if let Some(fresh) = ctx
        .signals_api
        .full_analysis(ticker, TradeMode::SwingTrade)
        .await
    {
        if fresh.recommendation == Recommendation::Sell {
            let reason = "verification: fresh analysis recommends SELL";
            ctx.record_skip(ticker, mode, EventSource::SuggestedFinds, "verification", reason)
                .await;
            return Decision::skip(reason);
        }
        if find.conviction - fresh.confidence >= VERIFICATION_DROP_LIMIT {
            let reason = format!(
                "verification: conviction dropped {:.1} -> {:.1}",
                find.conviction, fresh.confidence
            );
            ctx.record_skip(ticker, mode, EventSource::SuggestedFinds, "verification", &reason)
                .await;
            return Decision::skip(reason);
        }
    }

    let Some(price) = ctx.market.quote(ticker).await else {
        return Decision::defer("quote unavailable");
    };

    let size = sizing::compute(
        ctx.cfg,
        &SizeRequest::market(price, mode)
            .with_conviction(find.conviction, pick.gold_mine)
            .with_drawdown(ctx.drawdown.multiplier),
    );
    if size.quantity < 1 || size.dollars <= 0.0 {
        return Decision::skip("size_too_small");
    }

    // Tag-level cap on speculative exposure.
    if pick.gold_mine {
        let exposure = gold_mine_exposure(&active);
        let cap = GOLD_MINE_ALLOCATION_SHARE * ctx.cfg.max_total_allocation;
        if exposure + size.dollars > cap {
            let reason = format!(
                "gold-mine exposure ${exposure:.0} + ${:.0} would exceed ${cap:.0}",
                size.dollars
            );
            ctx.record_skip(ticker, mode, EventSource::SuggestedFinds, "gold_mine_cap", &reason)
                .await;
            return Decision::skip(reason);
        }
    }

    if let GateVerdict::Reject { slug, reason } = ctx.risk_check(ticker, size.dollars, &active).await
    {
        ctx.record_skip(ticker, mode, EventSource::SuggestedFinds, slug, &reason)
            .await;
        return Decision::skip(reason);
    }

    let tag = if pick.gold_mine {
        GOLD_MINE_MARKER
    } else {
        "(Steady Compounder)"
    };
    let mut order = EntryOrder::new(
        ticker,
        mode,
        TradeSignal::Buy,
        size.quantity,
        size.dollars,
        EventSource::SuggestedFinds,
    );
    order.notes = Some(match &find.reason {
        Some(reason) => format!("Suggested find {tag}: {reason}"),
        None => format!("Suggested find {tag}"),
    });
    order.event_metadata = serde_json::json!({
        "conviction": find.conviction,
        "valuation_tag": find.valuation_tag,
        "tag": find.tag,
    });

    match ctx.executor.place_entry(order).await {
        ExecutionOutcome::Placed(_) => Decision::executed(),
        ExecutionOutcome::NoContract => Decision::fail("no_contract"),
        ExecutionOutcome::PlacementFailed(msg) => Decision::fail(msg),
    }
}

// =============================================================================
// Scanner ideas — intake filtering, full-analysis gate, execution
// =============================================================================
//
// Scanner ideas are the residual source: they run after the generic-strategy
// queuer has claimed its tickers. An idea must clear four intake filters
// (not active, not processed today, not claimed, confident enough) and then
// the full-analysis gate before it is sized, risk-checked, and placed as a
// bracket order.
// =============================================================================

use std::collections::HashSet;

use tracing::{debug, info};

use super::{Decision, SourceContext};
use crate::execution::{EntryOrder, ExecutionOutcome};
use crate::risk::GateVerdict;
use crate::services::signals::{FullAnalysis, Recommendation, TradeIdea};
use crate::sizing::{self, SizeRequest};
use crate::types::{parse_risk_reward, EventSource, TradeMode, TradeSignal};

/// Day-trade setups must pay at least this reward per unit of risk.
const MIN_DAY_TRADE_RR: f64 = 1.8;

/// Swing limit entries are rejected when the live quote has drifted more
/// than this from the proposed entry.
const MAX_SWING_ENTRY_DRIFT_PCT: f64 = 4.0;

// ---------------------------------------------------------------------------
// Intake filtering (pure)
// ---------------------------------------------------------------------------

/// Reduce raw ideas to the executable shortlist: unclaimed, unseen today,
/// not already held, confident enough; descending confidence, truncated to
/// the remaining position budget.
pub fn filter_ideas(
    ideas: &[TradeIdea],
    active_tickers: &HashSet<String>,
    processed: &HashSet<String>,
    claimed: &HashSet<String>,
    min_confidence: f64,
    max_new: usize,
) -> Vec<TradeIdea> {
    let mut shortlist: Vec<TradeIdea> = ideas
        .iter()
        .filter(|idea| !active_tickers.contains(&idea.ticker))
        .filter(|idea| !processed.contains(&idea.ticker))
        .filter(|idea| !claimed.contains(&idea.ticker))
        .filter(|idea| idea.confidence >= min_confidence)
        .cloned()
        .collect();

    shortlist.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    shortlist.truncate(max_new);
    shortlist
}

// ---------------------------------------------------------------------------
// Full-analysis gate (pure)
// ---------------------------------------------------------------------------

/// Mode used for the analysis call; long-term candidates are analysed on
/// the swing horizon.
pub fn analysis_mode(mode: TradeMode) -> TradeMode {
    match mode {
        TradeMode::LongTerm => TradeMode::SwingTrade,
        other => other,
    }
}

/// Apply the full-analysis gate. `Ok(())` means the analysis levels may be
/// adopted; `Err` carries the rejection reason.
pub fn fa_gate(
    signal: TradeSignal,
    mode: TradeMode,
    analysis: &FullAnalysis,
    quote: Option<f64>,
    min_fa_confidence: f64,
) -> Result<(), String> {
    if analysis.confidence < min_fa_confidence {
        return Err(format!(
            "analysis confidence {:.1} below {min_fa_confidence:.1}",
            analysis.confidence
        ));
    }
    if analysis.recommendation == Recommendation::Hold {
        return Err("analysis recommends HOLD".into());
    }
    if !analysis.recommendation.matches(signal) {
        return Err(format!(
            "analysis {:?} disagrees with {signal}",
            analysis.recommendation
        ));
    }
    let (Some(entry), Some(_stop), Some(_target)) = (
        analysis.entry_price,
        analysis.stop_loss,
        analysis.target_price,
    ) else {
        return Err("analysis missing entry/stop/target".into());
    };

    if mode == TradeMode::DayTrade {
        let ratio = analysis
            .risk_reward
            .as_deref()
            .and_then(parse_risk_reward);
        match ratio {
            Some(rr) if rr >= MIN_DAY_TRADE_RR => {}
            Some(rr) => return Err(format!("risk/reward 1:{rr:.2} below 1:{MIN_DAY_TRADE_RR}")),
            None => return Err("risk/reward unparseable".into()),
        }
    }

    // Entry precision matters for swing limit fills; a drifted quote means
    // the setup is gone.
    if mode == TradeMode::SwingTrade {
        if let Some(quote) = quote {
            if entry > 0.0 {
                let drift_pct = ((quote - entry) / entry).abs() * 100.0;
                if drift_pct > MAX_SWING_ENTRY_DRIFT_PCT {
                    return Err(format!(
                        "skipped by distance: quote {quote:.2} is {drift_pct:.1}% from entry {entry:.2}"
                    ));
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Run the residual scanner step: filter, gate, size, risk-check, place.
pub async fn execute_ideas(
    ctx: &SourceContext<'_>,
    ideas: &[TradeIdea],
    claimed: &HashSet<String>,
) -> Vec<(String, Decision)> {
    let mut outcomes = Vec::new();

    if ctx.drawdown.blocks_entries() {
        info!("scanner execution suppressed: critical drawdown");
        return outcomes;
    }

    let active = ctx.active_trades().await;
    let active_tickers: HashSet<String> = active.iter().map(|t| t.ticker.clone()).collect();
    let processed = {
        let ledger = ctx.state.ledger.lock();
        ledger.processed_tickers.clone()
    };

    let budget = (ctx.cfg.max_positions as usize).saturating_sub(active_tickers.len());
    let shortlist = filter_ideas(
        ideas,
        &active_tickers,
        &processed,
        claimed,
        ctx.cfg.min_scanner_confidence,
        budget,
    );
    debug!(
        raw = ideas.len(),
        shortlisted = shortlist.len(),
        budget,
        "scanner intake filtered"
    );

    for idea in shortlist {
        let decision = execute_one(ctx, &idea).await;
        outcomes.push((idea.ticker.clone(), decision));
    }
    outcomes
}

async fn execute_one(ctx: &SourceContext<'_>, idea: &TradeIdea) -> Decision {
    let ticker = idea.ticker.as_str();

    let Some(analysis) = ctx
        .signals_api
        .full_analysis(ticker, analysis_mode(idea.mode))
        .await
    else {
        // Without levels there is no order to shape; leave the idea for a
        // later cycle when the service recovers.
        return Decision::defer("analysis unavailable");
    };

    let quote = ctx.market.quote(ticker).await;

    if let Err(reason) = fa_gate(
        idea.signal,
        idea.mode,
        &analysis,
        quote,
        ctx.cfg.min_fa_confidence,
    ) {
        ctx.record_skip(ticker, idea.mode, EventSource::Scanner, "fa_gate", &reason)
            .await;
        return Decision::skip(reason);
    }

    let price = quote
        .or(analysis.entry_price)
        .or(idea.price)
        .unwrap_or(0.0);
    let size = sizing::compute(
        ctx.cfg,
        &SizeRequest::market(price, idea.mode)
            .with_levels(analysis.entry_price, analysis.stop_loss)
            .with_drawdown(ctx.drawdown.multiplier),
    );
    if size.quantity < 1 || size.dollars <= 0.0 {
        ctx.record_skip(
            ticker,
            idea.mode,
            EventSource::Scanner,
            "size_too_small",
            "computed size below one share",
        )
        .await;
        return Decision::skip("size_too_small");
    }

    let active = ctx.active_trades().await;
    if let GateVerdict::Reject { slug, reason } = ctx.risk_check(ticker, size.dollars, &active).await
    {
        ctx.record_skip(ticker, idea.mode, EventSource::Scanner, slug, &reason)
            .await;
        return Decision::skip(reason);
    }

    let mut order = EntryOrder::new(
        ticker,
        idea.mode,
        idea.signal,
        size.quantity,
        size.dollars,
        EventSource::Scanner,
    );
    order.entry_price = analysis.entry_price;
    order.stop_loss = analysis.stop_loss;
    order.target_price = analysis.target_price;
    order.target_price_2 = analysis.target_price_2;
    order.risk_reward = analysis.risk_reward.clone();
    order.scanner_confidence = Some(idea.confidence);
    order.fa_confidence = Some(analysis.confidence);
    order.fa_recommendation = Some(format!("{:?}", analysis.recommendation).to_uppercase());
    order.notes = idea.reason.clone();

    match ctx.executor.place_entry(order).await {
        ExecutionOutcome::Placed(_) => Decision::executed(),
        ExecutionOutcome::NoContract => Decision::fail("no_contract"),
        ExecutionOutcome::PlacementFailed(msg) => Decision::fail(msg),
    }
}

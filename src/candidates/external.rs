// =============================================================================
// External strategy signals — time gates, splits, layered execution
// =============================================================================
//
// Due signals (PENDING, execute-on date reached) run a fixed gauntlet:
//
//   time gates -> deactivation -> duplicate check -> full-analysis adoption
//   -> price trigger -> sizing (with allocation split) -> risk gates
//   -> placement -> terminal transition
//
// Generic signals that came due together for the same (ticker, mode, side,
// date) split one normally-sized position N ways; their duplicate check is
// lenient so the split legs can coexist. Every terminal transition goes
// through the datastore's PENDING-guarded update, so re-processing an
// already-settled signal is a no-op by construction.
// =============================================================================

use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::scanner::{analysis_mode, fa_gate};
use super::{Decision, SourceContext};
use crate::datastore::SignalTransition;
use crate::execution::{EntryOrder, ExecutionOutcome};
use crate::risk::{self, GateVerdict};
use crate::services::signals::FullAnalysis;
use crate::sizing::{self, SizeRequest};
use crate::time_rules::{self, WindowPosition};
use crate::types::{
    EventSource, ExternalStrategySignal, SignalStatus, StrategyType, StrategyVideo, Trade,
    TradeMode, TradeSignal,
};

/// Allocation-split membership for one signal in a due batch.
#[derive(Debug, Clone, Copy)]
struct SplitShare {
    index: usize,
    of: usize,
}

/// Process every due external signal. `videos` maps video id to catalogue
/// entry for window/exemption lookups.
pub async fn process(
    ctx: &SourceContext<'_>,
    videos: &HashMap<String, StrategyVideo>,
) -> Vec<(String, Decision)> {
    let mut outcomes = Vec::new();

    let due = match ctx.datastore.due_signals(ctx.today()).await {
        Ok(due) => due,
        Err(e) => {
            warn!(error = %e, "due signal fetch failed");
            return outcomes;
        }
    };
    if due.is_empty() {
        return outcomes;
    }
    info!(count = due.len(), "external signals due");

    let splits = split_plan(&due, videos);

    for signal in &due {
        let video = signal
            .strategy_video_id
            .as_deref()
            .and_then(|id| videos.get(id));
        let split = splits.get(signal.id.as_str()).copied();
        let decision = process_one(ctx, signal, video, split).await;
        debug!(ticker = %signal.ticker, outcome = %decision.label(), "external signal processed");
        outcomes.push((signal.ticker.clone(), decision));
    }
    outcomes
}

// ---------------------------------------------------------------------------
// Allocation split planning
// ---------------------------------------------------------------------------

fn is_generic(signal: &ExternalStrategySignal, video: Option<&StrategyVideo>) -> bool {
    video.map(|v| v.strategy_type == StrategyType::GenericStrategy) == Some(true)
        || signal.is_generic_auto()
}

/// Group due generic signals by (ticker, mode, signal, date); groups larger
/// than one share a single position equally, ordered by creation time.
fn split_plan<'a>(
    due: &'a [ExternalStrategySignal],
    videos: &HashMap<String, StrategyVideo>,
) -> HashMap<&'a str, SplitShare> {
    let mut groups: HashMap<(String, TradeMode, TradeSignal, chrono::NaiveDate), Vec<&ExternalStrategySignal>> =
        HashMap::new();

    for signal in due {
        let video = signal
            .strategy_video_id
            .as_deref()
            .and_then(|id| videos.get(id));
        if !is_generic(signal, video) {
            continue;
        }
        groups
            .entry((
                signal.ticker.clone(),
                signal.mode,
                signal.signal,
                signal.execute_on_date,
            ))
            .or_default()
            .push(signal);
    }

    let mut plan = HashMap::new();
    for (_, mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let of = members.len();
        for (i, member) in members.iter().enumerate() {
            plan.insert(
                member.id.as_str(),
                SplitShare { index: i + 1, of },
            );
        }
    }
    plan
}

// ---------------------------------------------------------------------------
// Per-signal pipeline
// ---------------------------------------------------------------------------

async fn process_one(
    ctx: &SourceContext<'_>,
    signal: &ExternalStrategySignal,
    video: Option<&StrategyVideo>,
    split: Option<SplitShare>,
) -> Decision {
    let ticker = signal.ticker.as_str();

    // --- Time gates ---------------------------------------------------------
    if let Some(execute_at) = signal.execute_at {
        if execute_at > ctx.now {
            return Decision::defer("not yet due");
        }
    }
    if let Some(expires_at) = signal.expires_at {
        if expires_at < ctx.now {
            settle(ctx, signal, SignalStatus::Expired, Some("signal expired before execution"), None)
                .await;
            return Decision::skip("expired");
        }
    }
    if let Some(window) = video.and_then(|v| v.execution_window_et.as_ref()) {
        match time_rules::window_position(ctx.now, &window.start, &window.end) {
            WindowPosition::Before => return Decision::defer("before execution window"),
            WindowPosition::After => {
                settle(
                    ctx,
                    signal,
                    SignalStatus::Expired,
                    Some(&format!(
                        "execution window {}-{} ET passed",
                        window.start, window.end
                    )),
                    None,
                )
                .await;
                return Decision::skip("window passed");
            }
            WindowPosition::Within => {}
        }
    }

    if ctx.drawdown.blocks_entries() {
        // Leave PENDING; the portfolio may recover before expiry.
        return Decision::defer("critical drawdown");
    }

    // --- Strategy auto-deactivation ----------------------------------------
    let exempt = video.map(|v| v.exempt_from_auto_deactivation).unwrap_or(false);
    match risk::check_deactivation(
        ctx.datastore,
        ctx.cfg,
        &signal.source_name,
        signal.strategy_video_id.as_deref(),
        signal.mode,
        exempt,
    )
    .await
    {
        Ok(Some((scope, days))) => {
            let reason = format!(
                "Strategy marked X after {days} consecutive losses ({scope:?} scope)"
            );
            settle(ctx, signal, SignalStatus::Skipped, Some(&reason), None).await;
            ctx.record_skip(ticker, signal.mode, EventSource::ExternalSignal, "strategy_marked_x", &reason)
                .await;
            return Decision::skip(reason);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "deactivation check failed — proceeding"),
    }

    // --- Duplicate-ticker gate ---------------------------------------------
    let active = ctx.active_trades().await;
    if let Some(conflict) = duplicate_conflict(signal, video, &active) {
        settle(ctx, signal, SignalStatus::Skipped, Some(&conflict), None).await;
        ctx.record_skip(ticker, signal.mode, EventSource::ExternalSignal, "duplicate", &conflict)
            .await;
        return Decision::skip("duplicate");
    }

    // --- Full-analysis adoption --------------------------------------------
    let mut entry = signal.entry_price;
    let mut stop = signal.stop_loss;
    let mut target = signal.target_price;
    let mut adopted: Option<FullAnalysis> = None;

    let needs_analysis = entry.is_none()
        && stop.is_none()
        && target.is_none()
        && matches!(signal.mode, TradeMode::DayTrade | TradeMode::SwingTrade);
    if needs_analysis {
        let Some(analysis) = ctx
            .signals_api
            .full_analysis(ticker, analysis_mode(signal.mode))
            .await
        else {
            return Decision::defer("analysis unavailable");
        };
        let quote = ctx.market.quote(ticker).await;
        if let Err(reason) = fa_gate(
            signal.signal,
            signal.mode,
            &analysis,
            quote,
            ctx.cfg.min_fa_confidence,
        ) {
            settle(ctx, signal, SignalStatus::Skipped, Some(&reason), None).await;
            ctx.record_skip(ticker, signal.mode, EventSource::ExternalSignal, "fa_gate", &reason)
                .await;
            return Decision::skip(reason);
        }
        entry = analysis.entry_price;
        stop = analysis.stop_loss;
        target = analysis.target_price;
        adopted = Some(analysis);
    }

    // --- Price trigger gate -------------------------------------------------
    let quote = ctx.market.quote(ticker).await;
    if let Some(entry_level) = entry {
        let Some(last) = quote else {
            return Decision::defer("waiting for quote");
        };
        let triggered = match signal.signal {
            TradeSignal::Buy => last >= entry_level,
            TradeSignal::Sell => last <= entry_level,
        };
        if !triggered {
            return Decision::defer(format!(
                "waiting: quote {last:.2} has not reached trigger {entry_level:.2}"
            ));
        }
    }

    // --- Sizing (with allocation split) ------------------------------------
    let price = quote.or(entry).unwrap_or(0.0);
    if price <= 0.0 {
        return Decision::defer("no usable price");
    }

    let mut dollars = match signal.position_size_override {
        Some(override_size) => override_size.min(ctx.cfg.hard_position_cap()),
        None => {
            let mut req = SizeRequest::market(price, signal.mode)
                .with_levels(entry, stop)
                .with_drawdown(ctx.drawdown.multiplier);
            if signal.mode == TradeMode::LongTerm {
                req = req.with_conviction(signal.confidence as f64, false);
            }
            sizing::compute(ctx.cfg, &req).dollars
        }
    };

    if let Some(share) = split {
        dollars /= share.of as f64;
    }
    let quantity = (dollars / price).floor() as i64;
    if quantity < 1 {
        let slug = if split.is_some() {
            "allocation_split_too_small"
        } else {
            "size_too_small"
        };
        settle(ctx, signal, SignalStatus::Skipped, Some(slug), None).await;
        ctx.record_skip(ticker, signal.mode, EventSource::ExternalSignal, slug, slug)
            .await;
        return Decision::skip(slug);
    }
    let dollars = quantity as f64 * price;

    // --- Risk gates ---------------------------------------------------------
    if let GateVerdict::Reject { slug, reason } = ctx.risk_check(ticker, dollars, &active).await {
        settle(ctx, signal, SignalStatus::Skipped, Some(&reason), None).await;
        ctx.record_skip(ticker, signal.mode, EventSource::ExternalSignal, slug, &reason)
            .await;
        return Decision::skip(reason);
    }

    // --- Placement ----------------------------------------------------------
    let mut order = EntryOrder::new(
        ticker,
        signal.mode,
        signal.signal,
        quantity,
        dollars,
        EventSource::ExternalSignal,
    );
    order.entry_price = entry;
    order.stop_loss = stop;
    order.target_price = target;
    order.strategy_source = Some(signal.source_name.clone());
    order.strategy_url = signal.source_url.clone();
    order.strategy_video_id = signal.strategy_video_id.clone();
    order.strategy_video_heading = signal.strategy_video_heading.clone();
    if let Some(analysis) = &adopted {
        order.target_price_2 = analysis.target_price_2;
        order.risk_reward = analysis.risk_reward.clone();
        order.fa_confidence = Some(analysis.confidence);
        order.fa_recommendation = Some(format!("{:?}", analysis.recommendation).to_uppercase());
    }
    order.notes = match (signal.notes.clone(), split) {
        (Some(notes), Some(share)) => {
            Some(format!("{notes} | allocation {}/{}", share.index, share.of))
        }
        (None, Some(share)) => Some(format!("allocation {}/{}", share.index, share.of)),
        (notes, None) => notes,
    };
    order.event_metadata = serde_json::json!({
        "signal_id": signal.id,
        "confidence": signal.confidence,
        "allocation_split": split.map(|s| s.of),
    });

    match ctx.executor.place_entry(order).await {
        ExecutionOutcome::Placed(trade) => {
            settle(ctx, signal, SignalStatus::Executed, None, Some(trade.id.clone())).await;
            Decision::executed()
        }
        ExecutionOutcome::NoContract => {
            settle(ctx, signal, SignalStatus::Failed, Some("no tradable contract found"), None)
                .await;
            Decision::fail("no_contract")
        }
        ExecutionOutcome::PlacementFailed(msg) => {
            settle(ctx, signal, SignalStatus::Failed, Some(&msg), None).await;
            Decision::fail(msg)
        }
    }
}

/// Lenient duplicate check for generic signals, strict otherwise.
fn duplicate_conflict(
    signal: &ExternalStrategySignal,
    video: Option<&StrategyVideo>,
    active: &[Trade],
) -> Option<String> {
    let lenient = is_generic(signal, video);
    for trade in active.iter().filter(|t| t.ticker == signal.ticker) {
        let conflicts = if lenient {
            // Split legs coexist: same mode, same side, each tagged with
            // its own video.
            trade.mode != signal.mode
                || trade.signal != signal.signal
                || trade.strategy_video_id.is_none()
        } else {
            true
        };
        if conflicts {
            return Some(format!(
                "duplicate ticker: active {} trade already exists",
                trade.mode
            ));
        }
    }
    None
}

/// Apply a terminal transition through the PENDING-guarded update.
async fn settle(
    ctx: &SourceContext<'_>,
    signal: &ExternalStrategySignal,
    to: SignalStatus,
    failure_reason: Option<&str>,
    executed_trade_id: Option<String>,
) {
    let details = SignalTransition {
        failure_reason: failure_reason.map(String::from),
        executed_trade_id,
        executed_at: (to == SignalStatus::Executed).then_some(ctx.now),
    };
    match ctx.datastore.transition_signal(&signal.id, to, details).await {
        Ok(true) => {}
        Ok(false) => debug!(
            signal_id = %signal.id,
            "signal already terminal — transition was a no-op"
        ),
        Err(e) => warn!(signal_id = %signal.id, error = %e, "signal transition failed"),
    }
}

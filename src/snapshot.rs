// =============================================================================
// Snapshot / rehydration — daily account snapshot and post-close learnings
// =============================================================================
//
// The snapshot runs once per ET day and only when broker positions exist
// (an empty book produces nothing to study). After the 16:15 ET boundary
// the rehydration pass re-runs reconciliation upstream (the orchestrator
// owns that) and then emits exactly one structured learning record per
// newly-closed trade; the `analyzed_at` stamp on the trade is the
// exactly-once guard.
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::datastore::Datastore;
use crate::types::{EnrichedPosition, PortfolioSnapshot, SnapshotPosition, TradeLearning};

/// Closed trades analysed per rehydration pass.
const LEARNING_BATCH: usize = 50;

// ---------------------------------------------------------------------------
// Daily snapshot
// ---------------------------------------------------------------------------

/// Persist the day's snapshot. Returns `false` (and writes nothing) when
/// the broker book is empty.
pub async fn take_daily_snapshot(
    datastore: &dyn Datastore,
    positions: &[EnrichedPosition],
    account_id: &str,
    open_trade_count: usize,
    date: NaiveDate,
) -> Result<bool> {
    if positions.is_empty() {
        return Ok(false);
    }

    let snapshot = PortfolioSnapshot {
        account_id: account_id.to_string(),
        date,
        total_value: positions.iter().map(|p| p.mkt_value).sum(),
        total_pnl: positions.iter().map(|p| p.unrealized_pnl).sum(),
        positions: positions
            .iter()
            .map(|p| SnapshotPosition {
                symbol: p.symbol.clone(),
                position: p.position,
                avg_cost: p.avg_cost,
                mkt_price: p.mkt_price,
                mkt_value: p.mkt_value,
                unrealized_pnl: p.unrealized_pnl,
            })
            .collect(),
        open_trade_count,
        created_at: Utc::now(),
    };

    datastore.insert_snapshot(&snapshot).await?;
    info!(
        date = %date,
        total_value = snapshot.total_value,
        total_pnl = snapshot.total_pnl,
        positions = snapshot.positions.len(),
        "daily portfolio snapshot written"
    );
    Ok(true)
}

// ---------------------------------------------------------------------------
// Post-close learning records
// ---------------------------------------------------------------------------

/// Emit one learning record per closed-but-unanalysed trade. Returns the
/// number emitted. Safe to re-run: analysed trades are excluded by the
/// `analyzed_at` stamp written here.
pub async fn emit_learnings(datastore: &dyn Datastore, now: DateTime<Utc>) -> Result<u32> {
    let pending = datastore.unanalyzed_closed_trades(LEARNING_BATCH).await?;
    let mut emitted = 0u32;

    for trade in pending {
        let outcome = match trade.pnl {
            Some(pnl) if pnl > 0.0 => "win",
            Some(pnl) if pnl < 0.0 => "loss",
            _ => "flat",
        };
        let hold_days = trade
            .closed_at
            .map(|closed| (closed - trade.filled_at.unwrap_or(trade.opened_at)).num_days());

        let learning = TradeLearning {
            id: Uuid::new_v4().to_string(),
            trade_id: trade.id.clone(),
            ticker: trade.ticker.clone(),
            mode: trade.mode,
            signal: trade.signal,
            strategy_source: trade.strategy_source.clone(),
            outcome: outcome.to_string(),
            pnl: trade.pnl,
            pnl_percent: trade.pnl_percent,
            r_multiple: trade.r_multiple,
            hold_days,
            created_at: now,
        };

        if let Err(e) = datastore.insert_learning(&learning).await {
            warn!(trade_id = %trade.id, error = %e, "learning insert failed — will retry next pass");
            continue;
        }

        let mut stamped = trade.clone();
        stamped.analyzed_at = Some(now);
        if let Err(e) = datastore.update_trade(&stamped).await {
            // The learning exists but the stamp failed; the next pass will
            // produce a duplicate record, which downstream consumers
            // de-duplicate by trade id. Log it loudly anyway.
            warn!(trade_id = %trade.id, error = %e, "analyzed_at stamp failed");
            continue;
        }
        emitted += 1;
    }

    if emitted > 0 {
        info!(emitted, "post-close trade learnings recorded");
    }
    Ok(emitted)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::memory::MemoryDatastore;
    use crate::types::{
        CloseReason, EntryTriggerType, Trade, TradeMode, TradeSignal, TradeStatus,
    };

    fn utc(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn closed_trade(ticker: &str, pnl: f64) -> Trade {
        Trade {
            id: Uuid::new_v4().to_string(),
            ticker: ticker.into(),
            mode: TradeMode::SwingTrade,
            signal: TradeSignal::Buy,
            strategy_source: Some("Chart Sensei".into()),
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
            risk_reward: None,
            quantity: 50,
            position_size: 5_000.0,
            ib_order_id: None,
            status: TradeStatus::TargetHit,
            fill_price: Some(100.0),
            close_price: Some(106.0),
            pnl: Some(pnl),
            pnl_percent: Some(pnl / 50.0),
            r_multiple: Some(2.0),
            opened_at: utc("2026-03-02T15:00:00Z"),
            filled_at: Some(utc("2026-03-02T15:30:00Z")),
            closed_at: Some(utc("2026-03-04T18:00:00Z")),
            close_reason: Some(CloseReason::TargetHit),
            entry_trigger_type: EntryTriggerType::BracketLimit,
            notes: None,
            entry_ma20_dist_pct: None,
            entry_macd_slope: None,
            entry_volume_ratio_10d: None,
            entry_regime_alignment: None,
            analyzed_at: None,
        }
    }

    fn pos(symbol: &str, qty: f64, avg: f64, mkt: f64) -> EnrichedPosition {
        EnrichedPosition {
            symbol: symbol.into(),
            position: qty,
            avg_cost: avg,
            contract_id: None,
            mkt_price: mkt,
            mkt_value: qty * mkt,
            unrealized_pnl: (mkt - avg) * qty,
        }
    }

    #[tokio::test]
    async fn snapshot_skipped_when_book_empty() {
        let ds = MemoryDatastore::new();
        let written =
            take_daily_snapshot(&ds, &[], "U1234567", 0, "2026-03-02".parse().unwrap())
                .await
                .unwrap();
        assert!(!written);
        assert!(ds.snapshots.lock().is_empty());
    }

    #[tokio::test]
    async fn snapshot_totals_positions() {
        let ds = MemoryDatastore::new();
        let positions = vec![pos("AAA", 100.0, 50.0, 55.0), pos("BBB", 10.0, 200.0, 190.0)];
        let written =
            take_daily_snapshot(&ds, &positions, "U1234567", 2, "2026-03-02".parse().unwrap())
                .await
                .unwrap();
        assert!(written);

        let snapshots = ds.snapshots.lock();
        let snap = &snapshots[0];
        assert_eq!(snap.positions.len(), 2);
        assert!((snap.total_value - (5_500.0 + 1_900.0)).abs() < 1e-9);
        assert!((snap.total_pnl - (500.0 - 100.0)).abs() < 1e-9);
        assert_eq!(snap.open_trade_count, 2);
    }

    #[tokio::test]
    async fn learnings_emitted_exactly_once() {
        let ds = MemoryDatastore::new();
        ds.push_trade(closed_trade("WIN", 300.0));
        ds.push_trade(closed_trade("LOSS", -120.0));

        let now = utc("2026-03-04T21:30:00Z");
        let first = emit_learnings(&ds, now).await.unwrap();
        assert_eq!(first, 2);

        {
            let learnings = ds.learnings.lock();
            assert_eq!(learnings.len(), 2);
            let win = learnings.iter().find(|l| l.ticker == "WIN").unwrap();
            assert_eq!(win.outcome, "win");
            assert_eq!(win.hold_days, Some(2));
            let loss = learnings.iter().find(|l| l.ticker == "LOSS").unwrap();
            assert_eq!(loss.outcome, "loss");
        }

        // Second pass finds everything stamped.
        let second = emit_learnings(&ds, now).await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(ds.learnings.lock().len(), 2);
    }
}

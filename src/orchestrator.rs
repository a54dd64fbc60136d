// =============================================================================
// Orchestrator — the scheduling state machine around the trading cycle
// =============================================================================
//
// All triggers converge on `run_cycle`, protected by the single
// non-reentrant flag on AppState. A trigger that finds a cycle running is
// dropped, not queued: time triggers fire again soon, and dropping avoids
// cascading backlogs when a cycle runs long.
//
// Triggers:
//   - periodic     every 15 minutes, 09:00-16:59 ET, weekdays
//   - first candle one-shot at 09:36 ET, weekdays
//   - startup      once, ~10 s after boot
//   - manual       REST endpoint
//   - realtime     debounced scanner-table change events, running the
//                  lighter execution-only path
//
// Fixed cycle order: connection gate -> config -> enriched positions ->
// daily tasks -> reconcile -> portfolio value refresh -> drawdown ->
// market-hours gate -> position management -> scanner fetch -> signal
// queuer -> external signals -> residual scanner ideas -> rehydration.
// Any step failure records `error: …` as the last result and returns;
// subsequent triggers re-enter normally.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broker::BrokerGateway;
use crate::candidates::{self, scanner, suggested, SourceContext};
use crate::config::AutoTraderConfig;
use crate::datastore::Datastore;
use crate::execution::Executor;
use crate::reconcile::Reconciler;
use crate::risk::{self, DrawdownAssessment};
use crate::services::market::{MarketDataApi, RegimeCache};
use crate::services::signals::{ScanResults, SignalsApi};
use crate::signal_queue::SignalQueuer;
use crate::snapshot;
use crate::time_rules::{self, Clock};
use crate::position_mgmt;
use crate::types::{EnrichedPosition, StrategyVideo};

/// Delay before the one-shot startup cycle.
const STARTUP_DELAY_SECS: u64 = 10;

pub struct Orchestrator {
    pub state: Arc<AppState>,
    broker: Arc<dyn BrokerGateway>,
    datastore: Arc<dyn Datastore>,
    market: Arc<dyn MarketDataApi>,
    signals_api: Arc<dyn SignalsApi>,
    clock: Arc<dyn Clock>,
    executor: Executor,
    regime: RegimeCache,
}

impl Orchestrator {
    pub fn new(
        state: Arc<AppState>,
        broker: Arc<dyn BrokerGateway>,
        datastore: Arc<dyn Datastore>,
        market: Arc<dyn MarketDataApi>,
        signals_api: Arc<dyn SignalsApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let executor = Executor::new(broker.clone(), datastore.clone(), state.clone());
        Self {
            state,
            broker,
            datastore,
            market,
            signals_api,
            clock,
            executor,
            regime: RegimeCache::new(),
        }
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Run one full cycle. Returns the result string also stored on the
    /// status surface.
    pub async fn run_cycle(&self) -> String {
        self.run_guarded(true).await
    }

    /// Realtime path: the execution-only subset of the cycle.
    pub async fn run_execution_only(&self) -> String {
        self.run_guarded(false).await
    }

    async fn run_guarded(&self, full: bool) -> String {
        let Some(_guard) = self.state.try_begin_cycle() else {
            debug!("trigger dropped: cycle already running");
            return "skipped: cycle already running".to_string();
        };

        let now = self.clock.now();
        self.state.run_count.fetch_add(1, Ordering::SeqCst);
        *self.state.last_run.write() = Some(now);
        self.state.ledger.lock().roll_day(time_rules::et_date(now));

        let label = if full { "cycle" } else { "execution-only" };
        info!(kind = label, "run started");

        let result = match self.run_inner(full).await {
            Ok(summary) => summary,
            Err(e) => {
                let msg = format!("error: {e:#}");
                warn!(kind = label, error = %msg, "run aborted");
                self.state.push_error(msg.clone());
                msg
            }
        };

        info!(kind = label, result = %result, "run finished");
        *self.state.last_result.write() = Some(result.clone());
        result
    }

    // =========================================================================
    // The cycle itself
    // =========================================================================

    async fn run_inner(&self, full: bool) -> Result<String> {
        let now = self.clock.now();
        let today = time_rules::et_date(now);

        // --- Connection gate -------------------------------------------------
        let connected = self.broker.is_connected().await;
        *self.state.broker_connected.write() = connected;
        if !connected {
            return Ok("skipped: broker gateway not connected".into());
        }
        if !self.state.datastore_configured {
            return Ok("skipped: datastore not configured".into());
        }

        // --- Config ----------------------------------------------------------
        let Some(mut cfg) = self
            .datastore
            .load_config()
            .await
            .context("config load failed")?
        else {
            return Ok("skipped: no auto_trader_config record".into());
        };
        if !cfg.enabled {
            return Ok("skipped: auto-trading disabled".into());
        }
        let Some(account_id) = cfg.account_id.clone() else {
            return Ok("skipped: no account configured".into());
        };

        // --- Enriched positions ----------------------------------------------
        let positions = self
            .enriched_positions()
            .await
            .context("position fetch failed")?;
        debug!(count = positions.len(), "broker positions enriched");

        // --- Drawdown (computed early, logged as its own step) ----------------
        let drawdown = risk::assess_drawdown(&positions);

        let mut tallies = Tallies::default();

        // --- Daily tasks (full cycle only) ------------------------------------
        if full {
            self.daily_tasks(&cfg, &positions, drawdown, &account_id, today, &mut tallies)
                .await;
        }

        // --- Reconcile --------------------------------------------------------
        let active = self.datastore.active_trades().await.unwrap_or_default();
        let summary = Reconciler::new(
            self.datastore.as_ref(),
            self.broker.as_ref(),
            self.market.as_ref(),
            now,
        )
        .run(&positions, &active)
        .await;
        // Broker truth has been re-read; local optimism is obsolete.
        self.state.ledger.lock().clear_pending();
        tallies.reconciled = summary;

        // --- Portfolio value refresh (only ever grows) ------------------------
        let observed: f64 = positions.iter().map(|p| p.mkt_value).sum();
        if observed > cfg.portfolio_value {
            info!(
                old = cfg.portfolio_value,
                new = observed,
                "portfolio value raised from broker observation"
            );
            cfg.portfolio_value = observed;
            if let Err(e) = self.datastore.update_portfolio_value(observed).await {
                warn!(error = %e, "portfolio value persist failed");
            }
        }

        info!(
            level = %drawdown.level,
            pnl_pct = drawdown.pnl_pct,
            multiplier = drawdown.multiplier,
            "drawdown assessed"
        );

        // --- Market-hours gate ------------------------------------------------
        if time_rules::is_market_hours(now) {
            self.trading_steps(&cfg, &positions, drawdown, full, today, &mut tallies)
                .await;
        } else {
            debug!("outside market hours — trading steps skipped");
        }

        // --- Rehydration (full cycle only, after the post-close boundary) -----
        if full && time_rules::is_after_post_close(now) {
            let due = *self.state.last_rehydration_date.read() != Some(today);
            if due {
                self.rehydrate(&positions, now).await;
                *self.state.last_rehydration_date.write() = Some(today);
            }
        }

        Ok(tallies.summary_line(positions.len()))
    }

    /// The trade-generating middle of the cycle, gated on market hours.
    async fn trading_steps(
        &self,
        cfg: &AutoTraderConfig,
        positions: &[EnrichedPosition],
        drawdown: DrawdownAssessment,
        full: bool,
        today: chrono::NaiveDate,
        tallies: &mut Tallies,
    ) {
        let now = self.clock.now();
        let ctx = SourceContext {
            cfg,
            datastore: self.datastore.as_ref(),
            market: self.market.as_ref(),
            signals_api: self.signals_api.as_ref(),
            executor: &self.executor,
            state: &self.state,
            positions,
            drawdown,
            now,
        };

        // Position management runs in the full cycle only; the realtime
        // path exists to catch fresh scanner rows, not to manage holdings.
        if full {
            tallies.absorb("position_mgmt", position_mgmt::run(&ctx).await);
        }

        // One scanner fetch feeds both the generic queuer and the residual
        // execution step.
        let portfolio_tickers: Vec<String> =
            positions.iter().map(|p| p.symbol.clone()).collect();
        let scan = self
            .signals_api
            .scan_ideas(&portfolio_tickers)
            .await
            .unwrap_or_else(|| {
                debug!("scanner unavailable — continuing with empty idea set");
                ScanResults::default()
            });

        // Video-derived queuing, then the claimed-ticker handoff.
        let videos = self.tracked_videos().await;
        let queuer = SignalQueuer::new(self.datastore.as_ref());
        if let Err(e) = queuer.queue_daily_signals(&videos_vec(&videos), today).await {
            warn!(error = %e, "daily signal queuing failed");
        }
        let active_tickers: HashSet<String> = ctx
            .active_trades()
            .await
            .iter()
            .map(|t| t.ticker.clone())
            .collect();
        let claimed = match queuer
            .queue_generic_signals(
                &scan,
                &videos_vec(&videos),
                &active_tickers,
                cfg.min_scanner_confidence,
                today,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(error = %e, "generic signal queuing failed");
                HashSet::new()
            }
        };

        // External signals, then whatever scanner ideas remain unclaimed.
        tallies.absorb(
            "external_signals",
            candidates::external::process(&ctx, &videos).await,
        );

        let all_ideas: Vec<_> = scan
            .day_trades
            .iter()
            .chain(scan.swing_trades.iter())
            .cloned()
            .collect();
        tallies.absorb(
            "scanner",
            scanner::execute_ideas(&ctx, &all_ideas, &claimed).await,
        );
    }

    /// Suggested finds + daily snapshot, each latched to once per ET day.
    async fn daily_tasks(
        &self,
        cfg: &AutoTraderConfig,
        positions: &[EnrichedPosition],
        drawdown: DrawdownAssessment,
        account_id: &str,
        today: chrono::NaiveDate,
        tallies: &mut Tallies,
    ) {
        let now = self.clock.now();

        // Suggested finds: weekday mornings after 09:00 ET, once per day.
        let finds_due = *self.state.last_suggested_finds_date.read() != Some(today)
            && time_rules::is_weekday(now)
            && time_rules::is_at_or_after(now, 9, 0);
        if finds_due {
            let ctx = SourceContext {
                cfg,
                datastore: self.datastore.as_ref(),
                market: self.market.as_ref(),
                signals_api: self.signals_api.as_ref(),
                executor: &self.executor,
                state: &self.state,
                positions,
                drawdown,
                now,
            };
            tallies.absorb("suggested_finds", suggested::run(&ctx, &self.regime).await);
            *self.state.last_suggested_finds_date.write() = Some(today);
        }

        // Snapshot: once per day, only with a non-empty book.
        let snapshot_due = *self.state.last_snapshot_date.read() != Some(today);
        if snapshot_due {
            let open_count = self
                .datastore
                .active_trades()
                .await
                .map(|t| t.len())
                .unwrap_or(0);
            match snapshot::take_daily_snapshot(
                self.datastore.as_ref(),
                positions,
                account_id,
                open_count,
                today,
            )
            .await
            {
                Ok(true) => {
                    *self.state.last_snapshot_date.write() = Some(today);
                }
                Ok(false) => debug!("snapshot skipped: no broker positions"),
                Err(e) => warn!(error = %e, "snapshot failed"),
            }
        }
    }

    /// Post-close pass: late fills, then one learning record per
    /// newly-closed trade.
    async fn rehydrate(&self, positions: &[EnrichedPosition], now: chrono::DateTime<chrono::Utc>) {
        let active = self.datastore.active_trades().await.unwrap_or_default();
        Reconciler::new(
            self.datastore.as_ref(),
            self.broker.as_ref(),
            self.market.as_ref(),
            now,
        )
        .run(positions, &active)
        .await;

        match snapshot::emit_learnings(self.datastore.as_ref(), now).await {
            Ok(emitted) if emitted > 0 => info!(emitted, "rehydration learnings emitted"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "rehydration learning pass failed"),
        }
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    /// Fetch broker positions and fan quote lookups out concurrently,
    /// preserving input order on join.
    async fn enriched_positions(&self) -> Result<Vec<EnrichedPosition>> {
        let raw = self.broker.request_positions().await?;
        let quotes = join_all(raw.iter().map(|p| self.market.quote(&p.symbol))).await;

        Ok(raw
            .into_iter()
            .zip(quotes)
            .map(|(p, quote)| {
                let mkt_price = quote.unwrap_or(p.avg_cost);
                EnrichedPosition {
                    mkt_value: p.position * mkt_price,
                    unrealized_pnl: (mkt_price - p.avg_cost) * p.position,
                    mkt_price,
                    symbol: p.symbol,
                    position: p.position,
                    avg_cost: p.avg_cost,
                    contract_id: p.contract_id,
                }
            })
            .collect())
    }

    async fn tracked_videos(&self) -> HashMap<String, StrategyVideo> {
        match self.datastore.tracked_videos().await {
            Ok(videos) => videos
                .into_iter()
                .map(|v| (v.video_id.clone(), v))
                .collect(),
            Err(e) => {
                warn!(error = %e, "tracked video fetch failed");
                HashMap::new()
            }
        }
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Spawn the periodic, first-candle, startup, and realtime trigger
    /// tasks. `realtime_fires` carries debounced change notifications.
    pub fn spawn_triggers(self: &Arc<Self>, mut realtime_fires: mpsc::Receiver<()>) {
        self.state.triggers_active.store(true, Ordering::SeqCst);

        // Periodic: every 15 minutes on the quarter-hour grid.
        let orch = self.clone();
        tokio::spawn(async move {
            loop {
                let wait = time_rules::secs_to_next_quarter_hour(orch.clock.now());
                tokio::time::sleep(std::time::Duration::from_secs(wait.max(1))).await;
                if time_rules::in_trigger_window(orch.clock.now()) {
                    orch.run_cycle().await;
                }
            }
        });

        // First-candle one-shot at 09:36 ET: catches opening-range setups
        // that complete just after the quarter-hour grid.
        let orch = self.clone();
        tokio::spawn(async move {
            loop {
                let now = orch.clock.now();
                let at = time_rules::next_et_wallclock(now, 9, 36);
                let wait = (at - now).num_seconds().max(1) as u64;
                tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
                if time_rules::is_weekday(orch.clock.now()) {
                    orch.run_cycle().await;
                }
            }
        });

        // Startup one-shot.
        let orch = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(STARTUP_DELAY_SECS)).await;
            info!("startup cycle");
            orch.run_cycle().await;
        });

        // Realtime: debounced scanner-table changes run the lighter path.
        let orch = self.clone();
        tokio::spawn(async move {
            while realtime_fires.recv().await.is_some() {
                orch.run_execution_only().await;
            }
            warn!("realtime fire channel closed");
        });

        info!("scheduler triggers armed");
    }
}

fn videos_vec(videos: &HashMap<String, StrategyVideo>) -> Vec<StrategyVideo> {
    videos.values().cloned().collect()
}

// ---------------------------------------------------------------------------
// Result tallying
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tallies {
    reconciled: crate::reconcile::ReconcileSummary,
    executed: u32,
    skipped: u32,
    deferred: u32,
    failed: u32,
}

impl Tallies {
    fn absorb(&mut self, step: &str, outcomes: Vec<(String, candidates::Decision)>) {
        use candidates::Action;
        for (ticker, decision) in outcomes {
            info!(step, ticker = %ticker, outcome = %decision.label(), "candidate outcome");
            match decision.action {
                Action::Execute => self.executed += 1,
                Action::Skip => self.skipped += 1,
                Action::Defer => self.deferred += 1,
                Action::Fail => self.failed += 1,
            }
        }
    }

    fn summary_line(&self, position_count: usize) -> String {
        format!(
            "ok: {position_count} positions, {} filled, {} closed, {} executed, {} skipped, {} waiting, {} failed",
            self.reconciled.filled,
            self.reconciled.closed + self.reconciled.expired,
            self.executed,
            self.skipped,
            self.deferred,
            self.failed
        )
    }
}

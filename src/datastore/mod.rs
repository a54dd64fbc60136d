// =============================================================================
// Datastore boundary — keyed records, ledger, events, signals, videos
// =============================================================================
//
// The core consumes `Datastore` only; `rest.rs` implements it against a
// PostgREST-style HTTP API and `memory.rs` backs the tests. The realtime
// change channel on the scanner-results table lives in `realtime.rs`.
// =============================================================================

pub mod realtime;
pub mod rest;

#[cfg(test)]
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::config::AutoTraderConfig;
use crate::types::{
    AutoTradeEvent, EventSource, ExternalStrategySignal, PortfolioSnapshot, SignalStatus,
    StrategyVideo, Trade, TradeLearning, TradeMode, TradeSignal,
};

/// Identity of an external signal for idempotent queuing: at most one
/// non-terminal signal may exist per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalKey<'a> {
    pub source_name: &'a str,
    pub ticker: &'a str,
    pub signal: TradeSignal,
    pub mode: TradeMode,
    pub execute_on_date: NaiveDate,
    pub strategy_video_id: Option<&'a str>,
}

/// Requested terminal transition for an external signal. Applied only when
/// the row is still PENDING; the status column is the lock.
#[derive(Debug, Clone, Default)]
pub struct SignalTransition {
    pub failure_reason: Option<String>,
    pub executed_trade_id: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Datastore: Send + Sync {
    // --- Config --------------------------------------------------------------

    /// Load the `auto_trader_config` singleton; `None` when the record has
    /// never been created.
    async fn load_config(&self) -> Result<Option<AutoTraderConfig>>;

    /// Persist an increased portfolio value onto the singleton.
    async fn update_portfolio_value(&self, value: f64) -> Result<()>;

    // --- Ledger trades -------------------------------------------------------

    async fn insert_trade(&self, trade: &Trade) -> Result<()>;

    async fn update_trade(&self, trade: &Trade) -> Result<()>;

    /// Trades with status in {PENDING, SUBMITTED, FILLED, PARTIAL}.
    async fn active_trades(&self) -> Result<Vec<Trade>>;

    /// Closed trades for a deactivation scope, newest `closed_at` first.
    /// `strategy_video_id = None` matches any video.
    async fn recent_closed_trades(
        &self,
        source_name: &str,
        strategy_video_id: Option<&str>,
        mode: TradeMode,
        limit: usize,
    ) -> Result<Vec<Trade>>;

    /// Closed trades that have not yet had a learning record emitted.
    async fn unanalyzed_closed_trades(&self, limit: usize) -> Result<Vec<Trade>>;

    // --- Audit events --------------------------------------------------------

    async fn insert_event(&self, event: &AutoTradeEvent) -> Result<()>;

    /// Recent events for a ticker and source, newest first. Backs the
    /// dip-buy cooldown and per-tier dedup.
    async fn recent_events(
        &self,
        ticker: &str,
        source: EventSource,
        limit: usize,
    ) -> Result<Vec<AutoTradeEvent>>;

    // --- External strategy signals -------------------------------------------

    /// PENDING signals whose `execute_on_date` is on or before `today`.
    async fn due_signals(&self, today: NaiveDate) -> Result<Vec<ExternalStrategySignal>>;

    /// Look up a signal by its uniqueness key, regardless of status.
    async fn find_signal(&self, key: &SignalKey<'_>) -> Result<Option<ExternalStrategySignal>>;

    async fn insert_signal(&self, signal: &ExternalStrategySignal) -> Result<()>;

    /// Move a signal out of PENDING. Returns `false` when the row was
    /// already terminal — callers treat that as a completed no-op.
    async fn transition_signal(
        &self,
        id: &str,
        to: SignalStatus,
        details: SignalTransition,
    ) -> Result<bool>;

    // --- Strategy videos -----------------------------------------------------

    /// Catalogue entries with `status = "tracked"`.
    async fn tracked_videos(&self) -> Result<Vec<StrategyVideo>>;

    // --- Snapshots & learnings -----------------------------------------------

    async fn insert_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()>;

    async fn insert_learning(&self, learning: &TradeLearning) -> Result<()>;
}

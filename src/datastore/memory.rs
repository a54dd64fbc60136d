// =============================================================================
// In-memory datastore for tests
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;

use super::{Datastore, SignalKey, SignalTransition};
use crate::config::AutoTraderConfig;
use crate::types::{
    AutoTradeEvent, EventSource, ExternalStrategySignal, PortfolioSnapshot, SignalStatus,
    StrategyVideo, Trade, TradeLearning, TradeMode,
};

/// Vec-backed datastore with the same observable semantics as the REST
/// client, including the PENDING-guarded signal transition.
#[derive(Default)]
pub struct MemoryDatastore {
    pub config: Mutex<Option<AutoTraderConfig>>,
    pub trades: Mutex<Vec<Trade>>,
    pub events: Mutex<Vec<AutoTradeEvent>>,
    pub signals: Mutex<Vec<ExternalStrategySignal>>,
    pub videos: Mutex<Vec<StrategyVideo>>,
    pub snapshots: Mutex<Vec<PortfolioSnapshot>>,
    pub learnings: Mutex<Vec<TradeLearning>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(self, config: AutoTraderConfig) -> Self {
        *self.config.lock() = Some(config);
        self
    }

    pub fn push_trade(&self, trade: Trade) {
        self.trades.lock().push(trade);
    }

    pub fn push_signal(&self, signal: ExternalStrategySignal) {
        self.signals.lock().push(signal);
    }

    pub fn push_video(&self, video: StrategyVideo) {
        self.videos.lock().push(video);
    }

    pub fn push_event(&self, event: AutoTradeEvent) {
        self.events.lock().push(event);
    }

    pub fn trade(&self, id: &str) -> Option<Trade> {
        self.trades.lock().iter().find(|t| t.id == id).cloned()
    }

    pub fn signal(&self, id: &str) -> Option<ExternalStrategySignal> {
        self.signals.lock().iter().find(|s| s.id == id).cloned()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn load_config(&self) -> Result<Option<AutoTraderConfig>> {
        Ok(self.config.lock().clone())
    }

    async fn update_portfolio_value(&self, value: f64) -> Result<()> {
        if let Some(cfg) = self.config.lock().as_mut() {
            cfg.portfolio_value = value;
        }
        Ok(())
    }

    async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        self.trades.lock().push(trade.clone());
        Ok(())
    }

    async fn update_trade(&self, trade: &Trade) -> Result<()> {
        let mut trades = self.trades.lock();
        if let Some(existing) = trades.iter_mut().find(|t| t.id == trade.id) {
            *existing = trade.clone();
        }
        Ok(())
    }

    async fn active_trades(&self) -> Result<Vec<Trade>> {
        Ok(self
            .trades
            .lock()
            .iter()
            .filter(|t| t.is_active())
            .cloned()
            .collect())
    }

    async fn recent_closed_trades(
        &self,
        source_name: &str,
        strategy_video_id: Option<&str>,
        mode: TradeMode,
        limit: usize,
    ) -> Result<Vec<Trade>> {
        let mut rows: Vec<Trade> = self
            .trades
            .lock()
            .iter()
            .filter(|t| t.status.is_terminal_close())
            .filter(|t| t.strategy_source.as_deref() == Some(source_name))
            .filter(|t| t.mode == mode)
            .filter(|t| match strategy_video_id {
                Some(video_id) => t.strategy_video_id.as_deref() == Some(video_id),
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn unanalyzed_closed_trades(&self, limit: usize) -> Result<Vec<Trade>> {
        Ok(self
            .trades
            .lock()
            .iter()
            .filter(|t| t.status.is_terminal_close() && t.analyzed_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_event(&self, event: &AutoTradeEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn recent_events(
        &self,
        ticker: &str,
        source: EventSource,
        limit: usize,
    ) -> Result<Vec<AutoTradeEvent>> {
        let mut rows: Vec<AutoTradeEvent> = self
            .events
            .lock()
            .iter()
            .filter(|e| e.ticker == ticker && e.source == source)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn due_signals(&self, today: NaiveDate) -> Result<Vec<ExternalStrategySignal>> {
        let mut rows: Vec<ExternalStrategySignal> = self
            .signals
            .lock()
            .iter()
            .filter(|s| s.status == SignalStatus::Pending && s.execute_on_date <= today)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn find_signal(&self, key: &SignalKey<'_>) -> Result<Option<ExternalStrategySignal>> {
        Ok(self
            .signals
            .lock()
            .iter()
            .find(|s| {
                s.source_name == key.source_name
                    && s.ticker == key.ticker
                    && s.signal == key.signal
                    && s.mode == key.mode
                    && s.execute_on_date == key.execute_on_date
                    && s.strategy_video_id.as_deref() == key.strategy_video_id
            })
            .cloned())
    }

    async fn insert_signal(&self, signal: &ExternalStrategySignal) -> Result<()> {
        self.signals.lock().push(signal.clone());
        Ok(())
    }

    async fn transition_signal(
        &self,
        id: &str,
        to: SignalStatus,
        details: SignalTransition,
    ) -> Result<bool> {
        let mut signals = self.signals.lock();
        let Some(signal) = signals.iter_mut().find(|s| s.id == id) else {
            return Ok(false);
        };
        if signal.status != SignalStatus::Pending {
            return Ok(false);
        }
        signal.status = to;
        signal.failure_reason = details.failure_reason;
        signal.executed_trade_id = details.executed_trade_id;
        signal.executed_at = details.executed_at;
        Ok(true)
    }

    async fn tracked_videos(&self) -> Result<Vec<StrategyVideo>> {
        Ok(self
            .videos
            .lock()
            .iter()
            .filter(|v| v.is_tracked())
            .cloned()
            .collect())
    }

    async fn insert_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }

    async fn insert_learning(&self, learning: &TradeLearning) -> Result<()> {
        self.learnings.lock().push(learning.clone());
        Ok(())
    }
}

// =============================================================================
// Executor — routes sized entries to the broker and records the outcome
// =============================================================================
//
// One entry point for every candidate source. A bracket order goes out when
// all three price levels exist; otherwise a plain market order. After a
// successful placement the executor:
//   1. persists a SUBMITTED ledger row,
//   2. records the deployed dollars against the pending and daily counters,
//   3. marks the ticker processed for the day,
//   4. appends an audit event tagged with the source.
//
// Placement failures are terminal for the attempt: no ledger row, no retry.
// A ledger write failure after a placed order is logged loudly but does not
// unwind the order.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::broker::{BracketOrder, BrokerGateway, MarketOrder, TimeInForce};
use crate::datastore::Datastore;
use crate::types::{
    AutoTradeEvent, EntryTriggerType, EventAction, EventSource, EventType, Trade, TradeMode,
    TradeSignal, TradeStatus,
};

// ---------------------------------------------------------------------------
// Entry request
// ---------------------------------------------------------------------------

/// A fully sized, fully gated entry ready for the broker.
#[derive(Debug, Clone)]
pub struct EntryOrder {
    pub ticker: String,
    pub mode: TradeMode,
    pub signal: TradeSignal,
    pub quantity: i64,
    pub dollars: f64,

    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub target_price: Option<f64>,
    pub target_price_2: Option<f64>,
    pub risk_reward: Option<String>,

    pub source: EventSource,
    pub strategy_source: Option<String>,
    pub strategy_url: Option<String>,
    pub strategy_video_id: Option<String>,
    pub strategy_video_heading: Option<String>,
    pub scanner_confidence: Option<f64>,
    pub fa_confidence: Option<f64>,
    pub fa_recommendation: Option<String>,
    pub notes: Option<String>,

    /// Explicit trigger tag for management orders (dip buy, trim, cut);
    /// `None` derives market/bracket_limit from the order shape.
    pub trigger_override: Option<EntryTriggerType>,
    /// Extra metadata carried on the audit event (e.g. tier numbers).
    pub event_metadata: serde_json::Value,
}

impl EntryOrder {
    pub fn new(
        ticker: &str,
        mode: TradeMode,
        signal: TradeSignal,
        quantity: i64,
        dollars: f64,
        source: EventSource,
    ) -> Self {
        Self {
            ticker: ticker.to_string(),
            mode,
            signal,
            quantity,
            dollars,
            entry_price: None,
            stop_loss: None,
            target_price: None,
            target_price_2: None,
            risk_reward: None,
            source,
            strategy_source: None,
            strategy_url: None,
            strategy_video_id: None,
            strategy_video_heading: None,
            scanner_confidence: None,
            fa_confidence: None,
            fa_recommendation: None,
            notes: None,
            trigger_override: None,
            event_metadata: serde_json::Value::Null,
        }
    }

    fn has_bracket_levels(&self) -> bool {
        self.entry_price.is_some() && self.stop_loss.is_some() && self.target_price.is_some()
    }
}

/// Outcome of one placement attempt.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Placed(Trade),
    NoContract,
    PlacementFailed(String),
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    broker: Arc<dyn BrokerGateway>,
    datastore: Arc<dyn Datastore>,
    state: Arc<AppState>,
}

impl Executor {
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        datastore: Arc<dyn Datastore>,
        state: Arc<AppState>,
    ) -> Self {
        Self {
            broker,
            datastore,
            state,
        }
    }

    /// Place `order` and record everything that follows from it.
    pub async fn place_entry(&self, order: EntryOrder) -> ExecutionOutcome {
        let Ok(Some(contract)) = self.broker.search_contract(&order.ticker).await else {
            warn!(ticker = %order.ticker, "no tradable contract found");
            self.record_failure(&order, "no tradable contract found").await;
            return ExecutionOutcome::NoContract;
        };

        let (placement, trigger) = if order.has_bracket_levels() {
            let tif = match order.mode {
                TradeMode::DayTrade => TimeInForce::Day,
                _ => TimeInForce::Gtc,
            };
            let bracket = BracketOrder {
                contract_id: contract.contract_id,
                symbol: order.ticker.clone(),
                side: order.signal,
                quantity: order.quantity,
                entry_price: order.entry_price.unwrap_or_default(),
                stop_loss: order.stop_loss.unwrap_or_default(),
                take_profit: order.target_price.unwrap_or_default(),
                tif,
            };
            (
                self.broker.place_bracket(&bracket).await,
                EntryTriggerType::BracketLimit,
            )
        } else {
            let market = MarketOrder {
                contract_id: contract.contract_id,
                symbol: order.ticker.clone(),
                side: order.signal,
                quantity: order.quantity,
            };
            (
                self.broker.place_market(&market).await,
                EntryTriggerType::Market,
            )
        };

        let order_id = match placement {
            Ok(id) => id,
            Err(e) => {
                warn!(ticker = %order.ticker, error = %e, "order placement failed");
                self.record_failure(&order, &e.to_string()).await;
                return ExecutionOutcome::PlacementFailed(e.to_string());
            }
        };

        let trade = self.build_trade(&order, &order_id, trigger);

        if let Err(e) = self.datastore.insert_trade(&trade).await {
            // The order is live at the broker; losing the row is serious.
            error!(
                ticker = %order.ticker,
                order_id = %order_id,
                error = %e,
                "ledger insert failed after order placement"
            );
            self.state
                .push_error(format!("ledger insert failed for {}: {e}", order.ticker));
        }

        {
            let mut ledger = self.state.ledger.lock();
            ledger.record_deploy(order.dollars);
            ledger.mark_processed(&order.ticker);
        }

        let event = AutoTradeEvent::new(
            &order.ticker,
            EventType::Success,
            EventAction::Executed,
            order.source,
            Some(order.mode),
            format!(
                "{} {} x{} (${:.0}) via {}",
                order.signal, order.ticker, order.quantity, order.dollars, trade.entry_trigger_type
            ),
        )
        .with_metadata(order.event_metadata.clone());
        if let Err(e) = self.datastore.insert_event(&event).await {
            warn!(error = %e, "event append failed");
        }

        info!(
            ticker = %order.ticker,
            signal = %order.signal,
            quantity = order.quantity,
            dollars = order.dollars,
            order_id = %order_id,
            source = %order.source,
            "entry order placed"
        );

        ExecutionOutcome::Placed(trade)
    }

    fn build_trade(&self, order: &EntryOrder, order_id: &str, trigger: EntryTriggerType) -> Trade {
        Trade {
            id: Uuid::new_v4().to_string(),
            ticker: order.ticker.clone(),
            mode: order.mode,
            signal: order.signal,
            strategy_source: order.strategy_source.clone(),
            strategy_url: order.strategy_url.clone(),
            strategy_video_id: order.strategy_video_id.clone(),
            strategy_video_heading: order.strategy_video_heading.clone(),
            scanner_confidence: order.scanner_confidence,
            fa_confidence: order.fa_confidence,
            fa_recommendation: order.fa_recommendation.clone(),
            entry_price: order.entry_price,
            stop_loss: order.stop_loss,
            target_price: order.target_price,
            target_price_2: order.target_price_2,
            risk_reward: order.risk_reward.clone(),
            quantity: order.quantity,
            position_size: order.dollars,
            ib_order_id: Some(order_id.to_string()),
            status: TradeStatus::Submitted,
            fill_price: None,
            close_price: None,
            pnl: None,
            pnl_percent: None,
            r_multiple: None,
            opened_at: Utc::now(),
            filled_at: None,
            closed_at: None,
            close_reason: None,
            entry_trigger_type: order.trigger_override.unwrap_or(trigger),
            notes: order.notes.clone(),
            entry_ma20_dist_pct: None,
            entry_macd_slope: None,
            entry_volume_ratio_10d: None,
            entry_regime_alignment: None,
            analyzed_at: None,
        }
    }

    async fn record_failure(&self, order: &EntryOrder, reason: &str) {
        let event = AutoTradeEvent::new(
            &order.ticker,
            EventType::Error,
            EventAction::Failed,
            order.source,
            Some(order.mode),
            format!("{} {} failed: {reason}", order.signal, order.ticker),
        );
        if let Err(e) = self.datastore.insert_event(&event).await {
            warn!(error = %e, "failure event append failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::{MockBroker, PlacedOrder};
    use crate::datastore::memory::MemoryDatastore;

    fn setup(broker: MockBroker) -> (Arc<MockBroker>, Arc<MemoryDatastore>, Executor) {
        let broker = Arc::new(broker);
        let datastore = Arc::new(MemoryDatastore::new());
        let state = Arc::new(AppState::new("2026-03-02".parse().unwrap(), true));
        let executor = Executor::new(broker.clone(), datastore.clone(), state);
        (broker, datastore, executor)
    }

    fn bracket_order() -> EntryOrder {
        let mut order = EntryOrder::new(
            "ABC",
            TradeMode::DayTrade,
            TradeSignal::Buy,
            500,
            50_000.0,
            EventSource::Scanner,
        );
        order.entry_price = Some(100.0);
        order.stop_loss = Some(97.0);
        order.target_price = Some(106.0);
        order.risk_reward = Some("1:2".into());
        order
    }

    #[tokio::test]
    async fn bracket_placed_and_recorded() {
        let (broker, datastore, executor) = setup(MockBroker::new().with_contract("ABC"));

        let outcome = executor.place_entry(bracket_order()).await;
        let trade = match outcome {
            ExecutionOutcome::Placed(t) => t,
            other => panic!("expected placement, got {other:?}"),
        };

        assert_eq!(trade.status, TradeStatus::Submitted);
        assert_eq!(trade.entry_trigger_type, EntryTriggerType::BracketLimit);
        assert!(trade.ib_order_id.is_some());

        // Day trades carry a DAY bracket.
        match &broker.placed.lock()[0] {
            PlacedOrder::Bracket(b) => {
                assert_eq!(b.tif, TimeInForce::Day);
                assert_eq!(b.quantity, 500);
            }
            other => panic!("expected bracket, got {other:?}"),
        }

        // Ledger row, event, and deployed dollars all recorded.
        assert_eq!(datastore.trades.lock().len(), 1);
        let events = datastore.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventAction::Executed);
        assert_eq!(events[0].source, EventSource::Scanner);
    }

    #[tokio::test]
    async fn swing_bracket_uses_gtc() {
        let (broker, _, executor) = setup(MockBroker::new().with_contract("ABC"));
        let mut order = bracket_order();
        order.mode = TradeMode::SwingTrade;

        executor.place_entry(order).await;
        match &broker.placed.lock()[0] {
            PlacedOrder::Bracket(b) => assert_eq!(b.tif, TimeInForce::Gtc),
            other => panic!("expected bracket, got {other:?}"),
        };
    }

    #[tokio::test]
    async fn missing_levels_fall_back_to_market() {
        let (broker, _, executor) = setup(MockBroker::new().with_contract("XYZ"));
        let order = EntryOrder::new(
            "XYZ",
            TradeMode::LongTerm,
            TradeSignal::Buy,
            10,
            1_000.0,
            EventSource::SuggestedFinds,
        );

        let outcome = executor.place_entry(order).await;
        let trade = match outcome {
            ExecutionOutcome::Placed(t) => t,
            other => panic!("expected placement, got {other:?}"),
        };
        assert_eq!(trade.entry_trigger_type, EntryTriggerType::Market);
        assert!(matches!(broker.placed.lock()[0], PlacedOrder::Market(_)));
    }

    #[tokio::test]
    async fn no_contract_records_failure_event() {
        let (broker, datastore, executor) = setup(MockBroker::new());
        let outcome = executor.place_entry(bracket_order()).await;
        assert!(matches!(outcome, ExecutionOutcome::NoContract));
        assert_eq!(broker.placed_count(), 0);
        assert!(datastore.trades.lock().is_empty());
        let events = datastore.events.lock();
        assert_eq!(events[0].action, EventAction::Failed);
    }

    #[tokio::test]
    async fn placement_failure_leaves_no_ledger_row() {
        let broker = MockBroker::new().with_contract("ABC");
        *broker.fail_placements.lock() = true;
        let (_, datastore, executor) = setup(broker);

        let outcome = executor.place_entry(bracket_order()).await;
        match outcome {
            ExecutionOutcome::PlacementFailed(msg) => {
                assert!(msg.contains("rejected"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(datastore.trades.lock().is_empty());
        assert_eq!(datastore.events.lock()[0].action, EventAction::Failed);
    }

    #[tokio::test]
    async fn deploy_counters_and_processed_set_updated() {
        let broker = Arc::new(MockBroker::new().with_contract("ABC"));
        let datastore = Arc::new(MemoryDatastore::new());
        let state = Arc::new(AppState::new("2026-03-02".parse().unwrap(), true));
        let executor = Executor::new(broker, datastore, state.clone());

        executor.place_entry(bracket_order()).await;

        let ledger = state.ledger.lock();
        assert_eq!(ledger.pending_deployed_dollar, 50_000.0);
        assert_eq!(ledger.daily_deployed_dollar, 50_000.0);
        assert!(ledger.is_processed("ABC"));
    }
}

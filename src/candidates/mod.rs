// =============================================================================
// Candidate sources — scanner ideas, suggested finds, external signals
// =============================================================================
//
// Each source reduces its candidates to a uniform decision record; the
// orchestrator logs the outcomes and never re-raises them. All sources
// execute through the shared `Executor` and consult the same risk gate, so
// the only differences between them are intake filtering and sizing inputs.
// =============================================================================

pub mod external;
pub mod scanner;
pub mod suggested;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::warn;

use crate::app_state::AppState;
use crate::config::AutoTraderConfig;
use crate::datastore::Datastore;
use crate::execution::Executor;
use crate::risk::{DrawdownAssessment, GateVerdict, RiskGate, TradeCheck};
use crate::services::market::MarketDataApi;
use crate::services::signals::SignalsApi;
use crate::time_rules;
use crate::types::{
    AutoTradeEvent, EnrichedPosition, EventAction, EventSource, EventType, Trade, TradeMode,
};

// ---------------------------------------------------------------------------
// Decision record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Execute,
    Skip,
    Defer,
    Fail,
}

/// Per-candidate outcome, logged by the orchestrator.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
}

impl Decision {
    pub fn executed() -> Self {
        Self {
            action: Action::Execute,
            reason: "executed".into(),
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Skip,
            reason: reason.into(),
        }
    }

    pub fn defer(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Defer,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Fail,
            reason: reason.into(),
        }
    }

    /// Compact label for the cycle log, e.g. `skipped:duplicate`.
    pub fn label(&self) -> String {
        match self.action {
            Action::Execute => "executed".into(),
            Action::Skip => format!("skipped:{}", self.reason),
            Action::Defer => format!("waiting:{}", self.reason),
            Action::Fail => format!("failed:{}", self.reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared per-cycle context
// ---------------------------------------------------------------------------

/// Everything a candidate source needs from the current cycle.
pub struct SourceContext<'a> {
    pub cfg: &'a AutoTraderConfig,
    pub datastore: &'a dyn Datastore,
    pub market: &'a dyn MarketDataApi,
    pub signals_api: &'a dyn SignalsApi,
    pub executor: &'a Executor,
    pub state: &'a AppState,
    pub positions: &'a [EnrichedPosition],
    pub drawdown: DrawdownAssessment,
    pub now: DateTime<Utc>,
}

impl SourceContext<'_> {
    pub fn today(&self) -> NaiveDate {
        time_rules::et_date(self.now)
    }

    /// Fresh view of active ledger rows; errors degrade to empty with a
    /// warning rather than aborting the source.
    pub async fn active_trades(&self) -> Vec<Trade> {
        match self.datastore.active_trades().await {
            Ok(trades) => trades,
            Err(e) => {
                warn!(error = %e, "active trade fetch failed — assuming none");
                Vec::new()
            }
        }
    }

    /// Run the layered risk gates for a sized candidate.
    pub async fn risk_check(&self, ticker: &str, new_size: f64, active: &[Trade]) -> GateVerdict {
        let (pending, daily) = {
            let ledger = self.state.ledger.lock();
            (ledger.pending_deployed_dollar, ledger.daily_deployed_dollar)
        };
        RiskGate::new(self.cfg, self.market)
            .evaluate(&TradeCheck {
                ticker,
                new_size,
                positions: self.positions,
                active_trades: active,
                pending_deployed: pending,
                daily_deployed: daily,
            })
            .await
    }

    /// Persist a structured skip event.
    pub async fn record_skip(
        &self,
        ticker: &str,
        mode: TradeMode,
        source: EventSource,
        slug: &str,
        reason: &str,
    ) {
        let event = AutoTradeEvent::new(
            ticker,
            EventType::Warning,
            EventAction::Skipped,
            source,
            Some(mode),
            reason.to_string(),
        )
        .with_metadata(serde_json::json!({ "skip_reason": slug }));
        if let Err(e) = self.datastore.insert_event(&event).await {
            warn!(error = %e, "skip event append failed");
        }
    }
}

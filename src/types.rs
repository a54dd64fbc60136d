// =============================================================================
// Shared domain types — ledger trades, external signals, events, videos
// =============================================================================
//
// Wire format notes: mode and signal serialise as SCREAMING_SNAKE_CASE
// (`DAY_TRADE`, `BUY`), statuses likewise; event/source tags serialise as
// snake_case (`dip_buy`). Every persistent record round-trips JSON so that
// older datastore rows with missing optional fields still deserialise.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Core enums
// ---------------------------------------------------------------------------

/// Trading horizon of a ledger trade or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeMode {
    DayTrade,
    SwingTrade,
    LongTerm,
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::DayTrade
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DayTrade => write!(f, "DAY_TRADE"),
            Self::SwingTrade => write!(f, "SWING_TRADE"),
            Self::LongTerm => write!(f, "LONG_TERM"),
        }
    }
}

/// Direction of a trade: long entry or short entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSignal {
    Buy,
    Sell,
}

impl TradeSignal {
    /// +1.0 for BUY, -1.0 for SELL. Used to sign PnL and R-multiple math.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for TradeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Ledger trade lifecycle.
///
/// Monotonic path: PENDING → SUBMITTED → FILLED/PARTIAL → STOPPED /
/// TARGET_HIT / CLOSED. CANCELLED and REJECTED are terminal forks out of
/// PENDING or SUBMITTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Submitted,
    Filled,
    Partial,
    Stopped,
    TargetHit,
    Closed,
    Cancelled,
    Rejected,
}

impl TradeStatus {
    /// A trade still tracked against the broker: not yet terminal.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Submitted | Self::Filled | Self::Partial
        )
    }

    pub fn is_terminal_close(&self) -> bool {
        matches!(self, Self::Stopped | Self::TargetHit | Self::Closed)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Filled => "FILLED",
            Self::Partial => "PARTIAL",
            Self::Stopped => "STOPPED",
            Self::TargetHit => "TARGET_HIT",
            Self::Closed => "CLOSED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

/// Why a position left the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TargetHit,
    StopLoss,
    Manual,
}

/// How the entry order reached the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryTriggerType {
    Market,
    BracketLimit,
    DipBuy,
    ProfitTake,
    LossCut,
}

impl Default for EntryTriggerType {
    fn default() -> Self {
        Self::Market
    }
}

impl std::fmt::Display for EntryTriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Market => "market",
            Self::BracketLimit => "bracket_limit",
            Self::DipBuy => "dip_buy",
            Self::ProfitTake => "profit_take",
            Self::LossCut => "loss_cut",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Swing entry-log enums (collect-only metrics, nothing gates on these)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacdSlope {
    Increasing,
    Decreasing,
}

/// Broad-market close vs its 50-day and 200-day means on entry day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeAlignment {
    AboveBoth,
    BelowBoth,
    Mixed,
}

// ---------------------------------------------------------------------------
// Trade — the ledger row
// ---------------------------------------------------------------------------

/// A single intended-or-actual trade in the internal ledger.
///
/// Created by the executor, mutated only by the reconciler and the position
/// manager, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub ticker: String,
    pub mode: TradeMode,
    pub signal: TradeSignal,

    #[serde(default)]
    pub strategy_source: Option<String>,
    #[serde(default)]
    pub strategy_url: Option<String>,
    #[serde(default)]
    pub strategy_video_id: Option<String>,
    #[serde(default)]
    pub strategy_video_heading: Option<String>,

    #[serde(default)]
    pub scanner_confidence: Option<f64>,
    #[serde(default)]
    pub fa_confidence: Option<f64>,
    #[serde(default)]
    pub fa_recommendation: Option<String>,

    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub target_price: Option<f64>,
    #[serde(default)]
    pub target_price_2: Option<f64>,
    /// String form "1:X" as produced by the analysis service.
    #[serde(default)]
    pub risk_reward: Option<String>,

    pub quantity: i64,
    /// Dollar size at submission time.
    pub position_size: f64,

    #[serde(default)]
    pub ib_order_id: Option<String>,
    pub status: TradeStatus,

    #[serde(default)]
    pub fill_price: Option<f64>,
    #[serde(default)]
    pub close_price: Option<f64>,
    #[serde(default)]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub pnl_percent: Option<f64>,
    #[serde(default)]
    pub r_multiple: Option<f64>,

    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_reason: Option<CloseReason>,

    #[serde(default)]
    pub entry_trigger_type: EntryTriggerType,
    #[serde(default)]
    pub notes: Option<String>,

    // Entry-log metrics, populated on swing fills only.
    #[serde(default)]
    pub entry_ma20_dist_pct: Option<f64>,
    #[serde(default)]
    pub entry_macd_slope: Option<MacdSlope>,
    #[serde(default)]
    pub entry_volume_ratio_10d: Option<f64>,
    #[serde(default)]
    pub entry_regime_alignment: Option<RegimeAlignment>,

    /// Set once the post-close learning record has been emitted.
    #[serde(default)]
    pub analyzed_at: Option<DateTime<Utc>>,
}

impl Trade {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Initial long-term entries qualify for dip-buys; add-on rows do not.
    pub fn is_dip_buy_row(&self) -> bool {
        self.notes
            .as_deref()
            .map(|n| n.starts_with("Dip buy"))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// ExternalStrategySignal
// ---------------------------------------------------------------------------

/// Lifecycle of an external strategy signal. The status field doubles as a
/// lightweight lock: transitions out of PENDING happen at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Pending,
    Executed,
    Failed,
    Skipped,
    Expired,
    Cancelled,
}

impl SignalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A persisted candidate trade written by an upstream process — either
/// derived from a tracked strategy video or hand-authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalStrategySignal {
    pub id: String,
    pub source_name: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub strategy_video_id: Option<String>,
    #[serde(default)]
    pub strategy_video_heading: Option<String>,

    pub ticker: String,
    pub signal: TradeSignal,
    pub mode: TradeMode,
    /// 1–10.
    pub confidence: u8,

    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub target_price: Option<f64>,
    #[serde(default)]
    pub position_size_override: Option<f64>,

    /// ET calendar date the signal becomes due.
    pub execute_on_date: NaiveDate,
    #[serde(default)]
    pub execute_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub notes: Option<String>,

    pub status: SignalStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub executed_trade_id: Option<String>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl ExternalStrategySignal {
    /// Generic-strategy signals get the lenient duplicate-ticker treatment
    /// and participate in allocation splitting.
    pub fn is_generic_auto(&self) -> bool {
        self.notes
            .as_deref()
            .map(|n| n.to_lowercase().starts_with("generic strategy auto"))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// AutoTradeEvent — append-only audit log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Executed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Scanner,
    SuggestedFinds,
    ExternalSignal,
    DipBuy,
    ProfitTake,
    LossCut,
    System,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scanner => "scanner",
            Self::SuggestedFinds => "suggested_finds",
            Self::ExternalSignal => "external_signal",
            Self::DipBuy => "dip_buy",
            Self::ProfitTake => "profit_take",
            Self::LossCut => "loss_cut",
            Self::System => "system",
        };
        write!(f, "{s}")
    }
}

/// One audit-log entry. Besides auditing, events back the dip-buy cooldown
/// and the per-tier dedup for trims and cuts (via `metadata.tier`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTradeEvent {
    pub id: String,
    pub ticker: String,
    pub event_type: EventType,
    pub action: EventAction,
    pub source: EventSource,
    #[serde(default)]
    pub mode: Option<TradeMode>,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AutoTradeEvent {
    pub fn new(
        ticker: &str,
        event_type: EventType,
        action: EventAction,
        source: EventSource,
        mode: Option<TradeMode>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ticker: ticker.to_string(),
            event_type,
            action,
            source,
            mode,
            message: message.into(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ---------------------------------------------------------------------------
// StrategyVideo — catalogue of tracked video strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    DailySignal,
    GenericStrategy,
}

/// ET wall-clock window ("HH:MM" strings, inclusive of both ends) within
/// which a video's signals may execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionWindowEt {
    pub start: String,
    pub end: String,
}

/// A per-ticker setup extracted from a video transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedSignal {
    pub ticker: String,
    #[serde(default)]
    pub long_trigger_above: Option<f64>,
    #[serde(default)]
    pub long_targets: Vec<f64>,
    #[serde(default)]
    pub short_trigger_below: Option<f64>,
    #[serde(default)]
    pub short_targets: Vec<f64>,
}

/// Catalogue entry for a tracked strategy video. Only `status = "tracked"`
/// entries are consumed by the signal queuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyVideo {
    pub video_id: String,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub canonical_url: Option<String>,
    #[serde(default)]
    pub video_heading: Option<String>,

    pub strategy_type: StrategyType,
    #[serde(default)]
    pub timeframe: Option<TradeMode>,
    #[serde(default)]
    pub applicable_timeframes: Vec<TradeMode>,
    #[serde(default)]
    pub execution_window_et: Option<ExecutionWindowEt>,
    /// Set for daily-signal videos: the ET date the setups apply to.
    #[serde(default)]
    pub trade_date: Option<NaiveDate>,
    #[serde(default)]
    pub extracted_signals: Vec<ExtractedSignal>,

    pub status: String,
    #[serde(default)]
    pub exempt_from_auto_deactivation: bool,
}

impl StrategyVideo {
    pub fn is_tracked(&self) -> bool {
        self.status == "tracked"
    }

    /// Display name used as `source_name` on derived signals.
    pub fn source_label(&self) -> String {
        self.source_name
            .clone()
            .or_else(|| self.source_handle.clone())
            .unwrap_or_else(|| self.video_id.clone())
    }
}

// ---------------------------------------------------------------------------
// EnrichedPosition — per-cycle broker position with live quote data
// ---------------------------------------------------------------------------

/// A broker position joined with a live quote. Ephemeral: rebuilt every
/// cycle, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedPosition {
    pub symbol: String,
    /// Signed share count; negative for shorts.
    pub position: f64,
    pub avg_cost: f64,
    #[serde(default)]
    pub contract_id: Option<i64>,
    #[serde(default)]
    pub mkt_price: f64,
    #[serde(default)]
    pub mkt_value: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
}

impl EnrichedPosition {
    /// Absolute dollars at cost — the allocation measure.
    pub fn cost_basis(&self) -> f64 {
        self.position.abs() * self.avg_cost
    }
}

// ---------------------------------------------------------------------------
// PortfolioSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPosition {
    pub symbol: String,
    pub position: f64,
    pub avg_cost: f64,
    pub mkt_price: f64,
    pub mkt_value: f64,
    pub unrealized_pnl: f64,
}

/// Once-per-day account snapshot, persisted only when broker positions
/// exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub account_id: String,
    pub date: NaiveDate,
    pub total_value: f64,
    pub total_pnl: f64,
    pub positions: Vec<SnapshotPosition>,
    pub open_trade_count: usize,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// TradeLearning — post-hoc analysis record (one per closed trade)
// ---------------------------------------------------------------------------

/// Structured learning record emitted exactly once per newly-closed trade
/// during post-close rehydration. Consumed by dashboards and future AI
/// prompts; the core only writes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLearning {
    pub id: String,
    pub trade_id: String,
    pub ticker: String,
    pub mode: TradeMode,
    pub signal: TradeSignal,
    #[serde(default)]
    pub strategy_source: Option<String>,
    pub outcome: String,
    #[serde(default)]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub pnl_percent: Option<f64>,
    #[serde(default)]
    pub r_multiple: Option<f64>,
    #[serde(default)]
    pub hold_days: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Risk/reward parsing
// ---------------------------------------------------------------------------

/// Parse the analysis service's "1:X" risk/reward string into the X ratio.
/// Returns `None` for anything that does not parse cleanly.
pub fn parse_risk_reward(rr: &str) -> Option<f64> {
    let mut parts = rr.split(':');
    let risk: f64 = parts.next()?.trim().parse().ok()?;
    let reward: f64 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() || risk <= 0.0 {
        return None;
    }
    Some(reward / risk)
}

// =============================================================================
// AutoTraderConfig — behavioural settings loaded from the datastore
// =============================================================================
//
// The singleton record (id = "default") holding every threshold, cap, and
// feature toggle the trading cycle consults. Loaded fresh at the top of each
// cycle so dashboard edits take effect without a restart.
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older record.
// =============================================================================

use serde::{Deserialize, Serialize};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_max_positions() -> u32 {
    5
}

fn default_position_size() -> f64 {
    5_000.0
}

fn default_portfolio_value() -> f64 {
    100_000.0
}

fn default_max_total_allocation() -> f64 {
    50_000.0
}

fn default_max_daily_deployment() -> f64 {
    10_000.0
}

fn default_max_position_pct() -> f64 {
    5.0
}

fn default_base_allocation_pct() -> f64 {
    2.0
}

fn default_risk_per_trade_pct() -> f64 {
    1.0
}

fn default_max_sector_pct() -> f64 {
    100.0
}

fn default_earnings_blackout_days() -> u32 {
    3
}

fn default_dip_tier_pcts() -> (f64, f64, f64) {
    (8.0, 15.0, 25.0)
}

fn default_dip_tier1_pct() -> f64 {
    default_dip_tier_pcts().0
}

fn default_dip_tier2_pct() -> f64 {
    default_dip_tier_pcts().1
}

fn default_dip_tier3_pct() -> f64 {
    default_dip_tier_pcts().2
}

fn default_dip_tier1_size_pct() -> f64 {
    25.0
}

fn default_dip_tier2_size_pct() -> f64 {
    35.0
}

fn default_dip_tier3_size_pct() -> f64 {
    50.0
}

fn default_dip_buy_cooldown_hours() -> u32 {
    72
}

fn default_profit_tier1_pct() -> f64 {
    20.0
}

fn default_profit_tier2_pct() -> f64 {
    40.0
}

fn default_profit_tier3_pct() -> f64 {
    60.0
}

fn default_profit_tier1_trim_pct() -> f64 {
    20.0
}

fn default_profit_tier2_trim_pct() -> f64 {
    25.0
}

fn default_profit_tier3_trim_pct() -> f64 {
    30.0
}

fn default_min_hold_pct() -> f64 {
    50.0
}

fn default_loss_tier1_pct() -> f64 {
    10.0
}

fn default_loss_tier2_pct() -> f64 {
    15.0
}

fn default_loss_tier3_pct() -> f64 {
    20.0
}

fn default_loss_tier1_sell_pct() -> f64 {
    33.0
}

fn default_loss_tier2_sell_pct() -> f64 {
    50.0
}

fn default_loss_tier3_sell_pct() -> f64 {
    100.0
}

fn default_loss_cut_min_hold_days() -> i64 {
    5
}

fn default_min_scanner_confidence() -> f64 {
    7.0
}

fn default_min_fa_confidence() -> f64 {
    7.0
}

fn default_min_suggested_finds_conviction() -> f64 {
    7.0
}

fn default_deactivation_loss_days() -> u32 {
    3
}

// =============================================================================
// Tier views
// =============================================================================

/// One threshold/size pair from a three-tier table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tier {
    /// 1-based tier index, used in event metadata for dedup.
    pub index: u8,
    /// Trigger threshold as a positive percentage magnitude.
    pub trigger_pct: f64,
    /// Action size as a percentage (of initial qty, current qty, …).
    pub size_pct: f64,
}

// =============================================================================
// AutoTraderConfig
// =============================================================================

/// The `auto_trader_config` singleton (`id = "default"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTraderConfig {
    // --- Master switches -----------------------------------------------------

    /// Master kill-switch. False short-circuits every cycle.
    #[serde(default)]
    pub enabled: bool,

    /// Brokerage account id. Absence short-circuits the cycle.
    #[serde(default)]
    pub account_id: Option<String>,

    // --- Position limits & sizing --------------------------------------------

    /// Hard ceiling on simultaneous active ledger rows.
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    /// Fallback fixed dollar size (non-dynamic, or when no stop/entry).
    #[serde(default = "default_position_size")]
    pub position_size: f64,

    /// Switch between fixed and dynamic sizing.
    #[serde(default = "default_true")]
    pub use_dynamic_sizing: bool,

    /// Denominator for percentage caps. Self-updates from broker positions
    /// and only ever grows.
    #[serde(default = "default_portfolio_value")]
    pub portfolio_value: f64,

    /// Absolute dollar cap across all positions.
    #[serde(default = "default_max_total_allocation")]
    pub max_total_allocation: f64,

    /// Absolute dollar cap per ET calendar day.
    #[serde(default = "default_max_daily_deployment")]
    pub max_daily_deployment: f64,

    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,

    #[serde(default = "default_base_allocation_pct")]
    pub base_allocation_pct: f64,

    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: f64,

    // --- Risk gates ----------------------------------------------------------

    /// Sector-cap gate; 100 or above disables it.
    #[serde(default = "default_max_sector_pct")]
    pub max_sector_pct: f64,

    #[serde(default)]
    pub earnings_avoid_enabled: bool,

    #[serde(default = "default_earnings_blackout_days")]
    pub earnings_blackout_days: u32,

    /// Consecutive net-loss ET days before a strategy scope is deactivated.
    #[serde(default = "default_deactivation_loss_days")]
    pub deactivation_loss_days: u32,

    // --- Dip-buy tiers (long-term add-ons) ------------------------------------

    #[serde(default = "default_true")]
    pub dip_buy_enabled: bool,
    #[serde(default = "default_dip_tier1_pct")]
    pub dip_buy_tier1_pct: f64,
    #[serde(default = "default_dip_tier2_pct")]
    pub dip_buy_tier2_pct: f64,
    #[serde(default = "default_dip_tier3_pct")]
    pub dip_buy_tier3_pct: f64,
    #[serde(default = "default_dip_tier1_size_pct")]
    pub dip_buy_tier1_size_pct: f64,
    #[serde(default = "default_dip_tier2_size_pct")]
    pub dip_buy_tier2_size_pct: f64,
    #[serde(default = "default_dip_tier3_size_pct")]
    pub dip_buy_tier3_size_pct: f64,
    #[serde(default = "default_dip_buy_cooldown_hours")]
    pub dip_buy_cooldown_hours: u32,

    // --- Profit-take tiers (long-term trims) ----------------------------------

    #[serde(default = "default_true")]
    pub profit_take_enabled: bool,
    #[serde(default = "default_profit_tier1_pct")]
    pub profit_take_tier1_pct: f64,
    #[serde(default = "default_profit_tier2_pct")]
    pub profit_take_tier2_pct: f64,
    #[serde(default = "default_profit_tier3_pct")]
    pub profit_take_tier3_pct: f64,
    #[serde(default = "default_profit_tier1_trim_pct")]
    pub profit_take_tier1_trim_pct: f64,
    #[serde(default = "default_profit_tier2_trim_pct")]
    pub profit_take_tier2_trim_pct: f64,
    #[serde(default = "default_profit_tier3_trim_pct")]
    pub profit_take_tier3_trim_pct: f64,
    /// Floor on the retained fraction of the original quantity.
    #[serde(default = "default_min_hold_pct")]
    pub min_hold_pct: f64,

    // --- Loss-cut tiers (long-term + swing exits) -----------------------------

    #[serde(default = "default_true")]
    pub loss_cut_enabled: bool,
    #[serde(default = "default_loss_tier1_pct")]
    pub loss_cut_tier1_pct: f64,
    #[serde(default = "default_loss_tier2_pct")]
    pub loss_cut_tier2_pct: f64,
    #[serde(default = "default_loss_tier3_pct")]
    pub loss_cut_tier3_pct: f64,
    #[serde(default = "default_loss_tier1_sell_pct")]
    pub loss_cut_tier1_sell_pct: f64,
    #[serde(default = "default_loss_tier2_sell_pct")]
    pub loss_cut_tier2_sell_pct: f64,
    #[serde(default = "default_loss_tier3_sell_pct")]
    pub loss_cut_tier3_sell_pct: f64,
    #[serde(default = "default_loss_cut_min_hold_days")]
    pub loss_cut_min_hold_days: i64,

    // --- Intake thresholds ----------------------------------------------------

    #[serde(default = "default_min_scanner_confidence")]
    pub min_scanner_confidence: f64,
    #[serde(default = "default_min_fa_confidence")]
    pub min_fa_confidence: f64,
    #[serde(default = "default_min_suggested_finds_conviction")]
    pub min_suggested_finds_conviction: f64,
}

impl Default for AutoTraderConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises from defaults")
    }
}

impl AutoTraderConfig {
    /// Per-position absolute dollar cap: 10 % of the total allocation.
    pub fn hard_position_cap(&self) -> f64 {
        0.10 * self.max_total_allocation
    }

    /// Dip-buy tiers ordered by ascending dip magnitude (tier 1 shallowest).
    pub fn dip_tiers(&self) -> [Tier; 3] {
        [
            Tier {
                index: 1,
                trigger_pct: self.dip_buy_tier1_pct,
                size_pct: self.dip_buy_tier1_size_pct,
            },
            Tier {
                index: 2,
                trigger_pct: self.dip_buy_tier2_pct,
                size_pct: self.dip_buy_tier2_size_pct,
            },
            Tier {
                index: 3,
                trigger_pct: self.dip_buy_tier3_pct,
                size_pct: self.dip_buy_tier3_size_pct,
            },
        ]
    }

    /// Profit-take tiers ordered by ascending gain threshold.
    pub fn profit_tiers(&self) -> [Tier; 3] {
        [
            Tier {
                index: 1,
                trigger_pct: self.profit_take_tier1_pct,
                size_pct: self.profit_take_tier1_trim_pct,
            },
            Tier {
                index: 2,
                trigger_pct: self.profit_take_tier2_pct,
                size_pct: self.profit_take_tier2_trim_pct,
            },
            Tier {
                index: 3,
                trigger_pct: self.profit_take_tier3_pct,
                size_pct: self.profit_take_tier3_trim_pct,
            },
        ]
    }

    /// Loss-cut tiers ordered by ascending loss magnitude.
    pub fn loss_tiers(&self) -> [Tier; 3] {
        [
            Tier {
                index: 1,
                trigger_pct: self.loss_cut_tier1_pct,
                size_pct: self.loss_cut_tier1_sell_pct,
            },
            Tier {
                index: 2,
                trigger_pct: self.loss_cut_tier2_pct,
                size_pct: self.loss_cut_tier2_sell_pct,
            },
            Tier {
                index: 3,
                trigger_pct: self.loss_cut_tier3_pct,
                size_pct: self.loss_cut_tier3_sell_pct,
            },
        ]
    }
}

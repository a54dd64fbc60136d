// =============================================================================
// Position sizing — fixed, conviction-weighted, risk-based, dynamic caps
// =============================================================================
//
// Sizing never decides *whether* to trade, only *how much*. The risk gates
// run separately; the only hard rule here is the per-position absolute cap
// of 10 % of the total allocation, applied in every mode.
//
// Dollar floors and multipliers:
//   - fixed path: min(position_size, hard cap), used when dynamic sizing is
//     off or no usable price exists
//   - long-term with conviction: base allocation scaled by the conviction
//     ladder (Gold Mine capped at 1.25x then dampened 0.75x)
//   - entry + stop: risk-budget sizing from the stop distance
//   - everything dynamic is then scaled by regime and drawdown multipliers
//     and clamped into [$100, max dollar]
// =============================================================================

use crate::config::AutoTraderConfig;
use crate::types::TradeMode;

/// Minimum dollar size after multipliers; anything smaller clamps up.
const MIN_DOLLAR_SIZE: f64 = 100.0;

/// Inputs to one sizing decision.
#[derive(Debug, Clone)]
pub struct SizeRequest {
    pub price: f64,
    pub mode: TradeMode,
    /// 0–10 conviction for long-term candidates.
    pub conviction: Option<f64>,
    /// True for Gold Mine suggested finds (capped + dampened multiplier).
    pub gold_mine: bool,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub regime_multiplier: f64,
    pub drawdown_multiplier: f64,
}

impl SizeRequest {
    pub fn market(price: f64, mode: TradeMode) -> Self {
        Self {
            price,
            mode,
            conviction: None,
            gold_mine: false,
            entry_price: None,
            stop_loss: None,
            regime_multiplier: 1.0,
            drawdown_multiplier: 1.0,
        }
    }

    pub fn with_levels(mut self, entry: Option<f64>, stop: Option<f64>) -> Self {
        self.entry_price = entry;
        self.stop_loss = stop;
        self
    }

    pub fn with_conviction(mut self, conviction: f64, gold_mine: bool) -> Self {
        self.conviction = Some(conviction);
        self.gold_mine = gold_mine;
        self
    }

    pub fn with_drawdown(mut self, multiplier: f64) -> Self {
        self.drawdown_multiplier = multiplier;
        self
    }
}

/// Computed size: whole shares plus the dollars they cost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSize {
    pub quantity: i64,
    pub dollars: f64,
}

/// Conviction ladder for long-term entries.
fn conviction_multiplier(conviction: f64, gold_mine: bool) -> f64 {
    let mult: f64 = if conviction >= 10.0 {
        1.5
    } else if conviction >= 9.0 {
        1.25
    } else if conviction >= 8.0 {
        1.0
    } else if conviction >= 7.0 {
        0.75
    } else {
        0.5
    };
    if gold_mine {
        // Speculative tag: cap the upside and dampen the whole size.
        mult.min(1.25) * 0.75
    } else {
        mult
    }
}

fn shares_for(size: f64, price: f64) -> i64 {
    if price > 0.0 {
        ((size / price).floor() as i64).max(1)
    } else {
        1
    }
}

/// Compute quantity and dollar size for one candidate entry.
pub fn compute(cfg: &AutoTraderConfig, req: &SizeRequest) -> PositionSize {
    let alloc = cfg.max_total_allocation;
    let hard_max = cfg.hard_position_cap();

    // Fixed path: dynamic sizing off, or no usable price to divide by.
    if !cfg.use_dynamic_sizing || req.price <= 0.0 {
        let size = cfg.position_size.min(hard_max);
        let quantity = shares_for(size, req.price);
        return PositionSize {
            quantity,
            dollars: quantity as f64 * req.price.max(0.0),
        };
    }

    let max_dollar = (cfg.portfolio_value * cfg.max_position_pct / 100.0).min(hard_max);

    let mut size = match (req.mode, req.conviction, req.entry_price, req.stop_loss) {
        // Long-term with a conviction score: base allocation x ladder.
        (TradeMode::LongTerm, Some(conviction), _, _) => {
            let base = alloc * cfg.base_allocation_pct / 100.0;
            base * conviction_multiplier(conviction, req.gold_mine)
        }
        // Entry and stop known: risk a fixed budget against the stop
        // distance.
        (_, _, Some(entry), Some(stop)) if (entry - stop).abs() > f64::EPSILON => {
            let risk_budget = alloc * cfg.risk_per_trade_pct / 100.0;
            let qty = (risk_budget / (entry - stop).abs()).floor();
            qty * req.price
        }
        _ => cfg.position_size,
    };

    size *= req.regime_multiplier * req.drawdown_multiplier;
    size = size.clamp(MIN_DOLLAR_SIZE, max_dollar.max(MIN_DOLLAR_SIZE));

    let quantity = shares_for(size, req.price);
    PositionSize {
        quantity,
        dollars: quantity as f64 * req.price,
    }
}

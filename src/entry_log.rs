// =============================================================================
// Swing entry log — collect-only context metrics captured at fill time
// =============================================================================
//
// When a swing trade fills, four pieces of context are recorded from daily
// bars ending today: stretch from the 20-day mean, MACD-histogram slope,
// entry-day volume vs its 10-day baseline, and broad-market regime
// alignment. Nothing is gated on these; they exist so closed trades can be
// studied against the conditions they were entered under. Any metric whose
// inputs are unavailable is simply left empty.
// =============================================================================

use tracing::debug;

use crate::indicators;
use crate::services::market::{MarketDataApi, MARKET_SYMBOL};
use crate::types::{MacdSlope, RegimeAlignment};

/// Metrics computed at swing fill time. Every field is optional; missing
/// bars drop individual fields, never the fill itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryLogMetrics {
    pub ma20_dist_pct: Option<f64>,
    pub macd_slope: Option<MacdSlope>,
    pub volume_ratio_10d: Option<f64>,
    pub regime_alignment: Option<RegimeAlignment>,
}

/// Compute the entry-log metrics for a fill at `fill_price`.
pub async fn compute(market: &dyn MarketDataApi, ticker: &str, fill_price: f64) -> EntryLogMetrics {
    let mut metrics = EntryLogMetrics::default();

    if let Some(bars) = market.daily_bars(ticker).await {
        if fill_price > 0.0 {
            if let Some(ma20) = indicators::sma(&bars.closes, 20) {
                if ma20 > 0.0 {
                    metrics.ma20_dist_pct = Some((fill_price - ma20) / ma20 * 100.0);
                }
            }
        }

        if let Some(hist) = indicators::macd_histogram(&bars.closes, 12, 26, 9) {
            let last = hist[hist.len() - 1];
            let prev = hist[hist.len() - 2];
            metrics.macd_slope = Some(if last > prev {
                MacdSlope::Increasing
            } else {
                MacdSlope::Decreasing
            });
        }

        if let (Some(entry_volume), Some(avg)) = (
            bars.volumes.last().copied(),
            indicators::trailing_avg_volume(&bars.volumes, 10),
        ) {
            metrics.volume_ratio_10d = Some(entry_volume / avg);
        }
    }

    metrics.regime_alignment = market_alignment(market).await;

    debug!(ticker, ?metrics, "swing entry log computed");
    metrics
}

/// Broad-market close vs its 50-day and 200-day means.
async fn market_alignment(market: &dyn MarketDataApi) -> Option<RegimeAlignment> {
    let bars = market.daily_bars(MARKET_SYMBOL).await?;
    let close = *bars.closes.last()?;
    let ma50 = indicators::sma(&bars.closes, 50)?;
    let ma200 = indicators::sma(&bars.closes, 200)?;

    Some(if close > ma50 && close > ma200 {
        RegimeAlignment::AboveBoth
    } else if close < ma50 && close < ma200 {
        RegimeAlignment::BelowBoth
    } else {
        RegimeAlignment::Mixed
    })
}

// =============================================================================
// Technical indicators used by the swing entry log
// =============================================================================
//
// Pure, side-effect-free helpers over daily close/volume series. Every public
// function returns `Option<T>` so callers are forced to handle
// insufficient-data and numerical-edge-case scenarios. These feed the
// collect-only entry-log metrics; no trading decision is gated on them.
// =============================================================================

/// Simple moving average of the trailing `period` values.
///
/// Returns `None` when the series is shorter than `period`, the period is
/// zero, or the mean is non-finite.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let mean = values[values.len() - period..].iter().sum::<f64>() / period as f64;
    mean.is_finite().then_some(mean)
}

/// Exponential moving average series.
///
/// Seeded with the SMA of the first `period` values; each output element
/// corresponds to a close starting at index `period - 1`. Stops early on a
/// non-finite value — downstream consumers should not trust a broken series.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);
    let mut prev = seed;
    for &v in &values[period..] {
        let next = v * alpha + prev * (1.0 - alpha);
        if !next.is_finite() {
            break;
        }
        out.push(next);
        prev = next;
    }
    out
}

/// MACD histogram series: (EMA12 − EMA26) minus its 9-period signal EMA.
///
/// Returns `None` when the close series cannot support the 26-period slow
/// EMA plus the 9-period signal seed.
pub fn macd_histogram(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Vec<f64>> {
    if fast == 0 || slow <= fast || signal == 0 || closes.len() < slow + signal {
        return None;
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align the two series on their tails: both end at the latest close.
    let skip = fast_series.len().checked_sub(slow_series.len())?;
    let macd_line: Vec<f64> = fast_series[skip..]
        .iter()
        .zip(slow_series.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_line = ema_series(&macd_line, signal);
    if signal_line.is_empty() {
        return None;
    }

    let skip = macd_line.len().checked_sub(signal_line.len())?;
    let hist: Vec<f64> = macd_line[skip..]
        .iter()
        .zip(signal_line.iter())
        .map(|(m, s)| m - s)
        .collect();

    (hist.len() >= 2).then_some(hist)
}

/// Mean of the trailing `period` volumes, excluding the final element
/// (the entry day itself).
pub fn trailing_avg_volume(volumes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || volumes.len() < period + 1 {
        return None;
    }
    let window = &volumes[volumes.len() - 1 - period..volumes.len() - 1];
    let mean = window.iter().sum::<f64>() / period as f64;
    (mean.is_finite() && mean > 0.0).then_some(mean)
}

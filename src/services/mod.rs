// =============================================================================
// External HTTP services consumed by the trading cycle
// =============================================================================
//
// Two seams: `market` (quotes, earnings calendar, industry lookup, daily
// bars) and `signals` (trade scanner, full analysis, daily suggestions).
// Every call fails open — a missing or malformed response is "data
// unavailable", never an error that blocks trading.

pub mod market;
pub mod signals;

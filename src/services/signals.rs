// =============================================================================
// Signal services — trade scanner, full analysis, daily suggestions
// =============================================================================
//
// These are internal HTTP services (POST + JSON, camelCase wire format).
// Analysis calls can take a long time, so that client runs with a wider
// timeout than the rest of the stack. Every method fails open.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::types::{TradeMode, TradeSignal};

/// Analysis calls may run a full model pass; tolerate up to this long.
const ANALYSIS_TIMEOUT_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

/// One candidate from the trade scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIdea {
    pub ticker: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub change: Option<f64>,
    #[serde(default, rename = "changePercent")]
    pub change_percent: Option<f64>,
    pub signal: TradeSignal,
    /// 0–10.
    pub confidence: f64,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub mode: TradeMode,
    #[serde(default)]
    pub in_play_score: Option<f64>,
    #[serde(default)]
    pub pass1_confidence: Option<f64>,
    #[serde(default)]
    pub market_condition: Option<String>,
}

/// Scanner output split by timeframe.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResults {
    #[serde(default)]
    pub day_trades: Vec<TradeIdea>,
    #[serde(default)]
    pub swing_trades: Vec<TradeIdea>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Buy,
    Sell,
    Hold,
}

impl Recommendation {
    pub fn matches(&self, signal: TradeSignal) -> bool {
        matches!(
            (self, signal),
            (Self::Buy, TradeSignal::Buy) | (Self::Sell, TradeSignal::Sell)
        )
    }
}

/// Full-analysis verdict for one ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullAnalysis {
    pub recommendation: Recommendation,
    pub confidence: f64,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub target_price: Option<f64>,
    #[serde(default)]
    pub target_price_2: Option<f64>,
    /// String form "1:X".
    #[serde(default)]
    pub risk_reward: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// One curated long-term candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedFind {
    pub ticker: String,
    /// 0–10.
    pub conviction: f64,
    #[serde(default)]
    pub valuation_tag: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Daily-suggestions payload. Only cached responses are honoured.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySuggestions {
    #[serde(default)]
    pub compounders: Vec<SuggestedFind>,
    #[serde(default)]
    pub gold_mines: Vec<SuggestedFind>,
}

// ---------------------------------------------------------------------------
// Trait seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SignalsApi: Send + Sync {
    /// Scanner candidates, excluding the given portfolio tickers.
    async fn scan_ideas(&self, portfolio_tickers: &[String]) -> Option<ScanResults>;

    /// Full analysis for one ticker in one mode.
    async fn full_analysis(&self, ticker: &str, mode: TradeMode) -> Option<FullAnalysis>;

    /// Cached daily long-term suggestions; `None` when the service has no
    /// cached list yet (uncached responses are discarded, not awaited).
    async fn daily_suggestions(&self) -> Option<DailySuggestions>;
}

// ---------------------------------------------------------------------------
// Concrete client
// ---------------------------------------------------------------------------

pub struct SignalServiceClient {
    base_url: String,
    client: reqwest::Client,
    analysis_client: reqwest::Client,
}

impl SignalServiceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");
        let analysis_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(ANALYSIS_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
            analysis_client,
        }
    }
}

#[async_trait]
impl SignalsApi for SignalServiceClient {
    async fn scan_ideas(&self, portfolio_tickers: &[String]) -> Option<ScanResults> {
        let url = format!("{}/trade-scanner", self.base_url);
        let payload = json!({ "portfolioTickers": portfolio_tickers });

        let resp = match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(status = %resp.status(), "trade scanner rejected request");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "trade scanner unreachable");
                return None;
            }
        };

        match resp.json::<ScanResults>().await {
            Ok(results) => {
                debug!(
                    day = results.day_trades.len(),
                    swing = results.swing_trades.len(),
                    "scanner ideas fetched"
                );
                Some(results)
            }
            Err(e) => {
                warn!(error = %e, "trade scanner response malformed");
                None
            }
        }
    }

    async fn full_analysis(&self, ticker: &str, mode: TradeMode) -> Option<FullAnalysis> {
        let url = format!("{}/trading-signals", self.base_url);
        let payload = json!({ "ticker": ticker, "mode": mode });

        let resp = match self.analysis_client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(ticker, status = %resp.status(), "analysis service rejected request");
                return None;
            }
            Err(e) => {
                warn!(ticker, error = %e, "analysis service unreachable");
                return None;
            }
        };

        let body: serde_json::Value = resp.json().await.ok()?;
        match serde_json::from_value::<FullAnalysis>(body["trade"].clone()) {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                warn!(ticker, error = %e, "analysis response malformed");
                None
            }
        }
    }

    async fn daily_suggestions(&self) -> Option<DailySuggestions> {
        let url = format!("{}/daily-suggestions", self.base_url);

        let resp = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(status = %resp.status(), "daily suggestions rejected request");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "daily suggestions unreachable");
                return None;
            }
        };

        let body: serde_json::Value = resp.json().await.ok()?;
        if !body["cached"].as_bool().unwrap_or(false) {
            debug!("daily suggestions not cached yet — skipping");
            return None;
        }
        serde_json::from_value::<DailySuggestions>(body["data"].clone()).ok()
    }
}

impl std::fmt::Debug for SignalServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalServiceClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Stub for tests
// =============================================================================
#[cfg(test)]
pub mod stub {
    use std::collections::HashMap;

    use super::*;

    /// Scriptable signal services. Analyses are keyed by ticker.
    #[derive(Default)]
    pub struct StubSignals {
        pub scan: Option<ScanResults>,
        pub analyses: HashMap<String, FullAnalysis>,
        pub suggestions: Option<DailySuggestions>,
    }

    impl StubSignals {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_analysis(mut self, ticker: &str, analysis: FullAnalysis) -> Self {
            self.analyses.insert(ticker.to_string(), analysis);
            self
        }

        pub fn with_scan(mut self, scan: ScanResults) -> Self {
            self.scan = Some(scan);
            self
        }

        pub fn with_suggestions(mut self, suggestions: DailySuggestions) -> Self {
            self.suggestions = Some(suggestions);
            self
        }
    }

    #[async_trait]
    impl SignalsApi for StubSignals {
        async fn scan_ideas(&self, _portfolio_tickers: &[String]) -> Option<ScanResults> {
            self.scan.clone()
        }

        async fn full_analysis(&self, ticker: &str, _mode: TradeMode) -> Option<FullAnalysis> {
            self.analyses.get(ticker).cloned()
        }

        async fn daily_suggestions(&self) -> Option<DailySuggestions> {
            self.suggestions.clone()
        }
    }
}

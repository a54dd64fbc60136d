// =============================================================================
// Market data services — quote, earnings calendar, industry, daily bars
// =============================================================================
//
// The quote/calendar/profile endpoints are keyed REST lookups; daily bars
// come from a chart endpoint (1y of daily closes and volumes). All methods
// return `Option`: a transport failure or a response missing required fields
// logs a warning and yields `None`, and callers skip the affected check.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::indicators;

/// Broad-market symbol used for regime checks and entry-log alignment.
pub const MARKET_SYMBOL: &str = "SPY";

/// How long a cached market-regime verdict stays fresh.
const REGIME_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// One year of daily bars, oldest first.
#[derive(Debug, Clone, Default)]
pub struct DailyBars {
    pub closes: Vec<f64>,
    pub volumes: Vec<f64>,
}

// ---------------------------------------------------------------------------
// Trait seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MarketDataApi: Send + Sync {
    /// Last traded price, `None` when unavailable.
    async fn quote(&self, symbol: &str) -> Option<f64>;

    /// Earnings dates for `symbol` inside `[from, to]`.
    async fn upcoming_earnings(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Option<Vec<NaiveDate>>;

    /// Industry label for the sector cap. Cached for the process lifetime
    /// by the concrete client.
    async fn industry(&self, symbol: &str) -> Option<String>;

    /// Daily closes and volumes ending today, oldest first.
    async fn daily_bars(&self, symbol: &str) -> Option<DailyBars>;
}

// ---------------------------------------------------------------------------
// Concrete client
// ---------------------------------------------------------------------------

/// REST client for the quote/calendar/profile provider plus the chart
/// endpoint for daily bars.
pub struct MarketDataClient {
    quote_base: String,
    chart_base: String,
    api_key: String,
    client: reqwest::Client,
    /// Per-process, monotonically growing; tolerates stale entries.
    industry_cache: RwLock<HashMap<String, String>>,
}

impl MarketDataClient {
    pub fn new(
        quote_base: impl Into<String>,
        chart_base: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            quote_base: quote_base.into(),
            chart_base: chart_base.into(),
            api_key: api_key.into(),
            client,
            industry_cache: RwLock::new(HashMap::new()),
        }
    }

    async fn get_json(&self, url: &str) -> Option<serde_json::Value> {
        match self.client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(body) => Some(body),
                Err(e) => {
                    warn!(error = %e, "market data response parse failed");
                    None
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "market data request rejected");
                None
            }
            Err(e) => {
                warn!(error = %e, "market data request failed");
                None
            }
        }
    }
}

#[async_trait]
impl MarketDataApi for MarketDataClient {
    async fn quote(&self, symbol: &str) -> Option<f64> {
        let url = format!(
            "{}/quote?symbol={}&token={}",
            self.quote_base, symbol, self.api_key
        );
        let body = self.get_json(&url).await?;
        let last = body["c"].as_f64().filter(|c| *c > 0.0);
        if last.is_none() {
            debug!(symbol, "quote unavailable");
        }
        last
    }

    async fn upcoming_earnings(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Option<Vec<NaiveDate>> {
        let url = format!(
            "{}/calendar/earnings?symbol={}&from={}&to={}&token={}",
            self.quote_base, symbol, from, to, self.api_key
        );
        let body = self.get_json(&url).await?;
        let events = body["earningsCalendar"].as_array()?;
        let dates = events
            .iter()
            .filter(|e| e["symbol"].as_str() == Some(symbol))
            .filter_map(|e| e["date"].as_str())
            .filter_map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .collect();
        Some(dates)
    }

    async fn industry(&self, symbol: &str) -> Option<String> {
        if let Some(hit) = self.industry_cache.read().get(symbol) {
            return Some(hit.clone());
        }

        let url = format!(
            "{}/stock/profile2?symbol={}&token={}",
            self.quote_base, symbol, self.api_key
        );
        let body = self.get_json(&url).await?;
        let industry = body["finnhubIndustry"].as_str()?.trim().to_string();
        if industry.is_empty() {
            return None;
        }

        self.industry_cache
            .write()
            .insert(symbol.to_string(), industry.clone());
        Some(industry)
    }

    async fn daily_bars(&self, symbol: &str) -> Option<DailyBars> {
        let url = format!(
            "{}/v8/finance/chart/{}?range=1y&interval=1d",
            self.chart_base, symbol
        );
        let body = self.get_json(&url).await?;
        let quote = &body["chart"]["result"][0]["indicators"]["quote"][0];

        let series = |key: &str| -> Vec<f64> {
            quote[key]
                .as_array()
                .map(|arr| arr.iter().filter_map(|v| v.as_f64()).collect())
                .unwrap_or_default()
        };

        let bars = DailyBars {
            closes: series("close"),
            volumes: series("volume"),
        };
        if bars.closes.is_empty() {
            warn!(symbol, "daily bars unavailable");
            return None;
        }
        Some(bars)
    }
}

impl std::fmt::Debug for MarketDataClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataClient")
            .field("quote_base", &self.quote_base)
            .field("chart_base", &self.chart_base)
            .field("industry_cache_len", &self.industry_cache.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Market regime cache
// ---------------------------------------------------------------------------

/// Time-bounded memo of "is the broad market above its 200-day mean".
/// Tolerates staleness by design; no invalidation.
#[derive(Default)]
pub struct RegimeCache {
    cached: Mutex<Option<(Instant, bool)>>,
}

impl RegimeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(true)` when the market symbol last closed above its 200-day
    /// mean; `None` when bars are unavailable (callers fail open).
    pub async fn market_above_200d(&self, api: &dyn MarketDataApi) -> Option<bool> {
        if let Some((at, verdict)) = *self.cached.lock() {
            if at.elapsed() < REGIME_CACHE_TTL {
                return Some(verdict);
            }
        }

        let bars = api.daily_bars(MARKET_SYMBOL).await?;
        let last_close = *bars.closes.last()?;
        let ma200 = indicators::sma(&bars.closes, 200)?;
        let verdict = last_close > ma200;

        *self.cached.lock() = Some((Instant::now(), verdict));
        debug!(last_close, ma200, verdict, "market regime refreshed");
        Some(verdict)
    }
}

// =============================================================================
// REST datastore client — PostgREST-style filters, apikey header auth
// =============================================================================
//
// Every call is a plain HTTP round-trip; the row shapes are the serde types
// from `types.rs`, so unknown columns returned by the server are ignored and
// missing optionals deserialise to their defaults.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use tracing::debug;

use super::{Datastore, SignalKey, SignalTransition};
use crate::config::AutoTraderConfig;
use crate::types::{
    AutoTradeEvent, EventSource, ExternalStrategySignal, PortfolioSnapshot, SignalStatus,
    StrategyVideo, Trade, TradeLearning, TradeMode,
};

const ACTIVE_STATUSES: &str = "in.(PENDING,SUBMITTED,FILLED,PARTIAL)";
const CLOSED_STATUSES: &str = "in.(STOPPED,TARGET_HIT,CLOSED)";

/// HTTP client for the datastore's REST surface.
pub struct RestDatastore {
    base_url: String,
    client: reqwest::Client,
}

impl RestDatastore {
    /// Create a client for `base_url` (no trailing slash) authenticated with
    /// `api_key`, sent as both `apikey` and bearer headers.
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(api_key) {
            headers.insert("apikey", val);
        }
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
            headers.insert("Authorization", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, "RestDatastore initialised");

        Self { base_url, client }
    }

    fn table_url(&self, table: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}/rest/v1/{table}", self.base_url)
        } else {
            format!("{}/rest/v1/{table}?{query}", self.base_url)
        }
    }

    /// GET rows matching `query` and deserialise them.
    async fn select<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> Result<Vec<T>> {
        let url = self.table_url(table, query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {table} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("datastore GET {table} returned {status}: {body}");
        }

        resp.json::<Vec<T>>()
            .await
            .with_context(|| format!("failed to parse {table} rows"))
    }

    /// POST one row.
    async fn insert<T: serde::Serialize>(&self, table: &str, row: &T) -> Result<()> {
        let url = self.table_url(table, "");
        let resp = self
            .client
            .post(&url)
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await
            .with_context(|| format!("POST {table} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("datastore POST {table} returned {status}: {body}");
        }
        Ok(())
    }

    /// PATCH rows matching `query`; returns how many rows were updated.
    async fn patch(&self, table: &str, query: &str, body: serde_json::Value) -> Result<usize> {
        let url = self.table_url(table, query);
        let resp = self
            .client
            .patch(&url)
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("PATCH {table} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("datastore PATCH {table} returned {status}: {body}");
        }

        let rows: Vec<serde_json::Value> =
            resp.json().await.with_context(|| format!("failed to parse {table} patch reply"))?;
        Ok(rows.len())
    }
}

#[async_trait]
impl Datastore for RestDatastore {
    async fn load_config(&self) -> Result<Option<AutoTraderConfig>> {
        let rows: Vec<AutoTraderConfig> = self
            .select("auto_trader_config", "id=eq.default&limit=1")
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn update_portfolio_value(&self, value: f64) -> Result<()> {
        self.patch(
            "auto_trader_config",
            "id=eq.default",
            json!({ "portfolio_value": value }),
        )
        .await?;
        Ok(())
    }

    async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        self.insert("paper_trades", trade).await
    }

    async fn update_trade(&self, trade: &Trade) -> Result<()> {
        let query = format!("id=eq.{}", trade.id);
        let body = serde_json::to_value(trade).context("serialise trade")?;
        self.patch("paper_trades", &query, body).await?;
        Ok(())
    }

    async fn active_trades(&self) -> Result<Vec<Trade>> {
        self.select("paper_trades", &format!("status={ACTIVE_STATUSES}"))
            .await
    }

    async fn recent_closed_trades(
        &self,
        source_name: &str,
        strategy_video_id: Option<&str>,
        mode: TradeMode,
        limit: usize,
    ) -> Result<Vec<Trade>> {
        let mut query = format!(
            "status={CLOSED_STATUSES}&strategy_source=eq.{source_name}&mode=eq.{mode}\
             &order=closed_at.desc&limit={limit}"
        );
        if let Some(video_id) = strategy_video_id {
            query.push_str(&format!("&strategy_video_id=eq.{video_id}"));
        }
        self.select("paper_trades", &query).await
    }

    async fn unanalyzed_closed_trades(&self, limit: usize) -> Result<Vec<Trade>> {
        self.select(
            "paper_trades",
            &format!("status={CLOSED_STATUSES}&analyzed_at=is.null&limit={limit}"),
        )
        .await
    }

    async fn insert_event(&self, event: &AutoTradeEvent) -> Result<()> {
        self.insert("auto_trade_events", event).await
    }

    async fn recent_events(
        &self,
        ticker: &str,
        source: EventSource,
        limit: usize,
    ) -> Result<Vec<AutoTradeEvent>> {
        self.select(
            "auto_trade_events",
            &format!("ticker=eq.{ticker}&source=eq.{source}&order=created_at.desc&limit={limit}"),
        )
        .await
    }

    async fn due_signals(&self, today: NaiveDate) -> Result<Vec<ExternalStrategySignal>> {
        self.select(
            "external_strategy_signals",
            &format!("status=eq.PENDING&execute_on_date=lte.{today}&order=created_at.asc"),
        )
        .await
    }

    async fn find_signal(&self, key: &SignalKey<'_>) -> Result<Option<ExternalStrategySignal>> {
        let mut query = format!(
            "source_name=eq.{}&ticker=eq.{}&signal=eq.{}&mode=eq.{}&execute_on_date=eq.{}&limit=1",
            key.source_name, key.ticker, key.signal, key.mode, key.execute_on_date
        );
        match key.strategy_video_id {
            Some(video_id) => query.push_str(&format!("&strategy_video_id=eq.{video_id}")),
            None => query.push_str("&strategy_video_id=is.null"),
        }
        let rows: Vec<ExternalStrategySignal> =
            self.select("external_strategy_signals", &query).await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_signal(&self, signal: &ExternalStrategySignal) -> Result<()> {
        self.insert("external_strategy_signals", signal).await
    }

    async fn transition_signal(
        &self,
        id: &str,
        to: SignalStatus,
        details: SignalTransition,
    ) -> Result<bool> {
        // The status=eq.PENDING filter is the idempotence guard: a row that
        // already left PENDING matches nothing and the patch is a no-op.
        let query = format!("id=eq.{id}&status=eq.PENDING");
        let body = json!({
            "status": to,
            "failure_reason": details.failure_reason,
            "executed_trade_id": details.executed_trade_id,
            "executed_at": details.executed_at,
        });
        let updated = self.patch("external_strategy_signals", &query, body).await?;
        Ok(updated > 0)
    }

    async fn tracked_videos(&self) -> Result<Vec<StrategyVideo>> {
        self.select("strategy_videos", "status=eq.tracked").await
    }

    async fn insert_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        self.insert("portfolio_snapshots", snapshot).await
    }

    async fn insert_learning(&self, learning: &TradeLearning) -> Result<()> {
        self.insert("trade_learnings", learning).await
    }
}

impl std::fmt::Debug for RestDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestDatastore")
            .field("base_url", &self.base_url)
            .finish()
    }
}

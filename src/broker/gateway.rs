// =============================================================================
// IB gateway REST client
// =============================================================================
//
// Talks to a locally running Client-Portal-style gateway over HTTPS. The
// gateway terminates TLS with a self-signed certificate, so certificate
// verification is relaxed for the loopback base URL only. No credentials
// live in this process; the gateway session is authenticated out-of-band.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use super::{BracketOrder, BrokerGateway, BrokerPosition, ContractHandle, MarketOrder};
use crate::types::TradeSignal;

/// REST client for the brokerage gateway.
pub struct GatewayClient {
    base_url: String,
    account_id: String,
    client: reqwest::Client,
}

impl GatewayClient {
    /// Create a new client against `base_url` (e.g. `https://localhost:5000`).
    pub fn new(base_url: impl Into<String>, account_id: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, "GatewayClient initialised");

        Self {
            base_url,
            account_id: account_id.into(),
            client,
        }
    }

    fn side_str(side: TradeSignal) -> &'static str {
        match side {
            TradeSignal::Buy => "BUY",
            TradeSignal::Sell => "SELL",
        }
    }

    /// Extract the order id from the gateway's reply, which nests it either
    /// at the top level or inside the first array element.
    fn parse_order_id(body: &serde_json::Value) -> Result<String> {
        let id = body
            .get("order_id")
            .or_else(|| body.get(0).and_then(|v| v.get("order_id")))
            .and_then(|v| {
                v.as_str()
                    .map(|s| s.to_string())
                    .or_else(|| v.as_u64().map(|n| n.to_string()))
            });
        id.context("order reply missing order_id")
    }
}

#[async_trait]
impl BrokerGateway for GatewayClient {
    async fn is_connected(&self) -> bool {
        let url = format!("{}/v1/api/iserver/auth/status", self.base_url);
        match self.client.post(&url).send().await {
            Ok(resp) => {
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                body["authenticated"].as_bool().unwrap_or(false)
                    && body["connected"].as_bool().unwrap_or(false)
            }
            Err(e) => {
                warn!(error = %e, "gateway auth status check failed");
                false
            }
        }
    }

    async fn request_positions(&self) -> Result<Vec<BrokerPosition>> {
        let url = format!(
            "{}/v1/api/portfolio/{}/positions/0",
            self.base_url, self.account_id
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET positions request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse positions")?;
        if !status.is_success() {
            anyhow::bail!("gateway GET positions returned {status}: {body}");
        }

        let rows = body.as_array().context("positions reply is not an array")?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(symbol) = row["contractDesc"]
                .as_str()
                .or_else(|| row["ticker"].as_str())
            else {
                warn!("skipping position row without a symbol");
                continue;
            };
            out.push(BrokerPosition {
                symbol: symbol.split_whitespace().next().unwrap_or(symbol).to_string(),
                position: row["position"].as_f64().unwrap_or(0.0),
                avg_cost: row["avgCost"].as_f64().unwrap_or(0.0),
                contract_id: row["conid"].as_i64(),
            });
        }

        debug!(count = out.len(), "broker positions fetched");
        Ok(out)
    }

    async fn search_contract(&self, ticker: &str) -> Result<Option<ContractHandle>> {
        let url = format!(
            "{}/v1/api/iserver/secdef/search?symbol={}",
            self.base_url, ticker
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET secdef search failed")?;

        let body: serde_json::Value = resp.json().await.context("failed to parse secdef")?;
        let hit = body
            .as_array()
            .and_then(|arr| {
                arr.iter()
                    .find(|c| c["symbol"].as_str() == Some(ticker))
                    .or_else(|| arr.first())
            })
            .and_then(|c| {
                let conid = c["conid"]
                    .as_i64()
                    .or_else(|| c["conid"].as_str().and_then(|s| s.parse().ok()))?;
                Some(ContractHandle {
                    contract_id: conid,
                    symbol: ticker.to_string(),
                })
            });

        debug!(ticker, found = hit.is_some(), "contract search");
        Ok(hit)
    }

    async fn place_bracket(&self, order: &BracketOrder) -> Result<String> {
        let url = format!(
            "{}/v1/api/iserver/account/{}/orders",
            self.base_url, self.account_id
        );
        let parent_ref = format!("bracket-{}", uuid::Uuid::new_v4());
        let side = Self::side_str(order.side);
        let child_side = Self::side_str(order.side.opposite());
        let tif = order.tif.to_string();

        let payload = json!({
            "orders": [
                {
                    "cOID": parent_ref,
                    "conid": order.contract_id,
                    "orderType": "LMT",
                    "side": side,
                    "price": order.entry_price,
                    "quantity": order.quantity,
                    "tif": tif,
                },
                {
                    "parentId": parent_ref,
                    "conid": order.contract_id,
                    "orderType": "STP",
                    "side": child_side,
                    "price": order.stop_loss,
                    "quantity": order.quantity,
                    "tif": tif,
                },
                {
                    "parentId": parent_ref,
                    "conid": order.contract_id,
                    "orderType": "LMT",
                    "side": child_side,
                    "price": order.take_profit,
                    "quantity": order.quantity,
                    "tif": tif,
                },
            ]
        });

        debug!(
            symbol = %order.symbol,
            side,
            quantity = order.quantity,
            entry = order.entry_price,
            "placing bracket order"
        );

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("POST bracket order failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse order reply")?;
        if !status.is_success() {
            anyhow::bail!("gateway bracket order returned {status}: {body}");
        }

        Self::parse_order_id(&body)
    }

    async fn place_market(&self, order: &MarketOrder) -> Result<String> {
        let url = format!(
            "{}/v1/api/iserver/account/{}/orders",
            self.base_url, self.account_id
        );
        let side = Self::side_str(order.side);

        let payload = json!({
            "orders": [{
                "conid": order.contract_id,
                "orderType": "MKT",
                "side": side,
                "quantity": order.quantity,
                "tif": "DAY",
            }]
        });

        debug!(symbol = %order.symbol, side, quantity = order.quantity, "placing market order");

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("POST market order failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse order reply")?;
        if !status.is_success() {
            anyhow::bail!("gateway market order returned {status}: {body}");
        }

        Self::parse_order_id(&body)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let url = format!(
            "{}/v1/api/iserver/account/{}/order/{}",
            self.base_url, self.account_id, order_id
        );
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE order failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            anyhow::bail!("gateway cancel returned {status}: {body}");
        }

        debug!(order_id, "order cancelled");
        Ok(())
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("base_url", &self.base_url)
            .field("account_id", &self.account_id)
            .finish()
    }
}

// =============================================================================
// Brokerage gateway — trait boundary plus the IB-gateway REST client
// =============================================================================
//
// The trading core only ever talks to `BrokerGateway`; the concrete client
// lives in `gateway.rs` and a scriptable mock backs the tests.
// =============================================================================

pub mod gateway;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::TradeSignal;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A raw broker position before quote enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Signed share count; negative for shorts.
    pub position: f64,
    pub avg_cost: f64,
    #[serde(default)]
    pub contract_id: Option<i64>,
}

/// Resolved tradable contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractHandle {
    pub contract_id: i64,
    pub symbol: String,
}

/// Order lifetime for bracket parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Day,
    Gtc,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "DAY"),
            Self::Gtc => write!(f, "GTC"),
        }
    }
}

/// Parent limit entry plus one-cancels-other stop-loss and take-profit legs.
#[derive(Debug, Clone, Serialize)]
pub struct BracketOrder {
    pub contract_id: i64,
    pub symbol: String,
    pub side: TradeSignal,
    pub quantity: i64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub tif: TimeInForce,
}

/// Plain market order.
#[derive(Debug, Clone, Serialize)]
pub struct MarketOrder {
    pub contract_id: i64,
    pub symbol: String,
    pub side: TradeSignal,
    pub quantity: i64,
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// The operations the trading core consumes from the brokerage gateway.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Whether the gateway session is authenticated and reachable.
    async fn is_connected(&self) -> bool;

    /// All positions in the account, including zero-quantity stubs the
    /// gateway may report after a close.
    async fn request_positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Resolve a ticker to a tradable contract, `None` when unknown.
    async fn search_contract(&self, ticker: &str) -> Result<Option<ContractHandle>>;

    /// Place a bracket order; returns the parent order id.
    async fn place_bracket(&self, order: &BracketOrder) -> Result<String>;

    /// Place a market order; returns the order id.
    async fn place_market(&self, order: &MarketOrder) -> Result<String>;

    /// Cancel a working order by id.
    async fn cancel_order(&self, order_id: &str) -> Result<()>;
}

// =============================================================================
// Scriptable mock for tests
// =============================================================================
#[cfg(test)]
pub mod mock {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// Record of an order the mock accepted.
    #[derive(Debug, Clone)]
    pub enum PlacedOrder {
        Bracket(BracketOrder),
        Market(MarketOrder),
    }

    /// In-memory broker: positions and contract lookups are scripted by the
    /// test; placed and cancelled orders are recorded for assertions.
    pub struct MockBroker {
        pub connected: Mutex<bool>,
        pub positions: Mutex<Vec<BrokerPosition>>,
        pub contracts: Mutex<HashMap<String, ContractHandle>>,
        pub placed: Mutex<Vec<PlacedOrder>>,
        pub cancelled: Mutex<Vec<String>>,
        pub fail_placements: Mutex<bool>,
        next_order_id: Mutex<u64>,
    }

    impl MockBroker {
        pub fn new() -> Self {
            Self {
                connected: Mutex::new(true),
                positions: Mutex::new(Vec::new()),
                contracts: Mutex::new(HashMap::new()),
                placed: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                fail_placements: Mutex::new(false),
                next_order_id: Mutex::new(1000),
            }
        }

        pub fn with_position(self, symbol: &str, position: f64, avg_cost: f64) -> Self {
            self.positions.lock().push(BrokerPosition {
                symbol: symbol.to_string(),
                position,
                avg_cost,
                contract_id: Some(1),
            });
            self
        }

        pub fn with_contract(self, symbol: &str) -> Self {
            let id = 42 + self.contracts.lock().len() as i64;
            self.contracts.lock().insert(
                symbol.to_string(),
                ContractHandle {
                    contract_id: id,
                    symbol: symbol.to_string(),
                },
            );
            self
        }

        pub fn placed_count(&self) -> usize {
            self.placed.lock().len()
        }

        fn next_id(&self) -> String {
            let mut n = self.next_order_id.lock();
            *n += 1;
            n.to_string()
        }
    }

    #[async_trait]
    impl BrokerGateway for MockBroker {
        async fn is_connected(&self) -> bool {
            *self.connected.lock()
        }

        async fn request_positions(&self) -> Result<Vec<BrokerPosition>> {
            Ok(self.positions.lock().clone())
        }

        async fn search_contract(&self, ticker: &str) -> Result<Option<ContractHandle>> {
            Ok(self.contracts.lock().get(ticker).cloned())
        }

        async fn place_bracket(&self, order: &BracketOrder) -> Result<String> {
            if *self.fail_placements.lock() {
                anyhow::bail!("gateway rejected order");
            }
            self.placed.lock().push(PlacedOrder::Bracket(order.clone()));
            Ok(self.next_id())
        }

        async fn place_market(&self, order: &MarketOrder) -> Result<String> {
            if *self.fail_placements.lock() {
                anyhow::bail!("gateway rejected order");
            }
            self.placed.lock().push(PlacedOrder::Market(order.clone()));
            Ok(self.next_id())
        }

        async fn cancel_order(&self, order_id: &str) -> Result<()> {
            self.cancelled.lock().push(order_id.to_string());
            Ok(())
        }
    }
}

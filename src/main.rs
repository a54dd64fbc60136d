// =============================================================================
// Sentinel Trader — Main Entry Point
// =============================================================================
//
// Long-running auto-trading scheduler: reconciles broker positions against
// the internal ledger, runs the candidate pipeline through the risk gates,
// and submits orders through the brokerage gateway. Behavioural settings
// live in the datastore and reload every cycle; only connectivity secrets
// come from the environment.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod candidates;
mod config;
mod datastore;
mod entry_log;
mod execution;
mod indicators;
mod orchestrator;
mod position_mgmt;
mod reconcile;
mod risk;
mod services;
mod signal_queue;
mod sizing;
mod snapshot;
mod time_rules;
mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::gateway::GatewayClient;
use crate::datastore::realtime::{self, DEBOUNCE_WINDOW};
use crate::datastore::rest::RestDatastore;
use crate::orchestrator::Orchestrator;
use crate::services::market::MarketDataClient;
use crate::services::signals::SignalServiceClient;
use crate::time_rules::{Clock, SystemClock};

/// Cadence of the broker connection monitor.
const CONNECTION_POLL_SECS: u64 = 30;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Sentinel Trader — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // Datastore connectivity is the one unrecoverable requirement.
    let (datastore_url, datastore_key) = match (
        std::env::var("DATASTORE_URL"),
        std::env::var("DATASTORE_API_KEY"),
    ) {
        (Ok(url), Ok(key)) if !url.is_empty() && !key.is_empty() => (url, key),
        _ => {
            error!("DATASTORE_URL and DATASTORE_API_KEY must be set");
            std::process::exit(1);
        }
    };

    let gateway_url = env_or("GATEWAY_URL", "https://localhost:5000");
    let gateway_account = env_or("GATEWAY_ACCOUNT_ID", "");
    let market_api_url = env_or("MARKET_API_URL", "https://finnhub.io/api/v1");
    let market_api_key = env_or("MARKET_API_KEY", "");
    let chart_api_url = env_or("CHART_API_URL", "https://query1.finance.yahoo.com");
    let signals_api_url = env_or("SIGNALS_API_URL", "http://localhost:8000");
    let bind_addr = env_or("SENTINEL_BIND_ADDR", "0.0.0.0:3001");

    if market_api_key.is_empty() {
        warn!("MARKET_API_KEY not set — quotes, earnings, and sector lookups will fail open");
    }

    info!(
        gateway = %gateway_url,
        signals = %signals_api_url,
        "external endpoints configured"
    );

    // ── 2. Shared state & clients ────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = Arc::new(AppState::new(time_rules::et_date(clock.now()), true));

    let broker = Arc::new(GatewayClient::new(gateway_url, gateway_account));
    let datastore = Arc::new(RestDatastore::new(datastore_url.clone(), &datastore_key));
    let market = Arc::new(MarketDataClient::new(
        market_api_url,
        chart_api_url,
        market_api_key,
    ));
    let signals_api = Arc::new(SignalServiceClient::new(signals_api_url));

    let orchestrator = Arc::new(Orchestrator::new(
        state.clone(),
        broker.clone(),
        datastore,
        market,
        signals_api,
        clock,
    ));

    // ── 3. Realtime change channel (scanner results) ─────────────────────
    let (event_tx, event_rx) = mpsc::channel(64);
    let (fire_tx, fire_rx) = mpsc::channel(8);

    let ws_url = datastore_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    tokio::spawn(async move {
        loop {
            if let Err(e) =
                realtime::run_change_stream(&ws_url, &datastore_key, event_tx.clone()).await
            {
                error!(error = %e, "realtime channel error — reconnecting in 5s");
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
        }
    });
    tokio::spawn(realtime::run_debouncer(event_rx, DEBOUNCE_WINDOW, fire_tx));

    // ── 4. Broker connection monitor ─────────────────────────────────────
    {
        let state = state.clone();
        let broker = broker.clone();
        tokio::spawn(async move {
            use crate::broker::BrokerGateway;
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(CONNECTION_POLL_SECS));
            loop {
                interval.tick().await;
                let connected = broker.is_connected().await;
                let previous = {
                    let mut slot = state.broker_connected.write();
                    std::mem::replace(&mut *slot, connected)
                };
                if previous != connected {
                    if connected {
                        info!("broker gateway connected");
                    } else {
                        warn!("broker gateway connection lost");
                    }
                }
            }
        });
    }

    // ── 5. API server ────────────────────────────────────────────────────
    {
        let app = api::router(orchestrator.clone());
        let bind = bind_addr.clone();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .expect("failed to bind API server");
            info!(addr = %bind, "API server listening");
            axum::serve(listener, app).await.expect("API server failed");
        });
    }

    // ── 6. Scheduler triggers ────────────────────────────────────────────
    orchestrator.spawn_triggers(fire_rx);
    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    state
        .triggers_active
        .store(false, std::sync::atomic::Ordering::SeqCst);
    warn!("shutdown signal received — triggers stopped");
    info!("Sentinel Trader shut down complete.");
    Ok(())
}

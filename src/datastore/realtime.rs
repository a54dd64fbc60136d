// =============================================================================
// Realtime change channel — scanner-results table subscription + debouncer
// =============================================================================
//
// The datastore emits a change event for every INSERT/UPDATE on the
// `trade_scans` table. Day-trade and swing-trade rows land within
// milliseconds of each other, so raw events pass through a trailing-edge
// debouncer: a burst collapses into one notification fired once the channel
// has been quiet for the full window.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Quiet window before a burst of change events collapses into one firing.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(3);

/// Heartbeat cadence keeping the realtime socket alive.
const HEARTBEAT_SECS: u64 = 30;

/// Table whose changes drive the realtime execution path.
const WATCHED_TABLE: &str = "trade_scans";

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Connect to the datastore's realtime websocket and forward one `()` per
/// change event on the watched table into `events`.
///
/// Runs until the socket drops; the caller owns the reconnect loop, same as
/// the market-data stream tasks.
pub async fn run_change_stream(
    base_ws_url: &str,
    api_key: &str,
    events: mpsc::Sender<()>,
) -> Result<()> {
    let url = format!("{base_ws_url}/realtime/v1/websocket?apikey={api_key}&vsn=1.0.0");
    let (ws, _) = connect_async(&url)
        .await
        .context("realtime websocket connect failed")?;
    let (mut write, mut read) = ws.split();

    let topic = format!("realtime:public:{WATCHED_TABLE}");
    let join = json!({
        "topic": topic,
        "event": "phx_join",
        "payload": {},
        "ref": "1",
    });
    write
        .send(Message::Text(join.to_string()))
        .await
        .context("realtime join failed")?;

    info!(table = WATCHED_TABLE, "realtime change channel joined");

    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let beat = json!({
                    "topic": "phoenix",
                    "event": "heartbeat",
                    "payload": {},
                    "ref": "hb",
                });
                write
                    .send(Message::Text(beat.to_string()))
                    .await
                    .context("realtime heartbeat failed")?;
            }
            msg = read.next() => {
                let Some(msg) = msg else {
                    anyhow::bail!("realtime socket closed by server");
                };
                match msg.context("realtime socket error")? {
                    Message::Text(text) => {
                        let parsed: serde_json::Value =
                            serde_json::from_str(&text).unwrap_or_default();
                        let event = parsed["event"].as_str().unwrap_or("");
                        if matches!(event, "INSERT" | "UPDATE") {
                            debug!(event, table = WATCHED_TABLE, "change event received");
                            if events.send(()).await.is_err() {
                                // Receiver gone — the engine is shutting down.
                                return Ok(());
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        write.send(Message::Pong(payload)).await.ok();
                    }
                    Message::Close(_) => anyhow::bail!("realtime socket closed"),
                    _ => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Debouncer
// ---------------------------------------------------------------------------

/// Trailing-edge debouncer: after the first event, keep absorbing events
/// until `window` passes with none, then emit exactly one firing.
///
/// Owns no state beyond the pending window — a burst of N events within the
/// window produces a single firing ~`window` after the last of them.
pub async fn run_debouncer(mut events: mpsc::Receiver<()>, window: Duration, fires: mpsc::Sender<()>) {
    while events.recv().await.is_some() {
        loop {
            match tokio::time::timeout(window, events.recv()).await {
                // Another event inside the window — restart the wait.
                Ok(Some(())) => continue,
                // Channel closed mid-burst: fire the pending notification
                // and stop.
                Ok(None) => {
                    let _ = fires.send(()).await;
                    return;
                }
                // Quiet for the full window.
                Err(_) => break,
            }
        }
        if fires.send(()).await.is_err() {
            return;
        }
        debug!("debounced change notification fired");
    }
    warn!("realtime event channel closed — debouncer stopping");
}

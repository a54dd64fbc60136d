// =============================================================================
// Central application state — Sentinel trading engine
// =============================================================================
//
// Shared by the trigger tasks, the status API, and the cycle itself via
// `Arc<AppState>`.
//
// Thread safety:
//   - AtomicBool for the single non-reentrant cycle flag (triggers that find
//     it set are dropped, never queued).
//   - parking_lot locks for everything mutable; the process ledger is only
//     mutated while a cycle holds the flag, so a plain Mutex suffices.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::info;

/// Maximum number of recent errors retained for the status API.
const MAX_RECENT_ERRORS: usize = 50;

// =============================================================================
// Process ledger — per-day counters owned by the cycle
// =============================================================================

/// Process-local deployment counters and the per-ET-day processed set.
///
/// Reset rules belong to the orchestrator: `roll_day` runs at cycle entry,
/// `clear_pending` after each reconciler pass (broker truth supersedes
/// local optimism).
#[derive(Debug, Clone)]
pub struct ProcessLedger {
    /// Dollars from orders placed locally that the broker has not yet shown.
    pub pending_deployed_dollar: f64,
    /// Dollars deployed so far this ET day.
    pub daily_deployed_dollar: f64,
    pub daily_deployed_date: NaiveDate,
    /// Tickers already acted on today; entries are added on execution.
    pub processed_tickers: HashSet<String>,
    pub processed_tickers_date: NaiveDate,
}

impl ProcessLedger {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            pending_deployed_dollar: 0.0,
            daily_deployed_dollar: 0.0,
            daily_deployed_date: today,
            processed_tickers: HashSet::new(),
            processed_tickers_date: today,
        }
    }

    /// Reset day-scoped state when the ET calendar rolled.
    pub fn roll_day(&mut self, today: NaiveDate) {
        if self.daily_deployed_date != today {
            info!(
                old = %self.daily_deployed_date,
                new = %today,
                "ET day rolled — resetting daily deployment"
            );
            self.daily_deployed_dollar = 0.0;
            self.daily_deployed_date = today;
        }
        if self.processed_tickers_date != today {
            self.processed_tickers.clear();
            self.processed_tickers_date = today;
        }
    }

    /// Record a placed order's dollars against both counters.
    pub fn record_deploy(&mut self, dollars: f64) {
        self.pending_deployed_dollar += dollars;
        self.daily_deployed_dollar += dollars;
    }

    /// Broker positions have been re-read; local optimism is obsolete.
    pub fn clear_pending(&mut self) {
        self.pending_deployed_dollar = 0.0;
    }

    pub fn mark_processed(&mut self, ticker: &str) {
        self.processed_tickers.insert(ticker.to_string());
    }

    pub fn is_processed(&self, ticker: &str) -> bool {
        self.processed_tickers.contains(ticker)
    }
}

// =============================================================================
// Error record (status API ring buffer)
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    // ── Cycle mutual exclusion ──────────────────────────────────────────
    cycle_running: AtomicBool,

    // ── Run bookkeeping ─────────────────────────────────────────────────
    pub triggers_active: AtomicBool,
    pub run_count: AtomicU64,
    pub last_run: RwLock<Option<DateTime<Utc>>>,
    pub last_result: RwLock<Option<String>>,

    // ── Daily task latches ──────────────────────────────────────────────
    pub last_suggested_finds_date: RwLock<Option<NaiveDate>>,
    pub last_snapshot_date: RwLock<Option<NaiveDate>>,
    pub last_rehydration_date: RwLock<Option<NaiveDate>>,

    // ── Deployment counters ─────────────────────────────────────────────
    pub ledger: Mutex<ProcessLedger>,

    // ── Connectivity ────────────────────────────────────────────────────
    pub broker_connected: RwLock<bool>,
    pub datastore_configured: bool,

    // ── Error log ───────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(today: NaiveDate, datastore_configured: bool) -> Self {
        Self {
            cycle_running: AtomicBool::new(false),
            triggers_active: AtomicBool::new(false),
            run_count: AtomicU64::new(0),
            last_run: RwLock::new(None),
            last_result: RwLock::new(None),
            last_suggested_finds_date: RwLock::new(None),
            last_snapshot_date: RwLock::new(None),
            last_rehydration_date: RwLock::new(None),
            ledger: Mutex::new(ProcessLedger::new(today)),
            broker_connected: RwLock::new(false),
            datastore_configured,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Cycle guard ─────────────────────────────────────────────────────

    /// Claim the cycle flag. Returns `None` when a cycle is already
    /// executing — the trigger is dropped, not queued.
    pub fn try_begin_cycle(&self) -> Option<CycleGuard<'_>> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(CycleGuard { state: self })
        } else {
            None
        }
    }

    pub fn is_cycle_running(&self) -> bool {
        self.cycle_running.load(Ordering::SeqCst)
    }

    // ── Error logging ───────────────────────────────────────────────────

    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    // ── Status snapshot ─────────────────────────────────────────────────

    pub fn build_status(&self) -> StatusSnapshot {
        let ledger = self.ledger.lock();
        StatusSnapshot {
            triggers_active: self.triggers_active.load(Ordering::SeqCst),
            cycle_running: self.is_cycle_running(),
            run_count: self.run_count.load(Ordering::SeqCst),
            last_run: self.last_run.read().map(|t| t.to_rfc3339()),
            last_result: self.last_result.read().clone(),
            broker_connected: *self.broker_connected.read(),
            datastore_configured: self.datastore_configured,
            pending_deployed_dollar: ledger.pending_deployed_dollar,
            daily_deployed_dollar: ledger.daily_deployed_dollar,
            processed_ticker_count: ledger.processed_tickers.len(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

/// RAII guard clearing the cycle flag, including on panic unwind.
pub struct CycleGuard<'a> {
    state: &'a AppState,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.state.cycle_running.store(false, Ordering::SeqCst);
    }
}

/// Status surface payload for the REST API.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub triggers_active: bool,
    pub cycle_running: bool,
    pub run_count: u64,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    pub broker_connected: bool,
    pub datastore_configured: bool,
    pub pending_deployed_dollar: f64,
    pub daily_deployed_dollar: f64,
    pub processed_ticker_count: usize,
    pub uptime_secs: u64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn cycle_guard_is_exclusive_and_clears() {
        let state = AppState::new(day("2026-03-02"), true);
        let guard = state.try_begin_cycle().expect("first claim succeeds");
        assert!(state.is_cycle_running());
        assert!(state.try_begin_cycle().is_none(), "second claim is dropped");
        drop(guard);
        assert!(!state.is_cycle_running());
        assert!(state.try_begin_cycle().is_some());
    }

    #[test]
    fn ledger_rolls_per_day() {
        let mut ledger = ProcessLedger::new(day("2026-03-02"));
        ledger.record_deploy(5_000.0);
        ledger.mark_processed("ABC");
        assert_eq!(ledger.daily_deployed_dollar, 5_000.0);
        assert_eq!(ledger.pending_deployed_dollar, 5_000.0);
        assert!(ledger.is_processed("ABC"));

        // Same day: nothing resets.
        ledger.roll_day(day("2026-03-02"));
        assert_eq!(ledger.daily_deployed_dollar, 5_000.0);

        // New ET day: daily counter and processed set reset; pending is
        // owned by the reconciler, not the calendar.
        ledger.roll_day(day("2026-03-03"));
        assert_eq!(ledger.daily_deployed_dollar, 0.0);
        assert!(!ledger.is_processed("ABC"));
        assert_eq!(ledger.pending_deployed_dollar, 5_000.0);

        ledger.clear_pending();
        assert_eq!(ledger.pending_deployed_dollar, 0.0);
    }

    #[test]
    fn error_ring_is_capped() {
        let state = AppState::new(day("2026-03-02"), true);
        for i in 0..60 {
            state.push_error(format!("error {i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), 50);
        assert_eq!(errors.first().unwrap().message, "error 10");
    }
}

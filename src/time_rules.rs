// =============================================================================
// Time rules — America/New_York calendar and session logic
// =============================================================================
//
// Every ET-day decision in the engine goes through this module so that DST
// transitions are handled in exactly one place. The ambient locale is never
// consulted.
//
// Session boundaries:
//   - weekdays only (Sat/Sun skip all triggers)
//   - market hours 09:30–16:00 ET inclusive
//   - post-close boundary 16:15 ET (daily rehydration threshold)
// =============================================================================

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;

// ---------------------------------------------------------------------------
// Clock capability
// ---------------------------------------------------------------------------

/// Injectable wall-clock. Production uses [`SystemClock`]; tests pin time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// ET conversions
// ---------------------------------------------------------------------------

/// Convert an instant to ET wall-clock.
pub fn to_et(at: DateTime<Utc>) -> DateTime<chrono_tz::Tz> {
    at.with_timezone(&New_York)
}

/// ET calendar date of an instant.
pub fn et_date(at: DateTime<Utc>) -> NaiveDate {
    to_et(at).date_naive()
}

/// ET wall-clock minutes since midnight for an instant.
pub fn et_minutes(at: DateTime<Utc>) -> u32 {
    let et = to_et(at);
    et.hour() * 60 + et.minute()
}

// ---------------------------------------------------------------------------
// Session predicates
// ---------------------------------------------------------------------------

/// Saturday and Sunday skip all triggers.
pub fn is_weekday(at: DateTime<Utc>) -> bool {
    !matches!(to_et(at).weekday(), Weekday::Sat | Weekday::Sun)
}

/// Regular session: 09:30–16:00 ET inclusive.
pub fn is_market_hours(at: DateTime<Utc>) -> bool {
    let m = et_minutes(at);
    (9 * 60 + 30..=16 * 60).contains(&m)
}

/// Periodic-trigger window: 09:00–16:59 ET on weekdays.
pub fn in_trigger_window(at: DateTime<Utc>) -> bool {
    if !is_weekday(at) {
        return false;
    }
    let m = et_minutes(at);
    (9 * 60..17 * 60).contains(&m)
}

/// True once ET wall clock has reached `hh:mm` today.
pub fn is_at_or_after(at: DateTime<Utc>, hh: u32, mm: u32) -> bool {
    et_minutes(at) >= hh * 60 + mm
}

/// Post-close boundary for daily rehydration.
pub fn is_after_post_close(at: DateTime<Utc>) -> bool {
    is_at_or_after(at, 16, 15)
}

// ---------------------------------------------------------------------------
// Execution windows ("HH:MM" strings, inclusive of start and end)
// ---------------------------------------------------------------------------

/// Position of the ET wall clock relative to a video execution window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPosition {
    Before,
    Within,
    After,
}

/// Parse a "HH:MM" wall-clock string.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

/// Place the current ET time relative to `[start, end]`. Unparseable bounds
/// fail open (`Within`) so a malformed window never blocks trading.
pub fn window_position(at: DateTime<Utc>, start: &str, end: &str) -> WindowPosition {
    let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
        return WindowPosition::Within;
    };
    let now = to_et(at).time();
    // Compare at minute granularity: "end" is inclusive through its minute.
    let now = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(now);
    if now < start {
        WindowPosition::Before
    } else if now > end {
        WindowPosition::After
    } else {
        WindowPosition::Within
    }
}

// ---------------------------------------------------------------------------
// Next-fire computation for the periodic grid
// ---------------------------------------------------------------------------

/// Seconds until the next quarter-hour boundary (…:00, :15, :30, :45).
pub fn secs_to_next_quarter_hour(at: DateTime<Utc>) -> u64 {
    let secs_into_hour = (at.minute() * 60 + at.second()) as u64;
    let period = 15 * 60;
    period - (secs_into_hour % period)
}

/// Instant of today's `hh:mm` ET, if it is still in the future; otherwise
/// the same wall-clock time tomorrow.
pub fn next_et_wallclock(at: DateTime<Utc>, hh: u32, mm: u32) -> DateTime<Utc> {
    let et = to_et(at);
    let mut date = et.date_naive();
    let time = NaiveTime::from_hms_opt(hh, mm, 0).expect("valid wall-clock time");
    if et.time() >= time {
        date = date.succ_opt().expect("date in range");
    }
    // DST-gap fallback: skip forward an hour if the wall-clock time does
    // not exist on that date.
    loop {
        if let Some(local) = New_York.from_local_datetime(&date.and_time(time)).earliest() {
            return local.with_timezone(&Utc);
        }
        date = date.succ_opt().expect("date in range");
    }
}

// =============================================================================
// Test clock
// =============================================================================

/// A pinned clock for tests. Construct from an RFC 3339 instant.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl FixedClock {
    pub fn at(rfc3339: &str) -> Self {
        Self(
            DateTime::parse_from_rfc3339(rfc3339)
                .expect("valid RFC 3339 instant")
                .with_timezone(&Utc),
        )
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn utc(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn et_date_respects_dst() {
        // 2026-03-02 is EST (UTC-5): 02:00 UTC is the prior ET evening.
        assert_eq!(
            et_date(utc("2026-03-02T02:00:00Z")),
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
        );
        // 2026-07-06 is EDT (UTC-4): 03:00 UTC is still the prior ET day.
        assert_eq!(
            et_date(utc("2026-07-06T03:00:00Z")),
            NaiveDate::from_ymd_opt(2026, 7, 5).unwrap()
        );
        assert_eq!(
            et_date(utc("2026-07-06T04:00:00Z")),
            NaiveDate::from_ymd_opt(2026, 7, 6).unwrap()
        );
    }

    #[test]
    fn market_hours_inclusive_bounds() {
        // 2026-03-02 is a Monday, EST.
        assert!(!is_market_hours(utc("2026-03-02T14:29:00Z"))); // 09:29 ET
        assert!(is_market_hours(utc("2026-03-02T14:30:00Z"))); // 09:30 ET
        assert!(is_market_hours(utc("2026-03-02T21:00:00Z"))); // 16:00 ET
        assert!(!is_market_hours(utc("2026-03-02T21:01:00Z"))); // 16:01 ET
    }

    #[test]
    fn weekend_skips_trigger_window() {
        // 2026-03-07 is a Saturday.
        assert!(!in_trigger_window(utc("2026-03-07T15:00:00Z")));
        // Monday 10:00 ET.
        assert!(in_trigger_window(utc("2026-03-02T15:00:00Z")));
        // Monday 08:59 ET.
        assert!(!in_trigger_window(utc("2026-03-02T13:59:00Z")));
        // Monday 16:59 ET in, 17:00 ET out.
        assert!(in_trigger_window(utc("2026-03-02T21:59:00Z")));
        assert!(!in_trigger_window(utc("2026-03-02T22:00:00Z")));
    }

    #[test]
    fn post_close_boundary() {
        assert!(!is_after_post_close(utc("2026-03-02T21:14:00Z"))); // 16:14 ET
        assert!(is_after_post_close(utc("2026-03-02T21:15:00Z"))); // 16:15 ET
    }

    #[test]
    fn window_position_inclusive() {
        let at_0935 = utc("2026-03-02T14:35:00Z");
        assert_eq!(
            window_position(at_0935, "09:35", "10:00"),
            WindowPosition::Within
        );
        assert_eq!(
            window_position(at_0935, "09:36", "10:00"),
            WindowPosition::Before
        );
        let at_1000 = utc("2026-03-02T15:00:00Z");
        assert_eq!(
            window_position(at_1000, "09:30", "10:00"),
            WindowPosition::Within
        );
        let at_1001 = utc("2026-03-02T15:01:00Z");
        assert_eq!(
            window_position(at_1001, "09:30", "10:00"),
            WindowPosition::After
        );
    }

    #[test]
    fn malformed_window_fails_open() {
        let at = utc("2026-03-02T15:00:00Z");
        assert_eq!(window_position(at, "late", "10:00"), WindowPosition::Within);
    }

    #[test]
    fn quarter_hour_grid() {
        assert_eq!(secs_to_next_quarter_hour(utc("2026-03-02T15:00:00Z")), 900);
        assert_eq!(secs_to_next_quarter_hour(utc("2026-03-02T15:14:30Z")), 30);
        assert_eq!(secs_to_next_quarter_hour(utc("2026-03-02T15:15:00Z")), 900);
    }

    #[test]
    fn next_wallclock_rolls_to_tomorrow() {
        // 10:00 ET Monday: next 09:36 ET is Tuesday.
        let next = next_et_wallclock(utc("2026-03-02T15:00:00Z"), 9, 36);
        assert_eq!(et_date(next), NaiveDate::from_ymd_opt(2026, 3, 3).unwrap());
        // 09:00 ET Monday: next 09:36 ET is today.
        let next = next_et_wallclock(utc("2026-03-02T14:00:00Z"), 9, 36);
        assert_eq!(et_date(next), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert_eq!(et_minutes(next), 9 * 60 + 36);
    }
}

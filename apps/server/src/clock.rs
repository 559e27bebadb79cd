//! Business-zone clock.
//!
//! The shop operates in Europe/Vilnius. Rather than pulling in a tz
//! database, the EU DST rule is applied directly: UTC+2 (EET) in winter,
//! UTC+3 (EEST) between 01:00 UTC on the last Sunday of March and
//! 01:00 UTC on the last Sunday of October. "Now" is always re-derived
//! per call and never cached across requests.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};

/// Standard offset (EET, UTC+2).
const STD_OFFSET_SECS: i32 = 2 * 3600;
/// Summer offset (EEST, UTC+3).
const DST_OFFSET_SECS: i32 = 3 * 3600;

/// Last Sunday of the given month, at 01:00 UTC (the EU switch instant).
fn last_sunday_switch(year: i32, month: u32) -> DateTime<Utc> {
    let last_day = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .and_then(|d| d.pred_opt())
    .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, month, 28).unwrap());

    let mut day = last_day;
    while day.weekday() != Weekday::Sun {
        day = day.pred_opt().unwrap();
    }
    Utc.from_utc_datetime(&day.and_hms_opt(1, 0, 0).unwrap())
}

/// Offset in effect at a given UTC instant.
pub fn business_offset(at: DateTime<Utc>) -> FixedOffset {
    let dst_start = last_sunday_switch(at.year(), 3);
    let dst_end = last_sunday_switch(at.year(), 10);
    let secs = if at >= dst_start && at < dst_end {
        DST_OFFSET_SECS
    } else {
        STD_OFFSET_SECS
    };
    FixedOffset::east_opt(secs).unwrap()
}

/// Current wall-clock time in the business time zone.
pub fn business_now() -> DateTime<FixedOffset> {
    let utc = Utc::now();
    utc.with_timezone(&business_offset(utc))
}

/// Today's date in the business time zone, as YYYY-MM-DD.
pub fn business_today() -> String {
    business_now().format("%Y-%m-%d").to_string()
}

/// Current timestamp string used for created_at/performed_at columns.
pub fn timestamp() -> String {
    business_now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parse a business-local "YYYY-MM-DD" + "HH:MM" pair.
pub fn parse_local(date: &str, time: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M").ok()
}

/// Hours from `now` until the appointment, in the business zone.
/// Negative when the appointment is already in the past. `None` when the
/// date/time strings do not parse.
pub fn hours_until(date: &str, time: &str, now: DateTime<FixedOffset>) -> Option<f64> {
    let appointment = parse_local(date, time)?;
    let delta = appointment - now.naive_local();
    Some(delta.num_minutes() as f64 / 60.0)
}

// ── Tests ──

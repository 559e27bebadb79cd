//! Slot grid and conflict detection.
//!
//! The grid is fixed: 15-minute start times from 09:00 up to (not
//! including) 20:00, identical for every day and every barber. Opening
//! hours are not configurable per resource yet.

use serde::Serialize;

/// Opening time, minutes since midnight (09:00).
pub const OPEN_MINUTE: i64 = 9 * 60;
/// Closing time, minutes since midnight (20:00).
pub const CLOSE_MINUTE: i64 = 20 * 60;
/// Grid granularity.
pub const SLOT_STEP_MIN: i64 = 15;
/// Fallback duration when a booking carries no duration at all.
pub const DEFAULT_DURATION_MIN: i64 = 30;

/// One existing booking's occupied interval, as stored: a start time
/// string and a resolved duration.
#[derive(Debug, Clone)]
pub struct BookedInterval {
    pub time: String,
    pub duration_min: i64,
}

/// One grid entry in an availability response.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub time: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// Parse "HH:MM" into minutes since midnight.
pub fn parse_time(t: &str) -> Option<i64> {
    let (h, m) = t.split_once(':')?;
    let hours: i64 = h.parse().ok()?;
    let minutes: i64 = m.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

fn format_time(minute: i64) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// The canonical ordered grid of candidate start times for any day.
pub fn slot_grid() -> Vec<String> {
    let mut grid = Vec::new();
    let mut minute = OPEN_MINUTE;
    while minute < CLOSE_MINUTE {
        grid.push(format_time(minute));
        minute += SLOT_STEP_MIN;
    }
    grid
}

/// Whether the grid slot starting at `slot_minute` falls inside any
/// existing booking's occupied interval [start, start + duration).
/// Every minute of a booking blocks slots, not just its start minute.
pub fn slot_occupied(slot_minute: i64, existing: &[BookedInterval]) -> bool {
    existing.iter().any(|b| {
        let Some(start) = parse_time(&b.time) else {
            return false;
        };
        let end = start + b.duration_min.max(0);
        slot_minute >= start && slot_minute < end
    })
}

/// Whether a candidate interval overlaps any existing booking.
/// Two intervals conflict iff start < other_end && end > other_start.
pub fn range_conflicts(candidate_start: i64, candidate_duration: i64, existing: &[BookedInterval]) -> bool {
    let candidate_end = candidate_start + candidate_duration;
    existing.iter().any(|b| {
        let Some(start) = parse_time(&b.time) else {
            return false;
        };
        let end = start + b.duration_min.max(0);
        candidate_start < end && candidate_end > start
    })
}

/// Annotate the full day grid against existing bookings.
///
/// `now_minute` is the current wall-clock minute in the business zone and
/// only matters when `is_today` — past slots are marked unavailable with
/// reason "past".
pub fn annotate_day(existing: &[BookedInterval], is_today: bool, now_minute: i64) -> Vec<SlotInfo> {
    slot_grid()
        .into_iter()
        .map(|time| {
            let minute = parse_time(&time).unwrap_or(0);
            if is_today && minute <= now_minute {
                return SlotInfo {
                    time,
                    available: false,
                    reason: Some("past"),
                };
            }
            if slot_occupied(minute, existing) {
                SlotInfo {
                    time,
                    available: false,
                    reason: Some("booked"),
                }
            } else {
                SlotInfo {
                    time,
                    available: true,
                    reason: None,
                }
            }
        })
        .collect()
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn booked(time: &str, duration: i64) -> BookedInterval {
        BookedInterval {
            time: time.into(),
            duration_min: duration,
        }
    }

    // ── parse_time ──

    #[test]
    fn test_parse_time_basic() {
        assert_eq!(parse_time("09:00"), Some(540));
        assert_eq!(parse_time("19:45"), Some(1185));
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        assert_eq!(parse_time("garbage"), None);
        assert_eq!(parse_time("25:00"), None);
        assert_eq!(parse_time("10:75"), None);
        assert_eq!(parse_time(""), None);
    }

    // ── slot_grid ──

    #[test]
    fn test_grid_bounds() {
        let grid = slot_grid();
        assert_eq!(grid.first().map(String::as_str), Some("09:00"));
        assert_eq!(grid.last().map(String::as_str), Some("19:45"));
    }

    #[test]
    fn test_grid_length() {
        // 11 hours × 4 slots per hour.
        assert_eq!(slot_grid().len(), 44);
    }

    #[test]
    fn test_grid_is_ordered_and_stepped() {
        let grid = slot_grid();
        let minutes: Vec<i64> = grid.iter().map(|t| parse_time(t).unwrap()).collect();
        for pair in minutes.windows(2) {
            assert_eq!(pair[1] - pair[0], SLOT_STEP_MIN);
        }
    }

    // ── slot_occupied ──

    #[test]
    fn test_45_min_booking_blocks_three_slots() {
        // Scenario A: booking at 10:00 for 45 min blocks 10:00/10:15/10:30.
        let existing = vec![booked("10:00", 45)];
        assert!(slot_occupied(parse_time("10:00").unwrap(), &existing));
        assert!(slot_occupied(parse_time("10:15").unwrap(), &existing));
        assert!(slot_occupied(parse_time("10:30").unwrap(), &existing));
        assert!(!slot_occupied(parse_time("09:45").unwrap(), &existing));
        assert!(!slot_occupied(parse_time("10:45").unwrap(), &existing));
    }

    #[test]
    fn test_unparseable_booking_time_ignored() {
        let existing = vec![booked("??", 45)];
        assert!(!slot_occupied(parse_time("10:00").unwrap(), &existing));
    }

    // ── range_conflicts ──

    #[test]
    fn test_exact_overlap_conflicts() {
        let existing = vec![booked("10:00", 30)];
        assert!(range_conflicts(600, 30, &existing));
    }

    #[test]
    fn test_partial_overlap_conflicts() {
        let existing = vec![booked("10:00", 45)];
        // 10:30–11:00 overlaps 10:00–10:45.
        assert!(range_conflicts(630, 30, &existing));
        // 09:30–10:15 overlaps from the front.
        assert!(range_conflicts(570, 45, &existing));
    }

    #[test]
    fn test_adjacent_intervals_do_not_conflict() {
        let existing = vec![booked("10:00", 45)];
        // Ends exactly when the booking starts.
        assert!(!range_conflicts(570, 30, &existing));
        // Starts exactly when the booking ends (10:45).
        assert!(!range_conflicts(645, 30, &existing));
    }

    #[test]
    fn test_containment_conflicts() {
        let existing = vec![booked("10:00", 120)];
        assert!(range_conflicts(630, 15, &existing));
    }

    #[test]
    fn test_no_bookings_no_conflict() {
        assert!(!range_conflicts(600, 60, &[]));
    }

    // ── annotate_day ──

    #[test]
    fn test_annotate_scenario_a() {
        let existing = vec![booked("10:00", 45)];
        let slots = annotate_day(&existing, false, 0);
        let find = |t: &str| slots.iter().find(|s| s.time == t).unwrap();

        assert!(!find("10:00").available);
        assert!(!find("10:15").available);
        assert!(!find("10:30").available);
        assert_eq!(find("10:15").reason, Some("booked"));
        assert!(find("09:45").available);
        assert!(find("10:45").available);
    }

    #[test]
    fn test_annotate_counts() {
        let existing = vec![booked("10:00", 45)];
        let slots = annotate_day(&existing, false, 0);
        let available = slots.iter().filter(|s| s.available).count();
        assert_eq!(slots.len(), 44);
        assert_eq!(available, 41);
    }

    #[test]
    fn test_annotate_past_slots_today() {
        // 12:05 local: everything at or before 12:00 is in the past.
        let slots = annotate_day(&[], true, 12 * 60 + 5);
        let find = |t: &str| slots.iter().find(|s| s.time == t).unwrap();
        assert!(!find("12:00").available);
        assert_eq!(find("12:00").reason, Some("past"));
        assert!(find("12:15").available);
    }

    #[test]
    fn test_annotate_other_day_ignores_now() {
        let slots = annotate_day(&[], false, 23 * 60);
        assert!(slots.iter().all(|s| s.available));
    }

    #[test]
    fn test_annotate_booked_takes_precedence_on_future_slot() {
        let existing = vec![booked("15:00", 30)];
        let slots = annotate_day(&existing, true, 10 * 60);
        let slot = slots.iter().find(|s| s.time == "15:00").unwrap();
        assert_eq!(slot.reason, Some("booked"));
    }
}

//! Recurrence evaluation: when does a pattern fire next?
//!
//! All arithmetic happens on local wall-clock time in the message's IANA
//! timezone; only the final candidate is converted back to UTC. The functions
//! here are pure so they can be exercised with fixed reference instants.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::types::{Frequency, RecurrencePattern};

/// Time of day used when a pattern omits `time`.
pub const DEFAULT_TIME: &str = "12:00";
/// Day of month used when a monthly pattern omits `day`.
pub const DEFAULT_MONTH_DAY: u32 = 1;

/// Days scanned, today included, when looking for the next weekly slot.
const WEEKLY_LOOKAHEAD_DAYS: i64 = 7;
/// Longest DST gap we step over when a local time does not exist.
const MAX_GAP_MINUTES: i64 = 180;

/// Parse a timezone string into a `chrono_tz::Tz`, falling back to UTC.
pub fn parse_tz(tz: &str) -> Tz {
    tz.parse::<Tz>().unwrap_or_else(|_| {
        warn!(timezone = %tz, "unknown timezone, evaluating in UTC");
        chrono_tz::UTC
    })
}

/// Parse `"HH:MM"` (24h) into a time of day.
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let (hour, minute) = s.trim().split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Compute the first instant strictly after `reference` at which `pattern`
/// fires, evaluated in `timezone`.
///
/// Returns `None` when the pattern cannot produce a fire time: an unknown
/// frequency, a weekly pattern without usable weekdays, a malformed time or an
/// out-of-range day of month.
pub fn next_fire_time(
    pattern: &RecurrencePattern,
    timezone: &str,
    reference: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let tz = parse_tz(timezone);
    let time = parse_time_of_day(pattern.time.as_deref().unwrap_or(DEFAULT_TIME))?;
    let today = reference.with_timezone(&tz).date_naive();

    match pattern.frequency {
        Frequency::Daily => {
            let candidate = resolve_local(tz, today.and_time(time))?;
            if candidate > reference {
                Some(candidate)
            } else {
                resolve_local(tz, today.succ_opt()?.and_time(time))
            }
        }

        Frequency::Weekly => (0..WEEKLY_LOOKAHEAD_DAYS).find_map(|offset| {
            let date = today.checked_add_signed(Duration::days(offset))?;
            let weekday = date.weekday().num_days_from_sunday() as u8;
            if !pattern.days.contains(&weekday) {
                return None;
            }
            let candidate = resolve_local(tz, date.and_time(time))?;
            (candidate > reference).then_some(candidate)
        }),

        Frequency::Monthly => {
            let day = pattern.day.unwrap_or(DEFAULT_MONTH_DAY);
            if !(1..=31).contains(&day) {
                return None;
            }
            let candidate = monthly_occurrence(tz, today.year(), today.month(), day, time)?;
            if candidate > reference {
                Some(candidate)
            } else {
                let (year, month) = next_month(today.year(), today.month());
                monthly_occurrence(tz, year, month, day, time)
            }
        }

        Frequency::Unknown => None,
    }
}

/// Up to `n` consecutive fire times after `from`.
pub fn upcoming(
    pattern: &RecurrencePattern,
    timezone: &str,
    from: DateTime<Utc>,
    n: usize,
) -> Vec<DateTime<Utc>> {
    let mut results = Vec::with_capacity(n);
    let mut cursor = from;
    for _ in 0..n {
        match next_fire_time(pattern, timezone, cursor) {
            Some(next) => {
                results.push(next);
                cursor = next;
            }
            None => break,
        }
    }
    results
}

/// Check a pattern and timezone before they are persisted.
///
/// Stricter than [`next_fire_time`], which treats bad input as "never fires".
pub fn validate(pattern: &RecurrencePattern, timezone: &str) -> Result<(), String> {
    if timezone.parse::<Tz>().is_err() {
        return Err(format!("unknown timezone '{timezone}'"));
    }
    if let Some(ref time) = pattern.time {
        if parse_time_of_day(time).is_none() {
            return Err(format!("time '{time}' is not a valid HH:MM value"));
        }
    }
    match pattern.frequency {
        Frequency::Daily => Ok(()),
        Frequency::Weekly => {
            if pattern.days.is_empty() {
                return Err("weekly pattern needs at least one weekday".to_string());
            }
            if let Some(bad) = pattern.days.iter().find(|d| **d > 6) {
                return Err(format!("weekday {bad} is out of range (0 = Sunday … 6 = Saturday)"));
            }
            Ok(())
        }
        Frequency::Monthly => match pattern.day {
            Some(day) if !(1..=31).contains(&day) => {
                Err(format!("day of month {day} is out of range (1–31)"))
            }
            _ => Ok(()),
        },
        Frequency::Unknown => Err("unknown frequency".to_string()),
    }
}

/// The `day`-th day of the given month at `time`, clamped to the month's
/// last day (day 31 in April fires on the 30th).
fn monthly_occurrence(
    tz: Tz,
    year: i32,
    month: u32,
    day: u32,
    time: NaiveTime,
) -> Option<DateTime<Utc>> {
    let day = day.min(days_in_month(year, month)?);
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    resolve_local(tz, date.and_time(time))
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = next_month(year, month);
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1)?;
    Some(first_of_next.pred_opt()?.day())
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Map a local wall-clock time to UTC.
///
/// Ambiguous times (fall-back overlap) take the earliest mapping. Times inside
/// a spring-forward gap move to the first local minute that exists.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    (0..=MAX_GAP_MINUTES).find_map(|shift| {
        tz.from_local_datetime(&(local + Duration::minutes(shift)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn daily_before_time_fires_today() {
        let pattern = RecurrencePattern::daily("09:00");
        let next = next_fire_time(&pattern, "UTC", utc(2025, 1, 1, 8, 0));
        assert_eq!(next, Some(utc(2025, 1, 1, 9, 0)));
    }

    #[test]
    fn daily_after_time_fires_tomorrow() {
        let pattern = RecurrencePattern::daily("09:00");
        let next = next_fire_time(&pattern, "UTC", utc(2025, 1, 1, 9, 30));
        assert_eq!(next, Some(utc(2025, 1, 2, 9, 0)));
    }

    #[test]
    fn daily_exactly_at_time_fires_tomorrow() {
        let pattern = RecurrencePattern::daily("09:00");
        let next = next_fire_time(&pattern, "UTC", utc(2025, 1, 1, 9, 0));
        assert_eq!(next, Some(utc(2025, 1, 2, 9, 0)));
    }

    #[test]
    fn daily_property_holds_for_every_reference_hour() {
        let pattern = RecurrencePattern::daily("14:30");
        for hour in 0..24 {
            let reference = utc(2025, 6, 10, hour, 15);
            let next = next_fire_time(&pattern, "UTC", reference).unwrap();
            let today = utc(2025, 6, 10, 14, 30);
            if reference < today {
                assert_eq!(next, today);
            } else {
                assert_eq!(next, today + Duration::days(1));
            }
        }
    }

    #[test]
    fn missing_time_defaults_to_noon() {
        let pattern = RecurrencePattern {
            frequency: Frequency::Daily,
            time: None,
            days: Vec::new(),
            day: None,
        };
        let next = next_fire_time(&pattern, "UTC", utc(2025, 3, 1, 0, 0));
        assert_eq!(next, Some(utc(2025, 3, 1, 12, 0)));
    }

    #[test]
    fn daily_uses_local_wall_clock() {
        // Berlin is UTC+1 in January and UTC+2 in July.
        let pattern = RecurrencePattern::daily("09:00");
        let winter = next_fire_time(&pattern, "Europe/Berlin", utc(2025, 1, 15, 0, 0));
        assert_eq!(winter, Some(utc(2025, 1, 15, 8, 0)));
        let summer = next_fire_time(&pattern, "Europe/Berlin", utc(2025, 7, 15, 0, 0));
        assert_eq!(summer, Some(utc(2025, 7, 15, 7, 0)));
    }

    #[test]
    fn local_date_decides_today() {
        // 2025-01-01T23:30Z is already Jan 2 in Tokyo (UTC+9); 09:00 Tokyo
        // on Jan 2 is 00:00Z Jan 2, still ahead of the reference.
        let pattern = RecurrencePattern::daily("09:00");
        let next = next_fire_time(&pattern, "Asia/Tokyo", utc(2025, 1, 1, 23, 30));
        assert_eq!(next, Some(utc(2025, 1, 2, 0, 0)));
    }

    #[test]
    fn weekly_picks_first_listed_day() {
        // Sunday 2025-01-05 → Monday 2025-01-06 12:00.
        let pattern = RecurrencePattern::weekly(vec![1, 3], "12:00");
        let next = next_fire_time(&pattern, "UTC", utc(2025, 1, 5, 0, 0));
        assert_eq!(next, Some(utc(2025, 1, 6, 12, 0)));
    }

    #[test]
    fn weekly_today_still_ahead() {
        // Monday 2025-01-06 at 11:00, Monday slot at 12:00 is still ahead.
        let pattern = RecurrencePattern::weekly(vec![1], "12:00");
        let next = next_fire_time(&pattern, "UTC", utc(2025, 1, 6, 11, 0));
        assert_eq!(next, Some(utc(2025, 1, 6, 12, 0)));
    }

    #[test]
    fn weekly_single_day_already_passed_has_no_next_time() {
        // Monday only; the scan covers Mon 6th through Sun 12th.
        let pattern = RecurrencePattern::weekly(vec![1], "12:00");
        assert_eq!(next_fire_time(&pattern, "UTC", utc(2025, 1, 6, 12, 0)), None);
        assert_eq!(next_fire_time(&pattern, "UTC", utc(2025, 1, 6, 12, 30)), None);
        assert_eq!(
            next_fire_time(&pattern, "UTC", utc(2025, 1, 6, 11, 59)),
            Some(utc(2025, 1, 6, 12, 0))
        );
    }

    #[test]
    fn weekly_result_is_listed_weekday_and_after_reference() {
        let pattern = RecurrencePattern::weekly(vec![0, 2, 5], "07:45");
        let start = utc(2025, 2, 1, 0, 0);
        for hours in 0..(24 * 14) {
            let reference = start + Duration::hours(hours);
            let next = next_fire_time(&pattern, "America/New_York", reference).unwrap();
            assert!(next > reference);
            let local = next.with_timezone(&chrono_tz::America::New_York);
            let weekday = local.weekday().num_days_from_sunday() as u8;
            assert!(pattern.days.contains(&weekday), "unexpected weekday {weekday}");
            assert!(next - reference <= Duration::days(7));
        }
    }

    #[test]
    fn weekly_without_days_has_no_next_time() {
        let pattern = RecurrencePattern::weekly(Vec::new(), "12:00");
        assert_eq!(next_fire_time(&pattern, "UTC", utc(2025, 1, 5, 0, 0)), None);
    }

    #[test]
    fn weekly_with_only_invalid_days_has_no_next_time() {
        let pattern = RecurrencePattern::weekly(vec![7, 9], "12:00");
        assert_eq!(next_fire_time(&pattern, "UTC", utc(2025, 1, 5, 0, 0)), None);
    }

    #[test]
    fn monthly_this_month_when_ahead() {
        let pattern = RecurrencePattern::monthly(15, "10:00");
        let next = next_fire_time(&pattern, "UTC", utc(2025, 4, 10, 0, 0));
        assert_eq!(next, Some(utc(2025, 4, 15, 10, 0)));
    }

    #[test]
    fn monthly_next_month_when_passed() {
        let pattern = RecurrencePattern::monthly(15, "10:00");
        let next = next_fire_time(&pattern, "UTC", utc(2025, 4, 15, 10, 0));
        assert_eq!(next, Some(utc(2025, 5, 15, 10, 0)));
    }

    #[test]
    fn monthly_rolls_over_year_end() {
        let pattern = RecurrencePattern::monthly(1, "00:00");
        let next = next_fire_time(&pattern, "UTC", utc(2025, 12, 20, 0, 0));
        assert_eq!(next, Some(utc(2026, 1, 1, 0, 0)));
    }

    #[test]
    fn monthly_clamps_to_last_day_of_short_month() {
        let pattern = RecurrencePattern::monthly(31, "09:00");
        let next = next_fire_time(&pattern, "UTC", utc(2025, 1, 31, 10, 0));
        assert_eq!(next, Some(utc(2025, 2, 28, 9, 0)));

        let leap = next_fire_time(&pattern, "UTC", utc(2024, 1, 31, 10, 0));
        assert_eq!(leap, Some(utc(2024, 2, 29, 9, 0)));
    }

    #[test]
    fn monthly_clamped_slot_this_month() {
        // Day 31 in April means April 30.
        let pattern = RecurrencePattern::monthly(31, "09:00");
        let next = next_fire_time(&pattern, "UTC", utc(2025, 4, 2, 0, 0));
        assert_eq!(next, Some(utc(2025, 4, 30, 9, 0)));
    }

    #[test]
    fn monthly_defaults_to_first_day() {
        let pattern = RecurrencePattern {
            frequency: Frequency::Monthly,
            time: Some("08:00".to_string()),
            days: Vec::new(),
            day: None,
        };
        let next = next_fire_time(&pattern, "UTC", utc(2025, 5, 2, 0, 0));
        assert_eq!(next, Some(utc(2025, 6, 1, 8, 0)));
    }

    #[test]
    fn monthly_out_of_range_day_has_no_next_time() {
        let pattern = RecurrencePattern::monthly(0, "08:00");
        assert_eq!(next_fire_time(&pattern, "UTC", utc(2025, 5, 2, 0, 0)), None);
    }

    #[test]
    fn unknown_frequency_has_no_next_time() {
        let pattern: RecurrencePattern =
            serde_json::from_str(r#"{"frequency":"hourly","time":"10:00"}"#).unwrap();
        assert_eq!(pattern.frequency, Frequency::Unknown);
        assert_eq!(next_fire_time(&pattern, "UTC", utc(2025, 5, 2, 0, 0)), None);
    }

    #[test]
    fn malformed_time_has_no_next_time() {
        let pattern = RecurrencePattern::daily("25:99");
        assert_eq!(next_fire_time(&pattern, "UTC", utc(2025, 5, 2, 0, 0)), None);
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let pattern = RecurrencePattern::daily("09:00");
        let next = next_fire_time(&pattern, "Not/AZone", utc(2025, 1, 1, 8, 0));
        assert_eq!(next, Some(utc(2025, 1, 1, 9, 0)));
    }

    #[test]
    fn spring_forward_gap_moves_to_first_valid_minute() {
        // 2025-03-09 02:30 does not exist in New York; clocks jump to 03:00 EDT.
        let pattern = RecurrencePattern::daily("02:30");
        let next = next_fire_time(&pattern, "America/New_York", utc(2025, 3, 9, 5, 0));
        assert_eq!(next, Some(utc(2025, 3, 9, 7, 0)));
    }

    #[test]
    fn fall_back_overlap_takes_earliest_instant() {
        // 2025-11-02 01:30 happens twice in New York; the EDT one is 05:30Z.
        let pattern = RecurrencePattern::daily("01:30");
        let next = next_fire_time(&pattern, "America/New_York", utc(2025, 11, 2, 4, 0));
        assert_eq!(next, Some(utc(2025, 11, 2, 5, 30)));
    }

    #[test]
    fn upcoming_lists_consecutive_slots() {
        let pattern = RecurrencePattern::weekly(vec![1, 3], "12:00");
        let slots = upcoming(&pattern, "UTC", utc(2025, 1, 5, 0, 0), 3);
        assert_eq!(
            slots,
            vec![
                utc(2025, 1, 6, 12, 0),
                utc(2025, 1, 8, 12, 0),
                utc(2025, 1, 13, 12, 0),
            ]
        );
        assert!(slots.iter().all(|s| matches!(s.weekday(), Weekday::Mon | Weekday::Wed)));
    }

    #[test]
    fn upcoming_stops_when_pattern_is_exhausted() {
        let pattern = RecurrencePattern::weekly(Vec::new(), "12:00");
        assert!(upcoming(&pattern, "UTC", utc(2025, 1, 5, 0, 0), 5).is_empty());
    }

    #[test]
    fn validate_rejects_misconfigured_patterns() {
        assert!(validate(&RecurrencePattern::daily("09:00"), "Europe/Paris").is_ok());
        assert!(validate(&RecurrencePattern::daily("09:00"), "Mars/Olympus").is_err());
        assert!(validate(&RecurrencePattern::daily("9am"), "UTC").is_err());
        assert!(validate(&RecurrencePattern::weekly(Vec::new(), "09:00"), "UTC").is_err());
        assert!(validate(&RecurrencePattern::weekly(vec![1, 7], "09:00"), "UTC").is_err());
        assert!(validate(&RecurrencePattern::monthly(32, "09:00"), "UTC").is_err());
        assert!(validate(&RecurrencePattern::monthly(31, "09:00"), "UTC").is_ok());
    }

    #[test]
    fn parse_time_of_day_accepts_single_digit_hour() {
        assert_eq!(parse_time_of_day("9:05"), NaiveTime::from_hms_opt(9, 5, 0));
        assert_eq!(parse_time_of_day("23:59"), NaiveTime::from_hms_opt(23, 59, 0));
        assert_eq!(parse_time_of_day("24:00"), None);
        assert_eq!(parse_time_of_day("noon"), None);
    }
}

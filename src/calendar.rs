//! Timezone and DST-aware date arithmetic.
//!
//! Everything stored by the engine is UTC; everything presented to humans is
//! local to an allocation's IANA timezone. All ranges are half-open
//! `[start, end)`. On DST transition days a "whole day" is genuinely 23 or
//! 25 hours long and these helpers never pretend otherwise; normalization
//! for display is a separate, explicit step.

use chrono::offset::LocalResult;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::errors::Error;

/// Parse an IANA timezone name.
pub fn parse_tz(name: &str) -> Result<Tz, Error> {
    name.parse::<Tz>().map_err(|_| Error::Timezone(name.to_string()))
}

/// A point in time as accepted by the public API: either an absolute UTC
/// instant, or a timezone-naive wall-clock time that is interpreted in the
/// scheduler's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInput {
    Utc(DateTime<Utc>),
    Naive(NaiveDateTime),
}

impl From<DateTime<Utc>> for TimeInput {
    fn from(dt: DateTime<Utc>) -> Self {
        TimeInput::Utc(dt)
    }
}

impl From<NaiveDateTime> for TimeInput {
    fn from(dt: NaiveDateTime) -> Self {
        TimeInput::Naive(dt)
    }
}

/// Convert a local wall-clock time to UTC. Ambiguous times (the repeated
/// hour when clocks fall back) resolve to the earlier instant; nonexistent
/// times (the skipped hour when clocks spring forward) shift forward past
/// the gap.
pub fn to_utc(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            // Inside a DST gap. Gaps are at most a couple of hours; probe
            // forward in half-hour steps until the wall clock exists again.
            let mut probe = naive;
            loop {
                probe += Duration::minutes(30);
                match tz.from_local_datetime(&probe) {
                    LocalResult::Single(dt) => return dt.with_timezone(&Utc),
                    LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
                    LocalResult::None => continue,
                }
            }
        }
    }
}

/// Normalize an API-level time to UTC: naive inputs are interpreted in `tz`,
/// aware inputs pass through.
pub fn standardize(input: impl Into<TimeInput>, tz: Tz) -> DateTime<Utc> {
    match input.into() {
        TimeInput::Utc(dt) => dt,
        TimeInput::Naive(naive) => to_utc(naive, tz),
    }
}

/// Half-open overlap test.
pub fn overlaps(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}

/// How often `[start, end)` overlaps any of the given spans.
pub fn count_overlaps(
    spans: &[(DateTime<Utc>, DateTime<Utc>)],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> usize {
    spans
        .iter()
        .filter(|(s, e)| overlaps(start, end, *s, *e))
        .count()
}

/// Align a half-open range to whole local days: start snaps down to local
/// midnight, end snaps up to the following local midnight. The result spans
/// the actual local days, so a fall-back day is 25 hours long.
pub fn align_range_to_day(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tz: Tz,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_start = start.with_timezone(&tz);
    let local_end = end.with_timezone(&tz);

    let day_start = local_start.date_naive();
    // an end exactly on local midnight already is a day boundary
    let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
    let day_end = if local_end.time() == midnight && local_end.date_naive() > day_start {
        local_end.date_naive()
    } else {
        local_end.date_naive() + Duration::days(1)
    };

    (
        to_utc(day_start.and_time(midnight), tz),
        to_utc(day_end.and_time(midnight), tz),
    )
}

/// One half-open UTC pair per local calendar day between `first` and `last`
/// (inclusive), running from `day_start` to `day_end` local time. A
/// `day_end` of `None` means the following local midnight, which yields the
/// true 23/24/25 hour span on DST transition days.
pub fn expand_daily_dates(
    first: NaiveDate,
    last: NaiveDate,
    day_start: NaiveTime,
    day_end: Option<NaiveTime>,
    tz: Tz,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut out = Vec::new();
    let mut day = first;
    while day <= last {
        let start = to_utc(day.and_time(day_start), tz);
        let end = match day_end {
            Some(t) => to_utc(day.and_time(t), tz),
            None => to_utc((day + Duration::days(1)).and_time(NaiveTime::MIN), tz),
        };
        if start < end {
            out.push((start, end));
        }
        day += Duration::days(1);
    }
    out
}

/// True if `[start, end)` covers whole local days: both ends on local
/// midnight and at least one day apart.
pub fn is_whole_day(start: DateTime<Utc>, end: DateTime<Utc>, tz: Tz) -> bool {
    let local_start = start.with_timezone(&tz);
    let local_end = end.with_timezone(&tz);

    local_start.time() == NaiveTime::MIN
        && local_end.time() == NaiveTime::MIN
        && local_start < local_end
}

/// Weekday of an instant as seen in a timezone. Day filters must use this
/// rather than the UTC weekday: a Monday 00:30 in Zurich is still Sunday in
/// UTC.
pub fn weekday_in(tz: Tz, instant: DateTime<Utc>) -> Weekday {
    instant.with_timezone(&tz).weekday()
}

/// Length of a local calendar day in seconds (86400 except on DST
/// transition days, where it is 82800 or 90000).
pub fn day_length(tz: Tz, day: NaiveDate) -> i64 {
    let start = to_utc(day.and_time(NaiveTime::MIN), tz);
    let end = to_utc((day + Duration::days(1)).and_time(NaiveTime::MIN), tz);
    (end - start).num_seconds()
}

/// Availability percentage for one local day, scaled as if the day had 24
/// hours so renderers see a uniform grid. With `normalize` off (or on a
/// plain 24h day) this is the raw percentage.
///
/// On a 23h day the skipped hour counts as used (it cannot be reserved but
/// occupies grid space); on a 25h day the percentage is taken against the
/// nominal 24 hours.
pub fn normalized_availability(
    free_seconds: i64,
    total_seconds: i64,
    tz: Tz,
    day: NaiveDate,
    normalize: bool,
) -> f64 {
    if total_seconds <= 0 {
        return 0.0;
    }
    let raw = free_seconds as f64 / total_seconds as f64 * 100.0;

    if !normalize {
        return raw.clamp(0.0, 100.0);
    }

    let real_day = day_length(tz, day);
    if real_day == 86_400 || total_seconds != real_day {
        // not a transition day, or the span is not the whole day anyway
        return raw.clamp(0.0, 100.0);
    }

    let used = total_seconds - free_seconds;
    let used = if real_day < 86_400 {
        used + (86_400 - real_day)
    } else {
        // the repeated hour collapses onto the normalized grid
        used.min(86_400)
    };

    (100.0 - used as f64 / 86_400.0 * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZURICH: Tz = chrono_tz::Europe::Zurich;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn naive(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        date(y, m, d).and_hms_opt(h, min, 0).unwrap()
    }

    #[test]
    fn naive_times_are_localized() {
        // Zurich is UTC+2 in June
        let utc = to_utc(naive(2024, 6, 1, 10, 0), ZURICH);
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
    }

    #[test]
    fn standardize_passes_utc_through() {
        let instant = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        assert_eq!(standardize(instant, ZURICH), instant);
        assert_eq!(standardize(naive(2024, 6, 1, 10, 0), ZURICH), instant);
    }

    #[test]
    fn ambiguous_fall_back_picks_earlier() {
        // 2024-10-27 02:30 happens twice in Zurich; the first is CEST (UTC+2)
        let utc = to_utc(naive(2024, 10, 27, 2, 30), ZURICH);
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 10, 27, 0, 30, 0).unwrap());
    }

    #[test]
    fn nonexistent_spring_forward_shifts_past_gap() {
        // 2024-03-31 02:30 does not exist in Zurich (clocks jump 02:00→03:00)
        let utc = to_utc(naive(2024, 3, 31, 2, 30), ZURICH);
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 3, 31, 1, 0, 0).unwrap());
    }

    #[test]
    fn overlap_is_half_open() {
        let t = |h| Utc.with_ymd_and_hms(2024, 6, 1, h, 0, 0).unwrap();
        assert!(overlaps(t(9), t(11), t(10), t(12)));
        assert!(!overlaps(t(9), t(10), t(10), t(11))); // adjacent
        assert!(overlaps(t(9), t(12), t(10), t(11))); // contained
    }

    #[test]
    fn count_overlaps_counts_each_span() {
        let t = |h| Utc.with_ymd_and_hms(2024, 6, 1, h, 0, 0).unwrap();
        let spans = vec![(t(9), t(10)), (t(10), t(11)), (t(9), t(12))];
        assert_eq!(count_overlaps(&spans, t(9), t(10)), 2);
        assert_eq!(count_overlaps(&spans, t(11), t(12)), 1);
    }

    #[test]
    fn whole_day_alignment_ordinary_day() {
        let (s, e) = align_range_to_day(
            to_utc(naive(2024, 6, 1, 10, 0), ZURICH),
            to_utc(naive(2024, 6, 1, 15, 0), ZURICH),
            ZURICH,
        );
        // local day runs 22:00 UTC the day before to 22:00 UTC
        assert_eq!(s, Utc.with_ymd_and_hms(2024, 5, 31, 22, 0, 0).unwrap());
        assert_eq!(e, Utc.with_ymd_and_hms(2024, 6, 1, 22, 0, 0).unwrap());
        assert_eq!((e - s).num_hours(), 24);
    }

    #[test]
    fn whole_day_alignment_keeps_midnight_end() {
        let s_in = to_utc(naive(2024, 6, 1, 0, 0), ZURICH);
        let e_in = to_utc(naive(2024, 6, 2, 0, 0), ZURICH);
        let (s, e) = align_range_to_day(s_in, e_in, ZURICH);
        assert_eq!((s, e), (s_in, e_in));
    }

    #[test]
    fn fall_back_day_is_25_hours() {
        let (s, e) = align_range_to_day(
            to_utc(naive(2024, 10, 27, 12, 0), ZURICH),
            to_utc(naive(2024, 10, 27, 13, 0), ZURICH),
            ZURICH,
        );
        assert_eq!((e - s).num_hours(), 25);
    }

    #[test]
    fn spring_forward_day_is_23_hours() {
        let (s, e) = align_range_to_day(
            to_utc(naive(2024, 3, 31, 12, 0), ZURICH),
            to_utc(naive(2024, 3, 31, 13, 0), ZURICH),
            ZURICH,
        );
        assert_eq!((e - s).num_hours(), 23);
    }

    #[test]
    fn expand_daily_dates_covers_each_day() {
        let days = expand_daily_dates(
            date(2024, 10, 26),
            date(2024, 10, 28),
            NaiveTime::MIN,
            None,
            ZURICH,
        );
        assert_eq!(days.len(), 3);
        assert_eq!((days[0].1 - days[0].0).num_hours(), 24);
        assert_eq!((days[1].1 - days[1].0).num_hours(), 25); // fall back
        assert_eq!((days[2].1 - days[2].0).num_hours(), 24);
        // consecutive days touch but never overlap
        assert_eq!(days[0].1, days[1].0);
    }

    #[test]
    fn expand_daily_dates_with_day_times() {
        let days = expand_daily_dates(
            date(2024, 6, 1),
            date(2024, 6, 2),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            Some(NaiveTime::from_hms_opt(17, 0, 0).unwrap()),
            ZURICH,
        );
        assert_eq!(days.len(), 2);
        assert_eq!((days[0].1 - days[0].0).num_hours(), 8);
    }

    #[test]
    fn whole_day_detection() {
        let s = to_utc(naive(2024, 6, 1, 0, 0), ZURICH);
        let e = to_utc(naive(2024, 6, 2, 0, 0), ZURICH);
        assert!(is_whole_day(s, e, ZURICH));
        assert!(!is_whole_day(s, e - Duration::hours(1), ZURICH));
        // whole day in Zurich is not a whole day in UTC
        assert!(!is_whole_day(s, e, chrono_tz::UTC));
    }

    #[test]
    fn weekday_respects_timezone() {
        // Sunday 23:30 UTC is Monday 01:30 in Zurich
        let instant = Utc.with_ymd_and_hms(2024, 6, 2, 23, 30, 0).unwrap();
        assert_eq!(instant.weekday(), Weekday::Sun);
        assert_eq!(weekday_in(ZURICH, instant), Weekday::Mon);
    }

    #[test]
    fn day_lengths() {
        assert_eq!(day_length(ZURICH, date(2024, 6, 1)), 86_400);
        assert_eq!(day_length(ZURICH, date(2024, 10, 27)), 90_000);
        assert_eq!(day_length(ZURICH, date(2024, 3, 31)), 82_800);
    }

    #[test]
    fn normalized_availability_uniform_day_is_raw() {
        let day = date(2024, 6, 1);
        let v = normalized_availability(43_200, 86_400, ZURICH, day, true);
        assert!((v - 50.0).abs() < 1e-9);
    }

    #[test]
    fn normalized_availability_bounds() {
        for day in [date(2024, 3, 31), date(2024, 6, 1), date(2024, 10, 27)] {
            let total = day_length(ZURICH, day);
            for free in [0, total / 2, total] {
                let v = normalized_availability(free, total, ZURICH, day, true);
                assert!((0.0..=100.0).contains(&v), "{day} free={free} -> {v}");
            }
        }
    }

    #[test]
    fn normalized_availability_scales_transition_days() {
        // one 15-minute reservation on the 25h day
        let day = date(2024, 10, 27);
        let total = day_length(ZURICH, day);
        let norm = normalized_availability(total - 900, total, ZURICH, day, true);
        let raw = normalized_availability(total - 900, total, ZURICH, day, false);
        assert!(norm < raw);
        assert!((norm - (100.0 - 900.0 / 86_400.0 * 100.0)).abs() < 1e-9);
    }
}

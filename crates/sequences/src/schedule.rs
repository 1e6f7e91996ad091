//! Send-time resolution: turns a base instant, a step delay and an optional
//! preferred time-of-day into the instant a step fires.
//!
//! Day delays are calendar arithmetic in the sequence's timezone (a one-day
//! delay from 09:00 local lands on 09:00 local even across a DST change);
//! hour delays are elapsed time. This module is the only place delay math
//! happens, and it never reads the clock.

use chrono::{DateTime, Days, Duration, LocalResult, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::types::{Sequence, Step};

/// Computes when a step fires.
///
/// If `preferred_time` is set the local time-of-day is overwritten, and when
/// that lands at or before `base` the date rolls forward one local day.
pub fn resolve(
    base: DateTime<Utc>,
    delay_days: u32,
    delay_hours: u32,
    preferred_time: Option<NaiveTime>,
    tz: Tz,
) -> DateTime<Utc> {
    let local = base.with_timezone(&tz).naive_local();
    let shifted = local
        .checked_add_days(Days::new(u64::from(delay_days)))
        .unwrap_or(NaiveDateTime::MAX);
    let after_days = localize(tz, shifted).with_timezone(&Utc);
    let fire = after_days + Duration::hours(i64::from(delay_hours));

    let Some(time_of_day) = preferred_time else {
        return fire;
    };

    let date = fire.with_timezone(&tz).date_naive();
    let pinned = localize(tz, date.and_time(time_of_day)).with_timezone(&Utc);
    if pinned > base {
        return pinned;
    }
    match date.succ_opt() {
        Some(next) => localize(tz, next.and_time(time_of_day)).with_timezone(&Utc),
        None => fire,
    }
}

/// Fire time of `step` in `sequence` measured from `base`.
pub fn fire_time(sequence: &Sequence, step: &Step, base: DateTime<Utc>) -> DateTime<Utc> {
    resolve(
        base,
        step.delay_days,
        step.delay_hours,
        sequence.preferred_time,
        sequence.timezone,
    )
}

/// Maps a local wall-clock time to an instant. Ambiguous times (DST fall-back)
/// take the earlier offset; times inside a DST gap are shifted forward by the
/// length of the gap.
fn localize(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let before_gap = naive
                .checked_sub_signed(Duration::hours(6))
                .and_then(|earlier| tz.from_local_datetime(&earlier).earliest());
            let offset_secs = before_gap
                .map(|dt| dt.offset().fix().local_minus_utc())
                .unwrap_or(0);
            let as_utc = naive - Duration::seconds(i64::from(offset_secs));
            tz.from_utc_datetime(&as_utc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(h, m, 0)
    }

    #[test]
    fn test_zero_delay_fires_at_base() {
        let base = utc(2026, 1, 1, 9, 0);
        assert_eq!(resolve(base, 0, 0, None, Tz::UTC), base);
    }

    #[test]
    fn test_day_and_hour_delays() {
        let base = utc(2026, 1, 1, 9, 0);
        assert_eq!(resolve(base, 1, 0, None, Tz::UTC), utc(2026, 1, 2, 9, 0));
        assert_eq!(resolve(base, 2, 5, None, Tz::UTC), utc(2026, 1, 3, 14, 0));
        assert_eq!(resolve(base, 0, 36, None, Tz::UTC), utc(2026, 1, 2, 21, 0));
    }

    #[test]
    fn test_preferred_time_later_same_day() {
        let base = utc(2026, 1, 1, 9, 0);
        assert_eq!(resolve(base, 0, 0, hm(14, 0), Tz::UTC), utc(2026, 1, 1, 14, 0));
    }

    #[test]
    fn test_preferred_time_already_passed_rolls_forward() {
        let base = utc(2026, 1, 1, 16, 0);
        assert_eq!(resolve(base, 0, 0, hm(14, 0), Tz::UTC), utc(2026, 1, 2, 14, 0));
    }

    #[test]
    fn test_preferred_time_equal_to_base_rolls_forward() {
        let base = utc(2026, 1, 1, 14, 0);
        assert_eq!(resolve(base, 0, 0, hm(14, 0), Tz::UTC), utc(2026, 1, 2, 14, 0));
    }

    #[test]
    fn test_preferred_time_may_precede_delayed_time_on_target_day() {
        // 2 days after 09:00 is 09:00 on the 3rd; pinning to 08:00 that day
        // is still after the base, so no roll.
        let base = utc(2026, 1, 1, 9, 0);
        assert_eq!(resolve(base, 2, 0, hm(8, 0), Tz::UTC), utc(2026, 1, 3, 8, 0));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let base = utc(2026, 6, 30, 23, 59);
        let first = resolve(base, 3, 7, hm(6, 15), New_York);
        let second = resolve(base, 3, 7, hm(6, 15), New_York);
        assert_eq!(first, second);
    }

    #[test]
    fn test_day_delay_keeps_local_time_across_spring_forward() {
        // 09:00 EST on March 7th; DST starts March 8th 2026.
        let base = utc(2026, 3, 7, 14, 0);
        let fire = resolve(base, 1, 0, None, New_York);
        // 09:00 EDT is 13:00 UTC: 23 elapsed hours, not 24.
        assert_eq!(fire, utc(2026, 3, 8, 13, 0));
    }

    #[test]
    fn test_day_delay_keeps_local_time_across_fall_back() {
        // 09:00 EDT on Oct 31st; DST ends Nov 1st 2026.
        let base = utc(2026, 10, 31, 13, 0);
        assert_eq!(resolve(base, 1, 0, None, New_York), utc(2026, 11, 1, 14, 0));
    }

    #[test]
    fn test_hour_delay_is_elapsed_time_across_transition() {
        // 01:00 EST, two hours later is 04:00 EDT.
        let base = utc(2026, 3, 8, 6, 0);
        assert_eq!(resolve(base, 0, 2, None, New_York), utc(2026, 3, 8, 8, 0));
    }

    #[test]
    fn test_multi_day_delay_with_preferred_time_across_dst() {
        // 10:00 EST Friday + 3 days pinned to 09:00 → Monday 09:00 EDT.
        let base = utc(2026, 3, 6, 15, 0);
        assert_eq!(resolve(base, 3, 0, hm(9, 0), New_York), utc(2026, 3, 9, 13, 0));
    }

    #[test]
    fn test_preferred_time_inside_dst_gap_moves_forward() {
        // 02:30 does not exist on March 8th in New York; it becomes 03:30 EDT.
        let base = utc(2026, 3, 8, 5, 0);
        assert_eq!(resolve(base, 0, 0, hm(2, 30), New_York), utc(2026, 3, 8, 7, 30));
    }

    #[test]
    fn test_ambiguous_preferred_time_takes_earlier_offset() {
        // 01:30 happens twice on Nov 1st; the EDT occurrence is 05:30 UTC.
        let base = utc(2026, 11, 1, 4, 0);
        assert_eq!(resolve(base, 0, 0, hm(1, 30), New_York), utc(2026, 11, 1, 5, 30));
    }

    #[test]
    fn test_preferred_time_uses_local_date() {
        // 22:00 EST on Jan 1st is 03:00 UTC Jan 2nd; pinning to 23:00 local
        // stays on Jan 1st local.
        let base = utc(2026, 1, 2, 3, 0);
        assert_eq!(resolve(base, 0, 0, hm(23, 0), New_York), utc(2026, 1, 2, 4, 0));
    }
}

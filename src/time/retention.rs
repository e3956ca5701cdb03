/// Retention window: how far back an empty store is backfilled
use chrono::{DateTime, Utc};

use super::holidays::previous_trading_day;
use super::session::{market_date, start_of_market_day};

/// Start (UTC) of the Nth most recent complete trading day before `now`.
///
/// The current market-local day is never counted, so on a Friday afternoon with
/// `trading_days_back = 2` the result is Wednesday midnight New York time.
pub fn last_retained_instant(now: DateTime<Utc>, trading_days_back: u8) -> DateTime<Utc> {
    let day = (0..trading_days_back).fold(market_date(now), |day, _| previous_trading_day(day));
    start_of_market_day(day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::holidays::is_trading_day;
    use chrono::{NaiveDate, TimeZone};

    fn trading_days_in(from: NaiveDate, to_exclusive: NaiveDate) -> usize {
        from.iter_days()
            .take_while(|d| *d < to_exclusive)
            .filter(|d| is_trading_day(*d))
            .count()
    }

    #[test]
    fn test_sunday_two_days_is_thursday() {
        let now = Utc.with_ymd_and_hms(2025, 7, 13, 16, 0, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 7, 10, 4, 0, 0).unwrap();
        assert_eq!(last_retained_instant(now, 2), expected);
    }

    #[test]
    fn test_utc_sunday_midnight_is_still_saturday_in_new_york() {
        let now = Utc.with_ymd_and_hms(2025, 7, 13, 0, 0, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 7, 10, 4, 0, 0).unwrap();
        assert_eq!(last_retained_instant(now, 2), expected);
    }

    #[test]
    fn test_friday_midday_excludes_incomplete_day() {
        let now = Utc.with_ymd_and_hms(2025, 7, 11, 16, 0, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 7, 9, 4, 0, 0).unwrap();
        assert_eq!(last_retained_instant(now, 2), expected);
    }

    #[test]
    fn test_skips_holiday() {
        // Monday July 7th: Fri 4th is Independence Day.
        let now = Utc.with_ymd_and_hms(2025, 7, 7, 15, 0, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 7, 2, 4, 0, 0).unwrap();
        assert_eq!(last_retained_instant(now, 2), expected);
    }

    #[test]
    fn test_zero_days_is_start_of_today() {
        let now = Utc.with_ymd_and_hms(2025, 12, 3, 18, 0, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 12, 3, 5, 0, 0).unwrap();
        assert_eq!(last_retained_instant(now, 0), expected);
    }

    #[test]
    fn test_trading_day_count_matches_request() {
        let now = Utc.with_ymd_and_hms(2025, 11, 30, 12, 0, 0).unwrap();
        let today = market_date(now);

        for n in 0..=60u8 {
            let start = last_retained_instant(now, n);
            let start_day = market_date(start);
            assert_eq!(start, start_of_market_day(start_day));
            assert_eq!(trading_days_in(start_day, today), n as usize, "n = {}", n);
            if n > 0 {
                assert!(is_trading_day(start_day));
            }
        }
    }
}

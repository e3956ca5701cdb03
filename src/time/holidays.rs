/// NYSE Holiday Calendar Management
use chrono::{Datelike, NaiveDate};

/// Full-day NYSE closures (update annually). Early closes still trade.
const NYSE_HOLIDAYS: &[(i32, u32, u32)] = &[
    // 2025
    (2025, 1, 1),   // New Year's Day
    (2025, 1, 9),   // National Day of Mourning
    (2025, 1, 20),  // Martin Luther King Jr. Day
    (2025, 2, 17),  // Washington's Birthday
    (2025, 4, 18),  // Good Friday
    (2025, 5, 26),  // Memorial Day
    (2025, 6, 19),  // Juneteenth
    (2025, 7, 4),   // Independence Day
    (2025, 9, 1),   // Labor Day
    (2025, 11, 27), // Thanksgiving Day
    (2025, 12, 25), // Christmas Day
    // 2026
    (2026, 1, 1),   // New Year's Day
    (2026, 1, 19),  // Martin Luther King Jr. Day
    (2026, 2, 16),  // Washington's Birthday
    (2026, 4, 3),   // Good Friday
    (2026, 5, 25),  // Memorial Day
    (2026, 6, 19),  // Juneteenth
    (2026, 7, 3),   // Independence Day (observed)
    (2026, 9, 7),   // Labor Day
    (2026, 11, 26), // Thanksgiving Day
    (2026, 12, 25), // Christmas Day
];

pub fn is_market_holiday(date: NaiveDate) -> bool {
    NYSE_HOLIDAYS
        .iter()
        .any(|&(y, m, d)| date.year() == y && date.month() == m && date.day() == d)
}

/// Check if a date is a trading day (not weekend, not holiday)
pub fn is_trading_day(date: NaiveDate) -> bool {
    let weekday = date.weekday();
    if weekday == chrono::Weekday::Sat || weekday == chrono::Weekday::Sun {
        return false;
    }

    !is_market_holiday(date)
}

/// Get next trading day
pub fn next_trading_day(from_date: NaiveDate) -> NaiveDate {
    let mut date = from_date + chrono::Duration::days(1);

    while !is_trading_day(date) {
        date = date + chrono::Duration::days(1);
    }

    date
}

/// Get previous trading day
pub fn previous_trading_day(from_date: NaiveDate) -> NaiveDate {
    let mut date = from_date - chrono::Duration::days(1);

    while !is_trading_day(date) {
        date = date - chrono::Duration::days(1);
    }

    date
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independence_day_holiday() {
        let date = NaiveDate::from_ymd_opt(2025, 7, 4).unwrap();
        assert!(!is_trading_day(date));
        assert!(is_market_holiday(date));

        // Observed on Friday when the 4th is a Saturday.
        let observed = NaiveDate::from_ymd_opt(2026, 7, 3).unwrap();
        assert!(!is_trading_day(observed));
    }

    #[test]
    fn test_weekend() {
        let sat = NaiveDate::from_ymd_opt(2025, 7, 12).unwrap();
        let sun = NaiveDate::from_ymd_opt(2025, 7, 13).unwrap();
        assert!(!is_trading_day(sat));
        assert!(!is_trading_day(sun));
    }

    #[test]
    fn test_regular_weekday() {
        let mon = NaiveDate::from_ymd_opt(2025, 7, 14).unwrap();
        assert!(is_trading_day(mon));
    }

    #[test]
    fn test_trading_day_stepping() {
        // Thursday July 3rd -> skip holiday and weekend -> Monday July 7th
        let thu = NaiveDate::from_ymd_opt(2025, 7, 3).unwrap();
        let mon = NaiveDate::from_ymd_opt(2025, 7, 7).unwrap();
        assert_eq!(next_trading_day(thu), mon);
        assert_eq!(previous_trading_day(mon), thu);
    }
}

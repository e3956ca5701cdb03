/// Market-local calendar conversions (America/New_York)
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::America::New_York;

/// Calendar date of an instant in the market's local time zone
pub fn market_date(instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(&New_York).date_naive()
}

/// Local midnight opening `date`, expressed in UTC
pub fn start_of_market_day(date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    match New_York.from_local_datetime(&midnight).earliest() {
        Some(local) => local.with_timezone(&Utc),
        // New York has no DST gap at midnight; treat a gap as UTC.
        None => Utc.from_utc_datetime(&midnight),
    }
}

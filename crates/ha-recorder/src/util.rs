//! Timestamp and calendar helpers

use chrono::{DateTime, Datelike, TimeZone, Utc, Weekday};

/// Seconds since the epoch as stored in `*_ts` columns
pub fn dt_to_ts(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_micros() as f64 / 1_000_000.0
}

/// Inverse of [`dt_to_ts`], rounded to the microsecond
pub fn ts_to_dt(ts: f64) -> DateTime<Utc> {
    let micros = (ts * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
}

/// True on the second Sunday of the month, the day auto repack runs
pub fn is_second_sunday<Tz: TimeZone>(dt: &DateTime<Tz>) -> bool {
    dt.weekday() == Weekday::Sun && (8..=14).contains(&dt.day())
}

/// `?, ?, ?` for an `IN (...)` clause with `n` parameters
pub fn placeholders(n: usize) -> String {
    let mut out = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_timestamp_conversion() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 15).unwrap()
            + chrono::Duration::microseconds(250_000);
        let ts = dt_to_ts(dt);
        assert_eq!(ts, 1_709_296_215.25);
        assert_eq!(ts_to_dt(ts), dt);
    }

    #[test]
    fn test_is_second_sunday() {
        let day = |d| {
            Utc.from_utc_datetime(
                &NaiveDate::from_ymd_opt(2024, 9, d)
                    .unwrap()
                    .and_hms_opt(4, 12, 0)
                    .unwrap(),
            )
        };
        // September 2024: Sundays on the 1st, 8th, 15th
        assert!(!is_second_sunday(&day(1)));
        assert!(is_second_sunday(&day(8)));
        assert!(!is_second_sunday(&day(9)));
        assert!(!is_second_sunday(&day(15)));
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(0), "");
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}

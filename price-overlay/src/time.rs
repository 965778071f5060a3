//! Timestamp parsing and bucket alignment
//!
//! Source feeds stamp points either as ISO-8601 / RFC-3339 strings or as space separated
//! `YYYY-MM-DD HH:mm[:ss]` wall-clock strings. Strings without an offset are read as UTC.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a source timestamp. Returns `None` for anything unrecognised.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.with_timezone(&Utc));
    }

    // "2024-01-01 00:00:00Z" / "2024-01-01 00:00:00+02:00"
    if raw.len() > 10 && raw.as_bytes()[10] == b' ' {
        let mut iso = raw.to_string();
        iso.replace_range(10..11, "T");
        if let Ok(time) = DateTime::parse_from_rfc3339(&iso) {
            return Some(time.with_timezone(&Utc));
        }
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// Align a timestamp down to a multiple of `interval` since the Unix epoch.
#[inline]
pub fn align_to_interval(time: DateTime<Utc>, interval: TimeDelta) -> DateTime<Utc> {
    let step = interval.num_milliseconds();
    if step <= 0 {
        return time;
    }
    let aligned = time.timestamp_millis().div_euclid(step) * step;
    DateTime::from_timestamp_millis(aligned).unwrap_or(time)
}

/// Hour bucket identity, equivalent to the `(year, month, day, hour)` tuple in UTC.
///
/// Ordering follows time, so a `BTreeMap<HourKey, _>` iterates chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct HourKey(DateTime<Utc>);

impl HourKey {
    pub fn of(time: DateTime<Utc>) -> Self {
        Self(align_to_interval(time, TimeDelta::hours(1)))
    }

    /// Start of the hour this key represents
    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn ymdh(&self) -> (i32, u32, u32, u32) {
        (self.0.year(), self.0.month(), self.0.day(), self.0.hour())
    }
}

impl std::fmt::Display for HourKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:00"))
    }
}

/// Fractional hours from `from` to `to` (negative if `to` is earlier).
pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_timestamp() {
        struct TestCase {
            input: &'static str,
            expected: Option<DateTime<Utc>>,
        }

        let tests = vec![
            TestCase {
                // TC0: RFC-3339 with Z
                input: "2024-01-01T00:00:00Z",
                expected: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            },
            TestCase {
                // TC1: RFC-3339 with offset is normalised to UTC
                input: "2024-01-01T02:30:00+02:00",
                expected: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap()),
            },
            TestCase {
                // TC2: space separated without seconds
                input: "2024-03-05 14:00",
                expected: Some(Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap()),
            },
            TestCase {
                // TC3: space separated with seconds
                input: "2024-03-05 14:15:30",
                expected: Some(Utc.with_ymd_and_hms(2024, 3, 5, 14, 15, 30).unwrap()),
            },
            TestCase {
                // TC4: ISO without offset
                input: "2024-03-05T14:15",
                expected: Some(Utc.with_ymd_and_hms(2024, 3, 5, 14, 15, 0).unwrap()),
            },
            TestCase {
                // TC5: space separated with Z
                input: "2024-03-05 14:15:00Z",
                expected: Some(Utc.with_ymd_and_hms(2024, 3, 5, 14, 15, 0).unwrap()),
            },
            TestCase {
                // TC6: date only is midnight
                input: "2024-03-05",
                expected: Some(Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap()),
            },
            TestCase {
                // TC7: garbage
                input: "yesterday",
                expected: None,
            },
            TestCase {
                // TC8: empty
                input: "  ",
                expected: None,
            },
            TestCase {
                // TC9: impossible date
                input: "2024-02-30 10:00",
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = parse_timestamp(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_hour_key_truncates_to_hour() {
        let time = Utc.with_ymd_and_hms(2024, 6, 30, 23, 59, 59).unwrap();
        let key = HourKey::of(time);

        assert_eq!(key.start(), Utc.with_ymd_and_hms(2024, 6, 30, 23, 0, 0).unwrap());
        assert_eq!(key.ymdh(), (2024, 6, 30, 23));
        assert_eq!(key.to_string(), "2024-06-30 23:00");
        assert_eq!(key, HourKey::of(key.start()));
    }

    #[test]
    fn test_align_to_interval() {
        let time = Utc.with_ymd_and_hms(2024, 1, 1, 7, 45, 0).unwrap();

        assert_eq!(
            align_to_interval(time, TimeDelta::hours(4)),
            Utc.with_ymd_and_hms(2024, 1, 1, 4, 0, 0).unwrap()
        );
        assert_eq!(align_to_interval(time, TimeDelta::zero()), time);
    }

    #[test]
    fn test_align_before_epoch_rounds_down() {
        let time = Utc.with_ymd_and_hms(1969, 12, 31, 23, 30, 0).unwrap();
        assert_eq!(
            align_to_interval(time, TimeDelta::hours(1)),
            Utc.with_ymd_and_hms(1969, 12, 31, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_hours_between() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 1, 3, 30, 0).unwrap();
        assert_eq!(hours_between(from, to), 3.5);
        assert_eq!(hours_between(to, from), -3.5);
    }
}

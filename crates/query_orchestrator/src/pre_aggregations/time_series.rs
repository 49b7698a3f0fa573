//! Calendar helpers for partitioned pre-aggregations. Local timestamps are
//! `YYYY-MM-DDTHH:mm:ss.SSS` strings without an offset, interpreted in the
//! pre-aggregation's time zone.

use std::str::FromStr;

use chrono::{
    DateTime,
    Datelike,
    Duration as ChronoDuration,
    FixedOffset,
    Months,
    NaiveDate,
    NaiveDateTime,
    TimeZone,
    Timelike,
    Utc,
};
use errors::ErrorMetadata;
use serde_json::Value;

/// `[from, to]`, both local timestamps.
pub type QueryDateRange = [String; 2];

pub const DEFAULT_TIMESTAMP_FORMAT: &str = "YYYY-MM-DD[T]HH:mm:ss.SSS[Z]";

const MAX_TIME_SERIES_LENGTH: f64 = 50_000.0;

const LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl FromStr for Granularity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "second" => Granularity::Second,
            "minute" => Granularity::Minute,
            "hour" => Granularity::Hour,
            "day" => Granularity::Day,
            "week" => Granularity::Week,
            "month" => Granularity::Month,
            "quarter" => Granularity::Quarter,
            "year" => Granularity::Year,
            _ => anyhow::bail!(ErrorMetadata::bad_request(
                "UnsupportedGranularity",
                format!("Unsupported time granularity: {s}")
            )),
        })
    }
}

impl Granularity {
    /// Average length, used to bound the size of a series before building it.
    fn approximate_seconds(self) -> f64 {
        const DAY: f64 = 86_400.0;
        const MONTH: f64 = DAY * 146_097.0 / 4_800.0;
        match self {
            Granularity::Second => 1.0,
            Granularity::Minute => 60.0,
            Granularity::Hour => 3_600.0,
            Granularity::Day => DAY,
            Granularity::Week => 7.0 * DAY,
            Granularity::Month => MONTH,
            Granularity::Quarter => 3.0 * MONTH,
            Granularity::Year => 12.0 * MONTH,
        }
    }

    fn floor(self, ts: NaiveDateTime) -> NaiveDateTime {
        let date = ts.date();
        let midnight = |d: NaiveDate| d.and_hms_opt(0, 0, 0).unwrap_or(ts);
        let first_of = |month: u32| {
            NaiveDate::from_ymd_opt(date.year(), month, 1)
                .map(midnight)
                .unwrap_or(ts)
        };
        match self {
            Granularity::Second => ts.with_nanosecond(0).unwrap_or(ts),
            Granularity::Minute => date.and_hms_opt(ts.hour(), ts.minute(), 0).unwrap_or(ts),
            Granularity::Hour => date.and_hms_opt(ts.hour(), 0, 0).unwrap_or(ts),
            Granularity::Day => midnight(date),
            Granularity::Week => midnight(
                date - ChronoDuration::days(date.weekday().num_days_from_monday().into()),
            ),
            Granularity::Month => first_of(date.month()),
            Granularity::Quarter => first_of((date.month() - 1) / 3 * 3 + 1),
            Granularity::Year => first_of(1),
        }
    }

    fn next(self, start: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Granularity::Second => start.checked_add_signed(ChronoDuration::seconds(1)),
            Granularity::Minute => start.checked_add_signed(ChronoDuration::minutes(1)),
            Granularity::Hour => start.checked_add_signed(ChronoDuration::hours(1)),
            Granularity::Day => start.checked_add_signed(ChronoDuration::days(1)),
            Granularity::Week => start.checked_add_signed(ChronoDuration::weeks(1)),
            Granularity::Month => start.checked_add_months(Months::new(1)),
            Granularity::Quarter => start.checked_add_months(Months::new(3)),
            Granularity::Year => start.checked_add_months(Months::new(12)),
        }
    }
}

fn invalid_date(value: &str) -> ErrorMetadata {
    ErrorMetadata::bad_request("InvalidDate", format!("Can't parse date: '{value}'"))
}

/// Parses a local timestamp with millisecond or microsecond precision.
pub fn parse_local_timestamp(value: &str) -> anyhow::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|_| invalid_date(value).into())
}

fn format_local(ts: NaiveDateTime) -> String {
    ts.format(LOCAL_FORMAT).to_string()
}

/// Formats the seconds of `ts` followed by a fraction of `precision` copies
/// of `digit`.
fn format_with_fraction(ts: NaiveDateTime, digit: char, precision: usize) -> String {
    let fraction = digit.to_string().repeat(precision);
    format!("{}.{fraction}", ts.format("%Y-%m-%dT%H:%M:%S"))
}

/// Consecutive `[start, end]` ranges of `granularity` covering `range`.
/// Starts end in `.000`, ends in `.999`, with `precision` fractional digits.
pub fn time_series(
    granularity: &str,
    range: &QueryDateRange,
    precision: usize,
) -> anyhow::Result<Vec<QueryDateRange>> {
    let granularity: Granularity = granularity.parse()?;
    let from = parse_local_timestamp(&range[0])?;
    let to = parse_local_timestamp(&range[1])?;
    let span = (to - from).num_milliseconds() as f64 / 1000.0;
    if span / granularity.approximate_seconds() > MAX_TIME_SERIES_LENGTH {
        anyhow::bail!(ErrorMetadata::bad_request(
            "TimeSeriesTooLong",
            format!(
                "The query requested too many time series points: more than \
                 {MAX_TIME_SERIES_LENGTH} {granularity:?} intervals"
            )
        ));
    }
    let last = granularity.floor(to);
    let mut current = granularity.floor(from);
    let mut series = Vec::new();
    while current <= last {
        let Some(next) = granularity.next(current) else {
            break;
        };
        let end = next - ChronoDuration::seconds(1);
        series.push([
            format_with_fraction(current, '0', precision),
            format_with_fraction(end, '9', precision),
        ]);
        current = next;
    }
    Ok(series)
}

fn check_date_range(range: &QueryDateRange) -> anyhow::Result<()> {
    if range.iter().any(|ts| ts.len() != 23 && ts.len() != 26) {
        anyhow::bail!(ErrorMetadata::bad_request(
            "InvalidDateRange",
            format!(
                "Date range expected to be in YYYY-MM-DDTHH:mm:ss.SSS format but {range:?} \
                 found"
            )
        ));
    }
    Ok(())
}

/// Overlap of two ranges. A missing side leaves the other unrestricted;
/// `None` is returned when the ranges don't overlap.
pub fn intersect_date_ranges(
    a: Option<&QueryDateRange>,
    b: Option<&QueryDateRange>,
) -> anyhow::Result<Option<QueryDateRange>> {
    let (a, b) = match (a, b) {
        (None, None) => return Ok(None),
        (Some(range), None) | (None, Some(range)) => {
            check_date_range(range)?;
            return Ok(Some(range.clone()));
        },
        (Some(a), Some(b)) => (a, b),
    };
    check_date_range(a)?;
    check_date_range(b)?;
    let from = std::cmp::max(&a[0], &b[0]);
    let to = std::cmp::min(&a[1], &b[1]);
    if from > to {
        return Ok(None);
    }
    Ok(Some([from.clone(), to.clone()]))
}

/// Accepts `UTC`, `GMT` and fixed offsets like `+03:00`.
pub fn parse_timezone(timezone: &str) -> anyhow::Result<FixedOffset> {
    let unknown = || {
        anyhow::anyhow!(ErrorMetadata::bad_request(
            "UnknownTimezone",
            format!("Unknown time zone: '{timezone}'"),
        ))
    };
    let seconds = match timezone {
        "UTC" | "Etc/UTC" | "GMT" | "Z" => 0,
        _ => {
            let (sign, rest) = if let Some(rest) = timezone.strip_prefix('+') {
                (1, rest)
            } else if let Some(rest) = timezone.strip_prefix('-') {
                (-1, rest)
            } else {
                return Err(unknown());
            };
            let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
            let hours: i32 = hours.parse().map_err(|_| unknown())?;
            let minutes: i32 = minutes.parse().map_err(|_| unknown())?;
            sign * (hours * 3600 + minutes * 60)
        },
    };
    FixedOffset::east_opt(seconds).ok_or_else(unknown)
}

/// Instant of a local timestamp.
pub fn local_to_utc(timezone: &str, timestamp: &str) -> anyhow::Result<DateTime<Utc>> {
    let offset = parse_timezone(timezone)?;
    let local = parse_local_timestamp(timestamp)?;
    let instant = offset
        .from_local_datetime(&local)
        .single()
        .ok_or_else(|| invalid_date(timestamp))?;
    Ok(instant.with_timezone(&Utc))
}

/// Local timestamp of an instant.
pub fn utc_to_local(timezone: &str, instant: DateTime<Utc>) -> anyhow::Result<String> {
    let offset = parse_timezone(timezone)?;
    Ok(format_local(instant.with_timezone(&offset).naive_local()))
}

pub fn unix_millis_to_local(timezone: &str, millis: i64) -> anyhow::Result<String> {
    let instant = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow::anyhow!("Timestamp {millis} is out of range"))?;
    utc_to_local(timezone, instant)
}

/// Converts a local timestamp into the UTC literal a source expects for
/// `timestamp_format`.
pub fn local_timestamp_to_utc(
    timezone: &str,
    timestamp_format: Option<&str>,
    timestamp: &str,
) -> anyhow::Result<String> {
    let utc = local_to_utc(timezone, timestamp)?;
    let millis = utc.naive_utc().format(LOCAL_FORMAT).to_string();
    let micros = if millis.ends_with("999") { "999" } else { "000" };
    Ok(
        match timestamp_format.unwrap_or(DEFAULT_TIMESTAMP_FORMAT) {
            "YYYY-MM-DD[T]HH:mm:ss.SSS[Z]" | "YYYY-MM-DDTHH:mm:ss.SSSZ" => format!("{millis}Z"),
            "YYYY-MM-DD[T]HH:mm:ss.SSSSSS[Z]" | "YYYY-MM-DDTHH:mm:ss.SSSSSSZ" => {
                format!("{millis}{micros}Z")
            },
            "YYYY-MM-DDTHH:mm:ss.SSSSSS" => format!("{millis}{micros}"),
            _ => millis,
        },
    )
}

/// Instant `seconds` after a local timestamp.
pub fn add_seconds_to_local_timestamp(
    timestamp: &str,
    timezone: &str,
    seconds: u64,
) -> anyhow::Result<DateTime<Utc>> {
    let seconds = i64::try_from(seconds)?;
    Ok(local_to_utc(timezone, timestamp)? + ChronoDuration::seconds(seconds))
}

/// Normalizes a partition boundary to a 23 character local timestamp so
/// boundaries of different precision compare correctly.
pub fn reformat_in_iso_local(timestamp: &str) -> anyhow::Result<String> {
    match timestamp.len() {
        23 => Ok(timestamp.to_owned()),
        24 if timestamp.ends_with('Z') => Ok(timestamp[..23].to_owned()),
        _ => Ok(format_local(parse_local_timestamp(timestamp.trim_end_matches('Z'))?)),
    }
}

fn parse_source_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Some(instant.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// First column of the first row of a range query result, as a local
/// timestamp. Values without an offset are read as UTC. `None` for empty
/// results and unparseable values.
pub fn extract_date(data: &Value, timezone: &str) -> anyhow::Result<Option<String>> {
    let Some(value) = data
        .as_array()
        .and_then(|rows| rows.first())
        .and_then(|row| row.as_object())
        .and_then(|row| row.values().next())
    else {
        return Ok(None);
    };
    let instant = match value {
        Value::String(s) => parse_source_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    };
    instant
        .map(|instant| utc_to_local(timezone, instant))
        .transpose()
}

/// Suffix-free partition name: the range start cut to the granularity with
/// separators removed, e.g. `orders20240105`.
pub fn partition_table_name(
    table_name: &str,
    partition_granularity: &str,
    range: &QueryDateRange,
) -> String {
    let cut = match partition_granularity {
        "hour" => 13,
        "minute" => 16,
        _ => 10,
    };
    let suffix: String = range[0]
        .chars()
        .take(cut)
        .filter(|c| !matches!(c, '-' | 'T' | ':'))
        .collect();
    format!("{table_name}{suffix}")
}

#[cfg(test)]
mod tests {
    use chrono::{
        TimeZone,
        Utc,
    };
    use errors::ErrorMetadataAnyhowExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::{
        extract_date,
        intersect_date_ranges,
        local_timestamp_to_utc,
        partition_table_name,
        time_series,
        utc_to_local,
    };

    fn range(from: &str, to: &str) -> [String; 2] {
        [from.to_owned(), to.to_owned()]
    }

    #[test]
    fn test_daily_series() -> anyhow::Result<()> {
        let series = time_series(
            "day",
            &range("2024-01-01T10:00:00.000", "2024-01-03T00:00:00.000"),
            3,
        )?;
        assert_eq!(
            series,
            vec![
                range("2024-01-01T00:00:00.000", "2024-01-01T23:59:59.999"),
                range("2024-01-02T00:00:00.000", "2024-01-02T23:59:59.999"),
                range("2024-01-03T00:00:00.000", "2024-01-03T23:59:59.999"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_week_month_and_quarter_series() -> anyhow::Result<()> {
        // 2024-01-03 is a Wednesday.
        let weeks = time_series(
            "week",
            &range("2024-01-03T00:00:00.000", "2024-01-08T00:00:00.000"),
            3,
        )?;
        assert_eq!(weeks[0], range("2024-01-01T00:00:00.000", "2024-01-07T23:59:59.999"));
        assert_eq!(weeks.len(), 2);

        let months = time_series(
            "month",
            &range("2024-01-31T00:00:00.000", "2024-03-01T00:00:00.000"),
            6,
        )?;
        assert_eq!(
            months[1],
            range("2024-02-01T00:00:00.000000", "2024-02-29T23:59:59.999999")
        );
        assert_eq!(months.len(), 3);

        let quarters = time_series(
            "quarter",
            &range("2024-05-10T00:00:00.000", "2024-07-01T00:00:00.000"),
            3,
        )?;
        assert_eq!(
            quarters,
            vec![
                range("2024-04-01T00:00:00.000", "2024-06-30T23:59:59.999"),
                range("2024-07-01T00:00:00.000", "2024-09-30T23:59:59.999"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_series_length_is_bounded() {
        let err = time_series(
            "second",
            &range("2020-01-01T00:00:00.000", "2024-01-01T00:00:00.000"),
            3,
        )
        .unwrap_err();
        assert!(err.is_bad_request());
        assert!(time_series("fortnight", &range("2020-01-01T00:00:00.000", "2020-01-01T00:00:00.000"), 3)
            .unwrap_err()
            .is_bad_request());
    }

    #[test]
    fn test_intersect_date_ranges() -> anyhow::Result<()> {
        let build = range("2024-01-01T00:00:00.000", "2024-01-10T23:59:59.999");
        let query = range("2024-01-05T00:00:00.000", "2024-02-01T00:00:00.000");
        assert_eq!(
            intersect_date_ranges(Some(&build), Some(&query))?,
            Some(range("2024-01-05T00:00:00.000", "2024-01-10T23:59:59.999"))
        );
        let outside = range("2025-01-01T00:00:00.000", "2025-01-02T00:00:00.000");
        assert_eq!(intersect_date_ranges(Some(&build), Some(&outside))?, None);
        assert_eq!(intersect_date_ranges(Some(&build), None)?, Some(build.clone()));

        let malformed = range("2024-01-01", "2024-01-02");
        assert!(intersect_date_ranges(Some(&build), Some(&malformed))
            .unwrap_err()
            .is_bad_request());
        Ok(())
    }

    #[test]
    fn test_timezone_conversions() -> anyhow::Result<()> {
        assert_eq!(
            local_timestamp_to_utc("+02:00", None, "2024-01-01T00:00:00.000")?,
            "2023-12-31T22:00:00.000Z"
        );
        assert_eq!(
            local_timestamp_to_utc("UTC", Some("YYYY-MM-DDTHH:mm:ss.SSSSSS"), "2024-01-01T23:59:59.999")?,
            "2024-01-01T23:59:59.999999"
        );
        let instant = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).single().unwrap();
        assert_eq!(utc_to_local("-05:00", instant)?, "2024-01-01T07:00:00.000");
        assert!(utc_to_local("Mars/Olympus", instant).unwrap_err().is_bad_request());
        Ok(())
    }

    #[test]
    fn test_extract_date() -> anyhow::Result<()> {
        assert_eq!(
            extract_date(&json!([{"max": "2024-01-05T10:00:00.000Z"}]), "+01:00")?,
            Some("2024-01-05T11:00:00.000".to_owned())
        );
        assert_eq!(
            extract_date(&json!([{"min": "2024-01-05 10:00:00"}]), "UTC")?,
            Some("2024-01-05T10:00:00.000".to_owned())
        );
        assert_eq!(extract_date(&json!([]), "UTC")?, None);
        assert_eq!(extract_date(&json!([{"max": null}]), "UTC")?, None);
        Ok(())
    }

    #[test]
    fn test_partition_table_name() {
        let day = range("2024-01-05T00:00:00.000", "2024-01-05T23:59:59.999");
        assert_eq!(
            partition_table_name("pre.orders", "day", &day),
            "pre.orders20240105"
        );
        assert_eq!(
            partition_table_name("pre.orders", "hour", &day),
            "pre.orders2024010500"
        );
        assert_eq!(
            partition_table_name("pre.orders", "minute", &day),
            "pre.orders202401050000"
        );
    }
}

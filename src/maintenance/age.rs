//! Record age extraction and old/recent partitioning.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields consulted for a record's date, in lookup order.
pub const AGE_FIELDS: [&str; 6] = ["timestamp", "date", "createdAt", "updatedAt", "time", "lastSeen"];

/// Numbers below this are epoch seconds; at or above it, epoch milliseconds.
const EPOCH_MILLIS_FLOOR: f64 = 1e11;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Which date wins when a record carries several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgePrecedence {
    /// The newest parseable date. A record touched recently stays live.
    #[default]
    MostRecent,
    /// The first present field in [`AGE_FIELDS`] order.
    FirstMatch,
}

/// The result of splitting a document by record age.
#[derive(Debug, Clone, PartialEq)]
pub struct AgePartition {
    pub old: Value,
    pub recent: Value,
    pub old_count: usize,
    pub recent_count: usize,
}

impl AgePartition {
    pub fn has_old(&self) -> bool {
        self.old_count > 0
    }
}

/// Returns the date of `record`, or `None` when it has no usable date field.
pub fn extract_record_age(record: &Value, precedence: AgePrecedence) -> Option<DateTime<Utc>> {
    let object = record.as_object()?;
    let mut candidates = AGE_FIELDS
        .iter()
        .filter_map(|field| object.get(*field))
        .filter(|value| is_truthy(value))
        .filter_map(parse_date_value);

    match precedence {
        AgePrecedence::FirstMatch => candidates.next(),
        AgePrecedence::MostRecent => candidates.max(),
    }
}

/// Interprets a JSON value as a point in time.
///
/// Accepts epoch numbers (seconds or milliseconds), numeric strings, RFC 3339,
/// RFC 2822, and plain `YYYY-MM-DD[ HH:MM[:SS]]` text read as UTC.
pub fn parse_date_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number.as_f64().and_then(from_epoch_number),
        Value::String(text) => parse_date_str(text.trim()),
        _ => None,
    }
}

fn parse_date_str(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    text.parse::<f64>().ok().and_then(from_epoch_number)
}

fn from_epoch_number(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let millis = if value.abs() < EPOCH_MILLIS_FLOOR {
        value * 1000.0
    } else {
        value
    };
    DateTime::from_timestamp_millis(millis as i64)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_none_or(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Splits `data` into records dated before `cutoff` and everything else.
///
/// Arrays keep element order on both sides; mappings keep their keys. Records
/// without a usable date stay recent. Any other JSON value is left whole in
/// `recent` with an empty `old`.
pub fn separate_by_age(data: Value, cutoff: DateTime<Utc>, precedence: AgePrecedence) -> AgePartition {
    let is_old = |record: &Value| {
        extract_record_age(record, precedence).is_some_and(|age| age < cutoff)
    };

    match data {
        Value::Array(items) => {
            let (old, recent): (Vec<Value>, Vec<Value>) = items.into_iter().partition(|item| is_old(item));
            AgePartition {
                old_count: old.len(),
                recent_count: recent.len(),
                old: Value::Array(old),
                recent: Value::Array(recent),
            }
        }
        Value::Object(entries) => {
            let mut old = Map::new();
            let mut recent = Map::new();
            for (key, record) in entries {
                if is_old(&record) {
                    old.insert(key, record);
                } else {
                    recent.insert(key, record);
                }
            }
            AgePartition {
                old_count: old.len(),
                recent_count: recent.len(),
                old: Value::Object(old),
                recent: Value::Object(recent),
            }
        }
        other => AgePartition {
            old: Value::Object(Map::new()),
            recent: other,
            old_count: 0,
            recent_count: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_ten_records_split_four_old_six_recent() {
        let now = fixed_now();
        let ages = [40, 35, 60, 90, 10, 5, 1, 0, 20, 29];
        let records: Vec<Value> = ages
            .iter()
            .enumerate()
            .map(|(id, days)| json!({"id": id, "timestamp": (now - Duration::days(*days)).to_rfc3339()}))
            .collect();

        let partition = separate_by_age(Value::Array(records), now - Duration::days(30), AgePrecedence::MostRecent);

        assert_eq!(partition.old_count, 4);
        assert_eq!(partition.recent_count, 6);
        let old_ids: Vec<i64> = partition.old.as_array().unwrap().iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(old_ids, vec![0, 1, 2, 3]);
        let recent_ids: Vec<i64> = partition.recent.as_array().unwrap().iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(recent_ids, vec![4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_mapping_keys_partitioned_in_order() {
        let now = fixed_now();
        let data = json!({
            "alice": {"lastSeen": (now - Duration::days(100)).timestamp_millis()},
            "bob": {"lastSeen": (now - Duration::days(2)).timestamp_millis()},
            "carol": {"nickname": "c"},
            "dave": {"date": "2020-01-01"},
        });

        let partition = separate_by_age(data, now - Duration::days(30), AgePrecedence::MostRecent);

        let old_keys: Vec<&String> = partition.old.as_object().unwrap().keys().collect();
        let recent_keys: Vec<&String> = partition.recent.as_object().unwrap().keys().collect();
        assert_eq!(old_keys, vec!["alice", "dave"]);
        assert_eq!(recent_keys, vec!["bob", "carol"]);
    }

    #[test]
    fn test_scalar_document_is_all_recent() {
        let partition = separate_by_age(json!("just text"), fixed_now(), AgePrecedence::MostRecent);
        assert!(!partition.has_old());
        assert_eq!(partition.recent, json!("just text"));
        assert_eq!(partition.old, json!({}));
    }

    #[test]
    fn test_precedence_between_conflicting_fields() {
        let record = json!({"createdAt": "2020-01-01T00:00:00Z", "updatedAt": "2024-05-30T00:00:00Z"});
        let newest = extract_record_age(&record, AgePrecedence::MostRecent).unwrap();
        let first = extract_record_age(&record, AgePrecedence::FirstMatch).unwrap();
        assert_eq!(newest.date_naive(), NaiveDate::from_ymd_opt(2024, 5, 30).unwrap());
        assert_eq!(first.date_naive(), NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
    }

    #[test]
    fn test_timestamp_field_wins_first_match() {
        let record = json!({"date": "2021-01-01", "timestamp": "2023-01-01"});
        let first = extract_record_age(&record, AgePrecedence::FirstMatch).unwrap();
        assert_eq!(first.date_naive(), NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
    }

    #[test]
    fn test_epoch_seconds_and_millis() {
        let seconds = parse_date_value(&json!(1_700_000_000)).unwrap();
        let millis = parse_date_value(&json!(1_700_000_000_000_i64)).unwrap();
        assert_eq!(seconds, millis);
        assert_eq!(parse_date_value(&json!("1700000000")).unwrap(), seconds);
    }

    #[test]
    fn test_unparseable_and_falsy_values_are_skipped() {
        assert!(extract_record_age(&json!({"timestamp": "yesterday-ish"}), AgePrecedence::MostRecent).is_none());
        assert!(extract_record_age(&json!({"timestamp": 0}), AgePrecedence::MostRecent).is_none());
        assert!(extract_record_age(&json!({"timestamp": ""}), AgePrecedence::MostRecent).is_none());
        assert!(extract_record_age(&json!([1, 2]), AgePrecedence::MostRecent).is_none());

        let fallback = json!({"timestamp": null, "time": "2022-02-02 10:30:00"});
        let age = extract_record_age(&fallback, AgePrecedence::FirstMatch).unwrap();
        assert_eq!(age, Utc.with_ymd_and_hms(2022, 2, 2, 10, 30, 0).unwrap());
    }
}

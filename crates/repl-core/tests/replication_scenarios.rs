//! End-to-end scenarios driving `Processor` against an in-memory fake of
//! the `Adapter` trait, standing in for the wire-level `HttpAdapter` tests
//! in `transport::mod`'s `#[cfg(test)]` module. Grounded in
//! `original_source/backup_processor.py`'s own scripted-fixture test suite,
//! which drives the orchestrator against a fake InfluxDB client rather than
//! a live server.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use repl_core::model::{FieldOutcome, FieldType, FieldValue, Row};
use repl_core::transport::Adapter;
use repl_core::{JobSpec, Processor};

type DataKey = (String, String, String);
type TagSet = BTreeMap<String, String>;

/// One stored point: its timestamp, its full tag set, and its value. Kept as
/// a flat `Vec` rather than `BTreeMap<DateTime, _>` because distinct tag
/// values can legitimately share a timestamp — the exact case a tag-blind
/// store would collapse.
type Point = (DateTime<Utc>, TagSet, FieldValue);

#[derive(Default)]
struct FakeAdapter {
    measurements: Mutex<HashMap<String, Vec<String>>>,
    field_keys: Mutex<HashMap<(String, String), HashMap<String, FieldType>>>,
    tag_keys: Mutex<HashMap<(String, String), Vec<String>>>,
    data: Mutex<HashMap<DataKey, Vec<Point>>>,
}

impl FakeAdapter {
    fn with_measurement(
        db: &str,
        measurement: &str,
        fields: &[(&str, FieldType)],
        tags: &[&str],
    ) -> Self {
        let adapter = Self::default();
        adapter
            .measurements
            .lock()
            .unwrap()
            .entry(db.to_string())
            .or_default()
            .push(measurement.to_string());
        adapter.field_keys.lock().unwrap().insert(
            (db.to_string(), measurement.to_string()),
            fields.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
        );
        adapter.tag_keys.lock().unwrap().insert(
            (db.to_string(), measurement.to_string()),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        adapter
    }

    fn seed(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
        tags: &[(&str, &str)],
        ts: DateTime<Utc>,
        value: FieldValue,
    ) {
        let tag_set: TagSet = tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.data
            .lock()
            .unwrap()
            .entry((db.to_string(), measurement.to_string(), field.to_string()))
            .or_default()
            .push((ts, tag_set, value));
    }

    fn point_count(&self, db: &str, measurement: &str, field: &str) -> usize {
        self.data
            .lock()
            .unwrap()
            .get(&(db.to_string(), measurement.to_string(), field.to_string()))
            .map(|points| points.len())
            .unwrap_or(0)
    }

    /// How many distinct points exist for one tag value specifically —
    /// proof that two series sharing a timestamp didn't collapse into one.
    fn point_count_for_tag(&self, db: &str, measurement: &str, field: &str, tag: (&str, &str)) -> usize {
        self.data
            .lock()
            .unwrap()
            .get(&(db.to_string(), measurement.to_string(), field.to_string()))
            .map(|points| {
                points
                    .iter()
                    .filter(|(_, tags, _)| tags.get(tag.0).map(String::as_str) == Some(tag.1))
                    .count()
            })
            .unwrap_or(0)
    }
}

fn parse_field_value(raw: &str) -> FieldValue {
    if let Some(digits) = raw.strip_suffix('i') {
        if let Ok(n) = digits.parse::<i64>() {
            return FieldValue::Int(n);
        }
    }
    match raw {
        "true" => return FieldValue::Bool(true),
        "false" => return FieldValue::Bool(false),
        _ => {}
    }
    if raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2 {
        return FieldValue::Str(raw[1..raw.len() - 1].to_string());
    }
    raw.parse::<f64>().map(FieldValue::Float).unwrap_or(FieldValue::Float(0.0))
}

#[async_trait]
impl Adapter for FakeAdapter {
    async fn test_connection(&self, _cancel: &CancellationToken) -> repl_core::Result<()> {
        Ok(())
    }

    async fn list_databases(&self, _cancel: &CancellationToken) -> repl_core::Result<Vec<String>> {
        Ok(self.measurements.lock().unwrap().keys().cloned().collect())
    }

    async fn create_database(&self, db: &str, _cancel: &CancellationToken) -> repl_core::Result<()> {
        self.measurements.lock().unwrap().entry(db.to_string()).or_default();
        Ok(())
    }

    async fn list_measurements(&self, db: &str, _cancel: &CancellationToken) -> repl_core::Result<Vec<String>> {
        Ok(self.measurements.lock().unwrap().get(db).cloned().unwrap_or_default())
    }

    async fn get_field_keys(
        &self,
        db: &str,
        measurement: &str,
        _cancel: &CancellationToken,
    ) -> repl_core::Result<HashMap<String, FieldType>> {
        Ok(self
            .field_keys
            .lock()
            .unwrap()
            .get(&(db.to_string(), measurement.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_tag_keys(
        &self,
        db: &str,
        measurement: &str,
        _cancel: &CancellationToken,
    ) -> repl_core::Result<Vec<String>> {
        Ok(self
            .tag_keys
            .lock()
            .unwrap()
            .get(&(db.to_string(), measurement.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn last_timestamp_for_field(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
        _cancel: &CancellationToken,
    ) -> repl_core::Result<Option<DateTime<Utc>>> {
        let key = (db.to_string(), measurement.to_string(), field.to_string());
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(&key)
            .and_then(|points| points.iter().map(|(ts, _, _)| *ts).max()))
    }

    async fn oldest_timestamp(
        &self,
        db: &str,
        measurement: &str,
        _cancel: &CancellationToken,
    ) -> repl_core::Result<Option<DateTime<Utc>>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .iter()
            .filter(|((d, m, _), _)| d == db && m == measurement)
            .flat_map(|(_, points)| points.iter().map(|(ts, _, _)| *ts))
            .min())
    }

    async fn count_records(
        &self,
        db: &str,
        measurement: &str,
        range: (DateTime<Utc>, DateTime<Utc>),
        _cancel: &CancellationToken,
    ) -> repl_core::Result<u64> {
        let data = self.data.lock().unwrap();
        Ok(data
            .iter()
            .filter(|((d, m, _), _)| d == db && m == measurement)
            .map(|(_, points)| points.iter().filter(|(ts, _, _)| *ts >= range.0 && *ts < range.1).count() as u64)
            .sum())
    }

    async fn query(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
        tags: &[String],
        range: (DateTime<Utc>, DateTime<Utc>),
        _group_by: Option<&str>,
        _cancel: &CancellationToken,
    ) -> repl_core::Result<Vec<Row>> {
        let key = (db.to_string(), measurement.to_string(), field.to_string());
        let data = self.data.lock().unwrap();
        let rows = data
            .get(&key)
            .map(|points| {
                points
                    .iter()
                    .filter(|(ts, _, _)| *ts >= range.0 && *ts < range.1)
                    .map(|(ts, point_tags, value)| {
                        let mut row = Row::new(*ts);
                        // Mirrors the wire adapter selecting only the
                        // caller-requested tag columns alongside the field.
                        row.tags = point_tags
                            .iter()
                            .filter(|(k, _)| tags.iter().any(|t| t == *k))
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        row.fields.insert(field.to_string(), value.clone());
                        row
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    async fn write(&self, db: &str, lines: &[String], _cancel: &CancellationToken) -> repl_core::Result<()> {
        let mut data = self.data.lock().unwrap();
        for line in lines {
            let parts: Vec<&str> = line.splitn(3, ' ').collect();
            let (measurement_and_tags, fields_str, ts_str) = (parts[0], parts[1], parts[2]);
            let ts = DateTime::from_timestamp_nanos(ts_str.parse::<i64>().expect("nanosecond timestamp"));

            let mut segments = measurement_and_tags.split(',');
            let measurement = segments.next().unwrap().to_string();
            let tag_set: TagSet = segments
                .filter_map(|seg| seg.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();

            for kv in fields_str.split(',') {
                let (k, v) = kv.split_once('=').expect("field is k=v");
                data.entry((db.to_string(), measurement.clone(), k.to_string()))
                    .or_default()
                    .push((ts, tag_set.clone(), parse_field_value(v)));
            }
        }
        Ok(())
    }
}

fn hourly(start: &str, count: i64) -> Vec<DateTime<Utc>> {
    let start: DateTime<Utc> = start.parse().unwrap();
    (0..count).map(|i| start + Duration::hours(i)).collect()
}

#[tokio::test]
async fn scenario_range_copy_keeps_distinct_tag_series_separate() {
    let yaml = r#"
source:
  url: http://source
  databases:
    - name: m1
      destination: m1
destination:
  url: http://dest
options:
  backup_mode: range
  range:
    start_date: 2024-01-01T00:00:00Z
    end_date: 2024-01-02T00:00:00Z
  days_of_pagination: 7
  workers: 2
"#;
    let spec: JobSpec = serde_yaml::from_str(yaml).unwrap();

    let source = Arc::new(FakeAdapter::with_measurement(
        "m1",
        "cpu",
        &[("usage", FieldType::Numeric)],
        &["host"],
    ));
    // Two hosts report the exact same 24 hourly timestamps. Without tags on
    // the query/write path these would collapse onto one destination series
    // — `(measurement, timestamp)` with no tag set is the same upsert key
    // for both, so the second host's writes would silently overwrite the
    // first's.
    for ts in hourly("2024-01-01T00:00:00Z", 24) {
        source.seed("m1", "cpu", "usage", &[("host", "a")], ts, FieldValue::Float(0.1));
        source.seed("m1", "cpu", "usage", &[("host", "b")], ts, FieldValue::Float(0.2));
    }

    let destination = Arc::new(FakeAdapter::default());

    let processor = Processor::new(
        spec,
        source as Arc<dyn Adapter>,
        destination.clone() as Arc<dyn Adapter>,
        CancellationToken::new(),
    );
    let outcome = processor.run().await;

    assert!(outcome.success(), "{outcome:?}");
    let stats = match &outcome {
        repl_core::JobOutcome::Finished { stats, .. } => stats,
        other => panic!("expected Finished, got {other:?}"),
    };
    assert_eq!(stats.records_transferred, 48);
    assert_eq!(stats.fields.get("cpu.usage"), Some(&FieldOutcome::Replicated { records: 48 }));
    assert_eq!(destination.point_count("m1", "cpu", "usage"), 48);
    assert_eq!(destination.point_count_for_tag("m1", "cpu", "usage", ("host", "a")), 24);
    assert_eq!(destination.point_count_for_tag("m1", "cpu", "usage", ("host", "b")), 24);
}

#[tokio::test]
async fn scenario_incremental_catch_up_copies_only_new_points() {
    let yaml = r#"
source:
  url: http://source
  databases:
    - name: m1
      destination: m1
destination:
  url: http://dest
options:
  backup_mode: incremental
  days_of_pagination: 7
  workers: 2
"#;
    let spec: JobSpec = serde_yaml::from_str(yaml).unwrap();

    let source = Arc::new(FakeAdapter::with_measurement("m1", "cpu", &[("usage", FieldType::Numeric)], &[]));
    for ts in hourly("2024-06-01T00:00:00Z", 13) {
        source.seed("m1", "cpu", "usage", &[], ts, FieldValue::Float(1.0));
    }

    let destination = Arc::new(FakeAdapter::default());
    destination.seed(
        "m1",
        "cpu",
        "usage",
        &[],
        "2024-06-01T10:00:00Z".parse().unwrap(),
        FieldValue::Float(1.0),
    );

    let processor = Processor::new(
        spec,
        source as Arc<dyn Adapter>,
        destination.clone() as Arc<dyn Adapter>,
        CancellationToken::new(),
    );
    let outcome = processor.run().await;

    assert!(outcome.success(), "{outcome:?}");
    let stats = match &outcome {
        repl_core::JobOutcome::Finished { stats, .. } => stats,
        other => panic!("expected Finished, got {other:?}"),
    };
    assert_eq!(stats.records_transferred, 2);
    assert_eq!(stats.fields.get("cpu.usage"), Some(&FieldOutcome::Replicated { records: 2 }));
    assert_eq!(destination.point_count("m1", "cpu", "usage"), 3);
}

#[tokio::test]
async fn scenario_obsolete_field_is_skipped_without_querying_source() {
    let yaml = r#"
source:
  url: http://source
  databases:
    - name: m1
      destination: m1
destination:
  url: http://dest
options:
  backup_mode: incremental
  field_obsolete_threshold: "30d"
  days_of_pagination: 7
  workers: 2
"#;
    let spec: JobSpec = serde_yaml::from_str(yaml).unwrap();

    let source = Arc::new(FakeAdapter::with_measurement("m1", "cpu", &[("temp", FieldType::Numeric)], &[]));
    source.seed(
        "m1",
        "cpu",
        "temp",
        &[],
        "2024-01-01T00:00:00Z".parse().unwrap(),
        FieldValue::Float(42.0),
    );

    let destination = Arc::new(FakeAdapter::default());
    destination.seed(
        "m1",
        "cpu",
        "temp",
        &[],
        "2023-12-01T00:00:00Z".parse().unwrap(),
        FieldValue::Float(40.0),
    );

    let processor = Processor::new(
        spec,
        source as Arc<dyn Adapter>,
        destination.clone() as Arc<dyn Adapter>,
        CancellationToken::new(),
    );
    let outcome = processor.run().await;

    assert!(outcome.success(), "{outcome:?}");
    let stats = match &outcome {
        repl_core::JobOutcome::Finished { stats, .. } => stats,
        other => panic!("expected Finished, got {other:?}"),
    };
    assert_eq!(stats.fields.get("cpu.temp"), Some(&FieldOutcome::SkippedObsolete));
    assert_eq!(stats.records_transferred, 0);
    // Destination's own seeded point is the only one present: no new write
    // was issued for the obsolete field.
    assert_eq!(destination.point_count("m1", "cpu", "temp"), 1);
}

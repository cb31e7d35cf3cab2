//! Core data model: typed field values, rows, work units, and the
//! per-job statistics/outcome types.
//!
//! The source system passes rows around as untyped maps; here a `Row` is a
//! typed struct over `FieldValue`, eliminating the `isinstance`-style branch
//! the original used to tell a field apart from a tag (see DESIGN.md).

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three scalar classes the wire dialect recognizes for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Numeric,
    String,
    Boolean,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Numeric => write!(f, "numeric"),
            FieldType::String => write!(f, "string"),
            FieldType::Boolean => write!(f, "boolean"),
        }
    }
}

/// A typed field value, classified at the adapter boundary rather than
/// inferred later from serialized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Str(String),
    Bool(bool),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Float(_) | FieldValue::Int(_) => FieldType::Numeric,
            FieldValue::Str(_) => FieldType::String,
            FieldValue::Bool(_) => FieldType::Boolean,
        }
    }
}

/// One point: a timestamp, a stable-ordered tag set, and one or more typed
/// field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub time: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Row {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }
}

/// Per `(destination_db, measurement, field)` last-observed instant, used to
/// form the half-open replication interval `[horizon + 1ns, cutoff)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationHorizon {
    pub last_observed: Option<DateTime<Utc>>,
}

impl ReplicationHorizon {
    pub const NANOSECOND: chrono::Duration = chrono::Duration::nanoseconds(1);

    pub fn none() -> Self {
        Self { last_observed: None }
    }

    pub fn at(ts: DateTime<Utc>) -> Self {
        Self {
            last_observed: Some(ts),
        }
    }

    /// The inclusive lower bound for the next pull: one clock unit past the
    /// last observation, or `None` if nothing has been written yet (full
    /// backup case).
    pub fn next_start(&self) -> Option<DateTime<Utc>> {
        self.last_observed.map(|ts| ts + Self::NANOSECOND)
    }
}

/// One query+write unit: a single field of a single measurement over a
/// bounded time chunk. Produced by the planner, consumed by exactly one
/// field worker, then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub source_db: String,
    pub dest_db: String,
    pub measurement: String,
    pub field: String,
    pub chunk_start: DateTime<Utc>,
    pub chunk_end: DateTime<Utc>,
}

/// Terminal state of a single field within a job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOutcome {
    Replicated { records: u64 },
    SkippedNoDataInRange,
    SkippedNoNewData,
    SkippedObsolete,
    Failed { error: String },
}

/// Per-field-worker utilisation, aggregated into `JobStats` for the
/// "parallel field processing" reporting requirement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerUtilization {
    pub worker_index: usize,
    pub fields_handled: u32,
    #[serde(with = "duration_millis")]
    pub cumulative: Duration,
    pub records: u64,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Monotonic counters for one job run, owned exclusively by the processor
/// that drives the run; readers only ever see a cloned snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub records_transferred: u64,
    pub databases_processed: u64,
    pub measurements_processed: u64,
    pub fields: BTreeMap<String, FieldOutcome>,
    pub worker_utilization: Vec<WorkerUtilization>,
    pub errors: Vec<String>,
}

impl JobStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_field(&mut self, key: impl Into<String>, outcome: FieldOutcome) {
        if let FieldOutcome::Replicated { records } = &outcome {
            self.records_transferred += records;
        }
        if let FieldOutcome::Failed { error } = &outcome {
            self.errors.push(error.clone());
        }
        self.fields.insert(key.into(), outcome);
    }

    pub fn success(&self) -> bool {
        !self
            .fields
            .values()
            .any(|o| matches!(o, FieldOutcome::Failed { .. }))
    }
}

/// Terminal record emitted per job to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JobOutcome {
    /// A completed range job, or one tick of a scheduled job.
    Finished {
        job_name: String,
        success: bool,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        duration_ms: i64,
        stats: JobStats,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Posted immediately at launch for a cron-scheduled job, before it has
    /// produced any stats.
    LongRunning {
        job_name: String,
        start: DateTime<Utc>,
        status: String,
    },
}

impl JobOutcome {
    pub fn job_name(&self) -> &str {
        match self {
            JobOutcome::Finished { job_name, .. } => job_name,
            JobOutcome::LongRunning { job_name, .. } => job_name,
        }
    }

    pub fn success(&self) -> bool {
        match self {
            JobOutcome::Finished { success, .. } => *success,
            JobOutcome::LongRunning { .. } => true,
        }
    }
}

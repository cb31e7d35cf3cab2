//! Job descriptor schema and loader.
//!
//! Grounded in `rcommerce-core::config`'s idiom: `#[serde(default = "...")]`
//! free functions per field, a top-level `load(path)` that reads + parses +
//! validates, and a `validate()` method that returns a descriptive
//! `ReplicatorError::Config` rather than panicking.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReplicatorError, Result};
use crate::model::FieldType;

fn default_true() -> bool {
    true
}

fn default_timeout_client() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1
}

fn default_days_of_pagination() -> i64 {
    7
}

fn default_initial_connection_retry_delay() -> u64 {
    10
}

fn default_workers() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `global.network` — informational only, carried through to logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabasePair {
    pub name: String,
    pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// The `source` block additionally carries the database pairs and the
/// derived-name / grouping options that apply at write time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(flatten)]
    pub endpoint: EndpointConfig,
    pub databases: Vec<DatabasePair>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub group_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldPolicy {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub types: Vec<FieldType>,
}

impl Default for FieldPolicy {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            types: Vec::new(),
        }
    }
}

impl FieldPolicy {
    pub fn allowed_types(&self) -> Vec<FieldType> {
        if self.types.is_empty() {
            vec![FieldType::Numeric, FieldType::String, FieldType::Boolean]
        } else {
            self.types.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasurementPolicy {
    #[serde(default)]
    pub fields: FieldPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasurementFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub specific: HashMap<String, MeasurementPolicy>,
}

impl MeasurementFilter {
    pub fn policy_for(&self, measurement: &str) -> MeasurementPolicy {
        self.specific.get(measurement).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Range,
    Incremental,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeOptions {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncrementalOptions {
    #[serde(default)]
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRotation {
    #[serde(default = "default_log_rotation_when")]
    pub when: String,
    #[serde(default = "default_rotation_interval")]
    pub interval: u32,
    #[serde(default = "default_log_backup_count")]
    pub backup_count: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_log_rotation_when() -> String {
    "midnight".to_string()
}

fn default_rotation_interval() -> u32 {
    1
}

fn default_log_backup_count() -> u32 {
    7
}

impl Default for LogRotation {
    fn default() -> Self {
        Self {
            when: default_log_rotation_when(),
            interval: default_rotation_interval(),
            backup_count: default_log_backup_count(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LokiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub backup_mode: BackupMode,
    #[serde(default)]
    pub range: Option<RangeOptions>,
    #[serde(default)]
    pub incremental: Option<IncrementalOptions>,
    #[serde(default = "default_timeout_client")]
    pub timeout_client: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default = "default_days_of_pagination")]
    pub days_of_pagination: i64,
    #[serde(default)]
    pub field_obsolete_threshold: Option<String>,
    #[serde(default = "default_initial_connection_retry_delay")]
    pub initial_connection_retry_delay: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub log_directory: Option<String>,
    #[serde(default)]
    pub log_rotation: Option<LogRotation>,
    #[serde(default)]
    pub loki: Option<LokiConfig>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One declarative job description, loaded once at job start and immutable
/// thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(skip)]
    pub job_name: String,
    #[serde(default)]
    pub global: GlobalConfig,
    pub source: SourceConfig,
    pub destination: EndpointConfig,
    #[serde(default)]
    pub measurements: MeasurementFilter,
    pub options: Options,
}

/// `[A-Za-z_][A-Za-z0-9_.-]*` — the restricted grammar measurement and
/// database identifiers must satisfy.
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// The `cron` crate requires a leading seconds field; operators write
/// standard 5-field unix cron (`min hour dom month dow`). Prefix `"0 "`
/// when a 5-field expression is given so both forms are accepted.
pub fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

impl JobSpec {
    /// Load and validate a job descriptor from a YAML file. The job name is
    /// derived from the file stem (e.g. `nightly.yaml` → `nightly`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut spec: JobSpec = serde_yaml::from_str(&contents)?;
        spec.job_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("job")
            .to_string();
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        match self.options.backup_mode {
            BackupMode::Range => {
                let range = self.options.range.as_ref().ok_or_else(|| {
                    ReplicatorError::config("backup_mode=range requires options.range")
                })?;
                if range.start_date >= range.end_date {
                    return Err(ReplicatorError::config(
                        "options.range.start_date must be before end_date",
                    ));
                }
            }
            BackupMode::Incremental => {
                if let Some(incremental) = &self.options.incremental {
                    if let Some(schedule) = &incremental.schedule {
                        cron::Schedule::from_str(&normalize_cron_expr(schedule)).map_err(|e| {
                            ReplicatorError::config(format!(
                                "invalid cron expression {:?}: {}",
                                schedule, e
                            ))
                        })?;
                    }
                }
            }
        }

        if !self.measurements.include.is_empty() && !self.measurements.exclude.is_empty() {
            return Err(ReplicatorError::config(
                "measurements.include and measurements.exclude are mutually exclusive",
            ));
        }

        for pair in &self.source.databases {
            if !is_valid_identifier(&pair.name) || !is_valid_identifier(&pair.destination) {
                return Err(ReplicatorError::config(format!(
                    "invalid database identifier: {} / {}",
                    pair.name, pair.destination
                )));
            }
        }

        for (name, policy) in &self.measurements.specific {
            if !is_valid_identifier(name) {
                return Err(ReplicatorError::config(format!(
                    "invalid measurement identifier: {}",
                    name
                )));
            }
            if !policy.fields.include.is_empty() && !policy.fields.exclude.is_empty() {
                return Err(ReplicatorError::config(format!(
                    "measurement {}: fields.include and fields.exclude are mutually exclusive",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Whether this spec describes a job with no natural termination
    /// (incremental + cron schedule) versus a bounded one-shot run.
    pub fn is_long_running(&self) -> bool {
        self.options.backup_mode == BackupMode::Incremental
            && self
                .options
                .incremental
                .as_ref()
                .and_then(|i| i.schedule.as_ref())
                .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml(mode: &str, extra: &str) -> String {
        format!(
            r#"
source:
  url: http://source:8086
  databases:
    - name: m1
      destination: m1_copy
destination:
  url: http://dest:8086
options:
  backup_mode: {mode}
  {extra}
"#
        )
    }

    #[test]
    fn valid_identifiers() {
        assert!(is_valid_identifier("cpu"));
        assert!(is_valid_identifier("_hidden"));
        assert!(is_valid_identifier("m1-copy.v2"));
        assert!(!is_valid_identifier("1cpu"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("cpu usage"));
    }

    #[test]
    fn range_mode_requires_start_before_end() {
        let yaml = base_yaml(
            "range",
            "range:\n    start_date: 2024-01-02T00:00:00Z\n    end_date: 2024-01-01T00:00:00Z",
        );
        let spec: JobSpec = serde_yaml::from_str(&yaml).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn range_mode_accepts_ordered_bounds() {
        let yaml = base_yaml(
            "range",
            "range:\n    start_date: 2024-01-01T00:00:00Z\n    end_date: 2024-01-02T00:00:00Z",
        );
        let spec: JobSpec = serde_yaml::from_str(&yaml).unwrap();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn incremental_without_schedule_is_short_running() {
        let yaml = base_yaml("incremental", "");
        let spec: JobSpec = serde_yaml::from_str(&yaml).unwrap();
        assert!(spec.validate().is_ok());
        assert!(!spec.is_long_running());
    }

    #[test]
    fn incremental_with_cron_is_long_running() {
        let yaml = base_yaml("incremental", "incremental:\n    schedule: \"*/5 * * * *\"");
        let spec: JobSpec = serde_yaml::from_str(&yaml).unwrap();
        assert!(spec.validate().is_ok());
        assert!(spec.is_long_running());
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let yaml = base_yaml("incremental", "incremental:\n    schedule: \"not a cron\"");
        let spec: JobSpec = serde_yaml::from_str(&yaml).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn mutually_exclusive_measurement_lists_rejected() {
        let yaml = format!(
            "{}\nmeasurements:\n  include: [cpu]\n  exclude: [mem]\n",
            base_yaml("incremental", "")
        );
        let spec: JobSpec = serde_yaml::from_str(&yaml).unwrap();
        assert!(spec.validate().is_err());
    }
}

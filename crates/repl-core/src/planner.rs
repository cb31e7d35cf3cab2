//! Measurement/field inclusion-exclusion, obsolescence check, and the
//! time-chunk generator.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::{FieldPolicy, MeasurementFilter};
use crate::model::FieldType;

/// Keep ⇔ name ∈ include when an include list is present; else keep ⇔ name
/// ∉ exclude.
pub fn measurement_kept(filter: &MeasurementFilter, name: &str) -> bool {
    if !filter.include.is_empty() {
        filter.include.iter().any(|m| m == name)
    } else {
        !filter.exclude.iter().any(|m| m == name)
    }
}

/// Reject first on type, then apply the same include/else-exclude rule as
/// measurements.
pub fn field_kept(policy: &FieldPolicy, field: &str, field_type: FieldType) -> bool {
    if !policy.allowed_types().contains(&field_type) {
        return false;
    }
    if !policy.include.is_empty() {
        policy.include.iter().any(|f| f == field)
    } else {
        !policy.exclude.iter().any(|f| f == field)
    }
}

/// `obsolete ⇔ last < cutoff`. A missing last timestamp is *not* obsolete —
/// nothing has been written yet, so it's fresh-by-omission.
pub fn is_obsolete(
    last_timestamp: Option<DateTime<Utc>>,
    threshold: ChronoDuration,
    now: DateTime<Utc>,
) -> bool {
    match last_timestamp {
        Some(last) => last < now - threshold,
        None => false,
    }
}

/// Tile `[t0, t1)` into half-open sub-intervals of width `days`, the last
/// possibly shorter. Yields nothing if `t0 >= t1`.
pub fn time_chunks(
    t0: DateTime<Utc>,
    t1: DateTime<Utc>,
    days: i64,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    if t0 >= t1 || days <= 0 {
        return Vec::new();
    }

    let width = ChronoDuration::days(days);
    let mut chunks = Vec::new();
    let mut start = t0;
    while start < t1 {
        let end = (start + width).min(t1);
        chunks.push((start, end));
        start = end;
    }
    chunks
}

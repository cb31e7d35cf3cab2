//! Job processor: `Run(JobSpec) → JobOutcome`.
//!
//! Connect, enumerate, plan, drive the per-field workers. Adds a
//! `tracing::info_span!` per job carrying `job_name`, with `stage`,
//! `database`, `measurement`, `field` fields on the log lines inside it —
//! the ambient logging contract mirrors how `rcommerce-core::jobs::worker`
//! annotates its `info!`/`warn!`/`error!` calls with job/worker ids.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{BackupMode, JobSpec};
use crate::duration::parse_duration;
use crate::model::{FieldOutcome, JobOutcome, JobStats, Row};
use crate::planner;
use crate::transport::{line_protocol, Adapter};

use super::worker_pool::FieldWorkerPool;

pub struct Processor {
    pub spec: JobSpec,
    pub source: Arc<dyn Adapter>,
    pub destination: Arc<dyn Adapter>,
    pub cancel: CancellationToken,
}

impl Processor {
    pub fn new(
        spec: JobSpec,
        source: Arc<dyn Adapter>,
        destination: Arc<dyn Adapter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            spec,
            source,
            destination,
            cancel,
        }
    }

    /// Runs one job to completion (range mode, or one tick of incremental
    /// mode). Scheduling repeated ticks is the caller's (engine::scheduler)
    /// responsibility.
    pub async fn run(&self) -> JobOutcome {
        let job_name = self.spec.job_name.clone();
        let span = info_span!("job", job_name = %job_name);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> JobOutcome {
        let start = Utc::now();
        let job_name = self.spec.job_name.clone();

        self.wait_for_connections().await;

        let mut stats = JobStats::new();
        let result = self.execute(&mut stats).await;

        let end = Utc::now();
        let (success, error) = match result {
            Ok(()) => (stats.success(), None),
            Err(e) => (false, Some(e.to_string())),
        };

        if let Some(err) = &error {
            warn!(stage = "job", error = %err, "job failed");
        }

        JobOutcome::Finished {
            job_name,
            success,
            start,
            end,
            duration_ms: (end - start).num_milliseconds(),
            stats,
            error,
        }
    }

    /// Probe both endpoints before any enumeration; on failure sleep the
    /// initial-connection retry delay and retry indefinitely. The
    /// orchestrator launches the whole fleet at once, so destinations may
    /// still be starting up.
    async fn wait_for_connections(&self) {
        let delay = std::time::Duration::from_secs(self.spec.options.initial_connection_retry_delay);
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let source_ok = self.source.test_connection(&self.cancel).await.is_ok();
            let dest_ok = self.destination.test_connection(&self.cancel).await.is_ok();
            if source_ok && dest_ok {
                return;
            }
            warn!(stage = "connect", "endpoints not ready yet, retrying");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    async fn execute(&self, stats: &mut JobStats) -> crate::error::Result<()> {
        let backup_mode = self.spec.options.backup_mode;
        let range_start = self.spec.options.range.as_ref().map(|r| r.start_date);
        let cutoff = match backup_mode {
            BackupMode::Range => self
                .spec
                .options
                .range
                .as_ref()
                .expect("validated: range mode has range options")
                .end_date,
            BackupMode::Incremental => Utc::now(),
        };

        let obsolete_threshold = self
            .spec
            .options
            .field_obsolete_threshold
            .as_deref()
            .map(parse_duration)
            .transpose()?;

        for pair in &self.spec.source.databases {
            if self.cancel.is_cancelled() {
                return Err(crate::error::ReplicatorError::Cancelled);
            }

            let dest_name = derive_destination_name(&self.spec, &pair.destination);
            self.destination.create_database(&dest_name, &self.cancel).await?;

            let measurements = self.source.list_measurements(&pair.name, &self.cancel).await?;
            for measurement in measurements {
                if !planner::measurement_kept(&self.spec.measurements, &measurement) {
                    continue;
                }
                self.process_measurement(
                    &pair.name,
                    &dest_name,
                    &measurement,
                    backup_mode,
                    range_start,
                    cutoff,
                    obsolete_threshold,
                    stats,
                )
                .instrument(info_span!("measurement", database = %pair.name, measurement = %measurement))
                .await?;
                stats.measurements_processed += 1;
            }
            stats.databases_processed += 1;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_measurement(
        &self,
        source_db: &str,
        dest_db: &str,
        measurement: &str,
        backup_mode: BackupMode,
        range_start: Option<chrono::DateTime<Utc>>,
        cutoff: chrono::DateTime<Utc>,
        obsolete_threshold: Option<chrono::Duration>,
        stats: &mut JobStats,
    ) -> crate::error::Result<()> {
        let field_keys = self.source.get_field_keys(source_db, measurement, &self.cancel).await?;
        let tag_keys = Arc::new(self.source.get_tag_keys(source_db, measurement, &self.cancel).await?);
        let policy = self.spec.measurements.policy_for(measurement);

        let mut surviving = Vec::new();
        for (field, field_type) in field_keys {
            if !planner::field_kept(&policy.fields, &field, field_type) {
                continue;
            }
            surviving.push(field);
        }

        let pool = Arc::new(FieldWorkerPool::new(self.spec.options.workers));
        let mut join_set = tokio::task::JoinSet::new();

        for field in surviving {
            let source = self.source.clone();
            let destination = self.destination.clone();
            let cancel = self.cancel.clone();
            let source_db = source_db.to_string();
            let dest_db = dest_db.to_string();
            let measurement = measurement.to_string();
            let retries = self.spec.options.retries;
            let pagination_days = self.spec.options.days_of_pagination;
            let group_by = self.spec.source.group_by.clone();
            let pool = pool.clone();
            let tags = tag_keys.clone();

            join_set.spawn(Self::process_field_task(
                pool,
                source,
                destination,
                cancel,
                source_db,
                dest_db,
                measurement,
                field,
                tags,
                backup_mode,
                range_start,
                cutoff,
                obsolete_threshold,
                retries,
                pagination_days,
                group_by,
            ));
        }

        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((key, outcome, utilization)) => {
                    stats.record_field(key, outcome);
                    if let Some(u) = utilization {
                        stats.worker_utilization.push(u);
                    }
                }
                Err(e) => stats.errors.push(format!("field task panicked: {e}")),
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_field_task(
        pool: Arc<FieldWorkerPool>,
        source: Arc<dyn Adapter>,
        destination: Arc<dyn Adapter>,
        cancel: CancellationToken,
        source_db: String,
        dest_db: String,
        measurement: String,
        field: String,
        tags: Arc<Vec<String>>,
        backup_mode: BackupMode,
        range_start: Option<chrono::DateTime<Utc>>,
        cutoff: chrono::DateTime<Utc>,
        obsolete_threshold: Option<chrono::Duration>,
        retries: u32,
        pagination_days: i64,
        group_by: Option<String>,
    ) -> (String, FieldOutcome, Option<crate::model::WorkerUtilization>) {
        let slot = pool.acquire().await;
        let key = format!("{measurement}.{field}");

        let outcome = Self::replicate_field(
            &source,
            &destination,
            &cancel,
            &source_db,
            &dest_db,
            &measurement,
            &field,
            &tags,
            backup_mode,
            range_start,
            cutoff,
            obsolete_threshold,
            retries,
            pagination_days,
            group_by.as_deref(),
        )
        .instrument(info_span!("field", field = %field, worker_index = slot.worker_index))
        .await;

        let records = match &outcome {
            FieldOutcome::Replicated { records } => *records,
            _ => 0,
        };

        let utilization = slot.finish(records);

        (key, outcome, Some(utilization))
    }

    #[allow(clippy::too_many_arguments)]
    async fn replicate_field(
        source: &Arc<dyn Adapter>,
        destination: &Arc<dyn Adapter>,
        cancel: &CancellationToken,
        source_db: &str,
        dest_db: &str,
        measurement: &str,
        field: &str,
        tags: &[String],
        backup_mode: BackupMode,
        range_start: Option<chrono::DateTime<Utc>>,
        cutoff: chrono::DateTime<Utc>,
        obsolete_threshold: Option<chrono::Duration>,
        _retries: u32,
        pagination_days: i64,
        group_by: Option<&str>,
    ) -> FieldOutcome {
        let last = match destination
            .last_timestamp_for_field(dest_db, measurement, field, cancel)
            .await
        {
            Ok(v) => v,
            Err(e) => return FieldOutcome::Failed { error: e.to_string() },
        };

        if let Some(threshold) = obsolete_threshold {
            if planner::is_obsolete(last, threshold, Utc::now()) {
                return FieldOutcome::SkippedObsolete;
            }
        }

        // Range mode replicates the literal [start, end) the spec
        // describes; incremental mode resolves the start from the
        // destination's own horizon via the three-strategy probe above.
        let start = match backup_mode {
            BackupMode::Range => {
                range_start.expect("validated: range mode has range.start_date")
            }
            BackupMode::Incremental => match last {
                Some(ts) => ts + crate::model::ReplicationHorizon::NANOSECOND,
                None => match source.oldest_timestamp(source_db, measurement, cancel).await {
                    Ok(Some(ts)) => ts,
                    Ok(None) => cutoff - chrono::Duration::days(30),
                    Err(e) => return FieldOutcome::Failed { error: e.to_string() },
                },
            },
        };

        if start >= cutoff {
            return FieldOutcome::SkippedNoNewData;
        }

        let chunks = planner::time_chunks(start, cutoff, pagination_days);
        let mut total_records = 0u64;

        for (chunk_start, chunk_end) in chunks {
            if cancel.is_cancelled() {
                return FieldOutcome::Failed {
                    error: "cancelled".to_string(),
                };
            }

            let rows: Vec<Row> = match source
                .query(source_db, measurement, field, tags, (chunk_start, chunk_end), group_by, cancel)
                .await
            {
                Ok(rows) => rows,
                Err(e) => return FieldOutcome::Failed { error: e.to_string() },
            };

            if rows.is_empty() {
                continue;
            }

            let (lines, dropped) = line_protocol::encode_batch(measurement, &rows);
            if dropped > 0 {
                debug!(field, dropped, "dropped fieldless rows during encode");
            }

            if let Err(e) = destination.write(dest_db, &lines, cancel).await {
                return FieldOutcome::Failed { error: e.to_string() };
            }

            total_records += lines.len() as u64;
            info!(
                field,
                records_written = lines.len(),
                total_records,
                "chunk written"
            );
        }

        if total_records == 0 {
            FieldOutcome::SkippedNoDataInRange
        } else {
            FieldOutcome::Replicated { records: total_records }
        }
    }
}

/// The destination database name, derived from the source's configured
/// destination via the job's prefix/suffix rule.
pub fn derive_destination_name(spec: &JobSpec, destination: &str) -> String {
    let mut name = String::new();
    if let Some(prefix) = &spec.source.prefix {
        name.push_str(prefix);
    }
    name.push_str(destination);
    if let Some(suffix) = &spec.source.suffix {
        name.push_str(suffix);
    }
    name
}

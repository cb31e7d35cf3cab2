//! Discovers job descriptors, spawns one isolated worker process per job,
//! and collects their outcomes.
//!
//! Isolation is a re-exec of the current binary (DESIGN NOTES §9's "child
//! process via the OS spawn interface" option): each worker is
//! `current_exe() __run-job <path>`. The child's own CLI entrypoint owns
//! running the job and prints each [`JobOutcome`] it produces as one JSON
//! line on stdout; tracing output goes to stderr, which this module forwards
//! line-by-line into its own tracing subscriber so a crash in one job cannot
//! corrupt another's log stream.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::JobSpec;
use crate::model::JobOutcome;

/// Hidden CLI flag the orchestrator re-execs the current binary with; never
/// listed in `--help`.
pub const RUN_JOB_ARG: &str = "__run-job";

/// How often the orchestrator polls liveness of long-running workers while
/// waiting on the shutdown signal.
const LIVENESS_POLL: Duration = Duration::from_secs(60);
/// Log a status line every this many liveness polls.
const STATUS_LOG_EVERY: u32 = 10;
/// Grace period granted to a worker between a graceful terminate request
/// and a force-kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Spawned,
    Running,
    Reported,
    TimedOut,
    Cancelled,
    Terminated,
    Killed,
}

struct Worker {
    job_name: String,
    path: PathBuf,
    long_running: bool,
    child: Child,
    state: WorkerState,
    outcomes: Vec<JobOutcome>,
}

/// Aggregate result of one orchestrator run.
#[derive(Debug, Default)]
pub struct OrchestratorReport {
    pub outcomes: Vec<JobOutcome>,
    /// Descriptors that failed to load/validate, with their error message.
    pub failed_descriptors: Vec<(PathBuf, String)>,
    /// Job names still running in the background when the orchestrator
    /// returned (only possible on a cancelled shutdown, or if the caller
    /// doesn't block for long-running jobs).
    pub long_running: Vec<String>,
}

impl OrchestratorReport {
    /// 0 if every job succeeded and no descriptor was invalid; 1 otherwise.
    /// The caller additionally maps an external interrupt to 130.
    pub fn exit_code(&self) -> i32 {
        let any_descriptor_failed = !self.failed_descriptors.is_empty();
        let any_job_failed = self.outcomes.iter().any(|o| !o.success());
        if any_descriptor_failed || any_job_failed {
            1
        } else {
            0
        }
    }
}

pub struct Orchestrator {
    jobs_dir: PathBuf,
    worker_timeout: Duration,
}

impl Orchestrator {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
            worker_timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Discover `*.yaml`/`*.yml` descriptors in the configured directory,
    /// sorted for deterministic ordering.
    fn discover_descriptors(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.jobs_dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if path.is_file() && is_yaml {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Runs every discovered job to completion (or until `cancel` fires for
    /// any long-running ones), producing one [`JobOutcome`] per valid
    /// descriptor and skipping invalid ones with a logged error.
    pub async fn run(&self, cancel: CancellationToken) -> crate::error::Result<OrchestratorReport> {
        let mut report = OrchestratorReport::default();

        let descriptors = self.discover_descriptors()?;
        if descriptors.is_empty() {
            warn!(dir = %self.jobs_dir.display(), "no job descriptors found");
        }

        let mut workers: HashMap<usize, Worker> = HashMap::new();
        for (idx, path) in descriptors.into_iter().enumerate() {
            match JobSpec::load(&path) {
                Ok(spec) => match self.spawn_worker(&path) {
                    Ok(child) => {
                        info!(job_name = %spec.job_name, path = %path.display(), "worker spawned");
                        workers.insert(
                            idx,
                            Worker {
                                job_name: spec.job_name.clone(),
                                path,
                                long_running: spec.is_long_running(),
                                child,
                                state: WorkerState::Spawned,
                                outcomes: Vec::new(),
                            },
                        );
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "failed to spawn worker");
                        report.failed_descriptors.push((path, e.to_string()));
                    }
                },
                Err(e) => {
                    error!(path = %path.display(), error = %e, "invalid job descriptor, skipping");
                    report.failed_descriptors.push((path, e.to_string()));
                }
            }
        }

        self.drain_workers(workers, cancel, &mut report).await;
        Ok(report)
    }

    fn spawn_worker(&self, path: &Path) -> crate::error::Result<Child> {
        let exe = std::env::current_exe()?;
        let child = Command::new(exe)
            .arg(RUN_JOB_ARG)
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    async fn drain_workers(
        &self,
        mut workers: HashMap<usize, Worker>,
        cancel: CancellationToken,
        report: &mut OrchestratorReport,
    ) {
        // Pump stdout (JobOutcome lines) and stderr (forwarded log lines)
        // for every worker concurrently, each bounded by the per-worker
        // timeout for short-running jobs.
        let mut join_set = tokio::task::JoinSet::new();
        for (idx, mut worker) in workers.drain() {
            worker.state = WorkerState::Running;
            let timeout = self.worker_timeout;
            let long_running = worker.long_running;
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let result = pump_worker(&mut worker, timeout, long_running, cancel).await;
                (idx, worker, result)
            });
        }

        let mut still_running = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_idx, worker, result)) => {
                    for outcome in &worker.outcomes {
                        report.outcomes.push(outcome.clone());
                    }
                    match result {
                        PumpResult::Completed => {
                            info!(job_name = %worker.job_name, "worker reported and exited");
                        }
                        PumpResult::StillRunning => {
                            still_running.push(worker.job_name.clone());
                        }
                        PumpResult::TimedOut => {
                            warn!(job_name = %worker.job_name, "worker exceeded timeout, terminating");
                            report
                                .failed_descriptors
                                .push((worker.path.clone(), "worker timed out".to_string()));
                        }
                    }
                }
                Err(e) => error!(error = %e, "worker task panicked"),
            }
        }

        if !still_running.is_empty() {
            self.wait_for_shutdown(&still_running, cancel).await;
            report.long_running = still_running;
        }
    }

    /// Blocks until `cancel` fires, logging liveness of the still-running
    /// long-running jobs every [`LIVENESS_POLL`], with a fuller status line
    /// every [`STATUS_LOG_EVERY`] polls.
    async fn wait_for_shutdown(&self, long_running: &[String], cancel: CancellationToken) {
        let mut polls: u32 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown signal received, long-running jobs will be cancelled by their own process exit");
                    return;
                }
                _ = tokio::time::sleep(LIVENESS_POLL) => {
                    polls += 1;
                    if polls % STATUS_LOG_EVERY == 0 {
                        info!(jobs = ?long_running, "long-running jobs still active");
                    } else {
                        debug!(count = long_running.len(), "liveness poll");
                    }
                }
            }
        }
    }
}

enum PumpResult {
    Completed,
    StillRunning,
    TimedOut,
}

/// Reads the worker's stdout (one JSON `JobOutcome` per line) and stderr
/// (forwarded verbatim into tracing) until it exits, is cancelled, or
/// exceeds `timeout`. Long-running workers are expected to post a single
/// `LongRunning` outcome and then keep running indefinitely — that's not a
/// timeout, it's the job doing its job.
async fn pump_worker(
    worker: &mut Worker,
    timeout: Duration,
    long_running: bool,
    cancel: CancellationToken,
) -> PumpResult {
    let stdout = worker.child.stdout.take().expect("piped stdout");
    let stderr = worker.child.stderr.take().expect("piped stderr");
    let job_name = worker.job_name.clone();

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            line = stdout_lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Ok(outcome) = serde_json::from_str::<JobOutcome>(&line) {
                            worker.state = WorkerState::Reported;
                            worker.outcomes.push(outcome);
                        } else if !line.trim().is_empty() {
                            info!(job_name = %job_name, "{}", line);
                        }
                    }
                    Ok(None) => {
                        // stdout closed; child is exiting or exited.
                        let status = worker.child.wait().await;
                        debug!(job_name = %job_name, ?status, "worker process exited");
                        return PumpResult::Completed;
                    }
                    Err(e) => {
                        warn!(job_name = %job_name, error = %e, "error reading worker stdout");
                        return PumpResult::Completed;
                    }
                }
            }
            line = stderr_lines.next_line() => {
                if let Ok(Some(line)) = line {
                    // The child's own tracing subscriber already formatted
                    // this; forward it verbatim rather than re-wrapping.
                    eprintln!("{}", line);
                }
            }
            _ = cancel.cancelled() => {
                worker.state = WorkerState::Cancelled;
                terminate_then_kill(worker).await;
                return PumpResult::Completed;
            }
            _ = &mut deadline, if !long_running => {
                worker.state = WorkerState::TimedOut;
                terminate_then_kill(worker).await;
                return PumpResult::TimedOut;
            }
        }

        if long_running && worker.state == WorkerState::Reported && !worker.outcomes.is_empty() {
            // A long-running worker has posted its provisional outcome;
            // stop blocking this pump task on it and let the caller treat
            // it as still-active background work. Its stdout/stderr
            // continue to be abandoned with the task, matching process
            // isolation: a crash here cannot affect peers.
            return PumpResult::StillRunning;
        }
    }
}

async fn terminate_then_kill(worker: &mut Worker) {
    #[cfg(unix)]
    {
        if let Some(pid) = worker.child.id() {
            // SAFETY: pid is a valid process id owned by this Child; signal
            // delivery failure (e.g. already-exited) is not fatal here.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    let graceful = tokio::time::timeout(TERMINATE_GRACE, worker.child.wait()).await;
    if graceful.is_err() {
        warn!(job_name = %worker.job_name, "worker did not exit within grace period, killing");
        let _ = worker.child.start_kill();
        let _ = worker.child.wait().await;
        worker.state = WorkerState::Killed;
    } else {
        worker.state = WorkerState::Terminated;
    }
}

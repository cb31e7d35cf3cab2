use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use repl_core::config::{EndpointConfig, JobSpec, Options};
use repl_core::engine::orchestrator::RUN_JOB_ARG;
use repl_core::engine::{JobScheduler, Orchestrator, Processor};
use repl_core::logging;
use repl_core::model::JobOutcome;
use repl_core::transport::retry::ExponentialBackoff;
use repl_core::transport::{Adapter, EndpointSettings, HttpAdapter, RetryConfig};

#[derive(Parser)]
#[command(name = "repl", version, about = "Time-series replication engine")]
struct Cli {
    /// Directory of job descriptor files (*.yaml, *.yml).
    #[arg(long, default_value = "/config")]
    config: PathBuf,

    /// Debug-level logging.
    #[arg(short, long)]
    verbose: bool,

    /// Validate every descriptor in the config directory and exit without
    /// running any job.
    #[arg(long)]
    validate_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // `__run-job <path>` is the hidden re-exec entrypoint the orchestrator
    // spawns worker processes with; intercepted before clap ever sees it so
    // it never shows up in --help.
    let raw_args: Vec<String> = std::env::args().collect();
    if raw_args.len() >= 3 && raw_args[1] == RUN_JOB_ARG {
        return run_job_worker(PathBuf::from(&raw_args[2])).await;
    }

    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .init();

    if cli.validate_only {
        return validate_only(&cli.config);
    }

    run_orchestrator(cli.config).await
}

fn validate_only(dir: &Path) -> ExitCode {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("{} {}: {}", "error:".red().bold(), dir.display(), e);
            return ExitCode::from(1);
        }
    };

    let mut any_invalid = false;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }
        match JobSpec::load(&path) {
            Ok(spec) => println!("{} {}", "ok".green().bold(), spec.job_name),
            Err(e) => {
                any_invalid = true;
                println!("{} {}: {}", "invalid".red().bold(), path.display(), e);
            }
        }
    }

    ExitCode::from(if any_invalid { 1 } else { 0 })
}

async fn run_orchestrator(dir: PathBuf) -> ExitCode {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    let orchestrator = Orchestrator::new(dir);
    match orchestrator.run(cancel.clone()).await {
        Ok(report) => {
            print_summary(&report);
            if cancel.is_cancelled() {
                ExitCode::from(130)
            } else {
                ExitCode::from(report.exit_code() as u8)
            }
        }
        Err(e) => {
            error!(error = %e, "orchestrator failed");
            ExitCode::from(1)
        }
    }
}

fn print_summary(report: &repl_core::OrchestratorReport) {
    let failed: Vec<_> = report.outcomes.iter().filter(|o| !o.success()).collect();

    for (path, err) in &report.failed_descriptors {
        println!("{} {}: {}", "skipped".yellow().bold(), path.display(), err);
    }
    for outcome in &failed {
        if let JobOutcome::Finished { job_name, error, .. } = outcome {
            println!(
                "{} {}: {}",
                "failed".red().bold(),
                job_name,
                error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    for job_name in &report.long_running {
        println!("{} {}", "still running".blue().bold(), job_name);
    }

    let succeeded = report.outcomes.len() - failed.len();
    println!(
        "{} {} succeeded, {} failed, {} still running",
        "summary:".bold(),
        succeeded,
        failed.len(),
        report.long_running.len()
    );
}

/// Hidden entrypoint for a single re-exec'd job worker process. Loads and
/// runs exactly one job descriptor, printing every `JobOutcome` it produces
/// as one JSON line on stdout — the orchestrator's result-channel protocol —
/// while routing its own tracing output to stderr.
async fn run_job_worker(path: PathBuf) -> ExitCode {
    let spec = match JobSpec::load(&path) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("invalid job descriptor {}: {}", path.display(), e);
            return ExitCode::from(1);
        }
    };

    let log_dir = spec
        .options
        .log_directory
        .as_ref()
        .map(|d| Path::new(d).join(&spec.job_name));
    let _logging = logging::init(
        &spec.options.log_level,
        log_dir.as_deref(),
        spec.options.log_rotation.as_ref(),
    );
    logging::warn_if_loki_unsupported(spec.options.loki.as_ref());

    let source = match build_adapter(&spec.source.endpoint, &spec.options) {
        Ok(a) => a,
        Err(e) => {
            error!(job_name = %spec.job_name, error = %e, "failed to build source adapter");
            return ExitCode::from(1);
        }
    };
    let destination = match build_adapter(&spec.destination, &spec.options) {
        Ok(a) => a,
        Err(e) => {
            error!(job_name = %spec.job_name, error = %e, "failed to build destination adapter");
            return ExitCode::from(1);
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let job_name = spec.job_name.clone();
    let long_running = spec.is_long_running();

    if long_running {
        let schedule = spec
            .options
            .incremental
            .as_ref()
            .and_then(|i| i.schedule.clone())
            .expect("validated: long-running requires a schedule");

        emit(&JobOutcome::LongRunning {
            job_name: job_name.clone(),
            start: chrono::Utc::now(),
            status: "scheduled".to_string(),
        });

        let scheduler = match JobScheduler::new(job_name.clone(), &schedule) {
            Ok(s) => s,
            Err(e) => {
                error!(job_name = %job_name, error = %e, "invalid schedule");
                return ExitCode::from(1);
            }
        };

        let processor = Processor::new(spec, source, destination, cancel.clone());
        scheduler
            .run(cancel.clone(), || async {
                let outcome = processor.run().await;
                if !outcome.success() {
                    warn!(job_name = %job_name, "scheduled run reported failure");
                }
            })
            .await;

        ExitCode::from(if cancel.is_cancelled() { 130 } else { 0 })
    } else {
        let processor = Processor::new(spec, source, destination, cancel.clone());
        let outcome = processor.run().await;
        let success = outcome.success();
        emit(&outcome);
        ExitCode::from(if success { 0 } else { 1 })
    }
}

fn emit(outcome: &JobOutcome) {
    match serde_json::to_string(outcome) {
        Ok(line) => println!("{line}"),
        Err(e) => eprintln!("failed to serialize job outcome: {e}"),
    }
}

fn build_adapter(endpoint: &EndpointConfig, opts: &Options) -> repl_core::Result<Arc<dyn Adapter>> {
    let settings = EndpointSettings {
        base_url: endpoint.url.clone(),
        user: endpoint.user.clone(),
        password: endpoint.password.clone(),
        verify_ssl: endpoint.verify_ssl,
        timeout: Duration::from_secs(opts.timeout_client),
    };
    let retry = RetryConfig {
        retries: opts.retries,
        backoff: ExponentialBackoff::new(Duration::from_secs(opts.retry_delay)),
    };
    Ok(repl_core::transport::shared(HttpAdapter::new(settings, retry)?))
}

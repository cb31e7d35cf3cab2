//! The per-job pipeline and the multi-job orchestrator that drives it.

pub mod orchestrator;
pub mod processor;
pub mod scheduler;
pub mod worker_pool;

pub use orchestrator::{Orchestrator, OrchestratorReport, RUN_JOB_ARG};
pub use processor::Processor;
pub use scheduler::JobScheduler;
pub use worker_pool::FieldWorkerPool;

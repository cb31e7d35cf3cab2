pub mod config;
pub mod duration;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod planner;
pub mod transport;

pub use config::JobSpec;
pub use duration::parse_duration;
pub use engine::{JobScheduler, Orchestrator, OrchestratorReport, Processor};
pub use error::{ReplicatorError, Result};
pub use model::{FieldOutcome, FieldType, FieldValue, JobOutcome, JobStats, Row, WorkerUtilization};
pub use transport::{Adapter, HttpAdapter};

/// Current version of the replication engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

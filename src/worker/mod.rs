//! Worker system: turns queued jobs into stored report archives.
//!
//! - `executor`: the analysis contract plus closure and subprocess adapters
//! - `runner`: claim → analyze → package → store → record, one job at a time
//! - `supervisor`: spawns and tracks the polling loops

pub mod executor;
pub mod runner;
pub mod supervisor;

pub use executor::{AnalysisExecutor, CommandExecutor, FnExecutor};
pub use runner::JobWorker;
pub use supervisor::WorkerSupervisor;

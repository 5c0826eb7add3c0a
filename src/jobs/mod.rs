//! Job records and the producer-facing queue.
//!
//! - `model`: job row, status state machine, failure kinds
//! - `queue`: enqueue / lookup / download resolution for producers

pub mod model;
pub mod queue;

pub use model::{FailureKind, Job, JobFailure, JobStatus, JobUpdate};
pub use queue::{ALLOWED_EXTENSIONS, JobQueue};

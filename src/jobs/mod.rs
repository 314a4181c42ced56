//! Scheduled delivery generation.
//!
//! The "generate today's deliveries" task is supplied by an external module
//! through a [`TaskRegistry`]. At startup [`DailyJob::start`] resolves it by
//! name; when it cannot be resolved the job stays inactive for the lifetime
//! of the process and only a warning is logged.
//!
//! A resolved task runs once at boot and then on every occurrence of its
//! [`DailySchedule`] (midnight server local time by default). Runs are
//! fire-and-forget: failures and panics are logged, never propagated, and a
//! trigger that arrives while a run is still in flight is skipped.

pub mod daily;
pub mod registry;
pub mod schedule;

pub use daily::{DailyJob, JobOutcome, JobStatus, Trigger};
pub use registry::{TaskFn, TaskFuture, TaskRegistry};
pub use schedule::DailySchedule;

//! Background shadow-column migration.
//!
//! For each configured table, the engine finds rows whose shadow column is
//! still NULL, converts the source value with the rounding engine and
//! writes the result back in throttled batches. Jobs are pausable,
//! resumable and stoppable through a single control queue checked at batch
//! boundaries.

pub mod controller;
pub mod progress;
pub mod store;
pub mod worker;

pub use controller::BackfillController;
pub use progress::{JobStatus, Progress, ProgressSnapshot};
pub use store::{BackfillStore, MySqlStore, PendingRow};
pub use worker::{ControlSignal, Worker, WorkerSettings};

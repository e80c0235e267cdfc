//! Job lifecycle: persistence, admission and cancellation.

pub mod admission;
pub mod control;
pub mod store;

pub use admission::AdmissionService;
pub use control::{cancel_job, CancellationRegistry, RunningJob};
pub use store::{JobStore, Recovery};

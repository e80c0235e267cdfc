//! Database query modules.

pub mod jobs;
pub mod quotas;
pub mod task_queue;
pub mod webhook_attempts;
pub mod webhook_outbox;

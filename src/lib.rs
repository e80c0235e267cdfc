//! Transforge - media transformation job service
//!
//! This library crate exposes the core functionality for integration testing.

pub mod config;
pub mod executor;
pub mod jobs;
pub mod queue;
pub mod recovery;
pub mod retention;
pub mod server;
pub mod storage;
pub mod tools;
pub mod validate;
pub mod webhook;

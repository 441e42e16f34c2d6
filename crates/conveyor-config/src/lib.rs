//! # Conveyor Config
//!
//! Configuration management for Conveyor services.
//! Supports layered configuration from files, environment variables,
//! and runtime refresh.

mod loader;

pub use loader::*;

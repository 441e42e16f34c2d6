//! # Conveyor Server Library
//!
//! Configuration and the maintenance loop behind the `conveyor-server`
//! binary. The loop keeps the shared queues moving when no dispatcher is
//! pumping: due delayed jobs become visible, repeating schedules fire, and
//! workers that stopped heartbeating are disconnected.

pub mod app;
pub mod startup;

pub use app::{AppSettings, MaintenanceLoop, MaintenanceReport, ServerConfig};

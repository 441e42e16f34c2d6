//! # Conveyor Core
//!
//! Error types and logging bootstrap shared by every Conveyor crate.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::*;

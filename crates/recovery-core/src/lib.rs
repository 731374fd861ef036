//! Lab device recovery: a plan engine that verifies a device and its servo
//! and repairs what it can, plus the servo, firmware and host operations the
//! plans are built from.
//!
//! The runtime hands capabilities in through [`tlw::Access`]; everything that
//! touches a real host goes through it.

pub mod config;
pub mod cros;
pub mod defaults;
pub mod dut;
pub mod engine;
pub mod error;
pub mod exec;
pub mod firmware;
pub mod log;
pub mod metrics;
pub mod plan;
pub mod recovery;
pub mod retry;
pub mod servo;
pub mod tlw;

#[cfg(test)]
mod testing;

pub use error::{RecoveryError, Result};

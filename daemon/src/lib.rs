//! Cross-platform process telemetry.
//!
//! [`stats::ProcessStats`] drives a per-platform [`collector::ProcessCollector`]
//! over every visible process and returns a [`stats::Snapshot`]. Fields that
//! need elevated access are collected in a separate tier whose failures are
//! recorded per field instead of discarding the process.

pub mod cache;
pub mod cgroup;
pub mod collector;
pub mod config;
pub mod error;
pub mod resolve;
pub mod state;
pub mod stats;
pub mod top;

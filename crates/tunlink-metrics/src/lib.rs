//! tunlink Observability
//!
//! This crate provides:
//! - Structured logging with tracing
//! - Prometheus counters for deploys, refresh passes and cloud route mutations

#![warn(missing_docs)]

pub mod logging;
pub mod metrics;

// Re-exports
pub use logging::{init_logging, LogConfig, LogFormat};
pub use metrics::{Metrics, MetricsSnapshot};

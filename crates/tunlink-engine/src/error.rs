//! Engine error types
//!
//! Every message starts with the subsystem that produced it (`cloud:`,
//! `ipsec:`, `iptables:`, `ledger:`, `state:`, `net:`) followed by the
//! underlying cause.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Result type for engine operations
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors that can occur while deploying or advertising link state
#[derive(Debug, Error)]
pub enum LinkError {
    /// A cloud or network request failed
    #[error("{0}")]
    Request(String),

    /// Reading local state failed
    #[error("{0}")]
    Read(String),

    /// Writing local state failed
    #[error("{0}")]
    Write(String),

    /// Template rendering or response decoding failed
    #[error("{0}")]
    Parse(String),

    /// An external command exited unsuccessfully
    #[error("{0}")]
    Exec(String),

    /// Shutdown is in progress
    #[error("{0}")]
    Interrupted(String),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// One or more route tables could not be reconciled
    #[error("cloud: Failed to reconcile {} route table(s): {}", .0.len(), join_failures(.0))]
    RouteTables(Vec<TableFailure>),
}

impl LinkError {
    /// Request error with a subsystem prefix
    pub fn request(context: &str, cause: impl fmt::Display) -> Self {
        Self::Request(format!("{}: {}", context, cause))
    }

    /// Read error with a subsystem prefix
    pub fn read(context: &str, cause: impl fmt::Display) -> Self {
        Self::Read(format!("{}: {}", context, cause))
    }

    /// Write error with a subsystem prefix
    pub fn write(context: &str, cause: impl fmt::Display) -> Self {
        Self::Write(format!("{}: {}", context, cause))
    }

    /// Parse error with a subsystem prefix
    pub fn parse(context: &str, cause: impl fmt::Display) -> Self {
        Self::Parse(format!("{}: {}", context, cause))
    }

    /// Exec error with a subsystem prefix
    pub fn exec(context: &str, cause: impl fmt::Display) -> Self {
        Self::Exec(format!("{}: {}", context, cause))
    }

    /// Interrupt error for the given subsystem
    pub fn interrupted(subsystem: &str) -> Self {
        Self::Interrupted(format!("{}: Interrupt", subsystem))
    }

    /// Returns true if this error was caused by shutdown
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

/// A route table where both the primary and fallback mutation failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFailure {
    /// Route table identifier
    pub table_id: String,
    /// Why the create call failed
    pub create_error: String,
    /// Why the replace call failed
    pub replace_error: String,
}

impl fmt::Display for TableFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (create: {}; replace: {})",
            self.table_id, self.create_error, self.replace_error
        )
    }
}

fn join_failures(failures: &[TableFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Fail with an interrupt error if the shutdown flag is set
pub fn check_interrupt(shutdown: &AtomicBool, subsystem: &str) -> LinkResult<()> {
    if shutdown.load(Ordering::Relaxed) {
        return Err(LinkError::interrupted(subsystem));
    }
    Ok(())
}

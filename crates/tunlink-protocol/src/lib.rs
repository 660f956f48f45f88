//! tunlink Protocol — link state model and configuration
//!
//! This crate holds the pieces of tunlink that carry no I/O of their own:
//!
//! - **Link state**: [`State`] and [`Link`] as submitted by the controller,
//!   plus the [`StateType`] that decides whether NAT rules are needed.
//! - **Address families**: the colon heuristic ([`AddressFamily::of`]) used
//!   everywhere a destination network has to be classified.
//! - **Configuration**: the daemon's TOML file ([`Config`]).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod types;

// Re-exports
pub use config::{
    AwsSection, Config, ConfigError, HostSection, LinkSection, Provider, SchedulerSection,
};
pub use types::{has_direct_client, has_subnets, AddressFamily, Link, State, StateType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

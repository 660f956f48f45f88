//! tunlink Engine
//!
//! Keeps a host's IPsec links and the cloud routes pointing at it in line
//! with the latest submitted state set.

#![warn(missing_docs)]

pub mod advertise;
pub mod cloud;
pub mod deployer;
pub mod error;
pub mod firewall;
pub mod host;
pub mod ipsec;
pub mod ledger;
pub mod scheduler;

#[cfg(test)]
mod testing;

// Re-exports
pub use advertise::{AwsCli, Imds, RouteAdvertiser, RouteReconciler};
pub use cloud::{
    CloudIdentity, CloudRoute, Destination, InstanceMetadata, MetadataProvider, RouteTableBackend,
    RouteTarget,
};
pub use deployer::{LinkDeployer, StateApplier};
pub use error::{LinkError, LinkResult, TableFailure};
pub use firewall::{Firewall, IpTables};
pub use host::{HostAddresses, NetworkSetup, SysctlForwarding};
pub use ipsec::{DaemonController, IpsecConfigWriter, IpsecCtl};
pub use ledger::{AdvertisedRoute, FileLedger, RouteLedger};
pub use scheduler::{LinkScheduler, SchedulerConfig, SchedulerHandle, TickOutcome};

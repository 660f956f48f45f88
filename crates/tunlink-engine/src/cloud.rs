//! Cloud provider seams
//!
//! The reconciler only talks to a cloud through [`RouteTableBackend`] and
//! learns who it is through [`MetadataProvider`]. Both are synchronous; a
//! backend is expected to block until the provider has answered.

use crate::error::{LinkError, LinkResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tunlink_protocol::{AddressFamily, AwsSection};

/// A destination network, tagged with the field it belongs in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// IPv4 CIDR, stored in the IPv4 destination field
    V4(String),
    /// IPv6 CIDR, stored in the IPv6 destination field
    V6(String),
}

impl Destination {
    /// Classify a network string by the colon heuristic
    pub fn parse(network: &str) -> Self {
        match AddressFamily::of(network) {
            AddressFamily::V6 => Self::V6(network.to_string()),
            AddressFamily::V4 => Self::V4(network.to_string()),
        }
    }

    /// The network string
    pub fn network(&self) -> &str {
        match self {
            Self::V4(n) | Self::V6(n) => n,
        }
    }

    /// Returns true for IPv6 destinations
    pub fn is_ipv6(&self) -> bool {
        matches!(self, Self::V6(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.network())
    }
}

/// Next hop for a route this node advertises
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    /// Compute instance identifier
    Instance(String),
    /// Network interface identifier
    Interface(String),
}

impl RouteTarget {
    /// The identifier, whatever its kind
    pub fn id(&self) -> &str {
        match self {
            Self::Instance(id) | Self::Interface(id) => id,
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(id) => write!(f, "instance {}", id),
            Self::Interface(id) => write!(f, "interface {}", id),
        }
    }
}

/// One route as reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudRoute {
    /// IPv4 destination
    pub destination_cidr_block: Option<String>,
    /// IPv6 destination
    pub destination_ipv6_cidr_block: Option<String>,
    /// Instance next hop
    pub instance_id: Option<String>,
    /// Network interface next hop
    pub network_interface_id: Option<String>,
}

impl CloudRoute {
    /// Returns true if this route is for `destination`, comparing only the
    /// field that matches its address family
    pub fn matches_destination(&self, destination: &Destination) -> bool {
        let field = match destination {
            Destination::V4(_) => &self.destination_cidr_block,
            Destination::V6(_) => &self.destination_ipv6_cidr_block,
        };
        field.as_deref() == Some(destination.network())
    }

    /// Returns true if this route already points at `target`
    pub fn points_at(&self, target: &RouteTarget) -> bool {
        match target {
            RouteTarget::Instance(id) => self.instance_id.as_deref() == Some(id.as_str()),
            RouteTarget::Interface(id) => {
                self.network_interface_id.as_deref() == Some(id.as_str())
            }
        }
    }
}

/// Route tables of one virtual network, keyed by table id. Fetched fresh
/// for every reconciliation call.
pub type RouteTableSnapshot = BTreeMap<String, Vec<CloudRoute>>;

/// Arguments to a create or replace call
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    /// Table to mutate
    pub table_id: &'a str,
    /// Destination network
    pub destination: &'a Destination,
    /// Next hop
    pub target: &'a RouteTarget,
}

/// Route table operations of a cloud provider
pub trait RouteTableBackend: Send + Sync {
    /// List every route table of a virtual network
    fn route_tables(&self, region: &str, vpc_id: &str) -> LinkResult<RouteTableSnapshot>;

    /// Create a route. Fails if the destination already has a route.
    fn create_route(&self, region: &str, request: &RouteRequest<'_>) -> LinkResult<()>;

    /// Replace a route. Fails if the destination has no route.
    fn replace_route(&self, region: &str, request: &RouteRequest<'_>) -> LinkResult<()>;

    /// Delete a route
    fn delete_route(&self, region: &str, table_id: &str, destination: &Destination)
        -> LinkResult<()>;
}

/// Identity of the running instance as reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceMetadata {
    /// Region
    pub region: String,
    /// Instance identifier
    pub instance_id: String,
    /// MAC address of the primary interface
    pub mac_address: String,
    /// Virtual network of the primary interface
    pub vpc_id: String,
}

/// Source of instance metadata
pub trait MetadataProvider: Send + Sync {
    /// Look up the running instance
    fn instance_metadata(&self) -> LinkResult<InstanceMetadata>;
}

/// Where and through what this node advertises routes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudIdentity {
    /// Region
    pub region: String,
    /// Virtual network
    pub vpc_id: String,
    /// Next hop for advertised routes
    pub target: RouteTarget,
}

/// Work out the advertisement identity.
///
/// A complete `[aws]` override is used as-is and metadata is never fetched.
/// Otherwise the metadata service decides and the instance is the target.
pub fn resolve_identity(
    overrides: &AwsSection,
    metadata: &dyn MetadataProvider,
) -> LinkResult<CloudIdentity> {
    if overrides.is_complete() {
        let target = if !overrides.interface_id.is_empty() {
            RouteTarget::Interface(overrides.interface_id.clone())
        } else {
            RouteTarget::Instance(overrides.instance_id.clone())
        };
        return Ok(CloudIdentity {
            region: overrides.region.clone(),
            vpc_id: overrides.vpc_id.clone(),
            target,
        });
    }

    let data = metadata.instance_metadata()?;
    if data.region.is_empty() || data.vpc_id.is_empty() || data.instance_id.is_empty() {
        return Err(LinkError::request(
            "cloud: Incomplete instance metadata",
            format!(
                "region='{}' vpc='{}' instance='{}'",
                data.region, data.vpc_id, data.instance_id
            ),
        ));
    }

    Ok(CloudIdentity {
        region: data.region,
        vpc_id: data.vpc_id,
        target: RouteTarget::Instance(data.instance_id),
    })
}

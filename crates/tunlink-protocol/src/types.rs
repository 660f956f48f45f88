//! Link state model for tunlink
//!
//! A [`State`] is one tunnel group as handed to us by the controller. States
//! are immutable snapshots: the engine never edits them, it only replaces the
//! whole set it is working towards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::config::ConfigError;

// ============================================================================
// Deployment kinds
// ============================================================================

/// Deployment kind of a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    /// This host terminates links for NAT'd clients behind it
    DirectServer,
    /// This host is the client side of a direct link
    DirectClient,
    /// Regular site-to-site link group, and any kind we do not know
    #[default]
    #[serde(other)]
    Standard,
}

impl StateType {
    /// Returns true if states of this kind need NAT rules on the host
    pub fn uses_nat(&self) -> bool {
        matches!(self, Self::DirectServer)
    }
}

impl std::str::FromStr for StateType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "standard" => Ok(Self::Standard),
            "direct_server" | "direct-server" => Ok(Self::DirectServer),
            "direct_client" | "direct-client" => Ok(Self::DirectClient),
            other => Err(ConfigError::ValidationError(format!(
                "unknown state type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::DirectServer => write!(f, "direct_server"),
            Self::DirectClient => write!(f, "direct_client"),
        }
    }
}

// ============================================================================
// Address families
// ============================================================================

/// Address family of a destination network string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// Dotted-quad networks
    V4,
    /// Anything containing a colon
    V6,
}

impl AddressFamily {
    /// Classify a network string. A colon anywhere means IPv6, everything
    /// else is treated as IPv4.
    pub fn of(network: &str) -> Self {
        if network.contains(':') {
            Self::V6
        } else {
            Self::V4
        }
    }

    /// Returns true for IPv6
    pub fn is_ipv6(&self) -> bool {
        matches!(self, Self::V6)
    }
}

// ============================================================================
// States and links
// ============================================================================

/// One IPsec tunnel between the local host and a remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Link {
    /// Local endpoint address as known to the controller
    #[serde(default)]
    pub left: String,

    /// Remote endpoint address
    #[serde(default)]
    pub right: String,

    /// Networks behind the local endpoint (CIDR)
    #[serde(default)]
    pub left_subnets: Vec<String>,

    /// Networks behind the remote endpoint (CIDR)
    #[serde(default)]
    pub right_subnets: Vec<String>,

    /// IKE pre-shared key
    #[serde(default)]
    pub pre_shared_key: String,
}

impl Link {
    /// Returns true if either side declares at least one subnet
    pub fn has_subnets(&self) -> bool {
        !self.left_subnets.is_empty() || !self.right_subnets.is_empty()
    }
}

/// A named group of links deployed together
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct State {
    /// Stable identifier of the tunnel group
    pub id: String,

    /// Deployment kind
    #[serde(rename = "type", default)]
    pub kind: StateType,

    /// Links, in controller order. The index is part of each link's name.
    #[serde(default)]
    pub links: Vec<Link>,
}

impl State {
    /// Create an empty state of the given kind
    pub fn new(id: &str, kind: StateType) -> Self {
        Self {
            id: id.to_string(),
            kind,
            links: Vec::new(),
        }
    }

    /// Append a link
    pub fn with_link(mut self, link: Link) -> Self {
        self.links.push(link);
        self
    }

    /// Name of the link at `index`, used for the daemon connection name
    pub fn link_id(&self, index: usize) -> String {
        format!("{}-{}", self.id, index)
    }

    /// Returns true if this state needs NAT rules applied on deploy
    pub fn requires_nat(&self) -> bool {
        self.kind.uses_nat() && !self.links.is_empty()
    }

    /// Parse a JSON array of states
    pub fn list_from_json(content: &str) -> Result<Vec<State>, ConfigError> {
        let states: Vec<State> = serde_json::from_str(content)?;
        for state in &states {
            if state.id.trim().is_empty() {
                return Err(ConfigError::MissingField("state id".into()));
            }
        }
        Ok(states)
    }

    /// Load a JSON array of states from a file
    pub fn list_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<State>, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::list_from_json(&content)
    }
}

/// Returns true if any link in any state declares a subnet
pub fn has_subnets(states: &[State]) -> bool {
    states
        .iter()
        .flat_map(|s| s.links.iter())
        .any(Link::has_subnets)
}

/// Returns true if any state is the client side of a direct link
pub fn has_direct_client(states: &[State]) -> bool {
    states.iter().any(|s| s.kind == StateType::DirectClient)
}

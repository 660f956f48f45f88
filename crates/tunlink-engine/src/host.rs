//! Host networking
//!
//! Addresses of this node, default interface detection and the kernel
//! settings a gateway needs before any tunnel can carry traffic.

use crate::error::{LinkError, LinkResult};
use std::process::Command;
use tunlink_protocol::HostSection;

/// Addresses of this node. `None` means unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAddresses {
    /// Address peers reach this node on
    pub public_address: Option<String>,
    /// Address of the node inside its own network
    pub local_address: Option<String>,
    /// IPv6 address
    pub address6: Option<String>,
    /// Interface carrying the default route
    pub default_interface: Option<String>,
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl HostAddresses {
    /// Build from the `[host]` section, without touching the system
    pub fn from_section(section: &HostSection) -> Self {
        Self {
            public_address: non_empty(&section.public_address),
            local_address: non_empty(&section.local_address),
            address6: non_empty(&section.address6),
            default_interface: non_empty(&section.default_interface),
        }
    }

    /// Build from the `[host]` section, detecting the default interface when
    /// it is not configured. Detection failure leaves it unknown.
    pub fn from_config(section: &HostSection) -> Self {
        let mut addresses = Self::from_section(section);
        if addresses.default_interface.is_none() {
            match detect_default_interface() {
                Ok(iface) => addresses.default_interface = iface,
                Err(e) => tracing::warn!("Failed to detect default interface: {}", e),
            }
        }
        addresses
    }
}

/// Run a command and return its stdout. A non-zero exit is an `Exec` error
/// carrying stderr.
pub fn run_cmd(program: &str, args: &[&str]) -> LinkResult<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| LinkError::exec(&format!("Failed to run {}", program), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LinkError::exec(
            &format!("{} {} failed", program, args.join(" ")),
            stderr.trim(),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Pick the interface out of `ip -o route show default` output
pub fn parse_default_interface(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word == "dev" {
                return words.next().map(str::to_string);
            }
        }
        None
    })
}

/// Ask the kernel for the default route's interface
pub fn detect_default_interface() -> LinkResult<Option<String>> {
    let output = run_cmd("ip", &["-o", "route", "show", "default"])
        .map_err(|e| LinkError::Read(format!("net: {}", e)))?;
    Ok(parse_default_interface(&output))
}

/// Prepares the host before a deploy
pub trait NetworkSetup: Send + Sync {
    /// Bring kernel networking into the state a gateway needs
    fn init(&self) -> LinkResult<()>;
}

/// Enables IPv4 and IPv6 forwarding through `/proc/sys`
#[derive(Debug, Clone)]
pub struct SysctlForwarding {
    root: std::path::PathBuf,
}

impl Default for SysctlForwarding {
    fn default() -> Self {
        Self::new("/proc/sys")
    }
}

impl SysctlForwarding {
    /// Forwarding switches rooted at `root` (normally `/proc/sys`)
    pub fn new<P: Into<std::path::PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn enable(&self, key: &str) -> LinkResult<()> {
        let path = self.root.join(key);
        match std::fs::read_to_string(&path) {
            Ok(val) if val.trim() == "1" => return Ok(()),
            Ok(_) => {}
            Err(e) => tracing::debug!("Could not read {}: {}", path.display(), e),
        }
        std::fs::write(&path, "1")
            .map_err(|e| LinkError::write(&format!("net: Failed to enable {}", key), e))?;
        tracing::info!("Enabled {}", key);
        Ok(())
    }
}

impl NetworkSetup for SysctlForwarding {
    fn init(&self) -> LinkResult<()> {
        self.enable("net/ipv4/ip_forward")?;
        self.enable("net/ipv6/conf/all/forwarding")
    }
}

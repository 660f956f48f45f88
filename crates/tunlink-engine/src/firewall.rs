//! Firewall rules for direct-server states
//!
//! Clients behind a direct server reach the rest of the network through NAT
//! on this host. Every rule this module installs carries the comment
//! [`RULE_COMMENT`] so [`Firewall::clear_all`] can find and remove exactly
//! those rules and nothing else.

use crate::error::{LinkError, LinkResult};
use crate::host::{run_cmd, HostAddresses};
use tunlink_protocol::State;

/// Comment attached to every managed rule
pub const RULE_COMMENT: &str = "tunlink";

/// MSS clamp applied to forwarded client TCP traffic
pub const CLAMP_MSS: &str = "1320";

/// One rule, without the comment match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Table (`nat`, `mangle`)
    pub table: String,
    /// Chain within the table
    pub chain: String,
    /// Match and target arguments
    pub spec: Vec<String>,
}

impl Rule {
    fn new(table: &str, chain: &str, spec: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            chain: chain.to_string(),
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Full rule arguments including the comment match
    pub fn args(&self) -> Vec<String> {
        let mut args = self.spec.clone();
        args.extend(
            ["-m", "comment", "--comment", RULE_COMMENT]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    }
}

/// Applies and clears managed rules
pub trait Firewall: Send + Sync {
    /// Insert a rule unless an identical one already exists
    fn upsert_rule(&self, rule: &Rule) -> LinkResult<()>;

    /// Remove every managed rule
    fn clear_all(&self) -> LinkResult<()>;
}

/// Rules needed for `state`, or `None` when some required value is unknown.
///
/// The first right-side subnet of the first link is the client network; its
/// network address is where IKE-unrelated traffic for this host is forwarded.
pub fn nat_rules(state: &State, host: &HostAddresses) -> Option<Vec<Rule>> {
    let client_net = state
        .links
        .first()
        .and_then(|l| l.right_subnets.first())
        .map(String::as_str)
        .unwrap_or("");
    let client = client_net.split('/').next().unwrap_or("");
    let local = host.local_address.as_deref().unwrap_or("");
    let public = host.public_address.as_deref().unwrap_or("");
    let iface = host.default_interface.as_deref().unwrap_or("");

    if client.is_empty() || local.is_empty() || public.is_empty() || iface.is_empty() {
        tracing::warn!(
            state = %state.id,
            client_local_address = client,
            local_address = local,
            public_address = public,
            default_interface = iface,
            "iptables: Missing required values for NAT rules"
        );
        return None;
    }

    let mut rules = Vec::new();
    for addr in [local, public] {
        for port in ["500", "4500"] {
            rules.push(Rule::new(
                "nat",
                "PREROUTING",
                &["-d", addr, "-p", "udp", "-m", "udp", "--dport", port, "-j", "ACCEPT"],
            ));
        }
    }
    for addr in [local, public] {
        rules.push(Rule::new(
            "nat",
            "PREROUTING",
            &["-d", addr, "-j", "DNAT", "--to-destination", client],
        ));
    }
    rules.push(Rule::new(
        "nat",
        "POSTROUTING",
        &["-s", client_net, "-o", iface, "-j", "MASQUERADE"],
    ));
    rules.push(Rule::new(
        "mangle",
        "FORWARD",
        &[
            "-s", client_net, "-p", "tcp", "-m", "tcp", "--tcp-flags", "SYN,RST", "SYN", "-j",
            "TCPMSS", "--set-mss", CLAMP_MSS,
        ],
    ));

    Some(rules)
}

/// Turn a `-S` listing line of a managed rule into delete arguments
pub fn delete_args(table: &str, line: &str) -> Option<Vec<String>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.first() != Some(&"-A") {
        return None;
    }
    let managed = words
        .windows(2)
        .any(|w| w[0] == "--comment" && w[1].trim_matches('"') == RULE_COMMENT);
    if !managed {
        return None;
    }

    let mut args = vec!["-t".to_string(), table.to_string(), "-D".to_string()];
    args.extend(words[1..].iter().map(|w| w.trim_matches('"').to_string()));
    Some(args)
}

/// `iptables` command line applier
#[derive(Debug, Clone)]
pub struct IpTables {
    program: String,
}

impl Default for IpTables {
    fn default() -> Self {
        Self {
            program: "iptables".to_string(),
        }
    }
}

impl IpTables {
    fn run(&self, args: &[String]) -> LinkResult<String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_cmd(&self.program, &args)
    }

    fn rule_args(op: &str, rule: &Rule) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            rule.table.clone(),
            op.to_string(),
            rule.chain.clone(),
        ];
        args.extend(rule.args());
        args
    }
}

impl Firewall for IpTables {
    fn upsert_rule(&self, rule: &Rule) -> LinkResult<()> {
        if self.run(&Self::rule_args("-C", rule)).is_ok() {
            return Ok(());
        }
        self.run(&Self::rule_args("-A", rule))
            .map_err(|e| LinkError::exec("iptables: Failed to add rule", e))?;
        Ok(())
    }

    fn clear_all(&self) -> LinkResult<()> {
        for table in ["nat", "mangle"] {
            let listing = self
                .run(&["-t".to_string(), table.to_string(), "-S".to_string()])
                .map_err(|e| LinkError::read("iptables: Failed to list rules", e))?;

            for args in listing.lines().filter_map(|l| delete_args(table, l)) {
                self.run(&args)
                    .map_err(|e| LinkError::exec("iptables: Failed to delete rule", e))?;
            }
        }
        Ok(())
    }
}

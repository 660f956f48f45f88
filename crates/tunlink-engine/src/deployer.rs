//! State deployment
//!
//! A full deploy rebuilds everything this node derives from its states, in
//! a fixed order:
//!
//! 1. clear managed firewall rules
//! 2. enable forwarding
//! 3. rewrite the IPsec configuration
//! 4. apply NAT rules for direct-server states
//! 5. restart the IPsec daemon
//! 6. advertise routes
//!
//! A failed step stops the deploy; the scheduler retries it later. A refresh
//! only repeats step 6, and is dropped when its networks differ from those
//! of the set most recently taken up for deployment. Advertisement passes
//! never overlap.

use crate::advertise::{desired_networks, RouteAdvertiser};
use crate::error::{check_interrupt, LinkError, LinkResult};
use crate::firewall::{nat_rules, Firewall, IpTables};
use crate::host::{HostAddresses, NetworkSetup, SysctlForwarding};
use crate::ipsec::{render_states, DaemonController, IpsecConfigWriter, IpsecCtl};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tunlink_metrics::Metrics;
use tunlink_protocol::{has_direct_client, has_subnets, Config, State};

/// Something that can bring the host in line with a state set
pub trait StateApplier: Send + Sync {
    /// Full deploy
    fn deploy(&self, states: &[State]) -> LinkResult<()>;

    /// Route advertisement only
    fn refresh(&self, states: &[State]) -> LinkResult<()>;
}

/// Deploys states onto this host
pub struct LinkDeployer {
    firewall: Arc<dyn Firewall>,
    network: Arc<dyn NetworkSetup>,
    writer: IpsecConfigWriter,
    daemon: Arc<dyn DaemonController>,
    advertiser: Option<RouteAdvertiser>,
    host: HostAddresses,
    shutdown: Arc<AtomicBool>,
    disable_advertise_update: bool,
    direct_client: AtomicBool,
    deployed_networks: Mutex<Option<BTreeSet<String>>>,
}

impl LinkDeployer {
    /// Create a deployer that does not advertise routes
    pub fn new(
        firewall: Arc<dyn Firewall>,
        network: Arc<dyn NetworkSetup>,
        writer: IpsecConfigWriter,
        daemon: Arc<dyn DaemonController>,
        host: HostAddresses,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            firewall,
            network,
            writer,
            daemon,
            advertiser: None,
            host,
            shutdown,
            disable_advertise_update: false,
            direct_client: AtomicBool::new(false),
            deployed_networks: Mutex::new(None),
        }
    }

    /// Advertise routes through `advertiser`
    pub fn with_advertiser(mut self, advertiser: RouteAdvertiser) -> Self {
        self.advertiser = Some(advertiser);
        self
    }

    /// Skip refresh-only passes
    pub fn with_disable_advertise_update(mut self, disable: bool) -> Self {
        self.disable_advertise_update = disable;
        self
    }

    /// Deployer wired to the real system as configured
    pub fn from_config(
        config: &Config,
        shutdown: Arc<AtomicBool>,
        metrics: Metrics,
    ) -> LinkResult<Self> {
        config
            .validate()
            .map_err(|e| LinkError::Config(e.to_string()))?;

        let writer = IpsecConfigWriter::new(
            config.link.ipsec_dir.as_str(),
            config.link.ipsec_conf_path.as_str(),
            config.link.ipsec_secrets_path.as_str(),
        );
        let advertiser = RouteAdvertiser::from_config(config, shutdown.clone(), metrics)?;

        let mut deployer = Self::new(
            Arc::new(IpTables::default()),
            Arc::new(SysctlForwarding::default()),
            writer,
            Arc::new(IpsecCtl),
            HostAddresses::from_config(&config.host),
            shutdown,
        )
        .with_disable_advertise_update(config.link.disable_advertise_update);
        deployer.advertiser = advertiser;
        Ok(deployer)
    }

    /// Host addresses in use
    pub fn host(&self) -> &HostAddresses {
        &self.host
    }

    /// Returns true if the last deployed set had a direct-client state
    pub fn is_direct_client(&self) -> bool {
        self.direct_client.load(Ordering::Relaxed)
    }

    /// Rewrite IPsec config and apply NAT rules. Nothing is touched when the
    /// public address is unknown.
    fn write_templates(&self, states: &[State]) -> LinkResult<()> {
        let public = match self.host.public_address.as_deref() {
            Some(addr) => addr,
            None => {
                tracing::warn!("ipsec: Public address unknown, skipping configuration");
                return Ok(());
            }
        };

        let rendered = render_states(states, public)?;

        let mut nat_applied = false;
        for state in states.iter().filter(|s| s.requires_nat()) {
            nat_applied = true;
            if let Some(rules) = nat_rules(state, &self.host) {
                for rule in &rules {
                    self.firewall.upsert_rule(rule)?;
                }
            }
        }

        self.writer.write_rendered(&rendered)?;

        if !nat_applied {
            self.firewall.clear_all()?;
        }
        Ok(())
    }

    fn advertise(&self, states: &[State]) -> LinkResult<()> {
        let _pass = self
            .deployed_networks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.advertise_locked(states)
    }

    fn advertise_locked(&self, states: &[State]) -> LinkResult<()> {
        match &self.advertiser {
            Some(advertiser) => advertiser.advertise(states),
            None => Ok(()),
        }
    }
}

impl StateApplier for LinkDeployer {
    fn deploy(&self, states: &[State]) -> LinkResult<()> {
        check_interrupt(&self.shutdown, "state")?;

        *self
            .deployed_networks
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(desired_networks(states));

        tracing::info!(
            states = states.len(),
            public_address = self.host.public_address.as_deref().unwrap_or(""),
            local_address = self.host.local_address.as_deref().unwrap_or(""),
            "Deploying link state"
        );

        self.firewall.clear_all()?;
        self.network.init()?;
        self.writer.clear_dir()?;
        self.writer.write_conf()?;
        self.write_templates(states)?;
        self.daemon.restart()?;
        self.advertise(states)?;

        self.direct_client
            .store(has_direct_client(states), Ordering::Relaxed);

        tracing::info!(states = states.len(), "Link state deployed");
        Ok(())
    }

    fn refresh(&self, states: &[State]) -> LinkResult<()> {
        check_interrupt(&self.shutdown, "state")?;

        if self.disable_advertise_update || !has_subnets(states) {
            return Ok(());
        }

        tracing::info!(
            local_address = self.host.local_address.as_deref().unwrap_or(""),
            public_address = self.host.public_address.as_deref().unwrap_or(""),
            address6 = self.host.address6.as_deref().unwrap_or(""),
            "state: Update advertisement"
        );

        let deployed = self
            .deployed_networks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(networks) = deployed.as_ref() {
            if *networks != desired_networks(states) {
                tracing::debug!("state: Skipping advertisement for superseded states");
                return Ok(());
            }
        }
        self.advertise_locked(states)
    }
}

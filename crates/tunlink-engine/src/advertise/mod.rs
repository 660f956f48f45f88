//! Route advertisement
//!
//! Turns a set of states into cloud routes: every right-side subnet should
//! be routed through this node, and every ledger record for a subnet that is
//! no longer wanted is withdrawn.

pub mod aws;
pub mod reconciler;

pub use aws::{AwsCli, Imds};
pub use reconciler::{
    apply_with_fallback, plan_table, AdvertiseOutcome, RouteOp, RouteReconciler, TablePlan,
    DEFAULT_ROUTE_DELAY,
};

use crate::cloud::{resolve_identity, MetadataProvider};
use crate::error::{LinkError, LinkResult};
use crate::ledger::FileLedger;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tunlink_metrics::Metrics;
use tunlink_protocol::{AwsSection, Config, Provider, State};

/// Networks the given states want routed through this node
pub fn desired_networks(states: &[State]) -> BTreeSet<String> {
    states
        .iter()
        .flat_map(|s| s.links.iter())
        .flat_map(|l| l.right_subnets.iter())
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

/// Advertises the networks of a state set and withdraws stale ones
pub struct RouteAdvertiser {
    reconciler: RouteReconciler,
    metadata: Arc<dyn MetadataProvider>,
    overrides: AwsSection,
}

impl RouteAdvertiser {
    /// Create an advertiser
    pub fn new(
        reconciler: RouteReconciler,
        metadata: Arc<dyn MetadataProvider>,
        overrides: AwsSection,
    ) -> Self {
        Self {
            reconciler,
            metadata,
            overrides,
        }
    }

    /// Build the configured advertiser, or `None` when no provider is set
    pub fn from_config(
        config: &Config,
        shutdown: Arc<AtomicBool>,
        metrics: Metrics,
    ) -> LinkResult<Option<Self>> {
        match config.link.provider {
            Provider::None => Ok(None),
            Provider::Aws => {
                let ledger = Arc::new(FileLedger::open(&config.link.ledger_path)?);
                let backend = Arc::new(AwsCli::new(&config.aws.profile));
                let reconciler = RouteReconciler::new(backend, ledger, shutdown, metrics)
                    .with_delay(Duration::from_millis(config.scheduler.route_delay_ms))
                    .with_delete_routes(config.link.delete_routes);
                Ok(Some(Self::new(
                    reconciler,
                    Arc::new(Imds::default()),
                    config.aws.clone(),
                )))
            }
        }
    }

    /// The underlying reconciler
    pub fn reconciler(&self) -> &RouteReconciler {
        &self.reconciler
    }

    /// Reconcile cloud routes with `states`.
    ///
    /// Every network is attempted even if an earlier one fails; the first
    /// error is returned. An interrupt stops the pass immediately.
    pub fn advertise(&self, states: &[State]) -> LinkResult<()> {
        let desired = desired_networks(states);
        let mut first_err: Option<LinkError> = None;

        if !desired.is_empty() {
            let identity = resolve_identity(&self.overrides, self.metadata.as_ref())?;

            for network in &desired {
                if let Err(e) = self.reconciler.advertise(
                    &identity.region,
                    &identity.vpc_id,
                    network,
                    &identity.target,
                ) {
                    if e.is_interrupted() {
                        return Err(e);
                    }
                    tracing::warn!(network = %network, error = %e, "Failed to advertise route");
                    first_err.get_or_insert(e);
                }
            }
        }

        for record in self.reconciler.ledger().list()? {
            if desired.contains(&record.network) {
                continue;
            }
            tracing::info!(network = %record.network, "Withdrawing stale route");
            if let Err(e) = self.reconciler.withdraw(&record) {
                if e.is_interrupted() {
                    return Err(e);
                }
                tracing::warn!(network = %record.network, error = %e, "Failed to withdraw route");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Withdraw every ledger record. Returns how many were withdrawn.
    pub fn withdraw_all(&self) -> LinkResult<usize> {
        let records = self.reconciler.ledger().list()?;
        for record in &records {
            self.reconciler.withdraw(record)?;
        }
        Ok(records.len())
    }
}

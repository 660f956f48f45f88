//! Prometheus-compatible metrics

#[cfg(feature = "prometheus")]
use prometheus_client::{encoding::text::encode, metrics::counter::Counter, registry::Registry};

#[cfg(not(feature = "prometheus"))]
use std::sync::atomic::Ordering;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Full deploys that succeeded
    pub deploys: u64,
    /// Full deploys that failed
    pub deploy_failures: u64,
    /// Refresh-only passes that succeeded
    pub refreshes: u64,
    /// Refresh-only passes that failed
    pub refresh_failures: u64,
    /// Routes created in a cloud route table
    pub route_creates: u64,
    /// Routes replaced in a cloud route table
    pub route_replaces: u64,
    /// Route tables that already had the right route
    pub route_noops: u64,
    /// Ledger records withdrawn
    pub route_withdrawals: u64,
}

/// tunlink metrics collector
#[derive(Clone)]
pub struct Metrics {
    #[cfg(feature = "prometheus")]
    registry: Arc<Registry>,
    #[cfg(feature = "prometheus")]
    deploys: Counter<u64, AtomicU64>,
    #[cfg(feature = "prometheus")]
    deploy_failures: Counter<u64, AtomicU64>,
    #[cfg(feature = "prometheus")]
    refreshes: Counter<u64, AtomicU64>,
    #[cfg(feature = "prometheus")]
    refresh_failures: Counter<u64, AtomicU64>,
    #[cfg(feature = "prometheus")]
    route_creates: Counter<u64, AtomicU64>,
    #[cfg(feature = "prometheus")]
    route_replaces: Counter<u64, AtomicU64>,
    #[cfg(feature = "prometheus")]
    route_noops: Counter<u64, AtomicU64>,
    #[cfg(feature = "prometheus")]
    route_withdrawals: Counter<u64, AtomicU64>,

    #[cfg(not(feature = "prometheus"))]
    simple_counters: Arc<SimpleCounters>,
}

#[cfg(not(feature = "prometheus"))]
#[derive(Default)]
struct SimpleCounters {
    deploys: AtomicU64,
    deploy_failures: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    route_creates: AtomicU64,
    route_replaces: AtomicU64,
    route_noops: AtomicU64,
    route_withdrawals: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "prometheus")]
fn counter(registry: &mut Registry, name: &str, help: &str) -> Counter<u64, AtomicU64> {
    let counter = Counter::default();
    registry.register(name, help, counter.clone());
    counter
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        #[cfg(feature = "prometheus")]
        {
            let mut registry = Registry::with_prefix("tunlink");

            let deploys = counter(&mut registry, "deploys", "Successful full deploys");
            let deploy_failures =
                counter(&mut registry, "deploy_failures", "Failed full deploys");
            let refreshes = counter(&mut registry, "refreshes", "Successful refresh passes");
            let refresh_failures =
                counter(&mut registry, "refresh_failures", "Failed refresh passes");
            let route_creates =
                counter(&mut registry, "route_creates", "Cloud routes created");
            let route_replaces =
                counter(&mut registry, "route_replaces", "Cloud routes replaced");
            let route_noops = counter(
                &mut registry,
                "route_noops",
                "Route tables already pointing at this node",
            );
            let route_withdrawals =
                counter(&mut registry, "route_withdrawals", "Advertised routes withdrawn");

            Self {
                registry: Arc::new(registry),
                deploys,
                deploy_failures,
                refreshes,
                refresh_failures,
                route_creates,
                route_replaces,
                route_noops,
                route_withdrawals,
            }
        }

        #[cfg(not(feature = "prometheus"))]
        {
            Self {
                simple_counters: Arc::new(SimpleCounters::default()),
            }
        }
    }

    /// Record a finished full deploy
    pub fn record_deploy(&self, success: bool) {
        #[cfg(feature = "prometheus")]
        {
            if success {
                self.deploys.inc();
            } else {
                self.deploy_failures.inc();
            }
        }

        #[cfg(not(feature = "prometheus"))]
        {
            let c = &self.simple_counters;
            let counter = if success { &c.deploys } else { &c.deploy_failures };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a finished refresh pass
    pub fn record_refresh(&self, success: bool) {
        #[cfg(feature = "prometheus")]
        {
            if success {
                self.refreshes.inc();
            } else {
                self.refresh_failures.inc();
            }
        }

        #[cfg(not(feature = "prometheus"))]
        {
            let c = &self.simple_counters;
            let counter = if success { &c.refreshes } else { &c.refresh_failures };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a route created in a cloud route table
    pub fn record_route_create(&self) {
        #[cfg(feature = "prometheus")]
        self.route_creates.inc();

        #[cfg(not(feature = "prometheus"))]
        self.simple_counters
            .route_creates
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a route replaced in a cloud route table
    pub fn record_route_replace(&self) {
        #[cfg(feature = "prometheus")]
        self.route_replaces.inc();

        #[cfg(not(feature = "prometheus"))]
        self.simple_counters
            .route_replaces
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a route table that needed no change
    pub fn record_route_noop(&self) {
        #[cfg(feature = "prometheus")]
        self.route_noops.inc();

        #[cfg(not(feature = "prometheus"))]
        self.simple_counters
            .route_noops
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a withdrawn route
    pub fn record_route_withdrawal(&self) {
        #[cfg(feature = "prometheus")]
        self.route_withdrawals.inc();

        #[cfg(not(feature = "prometheus"))]
        self.simple_counters
            .route_withdrawals
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Copy out the current counter values
    pub fn snapshot(&self) -> MetricsSnapshot {
        #[cfg(feature = "prometheus")]
        {
            MetricsSnapshot {
                deploys: self.deploys.get(),
                deploy_failures: self.deploy_failures.get(),
                refreshes: self.refreshes.get(),
                refresh_failures: self.refresh_failures.get(),
                route_creates: self.route_creates.get(),
                route_replaces: self.route_replaces.get(),
                route_noops: self.route_noops.get(),
                route_withdrawals: self.route_withdrawals.get(),
            }
        }

        #[cfg(not(feature = "prometheus"))]
        {
            let c = &self.simple_counters;
            MetricsSnapshot {
                deploys: c.deploys.load(Ordering::Relaxed),
                deploy_failures: c.deploy_failures.load(Ordering::Relaxed),
                refreshes: c.refreshes.load(Ordering::Relaxed),
                refresh_failures: c.refresh_failures.load(Ordering::Relaxed),
                route_creates: c.route_creates.load(Ordering::Relaxed),
                route_replaces: c.route_replaces.load(Ordering::Relaxed),
                route_noops: c.route_noops.load(Ordering::Relaxed),
                route_withdrawals: c.route_withdrawals.load(Ordering::Relaxed),
            }
        }
    }

    /// Encode metrics in Prometheus text format
    #[cfg(feature = "prometheus")]
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Encode metrics in Prometheus text format
    #[cfg(not(feature = "prometheus"))]
    pub fn encode(&self) -> String {
        let s = self.snapshot();
        format!(
            "# tunlink metrics (prometheus disabled)\n\
             tunlink_deploys_total {}\n\
             tunlink_deploy_failures_total {}\n\
             tunlink_refreshes_total {}\n\
             tunlink_refresh_failures_total {}\n\
             tunlink_route_creates_total {}\n\
             tunlink_route_replaces_total {}\n\
             tunlink_route_noops_total {}\n\
             tunlink_route_withdrawals_total {}\n",
            s.deploys,
            s.deploy_failures,
            s.refreshes,
            s.refresh_failures,
            s.route_creates,
            s.route_replaces,
            s.route_noops,
            s.route_withdrawals,
        )
    }
}

//! Cloud Route Reconciler
//!
//! Makes every route table of a virtual network send one destination to one
//! target. Other writers may change a table between the snapshot and the
//! mutation, so each mutation falls back to its opposite once:
//!
//! ```text
//!   plan ──► Noop                      (already correct)
//!        ──► Create ──fail──► Replace ──fail──► TableFailure
//!        ──► Replace ──fail──► Create ──fail──► TableFailure
//! ```
//!
//! A failed table never stops the others.

use crate::cloud::{CloudRoute, Destination, RouteRequest, RouteTableBackend, RouteTarget};
use crate::error::{check_interrupt, LinkError, LinkResult, TableFailure};
use crate::ledger::{AdvertisedRoute, RouteLedger};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tunlink_metrics::Metrics;

/// Pause before every reconciliation call, so refresh passes over many
/// links cannot hammer the provider API
pub const DEFAULT_ROUTE_DELAY: Duration = Duration::from_millis(150);

/// What a table needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablePlan {
    /// The route exists and already points at the target
    Noop,
    /// No route for the destination
    Create,
    /// A route exists with some other target
    Replace,
}

/// Decide what a table needs from its current routes
pub fn plan_table(
    routes: &[CloudRoute],
    destination: &Destination,
    target: &RouteTarget,
) -> TablePlan {
    match routes.iter().find(|r| r.matches_destination(destination)) {
        None => TablePlan::Create,
        Some(route) if route.points_at(target) => TablePlan::Noop,
        Some(_) => TablePlan::Replace,
    }
}

/// A mutating route call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    /// CreateRoute
    Create,
    /// ReplaceRoute
    Replace,
}

impl RouteOp {
    /// The call to try when this one fails
    pub fn fallback(self) -> Self {
        match self {
            Self::Create => Self::Replace,
            Self::Replace => Self::Create,
        }
    }

    fn call(
        self,
        backend: &dyn RouteTableBackend,
        region: &str,
        request: &RouteRequest<'_>,
    ) -> LinkResult<()> {
        match self {
            Self::Create => backend.create_route(region, request),
            Self::Replace => backend.replace_route(region, request),
        }
    }
}

enum Attempt {
    Primary(RouteOp),
    Fallback { op: RouteOp, primary_error: String },
    Applied(RouteOp),
    Failed(TableFailure),
}

/// Run `first` against one table, falling back to the opposite call once.
///
/// Both calls use the same request, so an IPv6 destination stays in the IPv6
/// field on the fallback path too. Returns the call that stuck.
pub fn apply_with_fallback(
    backend: &dyn RouteTableBackend,
    region: &str,
    request: &RouteRequest<'_>,
    first: RouteOp,
) -> Result<RouteOp, TableFailure> {
    let mut attempt = Attempt::Primary(first);
    loop {
        attempt = match attempt {
            Attempt::Primary(op) => match op.call(backend, region, request) {
                Ok(()) => Attempt::Applied(op),
                Err(e) => {
                    tracing::debug!(
                        table = request.table_id,
                        network = %request.destination,
                        "{:?} failed, trying {:?}: {}",
                        op,
                        op.fallback(),
                        e
                    );
                    Attempt::Fallback {
                        op: op.fallback(),
                        primary_error: e.to_string(),
                    }
                }
            },
            Attempt::Fallback { op, primary_error } => match op.call(backend, region, request) {
                Ok(()) => Attempt::Applied(op),
                Err(e) => {
                    let fallback_error = e.to_string();
                    let (create_error, replace_error) = match op {
                        RouteOp::Replace => (primary_error, fallback_error),
                        RouteOp::Create => (fallback_error, primary_error),
                    };
                    Attempt::Failed(TableFailure {
                        table_id: request.table_id.to_string(),
                        create_error,
                        replace_error,
                    })
                }
            },
            Attempt::Applied(op) => return Ok(op),
            Attempt::Failed(failure) => return Err(failure),
        };
    }
}

/// Tables touched by one advertisement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertiseOutcome {
    /// Tables that got a new route
    pub created: Vec<String>,
    /// Tables whose route was repointed
    pub replaced: Vec<String>,
    /// Tables that were already correct
    pub unchanged: Vec<String>,
}

impl AdvertiseOutcome {
    /// Number of mutating calls that stuck
    pub fn mutations(&self) -> usize {
        self.created.len() + self.replaced.len()
    }
}

/// Reconciles one destination at a time against a virtual network
pub struct RouteReconciler {
    backend: Arc<dyn RouteTableBackend>,
    ledger: Arc<dyn RouteLedger>,
    shutdown: Arc<AtomicBool>,
    delay: Duration,
    delete_routes: bool,
    metrics: Metrics,
}

impl RouteReconciler {
    /// Create a reconciler with the default delay that keeps cloud routes on withdrawal
    pub fn new(
        backend: Arc<dyn RouteTableBackend>,
        ledger: Arc<dyn RouteLedger>,
        shutdown: Arc<AtomicBool>,
        metrics: Metrics,
    ) -> Self {
        Self {
            backend,
            ledger,
            shutdown,
            delay: DEFAULT_ROUTE_DELAY,
            delete_routes: false,
            metrics,
        }
    }

    /// Set the pre-call delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Delete cloud routes on withdrawal
    pub fn with_delete_routes(mut self, delete_routes: bool) -> Self {
        self.delete_routes = delete_routes;
        self
    }

    /// The ledger records are written to
    pub fn ledger(&self) -> &Arc<dyn RouteLedger> {
        &self.ledger
    }

    fn pause(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }

    /// Point `network` at `target` in every route table of `vpc_id`.
    ///
    /// On success the route is recorded in the ledger. If any table could not
    /// be reconciled, the others are still updated and the error lists only
    /// the failed tables; nothing is recorded in that case.
    pub fn advertise(
        &self,
        region: &str,
        vpc_id: &str,
        network: &str,
        target: &RouteTarget,
    ) -> LinkResult<AdvertiseOutcome> {
        self.pause();
        check_interrupt(&self.shutdown, "advertise")?;

        let destination = Destination::parse(network);
        let tables = self.backend.route_tables(region, vpc_id)?;

        let mut outcome = AdvertiseOutcome::default();
        let mut failures = Vec::new();

        for (table_id, routes) in &tables {
            let first = match plan_table(routes, &destination, target) {
                TablePlan::Noop => {
                    tracing::debug!(table = %table_id, network, "Route already present");
                    self.metrics.record_route_noop();
                    outcome.unchanged.push(table_id.clone());
                    continue;
                }
                TablePlan::Create => RouteOp::Create,
                TablePlan::Replace => RouteOp::Replace,
            };

            let request = RouteRequest {
                table_id,
                destination: &destination,
                target,
            };

            match apply_with_fallback(self.backend.as_ref(), region, &request, first) {
                Ok(RouteOp::Create) => {
                    tracing::info!(table = %table_id, network, %target, "Created route");
                    self.metrics.record_route_create();
                    outcome.created.push(table_id.clone());
                }
                Ok(RouteOp::Replace) => {
                    tracing::info!(table = %table_id, network, %target, "Replaced route");
                    self.metrics.record_route_replace();
                    outcome.replaced.push(table_id.clone());
                }
                Err(failure) => {
                    tracing::warn!(table = %table_id, network, "Failed to set route: {}", failure);
                    failures.push(failure);
                }
            }
        }

        if !failures.is_empty() {
            return Err(LinkError::RouteTables(failures));
        }

        self.ledger.add(&AdvertisedRoute {
            network: network.to_string(),
            region: region.to_string(),
            vpc_id: vpc_id.to_string(),
            target: target.clone(),
        })?;

        Ok(outcome)
    }

    /// Take a previously advertised route back out.
    ///
    /// Cloud routes are only deleted when delete-routes is enabled; the
    /// ledger record is removed either way. Individual delete failures are
    /// ignored since a route that is already gone is the desired result.
    pub fn withdraw(&self, record: &AdvertisedRoute) -> LinkResult<()> {
        if self.delete_routes {
            self.pause();
            check_interrupt(&self.shutdown, "advertise")?;

            let destination = Destination::parse(&record.network);
            let tables = self.backend.route_tables(&record.region, &record.vpc_id)?;

            for table_id in tables.keys() {
                if let Err(e) = self.backend.delete_route(&record.region, table_id, &destination) {
                    tracing::debug!(
                        table = %table_id,
                        network = %record.network,
                        "Route delete ignored: {}",
                        e
                    );
                }
            }
            tracing::info!(
                network = %record.network,
                tables = tables.len(),
                "Deleted advertised route"
            );
        }

        self.ledger.remove(record)?;
        self.metrics.record_route_withdrawal();
        Ok(())
    }
}

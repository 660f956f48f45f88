//! In-memory collaborators for unit tests

use crate::cloud::{
    CloudRoute, Destination, InstanceMetadata, MetadataProvider, RouteRequest, RouteTableBackend,
    RouteTableSnapshot, RouteTarget,
};
use crate::deployer::StateApplier;
use crate::error::{LinkError, LinkResult};
use crate::firewall::{Firewall, Rule};
use crate::host::NetworkSetup;
use crate::ipsec::DaemonController;
use crate::ledger::{AdvertisedRoute, RouteLedger};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tunlink_protocol::State;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    List { vpc_id: String },
    Create { table: String, destination: Destination, target: RouteTarget },
    Replace { table: String, destination: Destination, target: RouteTarget },
    Delete { table: String, destination: Destination },
}

impl BackendCall {
    pub fn destination(&self) -> &Destination {
        match self {
            Self::Create { destination, .. }
            | Self::Replace { destination, .. }
            | Self::Delete { destination, .. } => destination,
            Self::List { .. } => panic!("listing has no destination"),
        }
    }
}

/// Route tables held in memory. Create and replace both upsert unless a
/// failure was injected; delete of a missing route fails.
#[derive(Default)]
pub struct FakeBackend {
    tables: Mutex<BTreeMap<String, Vec<CloudRoute>>>,
    calls: Mutex<Vec<BackendCall>>,
    create_failures: Mutex<HashMap<String, String>>,
    replace_failures: Mutex<HashMap<String, String>>,
    network_failures: Mutex<HashSet<String>>,
    listing_failure: Mutex<Option<String>>,
}

fn route_for(destination: &Destination, target: &RouteTarget) -> CloudRoute {
    let mut route = CloudRoute::default();
    match destination {
        Destination::V4(n) => route.destination_cidr_block = Some(n.clone()),
        Destination::V6(n) => route.destination_ipv6_cidr_block = Some(n.clone()),
    }
    match target {
        RouteTarget::Instance(id) => route.instance_id = Some(id.clone()),
        RouteTarget::Interface(id) => route.network_interface_id = Some(id.clone()),
    }
    route
}

impl FakeBackend {
    pub fn with_tables(ids: &[&str]) -> Self {
        let backend = Self::default();
        {
            let mut tables = backend.tables.lock().unwrap();
            for id in ids {
                tables.insert(id.to_string(), Vec::new());
            }
        }
        backend
    }

    pub fn insert_route(&self, table: &str, network: &str, target: RouteTarget) {
        let route = route_for(&Destination::parse(network), &target);
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(route);
    }

    pub fn remove_route(&self, table: &str, network: &str) {
        let dest = Destination::parse(network);
        if let Some(routes) = self.tables.lock().unwrap().get_mut(table) {
            routes.retain(|r| !r.matches_destination(&dest));
        }
    }

    pub fn target_of(&self, table: &str, network: &str) -> Option<RouteTarget> {
        let dest = Destination::parse(network);
        let tables = self.tables.lock().unwrap();
        let route = tables.get(table)?.iter().find(|r| r.matches_destination(&dest))?;
        match (&route.network_interface_id, &route.instance_id) {
            (Some(id), _) => Some(RouteTarget::Interface(id.clone())),
            (None, Some(id)) => Some(RouteTarget::Instance(id.clone())),
            (None, None) => None,
        }
    }

    pub fn fail_create(&self, table: &str, msg: &str) {
        self.create_failures.lock().unwrap().insert(table.into(), msg.into());
    }

    pub fn fail_replace(&self, table: &str, msg: &str) {
        self.replace_failures.lock().unwrap().insert(table.into(), msg.into());
    }

    pub fn fail_network(&self, network: &str) {
        self.network_failures.lock().unwrap().insert(network.into());
    }

    pub fn fail_listing(&self, msg: &str) {
        *self.listing_failure.lock().unwrap() = Some(msg.into());
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mutations(&self) -> Vec<BackendCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, BackendCall::List { .. }))
            .collect()
    }

    fn injected(
        &self,
        failures: &Mutex<HashMap<String, String>>,
        request: &RouteRequest<'_>,
    ) -> Option<String> {
        if self
            .network_failures
            .lock()
            .unwrap()
            .contains(request.destination.network())
        {
            return Some("injected network failure".into());
        }
        failures.lock().unwrap().get(request.table_id).cloned()
    }

    fn upsert(&self, request: &RouteRequest<'_>) {
        let mut tables = self.tables.lock().unwrap();
        let routes = tables.entry(request.table_id.to_string()).or_default();
        routes.retain(|r| !r.matches_destination(request.destination));
        routes.push(route_for(request.destination, request.target));
    }
}

impl RouteTableBackend for FakeBackend {
    fn route_tables(&self, _region: &str, vpc_id: &str) -> LinkResult<RouteTableSnapshot> {
        self.calls.lock().unwrap().push(BackendCall::List {
            vpc_id: vpc_id.to_string(),
        });
        if let Some(msg) = self.listing_failure.lock().unwrap().clone() {
            return Err(LinkError::request("cloud: Failed to get VPC route tables", msg));
        }
        Ok(self.tables.lock().unwrap().clone())
    }

    fn create_route(&self, _region: &str, request: &RouteRequest<'_>) -> LinkResult<()> {
        self.calls.lock().unwrap().push(BackendCall::Create {
            table: request.table_id.to_string(),
            destination: request.destination.clone(),
            target: request.target.clone(),
        });
        if let Some(msg) = self.injected(&self.create_failures, request) {
            return Err(LinkError::request("cloud: Failed to create route", msg));
        }
        self.upsert(request);
        Ok(())
    }

    fn replace_route(&self, _region: &str, request: &RouteRequest<'_>) -> LinkResult<()> {
        self.calls.lock().unwrap().push(BackendCall::Replace {
            table: request.table_id.to_string(),
            destination: request.destination.clone(),
            target: request.target.clone(),
        });
        if let Some(msg) = self.injected(&self.replace_failures, request) {
            return Err(LinkError::request("cloud: Failed to replace route", msg));
        }
        self.upsert(request);
        Ok(())
    }

    fn delete_route(
        &self,
        _region: &str,
        table_id: &str,
        destination: &Destination,
    ) -> LinkResult<()> {
        self.calls.lock().unwrap().push(BackendCall::Delete {
            table: table_id.to_string(),
            destination: destination.clone(),
        });
        let mut tables = self.tables.lock().unwrap();
        let routes = tables.entry(table_id.to_string()).or_default();
        let before = routes.len();
        routes.retain(|r| !r.matches_destination(destination));
        if routes.len() == before {
            return Err(LinkError::request(
                "cloud: Failed to delete route",
                "InvalidRoute.NotFound",
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    routes: Mutex<BTreeMap<String, AdvertisedRoute>>,
}

impl RouteLedger for MemoryLedger {
    fn add(&self, record: &AdvertisedRoute) -> LinkResult<()> {
        self.routes
            .lock()
            .unwrap()
            .insert(record.network.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, record: &AdvertisedRoute) -> LinkResult<()> {
        self.routes.lock().unwrap().remove(&record.network);
        Ok(())
    }

    fn list(&self) -> LinkResult<Vec<AdvertisedRoute>> {
        Ok(self.routes.lock().unwrap().values().cloned().collect())
    }
}

pub struct StaticMetadata {
    pub data: InstanceMetadata,
    fail: bool,
}

impl Default for StaticMetadata {
    fn default() -> Self {
        Self {
            data: InstanceMetadata {
                region: "us-east-1".into(),
                instance_id: "i-0test".into(),
                mac_address: "0a:00:00:00:00:01".into(),
                vpc_id: "vpc-0test".into(),
            },
            fail: false,
        }
    }
}

impl StaticMetadata {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl MetadataProvider for StaticMetadata {
    fn instance_metadata(&self) -> LinkResult<InstanceMetadata> {
        if self.fail {
            return Err(LinkError::request("cloud: Failed to get AWS region", "unreachable"));
        }
        Ok(self.data.clone())
    }
}

#[derive(Default)]
pub struct FakeFirewall {
    rules: Mutex<Vec<Rule>>,
    clears: AtomicUsize,
}

impl FakeFirewall {
    pub fn rules(&self) -> Vec<Rule> {
        self.rules.lock().unwrap().clone()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl Firewall for FakeFirewall {
    fn upsert_rule(&self, rule: &Rule) -> LinkResult<()> {
        let mut rules = self.rules.lock().unwrap();
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    fn clear_all(&self) -> LinkResult<()> {
        self.rules.lock().unwrap().clear();
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeNetwork {
    inits: AtomicUsize,
}

impl FakeNetwork {
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }
}

impl NetworkSetup for FakeNetwork {
    fn init(&self) -> LinkResult<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDaemon {
    restarts: AtomicUsize,
    fail: AtomicBool,
}

impl FakeDaemon {
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl DaemonController for FakeDaemon {
    fn restart(&self) -> LinkResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LinkError::exec("ipsec: Failed to restart daemon", "exit status: 1"));
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplierCall {
    Deploy(Vec<State>),
    Refresh(Vec<State>),
}

type Hook = Box<dyn FnOnce() + Send>;

/// Records every call; deploys can be made to fail a number of times and a
/// one-shot hook can run inside the next deploy.
#[derive(Default)]
pub struct RecordingApplier {
    calls: Mutex<Vec<ApplierCall>>,
    deploy_failures: AtomicUsize,
    hook: Mutex<Option<Hook>>,
}

impl RecordingApplier {
    pub fn calls(&self) -> Vec<ApplierCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_deploys(&self, count: usize) {
        self.deploy_failures.store(count, Ordering::SeqCst);
    }

    pub fn on_deploy<F: FnOnce() + Send + 'static>(&self, hook: F) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

impl StateApplier for RecordingApplier {
    fn deploy(&self, states: &[State]) -> LinkResult<()> {
        self.calls.lock().unwrap().push(ApplierCall::Deploy(states.to_vec()));

        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }

        let remaining = self.deploy_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.deploy_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LinkError::exec("ipsec: Failed to restart daemon", "exit status: 1"));
        }
        Ok(())
    }

    fn refresh(&self, states: &[State]) -> LinkResult<()> {
        self.calls.lock().unwrap().push(ApplierCall::Refresh(states.to_vec()));
        Ok(())
    }
}

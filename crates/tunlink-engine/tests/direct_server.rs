//! End-to-end deploy of a direct-server state through the scheduler

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tunlink_engine::cloud::{RouteRequest, RouteTableSnapshot};
use tunlink_engine::firewall::Rule;
use tunlink_engine::{
    CloudRoute, DaemonController, Destination, FileLedger, Firewall, HostAddresses,
    InstanceMetadata, IpsecConfigWriter, LinkDeployer, LinkResult, LinkScheduler,
    MetadataProvider, NetworkSetup, RouteAdvertiser, RouteLedger, RouteReconciler,
    RouteTableBackend, RouteTarget, SchedulerConfig, TickOutcome,
};
use tunlink_metrics::Metrics;
use tunlink_protocol::{AwsSection, Link, State, StateType};

#[derive(Default)]
struct Tables {
    tables: Mutex<BTreeMap<String, Vec<CloudRoute>>>,
    creates: AtomicUsize,
    replaces: AtomicUsize,
}

impl RouteTableBackend for Tables {
    fn route_tables(&self, _region: &str, _vpc_id: &str) -> LinkResult<RouteTableSnapshot> {
        Ok(self.tables.lock().unwrap().clone())
    }

    fn create_route(&self, _region: &str, request: &RouteRequest<'_>) -> LinkResult<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut route = CloudRoute::default();
        match request.destination {
            Destination::V4(n) => route.destination_cidr_block = Some(n.clone()),
            Destination::V6(n) => route.destination_ipv6_cidr_block = Some(n.clone()),
        }
        match request.target {
            RouteTarget::Instance(id) => route.instance_id = Some(id.clone()),
            RouteTarget::Interface(id) => route.network_interface_id = Some(id.clone()),
        }
        self.tables
            .lock()
            .unwrap()
            .entry(request.table_id.to_string())
            .or_default()
            .push(route);
        Ok(())
    }

    fn replace_route(&self, _region: &str, _request: &RouteRequest<'_>) -> LinkResult<()> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_route(
        &self,
        _region: &str,
        _table_id: &str,
        _destination: &Destination,
    ) -> LinkResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Host {
    rules: Mutex<Vec<Rule>>,
    inits: AtomicUsize,
    restarts: AtomicUsize,
}

impl Firewall for Host {
    fn upsert_rule(&self, rule: &Rule) -> LinkResult<()> {
        let mut rules = self.rules.lock().unwrap();
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    fn clear_all(&self) -> LinkResult<()> {
        self.rules.lock().unwrap().clear();
        Ok(())
    }
}

impl NetworkSetup for Host {
    fn init(&self) -> LinkResult<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl DaemonController for Host {
    fn restart(&self) -> LinkResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct NoMetadata;

impl MetadataProvider for NoMetadata {
    fn instance_metadata(&self) -> LinkResult<InstanceMetadata> {
        panic!("static identity must not query metadata");
    }
}

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tunlink-scenario-test-{}", name));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_direct_server_scenario() {
    let dir = test_dir("direct-server");
    let shutdown = Arc::new(AtomicBool::new(false));
    let metrics = Metrics::new();

    let backend = Arc::new(Tables::default());
    for id in ["rtb-a", "rtb-b", "rtb-c"] {
        backend.tables.lock().unwrap().insert(id.to_string(), Vec::new());
    }
    let host = Arc::new(Host::default());
    let ledger = Arc::new(FileLedger::open(dir.join("routes.json")).unwrap());

    let overrides = AwsSection {
        region: "us-east-1".into(),
        vpc_id: "vpc-1".into(),
        interface_id: "eni-gw".into(),
        ..Default::default()
    };
    let reconciler =
        RouteReconciler::new(backend.clone(), ledger.clone(), shutdown.clone(), metrics.clone())
            .with_delay(Duration::ZERO);
    let advertiser = RouteAdvertiser::new(reconciler, Arc::new(NoMetadata), overrides);

    let deployer = LinkDeployer::new(
        host.clone(),
        host.clone(),
        IpsecConfigWriter::new(
            dir.join("ipsec.d"),
            dir.join("ipsec.conf"),
            dir.join("ipsec.secrets"),
        ),
        host.clone(),
        HostAddresses {
            public_address: Some("203.0.113.10".into()),
            local_address: Some("10.0.0.5".into()),
            address6: None,
            default_interface: Some("eth0".into()),
        },
        shutdown.clone(),
    )
    .with_advertiser(advertiser);

    let scheduler = LinkScheduler::new(
        Arc::new(deployer),
        SchedulerConfig {
            deploy_poll: Duration::from_millis(1),
            retry_backoff: Duration::ZERO,
            refresh_tick: Duration::from_millis(1),
            advertise_rate: 30,
            advertise_replay: 3,
        },
        shutdown,
        metrics.clone(),
    );

    let states = vec![State::new("gw", StateType::DirectServer).with_link(Link {
        left: "203.0.113.10".into(),
        right: "198.51.100.7".into(),
        left_subnets: vec!["10.0.0.0/24".into()],
        right_subnets: vec!["10.1.0.0/24".into()],
        pre_shared_key: "psk".into(),
    })];

    scheduler.submit(states);
    assert_eq!(scheduler.deploy_tick(), TickOutcome::Deployed);
    assert_eq!(scheduler.deploy_tick(), TickOutcome::Idle);

    // one render
    let conf = std::fs::read_to_string(dir.join("ipsec.d").join("gw.conf")).unwrap();
    assert_eq!(conf.matches("conn ").count(), 1);
    assert!(conf.contains("conn gw-0"));
    let secrets = std::fs::read_to_string(dir.join("ipsec.secrets")).unwrap();
    assert_eq!(secrets.lines().count(), 1);

    // one firewall rule set, one restart
    assert_eq!(host.rules.lock().unwrap().len(), 8);
    assert_eq!(host.inits.load(Ordering::SeqCst), 1);
    assert_eq!(host.restarts.load(Ordering::SeqCst), 1);

    // one create per table, pointed at the interface
    assert_eq!(backend.creates.load(Ordering::SeqCst), 3);
    assert_eq!(backend.replaces.load(Ordering::SeqCst), 0);
    for routes in backend.tables.lock().unwrap().values() {
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].network_interface_id.as_deref(), Some("eni-gw"));
    }

    // ledger survives reopen
    let records = FileLedger::open(dir.join("routes.json")).unwrap().list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].network, "10.1.0.0/24");
    assert_eq!(records[0].target, RouteTarget::Interface("eni-gw".into()));

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.deploys, 1);
    assert_eq!(snapshot.route_creates, 3);

    // the refresh pass after the replay countdown finds nothing to change
    while !scheduler.refresh_tick() {}
    assert_eq!(backend.creates.load(Ordering::SeqCst), 3);
    assert_eq!(metrics.snapshot().route_noops, 3);

    let _ = std::fs::remove_dir_all(&dir);
}

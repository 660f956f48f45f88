//! Link Deploy Scheduler
//!
//! Two loops share one [`LinkScheduler`]:
//!
//! - the **deploy loop** polls for a submitted state set, promotes it to
//!   current and deploys it, retrying failures after a backoff for as long
//!   as nothing newer has been submitted;
//! - the **refresh loop** counts down once a second and, at zero, re-runs
//!   route advertisement for the current set.
//!
//! Submissions overwrite each other: only the newest set that is pending
//! when the deploy loop looks is ever deployed. Locks are held only to copy
//! state in or out, never across a deploy or refresh.

use crate::deployer::StateApplier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tunlink_metrics::Metrics;
use tunlink_protocol::{SchedulerSection, State};

/// Loop timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Sleep between deploy loop iterations
    pub deploy_poll: Duration,
    /// Wait after a failed deploy before re-staging it
    pub retry_backoff: Duration,
    /// Length of one refresh countdown tick
    pub refresh_tick: Duration,
    /// Ticks between refresh passes
    pub advertise_rate: u64,
    /// Ticks until the first refresh after a successful deploy
    pub advertise_replay: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SchedulerSection::default())
    }
}

impl From<&SchedulerSection> for SchedulerConfig {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            deploy_poll: Duration::from_millis(section.deploy_poll_ms),
            retry_backoff: Duration::from_millis(section.retry_backoff_ms),
            refresh_tick: Duration::from_secs(1),
            advertise_rate: section.update_advertise_rate_secs,
            advertise_replay: section.update_advertise_replay_secs,
        }
    }
}

#[derive(Debug, Default)]
struct DeployState {
    pending: Option<Vec<State>>,
    current: Option<Vec<State>>,
    refresh_requested: bool,
}

/// What one deploy loop iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do
    Idle,
    /// A full deploy succeeded
    Deployed,
    /// A requested refresh pass ran (successfully or not)
    Refreshed,
    /// A full deploy failed and was re-staged
    Retrying,
    /// A full deploy failed but a newer set superseded it
    Superseded,
}

/// Coalescing deploy scheduler
pub struct LinkScheduler {
    state: Mutex<DeployState>,
    countdown: Mutex<u64>,
    applier: Arc<dyn StateApplier>,
    config: SchedulerConfig,
    shutdown: Arc<AtomicBool>,
    metrics: Metrics,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LinkScheduler {
    /// Create a scheduler. No loops run until [`LinkScheduler::start`].
    pub fn new(
        applier: Arc<dyn StateApplier>,
        config: SchedulerConfig,
        shutdown: Arc<AtomicBool>,
        metrics: Metrics,
    ) -> Self {
        Self {
            state: Mutex::new(DeployState::default()),
            countdown: Mutex::new(config.advertise_rate),
            applier,
            config,
            shutdown,
            metrics,
        }
    }

    /// Replace whatever is pending with `states`
    pub fn submit(&self, states: Vec<State>) {
        lock(&self.state).pending = Some(states);
    }

    /// Redeploy the current set unless something newer is already pending
    pub fn nudge(&self) {
        let mut state = lock(&self.state);
        if state.pending.is_none() {
            state.pending = state.current.clone();
        }
    }

    /// Ask the deploy loop for a refresh pass over the current set
    pub fn request_refresh(&self) {
        lock(&self.state).refresh_requested = true;
    }

    /// The set most recently taken up for deployment
    pub fn current_states(&self) -> Option<Vec<State>> {
        lock(&self.state).current.clone()
    }

    /// Returns true if a set is waiting for the deploy loop
    pub fn has_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    /// Ticks left until the next refresh pass
    pub fn refresh_countdown(&self) -> u64 {
        *lock(&self.countdown)
    }

    /// One deploy loop iteration, without the poll sleep
    pub fn deploy_tick(&self) -> TickOutcome {
        let (states, full) = {
            let mut state = lock(&self.state);
            if let Some(pending) = state.pending.take() {
                state.current = Some(pending.clone());
                state.refresh_requested = false;
                (pending, true)
            } else if state.refresh_requested {
                state.refresh_requested = false;
                match state.current.clone() {
                    Some(current) => (current, false),
                    None => return TickOutcome::Idle,
                }
            } else {
                return TickOutcome::Idle;
            }
        };

        if !full {
            let result = self.applier.refresh(&states);
            self.metrics.record_refresh(result.is_ok());
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to refresh link state");
            }
            return TickOutcome::Refreshed;
        }

        match self.applier.deploy(&states) {
            Ok(()) => {
                self.metrics.record_deploy(true);
                *lock(&self.countdown) = self.config.advertise_replay;
                TickOutcome::Deployed
            }
            Err(e) => {
                self.metrics.record_deploy(false);
                tracing::error!(error = %e, "Failed to deploy link state");

                if !self.shutdown.load(Ordering::Relaxed) {
                    std::thread::sleep(self.config.retry_backoff);
                }

                let mut state = lock(&self.state);
                if state.pending.is_none() {
                    state.pending = Some(states);
                    TickOutcome::Retrying
                } else {
                    TickOutcome::Superseded
                }
            }
        }
    }

    /// One refresh loop tick, without the tick sleep. Returns true if a
    /// refresh pass ran.
    pub fn refresh_tick(&self) -> bool {
        {
            let mut countdown = lock(&self.countdown);
            if *countdown > 1 {
                *countdown -= 1;
                return false;
            }
            *countdown = self.config.advertise_rate;
        }

        let states = match self.current_states() {
            Some(states) if !states.is_empty() => states,
            _ => return false,
        };

        let result = self.applier.refresh(&states);
        self.metrics.record_refresh(result.is_ok());
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to update advertisement");
        }
        true
    }

    /// Start the deploy and refresh loops. They exit once the shutdown flag
    /// is set.
    pub fn start(self: &Arc<Self>) -> std::io::Result<SchedulerHandle> {
        let deployer = Arc::clone(self);
        let deploy = std::thread::Builder::new()
            .name("tunlink-deploy".into())
            .spawn(move || {
                tracing::debug!("Deploy loop started");
                while !deployer.shutdown.load(Ordering::Relaxed) {
                    deployer.deploy_tick();
                    std::thread::sleep(deployer.config.deploy_poll);
                }
                tracing::debug!("Deploy loop stopped");
            })?;

        let refresher = Arc::clone(self);
        let refresh = std::thread::Builder::new()
            .name("tunlink-refresh".into())
            .spawn(move || {
                tracing::debug!("Refresh loop started");
                while !refresher.shutdown.load(Ordering::Relaxed) {
                    std::thread::sleep(refresher.config.refresh_tick);
                    if refresher.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    refresher.refresh_tick();
                }
                tracing::debug!("Refresh loop stopped");
            })?;

        Ok(SchedulerHandle {
            threads: vec![deploy, refresh],
        })
    }
}

/// Running scheduler loops
pub struct SchedulerHandle {
    threads: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Wait for both loops to exit
    pub fn join(self) {
        for thread in self.threads {
            if thread.join().is_err() {
                tracing::error!("Scheduler thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ApplierCall, RecordingApplier};
    use tunlink_protocol::{Link, StateType};

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            deploy_poll: Duration::from_millis(1),
            retry_backoff: Duration::ZERO,
            refresh_tick: Duration::from_millis(1),
            advertise_rate: 30,
            advertise_replay: 3,
        }
    }

    fn set(id: &str) -> Vec<State> {
        vec![State::new(id, StateType::Standard).with_link(Link {
            right_subnets: vec!["10.1.0.0/24".into()],
            ..Default::default()
        })]
    }

    fn scheduler(applier: &Arc<RecordingApplier>) -> LinkScheduler {
        LinkScheduler::new(
            applier.clone(),
            config(),
            Arc::new(AtomicBool::new(false)),
            Metrics::new(),
        )
    }

    #[test]
    fn test_idle_without_submission() {
        let applier = Arc::new(RecordingApplier::default());
        let sched = scheduler(&applier);
        assert_eq!(sched.deploy_tick(), TickOutcome::Idle);
        assert!(applier.calls().is_empty());
    }

    #[test]
    fn test_submissions_coalesce() {
        let applier = Arc::new(RecordingApplier::default());
        let sched = scheduler(&applier);

        sched.submit(set("a"));
        sched.submit(set("b"));

        assert_eq!(sched.deploy_tick(), TickOutcome::Deployed);
        assert_eq!(sched.deploy_tick(), TickOutcome::Idle);
        assert_eq!(applier.calls(), vec![ApplierCall::Deploy(set("b"))]);
        assert_eq!(sched.current_states(), Some(set("b")));
    }

    #[test]
    fn test_failed_deploy_retries_same_set() {
        let applier = Arc::new(RecordingApplier::default());
        applier.fail_deploys(1);
        let sched = scheduler(&applier);

        sched.submit(set("a"));
        assert_eq!(sched.deploy_tick(), TickOutcome::Retrying);
        assert!(sched.has_pending());
        assert_eq!(sched.deploy_tick(), TickOutcome::Deployed);

        assert_eq!(
            applier.calls(),
            vec![ApplierCall::Deploy(set("a")), ApplierCall::Deploy(set("a"))]
        );
        assert_eq!(sched.metrics.snapshot().deploy_failures, 1);
        assert_eq!(sched.metrics.snapshot().deploys, 1);
    }

    #[test]
    fn test_newer_submission_supersedes_retry() {
        let applier = Arc::new(RecordingApplier::default());
        applier.fail_deploys(1);
        let sched = Arc::new(scheduler(&applier));

        // Submit during the failing deploy, before it re-stages
        let hook = Arc::clone(&sched);
        applier.on_deploy(move || hook.submit(set("b")));

        sched.submit(set("a"));
        assert_eq!(sched.deploy_tick(), TickOutcome::Superseded);
        assert_eq!(sched.deploy_tick(), TickOutcome::Deployed);

        assert_eq!(
            applier.calls(),
            vec![ApplierCall::Deploy(set("a")), ApplierCall::Deploy(set("b"))]
        );
    }

    #[test]
    fn test_success_shortens_countdown() {
        let applier = Arc::new(RecordingApplier::default());
        let sched = scheduler(&applier);
        assert_eq!(sched.refresh_countdown(), 30);

        sched.submit(set("a"));
        sched.deploy_tick();
        assert_eq!(sched.refresh_countdown(), 3);
    }

    #[test]
    fn test_refresh_after_countdown() {
        let applier = Arc::new(RecordingApplier::default());
        let sched = scheduler(&applier);
        sched.submit(set("a"));
        sched.deploy_tick();

        assert!(!sched.refresh_tick());
        assert!(!sched.refresh_tick());
        assert!(sched.refresh_tick());
        assert_eq!(sched.refresh_countdown(), 30);

        assert_eq!(
            applier.calls(),
            vec![ApplierCall::Deploy(set("a")), ApplierCall::Refresh(set("a"))]
        );
    }

    #[test]
    fn test_refresh_without_current_does_nothing() {
        let applier = Arc::new(RecordingApplier::default());
        let mut cfg = config();
        cfg.advertise_rate = 1;
        let sched = LinkScheduler::new(
            applier.clone(),
            cfg,
            Arc::new(AtomicBool::new(false)),
            Metrics::new(),
        );

        assert!(!sched.refresh_tick());
        assert!(applier.calls().is_empty());
    }

    #[test]
    fn test_nudge_restages_current() {
        let applier = Arc::new(RecordingApplier::default());
        let sched = scheduler(&applier);

        sched.nudge();
        assert!(!sched.has_pending());

        sched.submit(set("a"));
        sched.deploy_tick();
        sched.nudge();
        assert_eq!(sched.deploy_tick(), TickOutcome::Deployed);
        assert_eq!(applier.calls().len(), 2);
    }

    #[test]
    fn test_requested_refresh_runs_in_deploy_loop() {
        let applier = Arc::new(RecordingApplier::default());
        let sched = scheduler(&applier);
        sched.submit(set("a"));
        sched.deploy_tick();

        sched.request_refresh();
        assert_eq!(sched.deploy_tick(), TickOutcome::Refreshed);
        assert_eq!(applier.calls()[1], ApplierCall::Refresh(set("a")));
    }

    #[test]
    fn test_loops_stop_on_shutdown() {
        let applier = Arc::new(RecordingApplier::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let sched = Arc::new(LinkScheduler::new(
            applier.clone(),
            config(),
            shutdown.clone(),
            Metrics::new(),
        ));

        let handle = sched.start().unwrap();
        sched.submit(set("a"));
        for _ in 0..500 {
            if !applier.calls().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        shutdown.store(true, Ordering::Relaxed);
        handle.join();

        assert_eq!(applier.calls()[0], ApplierCall::Deploy(set("a")));
    }
}

//! tunlink CLI — link state reconciliation daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tunlink_engine::ipsec::render_states;
use tunlink_engine::{
    FileLedger, HostAddresses, LinkDeployer, LinkScheduler, RouteAdvertiser, RouteLedger,
    SchedulerConfig,
};
use tunlink_metrics::{init_logging, LogConfig, Metrics};
use tunlink_protocol::{has_direct_client, Config, State};

const DEFAULT_CONFIG: &str = "/etc/tunlink.toml";

/// tunlink — keeps IPsec links and cloud routes in line with desired state
#[derive(Parser)]
#[command(name = "tunlink")]
#[command(version)]
#[command(about = "Link state reconciliation daemon", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the deploy and refresh loops
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Desired state file (JSON array of states). Touching it without
        /// changing it re-advertises routes.
        #[arg(short, long)]
        states: PathBuf,

        /// Write Prometheus metrics to this file every second
        #[arg(long)]
        metrics_textfile: Option<PathBuf>,
    },

    /// Validate configuration and, optionally, a state file
    Check {
        /// Configuration file path
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Desired state file
        #[arg(short, long)]
        states: Option<PathBuf>,
    },

    /// Print the IPsec configuration a state file would produce
    Render {
        /// Configuration file path
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Desired state file
        #[arg(short, long)]
        states: PathBuf,
    },

    /// List routes recorded in the ledger
    Routes {
        /// Configuration file path
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Withdraw every route recorded in the ledger
    CleanRoutes {
        /// Configuration file path
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig::from_verbosity(cli.verbose))
        .context("Failed to initialize logging")?;

    match cli.command {
        Commands::Start {
            config,
            states,
            metrics_textfile,
        } => cmd_start(&config, &states, metrics_textfile.as_deref()),
        Commands::Check { config, states } => cmd_check(&config, states.as_deref()),
        Commands::Render { config, states } => cmd_render(&config, &states),
        Commands::Routes { config, json } => cmd_routes(&config, json),
        Commands::CleanRoutes { config } => cmd_clean_routes(&config),
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn load_states(path: &Path) -> Result<Vec<State>> {
    State::list_from_file(path).with_context(|| format!("Failed to load states {}", path.display()))
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn write_textfile(path: &Path, metrics: &Metrics) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, metrics.encode())?;
    std::fs::rename(&tmp, path)
}

/// Hand a freshly loaded states file to the scheduler. A file that was only
/// touched requests a route refresh instead of a redeploy. Returns true if
/// the states were submitted.
fn offer_states(scheduler: &LinkScheduler, states: Vec<State>) -> bool {
    if scheduler.current_states().as_ref() == Some(&states) && !scheduler.has_pending() {
        tracing::info!("States unchanged, requesting route refresh");
        scheduler.request_refresh();
        return false;
    }
    scheduler.submit(states);
    true
}

/// Run the engine until interrupted
fn cmd_start(
    config_path: &Path,
    states_path: &Path,
    metrics_textfile: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Received shutdown signal");
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Failed to set Ctrl+C handler")?;

    let metrics = Metrics::new();
    let deployer = LinkDeployer::from_config(&config, shutdown.clone(), metrics.clone())
        .context("Failed to build deployer")?;

    let host = deployer.host();
    tracing::info!(
        public_address = host.public_address.as_deref().unwrap_or(""),
        local_address = host.local_address.as_deref().unwrap_or(""),
        default_interface = host.default_interface.as_deref().unwrap_or(""),
        provider = ?config.link.provider,
        "Starting tunlink"
    );

    let scheduler = Arc::new(LinkScheduler::new(
        Arc::new(deployer),
        SchedulerConfig::from(&config.scheduler),
        shutdown.clone(),
        metrics.clone(),
    ));
    let handle = scheduler.start().context("Failed to start scheduler")?;

    let mut last_modified: Option<SystemTime> = None;
    while !shutdown.load(Ordering::Relaxed) {
        let current = modified(states_path);
        if current.is_some() && current != last_modified {
            last_modified = current;
            match State::list_from_file(states_path) {
                Ok(states) => {
                    let at = current.map(chrono::DateTime::<chrono::Utc>::from);
                    let modified = at.map(|t| t.to_rfc3339()).unwrap_or_default();
                    tracing::info!(
                        states = states.len(),
                        modified = %modified,
                        "States file changed"
                    );
                    offer_states(&scheduler, states);
                }
                Err(e) => tracing::warn!("Failed to load states {}: {}", states_path.display(), e),
            }
        }

        if let Some(path) = metrics_textfile {
            if let Err(e) = write_textfile(path, &metrics) {
                tracing::warn!("Failed to write metrics to {}: {}", path.display(), e);
            }
        }

        std::thread::sleep(Duration::from_secs(1));
    }

    handle.join();
    tracing::info!("tunlink stopped");
    Ok(())
}

/// Validate files
fn cmd_check(config_path: &Path, states_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;

    println!("✓ Configuration is valid");
    println!();
    println!("Summary:");
    println!("  Provider: {:?}", config.link.provider);
    println!("  IPsec dir: {}", config.link.ipsec_dir);
    println!("  Ledger: {}", config.link.ledger_path);
    println!("  Delete routes: {}", config.link.delete_routes);
    println!("  Static identity: {}", config.aws.is_complete());

    if let Some(path) = states_path {
        let states = load_states(path)?;
        let links: usize = states.iter().map(|s| s.links.len()).sum();
        println!();
        println!("✓ States are valid");
        println!("  States: {}", states.len());
        println!("  Links: {}", links);
        println!("  NAT states: {}", states.iter().filter(|s| s.requires_nat()).count());
        println!("  Direct client: {}", has_direct_client(&states));
    }

    Ok(())
}

/// Print rendered IPsec config without touching the system
fn cmd_render(config_path: &Path, states_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let states = load_states(states_path)?;

    let host = HostAddresses::from_section(&config.host);
    let public = host
        .public_address
        .context("host.public_address is required to render configuration")?;

    let rendered = render_states(&states, &public).context("Failed to render configuration")?;

    for (id, conf) in &rendered.confs {
        println!("# {}/{}.conf", config.link.ipsec_dir, id);
        print!("{}", conf);
    }
    println!("# {}", config.link.ipsec_secrets_path);
    print!("{}", rendered.secrets);
    Ok(())
}

/// List ledger records
fn cmd_routes(config_path: &Path, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let ledger = FileLedger::open(&config.link.ledger_path).context("Failed to open ledger")?;
    let routes = ledger.list().context("Failed to read ledger")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&routes)?);
        return Ok(());
    }

    if routes.is_empty() {
        println!("No advertised routes");
        return Ok(());
    }
    for route in &routes {
        println!(
            "{:<24} {:<14} {:<24} {}",
            route.network, route.region, route.vpc_id, route.target
        );
    }
    Ok(())
}

/// Withdraw every ledger record
fn cmd_clean_routes(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let shutdown = Arc::new(AtomicBool::new(false));

    let advertiser = RouteAdvertiser::from_config(&config, shutdown, Metrics::new())
        .context("Failed to build advertiser")?
        .context("No cloud provider configured")?;

    let count = advertiser.withdraw_all().context("Failed to withdraw routes")?;
    if config.link.delete_routes {
        println!("Withdrew {} route(s)", count);
    } else {
        println!(
            "Cleared {} ledger record(s); cloud routes kept (link.delete_routes = false)",
            count
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunlink_engine::{LinkResult, StateApplier};
    use tunlink_protocol::StateType;

    struct Noop;

    impl StateApplier for Noop {
        fn deploy(&self, _states: &[State]) -> LinkResult<()> {
            Ok(())
        }

        fn refresh(&self, _states: &[State]) -> LinkResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_offer_states_refreshes_unchanged_file() {
        let scheduler = LinkScheduler::new(
            Arc::new(Noop),
            SchedulerConfig::default(),
            Arc::new(AtomicBool::new(false)),
            Metrics::new(),
        );
        let states = vec![State::new("s1", StateType::Standard)];

        assert!(offer_states(&scheduler, states.clone()));
        scheduler.deploy_tick();

        assert!(!offer_states(&scheduler, states));
        assert!(!scheduler.has_pending());
        assert_eq!(scheduler.deploy_tick(), tunlink_engine::TickOutcome::Refreshed);

        assert!(offer_states(&scheduler, vec![State::new("s2", StateType::Standard)]));
        assert!(scheduler.has_pending());
    }
}

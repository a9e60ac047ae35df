//! `spm-node`: the binary entry point for every role this crate plays —
//! Monitor (spawning and supervising the configured component tree) and,
//! re-exec'd as a single-component child process, a Translator/Scheduler/
//! Drift-Corrected Scheduler itself.
//!
//! Parses the CLI, initializes tracing, loads config, and dispatches on
//! the subcommand.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spm_coordinator::cli::{Cli, Commands};
use spm_coordinator::component::{ComponentDescriptor, ComponentKind, DependencyGraph};
use spm_coordinator::drift::{DriftOracle, DriftScheduler, DriftSchedulerConfig};
use spm_coordinator::error::{Result, SpmError};
use spm_coordinator::heartbeat::{heartbeat_addr, Heartbeater};
use spm_coordinator::messages::{DriftSnapshot, Scan2D};
use spm_coordinator::monitor::ComponentMonitor;
use spm_coordinator::scheduler::Scheduler;
use spm_coordinator::config::Settings;
use spm_coordinator::transport::cache::CacheCapacity;
use spm_coordinator::tracing_setup::{init, OutputFormat, TracingConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        tracing::error!(error = %err, "spm-node exited with an error");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::SpawnAll { config, include, exclude } => {
            let settings = Settings::load_from(&config)?;
            init_tracing(&cli.log_level, cli.log_json, &settings);
            spawn_all(settings, config, include, exclude).await
        }
        Commands::SpawnSingle { config, name } => {
            let settings = Settings::load_from(&config)?;
            init_tracing(&cli.log_level, cli.log_json, &settings);
            spawn_single(settings, config, name).await
        }
        Commands::RunComponent { name, config } => {
            let settings = Settings::load_from(&config)?;
            init_tracing(&cli.log_level, cli.log_json, &settings);
            run_component(&name, &settings).await
        }
    }
}

fn init_tracing(log_level: &Option<String>, log_json: bool, settings: &Settings) {
    let mut tracing_config =
        TracingConfig::from_settings(settings).unwrap_or_else(|_| TracingConfig::default());
    if let Some(level) = log_level {
        if let Ok(level) = spm_coordinator::tracing_setup::parse_log_level(level) {
            tracing_config = tracing_config.with_level(level);
        }
    }
    if log_json {
        tracing_config = tracing_config.with_format(OutputFormat::Json);
    }
    if init(tracing_config).is_err() {
        eprintln!("warning: failed to initialize tracing, continuing without structured logs");
    }
}

async fn spawn_all(
    settings: Settings,
    config_path: PathBuf,
    include: Vec<String>,
    exclude: Vec<String>,
) -> Result<()> {
    let binary = std::env::current_exe().map_err(SpmError::TransportIo)?;
    let graph = DependencyGraph::from_descriptors(&settings.components);

    let descriptors: Vec<ComponentDescriptor> = settings
        .components
        .iter()
        .filter(|d| include.is_empty() || include.contains(&d.name))
        .filter(|d| !exclude.contains(&d.name))
        .cloned()
        .collect();

    for descriptor in &descriptors {
        tracing::info!(
            component = %descriptor.name,
            depends_on = ?descriptor.depends_on(),
            dependents = ?graph.get_dependents(&descriptor.name),
            "scheduling component for startup"
        );
    }

    let mut monitor =
        ComponentMonitor::new(binary, config_path, Duration::from_millis(settings.timing.monitor_loop_sleep_ms));
    monitor.startup(descriptors).await?;
    monitor.run().await
}

async fn spawn_single(settings: Settings, config_path: PathBuf, name: String) -> Result<()> {
    let descriptor = settings
        .component(&name)
        .cloned()
        .ok_or_else(|| SpmError::ConfigurationError(format!("no such component: {name}")))?;

    tracing::info!(
        component = %descriptor.name,
        depends_on = ?descriptor.depends_on(),
        "spawning single component; dependencies are reported, not started"
    );

    let binary = std::env::current_exe().map_err(SpmError::TransportIo)?;
    let mut monitor =
        ComponentMonitor::new(binary, config_path, Duration::from_millis(settings.timing.monitor_loop_sleep_ms));
    monitor.startup(vec![descriptor]).await?;
    monitor.run().await
}

/// Placeholder drift oracle used when `run-component` starts a
/// `DriftScheduler` descriptor. The actual image-registration routine is
/// outside this crate's scope; a real deployment supplies its own
/// [`DriftOracle`] by embedding [`spm_coordinator`] as a library instead of
/// running this binary's `run-component` path for drift-scheduler
/// descriptors.
struct NullDriftOracle;

#[async_trait::async_trait]
impl DriftOracle for NullDriftOracle {
    async fn estimate_drift(
        &self,
        _scan_a: &Scan2D,
        _scan_b: &Scan2D,
        _max_fit_score: f64,
    ) -> Result<Option<DriftSnapshot>> {
        Ok(None)
    }
}

async fn run_component(name: &str, settings: &Settings) -> Result<()> {
    let descriptor = settings
        .component(name)
        .cloned()
        .ok_or_else(|| SpmError::ConfigurationError(format!("no such component: {name}")))?;

    let addr = heartbeat_addr(&descriptor.name, descriptor.heartbeat_base_port);
    let mut heartbeater =
        Heartbeater::bind(addr, Duration::from_millis(descriptor.heartbeat_period_ms)).await?;
    heartbeater.set_uuid(descriptor.name.clone());
    let loop_period = Duration::from_millis(settings.timing.loop_period_ms);

    let result = match descriptor.kind {
        ComponentKind::Translator { instrument, .. } => Err(SpmError::ComponentProcess(format!(
            "component '{}' is a Translator; no InstrumentBackend is registered for instrument '{instrument}' in this binary",
            descriptor.name
        ))),
        ComponentKind::Scheduler {
            cache_upstream,
            cache_downstream,
            cache_capacity,
            cache_capacity_overrides,
            router_addr,
            router_upstream,
            ..
        } => {
            let capacity = CacheCapacity::new(cache_capacity, cache_capacity_overrides);
            let mut scheduler = Scheduler::bind(cache_upstream, cache_downstream, capacity, router_addr, router_upstream).await?;
            loop {
                if scheduler.tick().await? {
                    break;
                }
                heartbeater.tick();
                tokio::time::sleep(loop_period).await;
            }
            Ok(())
        }
        ComponentKind::DriftScheduler {
            cache_upstream,
            cache_downstream,
            cache_capacity,
            cache_capacity_overrides,
            router_addr,
            router_upstream,
            rescan_publisher_addr,
            csv_path,
            channel_id,
            ..
        } => {
            let oracle: Arc<dyn DriftOracle> = Arc::new(NullDriftOracle);
            let config = DriftSchedulerConfig { channel_id, ..Default::default() };
            let capacity = CacheCapacity::new(cache_capacity, cache_capacity_overrides);
            let mut scheduler = DriftScheduler::bind(
                cache_upstream,
                cache_downstream,
                capacity,
                router_addr,
                router_upstream,
                rescan_publisher_addr,
                oracle,
                csv_path,
                config,
            )
            .await?;
            loop {
                if scheduler.tick().await? {
                    break;
                }
                heartbeater.tick();
                tokio::time::sleep(loop_period).await;
            }
            Ok(())
        }
    };

    heartbeater.handle_closing();
    result
}

use anyhow::{Context, Result};
use cloudmon_cloud::build_collectors;
use cloudmon_cloud::http::RetryingHttpClient;
use cloudmon_common::{Provider, SyncDomain, SyncTrigger};
use cloudmon_storage::LatestQuery;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use cloudmon_server::config::ServerConfig;
use cloudmon_server::orchestrator::{SyncOrchestrator, TriggerOutcome};
use cloudmon_server::scheduler::SyncScheduler;

const DEFAULT_LATEST_LIMIT: usize = 1000;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cloudmon-server [config.toml]                                  Start the scheduler");
    eprintln!("  cloudmon-server sync <config.toml> <azure|aws|rackspace|all>   Run one sync and print the result");
    eprintln!("  cloudmon-server latest <config.toml> [provider] [limit]        Print stored snapshot records");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cloudmon=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("sync") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("sync requires <config.toml> and <domain> arguments")
            })?;
            let domain = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("sync requires a <domain> argument")
            })?;
            let domain: SyncDomain = domain.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            run_manual_sync(config_path, domain).await
        }
        Some("latest") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("latest requires a <config.toml> argument")
            })?;
            run_list_latest(config_path, args.get(3).map(String::as_str), args.get(4).map(String::as_str))
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/cloudmon.toml");
            run_server(config_path).await
        }
    }
}

fn build_orchestrator(config: &ServerConfig) -> Result<Arc<SyncOrchestrator>> {
    let store = config.storage.open()?;
    let http = RetryingHttpClient::new(&config.cloud.http).context("Failed to build HTTP client")?;
    let collectors = build_collectors(&config.cloud, http);
    for collector in &collectors {
        tracing::info!(
            provider = %collector.provider(),
            configured = collector.is_configured(),
            "Registered collector"
        );
    }
    Ok(Arc::new(SyncOrchestrator::new(
        collectors,
        store,
        Duration::from_secs(config.sync.interval_secs),
    )))
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    tracing::info!(
        interval_secs = config.sync.interval_secs,
        backend = ?config.storage.backend,
        data_dir = %config.storage.data_dir,
        "Starting cloudmon"
    );

    let orchestrator = build_orchestrator(&config)?;

    let scheduler_handle = if config.sync.enabled {
        let scheduler = SyncScheduler::new(
            orchestrator.clone(),
            config.sync.tick_secs,
            config.sync.run_on_startup,
        );
        Some(tokio::spawn(async move {
            scheduler.run().await;
        }))
    } else {
        tracing::info!("Periodic sync disabled");
        None
    };

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    if let Some(handle) = scheduler_handle {
        handle.abort();
    }
    for (domain, state) in orchestrator.status() {
        if state.running {
            tracing::warn!(domain = %domain, "Sync interrupted by shutdown");
        }
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn run_manual_sync(config_path: &str, domain: SyncDomain) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let orchestrator = build_orchestrator(&config)?;

    let outcome = orchestrator.trigger(domain, SyncTrigger::Manual).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    match outcome {
        TriggerOutcome::Completed(report) if report.failures.is_empty() => Ok(()),
        TriggerOutcome::Completed(report) => Err(anyhow::anyhow!(
            "{} of {} provider runs failed",
            report.failures.len(),
            report.failures.len() + report.summaries.len()
        )),
        TriggerOutcome::NotStarted { reason, .. } => {
            Err(anyhow::anyhow!("sync for {domain} not started: {reason:?}"))
        }
    }
}

#[allow(clippy::print_stdout)]
fn run_list_latest(config_path: &str, provider: Option<&str>, limit: Option<&str>) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let store = config.storage.open()?;

    let provider = match provider {
        None | Some("all") => None,
        Some(name) => Some(name.parse::<Provider>().map_err(|e| anyhow::anyhow!(e))?),
    };
    let limit = match limit {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("Invalid limit '{raw}'"))?,
        None => DEFAULT_LATEST_LIMIT,
    };

    let records = store.list_latest(&LatestQuery { provider, limit })?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

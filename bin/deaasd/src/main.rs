//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the DEaaS telemetry daemon."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use deaas_common::config::{AppConfig, ProviderKind};
use deaas_common::logging::init_tracing;
use deaas_metrics::{new_registry, spawn_http_server, DaemonMetrics, TelemetryMetrics};
use deaas_net::{ApiServerBuilder, Dispatcher, TelemetryBroadcaster, TelemetryQuery, TelemetryResponse};
use deaas_telemetry::build_provider;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "DEaaS plant telemetry daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the telemetry provider")]
    provider: Option<CliProvider>,

    #[arg(long, value_name = "PREFIX", help = "Override the process-variable prefix")]
    pv_prefix: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliProvider {
    Mock,
    #[value(alias = "epics")]
    Live,
}

impl From<CliProvider> for ProviderKind {
    fn from(value: CliProvider) -> Self {
        match value {
            CliProvider::Mock => ProviderKind::Mock,
            CliProvider::Live => ProviderKind::Live,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Serve telemetry until interrupted")]
    Run,
    #[command(about = "Print the effective configuration and exit")]
    CheckConfig,
    #[command(about = "Watch assets for a few ticks and print their metrics")]
    Sample {
        #[arg(long = "type", default_value = "panel", help = "Asset kind: panel or inverter")]
        kind: String,
        #[arg(long, help = "Comma-separated asset ids")]
        ids: String,
        #[arg(long, default_value_t = 1, help = "Tick intervals to wait before reading")]
        ticks: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/deaas.toml"));
    candidates.push(PathBuf::from("/etc/deaas/deaas.toml"));

    let load_started = Instant::now();
    let loaded_config = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded_config.config;
    let load_duration = load_started.elapsed();

    if let Some(provider) = cli.provider {
        config.telemetry.provider = provider.into();
    }
    if let Some(prefix) = cli.pv_prefix {
        config.telemetry.pv_prefix = prefix;
    }
    config.validate().context("invalid command-line overrides")?;

    init_tracing("deaasd", &config.logging)?;
    match &loaded_config.source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            config.validate_for_daemon()?;
            run_daemon(config, load_duration.as_secs_f64()).await?
        }
        Commands::CheckConfig => {
            print!("{}", config.to_toml()?);
        }
        Commands::Sample { kind, ids, ticks } => {
            config.validate_for_daemon()?;
            sample(config, &kind, &ids, ticks).await?
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, load_seconds: f64) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(&registry)?;
    daemon_metrics.observe_config_load(load_seconds);
    daemon_metrics.inc_start();
    daemon_metrics.set_provider_info(env!("CARGO_PKG_VERSION"), config.telemetry.provider.as_str());
    let telemetry_metrics = TelemetryMetrics::new(&registry)?;

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let provider = match build_provider(&config.telemetry, Some(telemetry_metrics)) {
        Ok(provider) => provider,
        Err(err) => {
            error!(error = %err, provider = %config.telemetry.provider, "telemetry provider unavailable");
            return Err(err).context("failed to start telemetry provider");
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(
        provider,
        TelemetryBroadcaster::new(config.api.broadcast_capacity),
    ));
    let api_server = ApiServerBuilder::new(config.api.listen, dispatcher.clone())
        .cors_origins(config.api.cors_origins.clone())
        .spawn()
        .await?;

    info!(
        provider = dispatcher.provider_name(),
        address = %api_server.local_addr(),
        "daemon running; waiting for termination signal"
    );
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    dispatcher.shutdown();
    api_server.shutdown().await?;
    if let Some(server) = metrics_server {
        if let Err(err) = server.shutdown().await {
            warn!(error = %err, "metrics exporter shutdown failed");
        }
    }

    Ok(())
}

fn sample_wait(tick_interval: Duration, ticks: u32) -> Result<Duration> {
    tick_interval
        .checked_mul(ticks)
        .ok_or_else(|| anyhow!("--ticks {ticks} at {tick_interval:?} per tick overflows the wait"))
}

async fn sample(config: AppConfig, kind: &str, ids: &str, ticks: u32) -> Result<()> {
    let query = TelemetryQuery::parse(Some(kind), Some(ids))?;
    let provider = build_provider(&config.telemetry, None).context("failed to start telemetry provider")?;
    for &id in &query.ids {
        provider.ensure(query.kind, id);
    }

    let wait = sample_wait(config.telemetry.simulation.tick_interval, ticks)?;
    info!(kind = %query.kind, ids = ?query.ids, wait_ms = wait.as_millis() as u64, "sampling telemetry");
    tokio::time::sleep(wait).await;

    let response = TelemetryResponse {
        kind: query.kind.as_str().to_owned(),
        data: query
            .ids
            .iter()
            .map(|&id| deaas_net::AssetReading {
                id,
                metrics: provider.read(query.kind, id),
            })
            .collect(),
    };
    provider.shutdown();
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_wait_scales_tick_interval() {
        let wait = sample_wait(Duration::from_millis(500), 3).unwrap();
        assert_eq!(wait, Duration::from_millis(1500));
    }

    #[test]
    fn sample_wait_overflow_is_an_error() {
        let err = sample_wait(Duration::from_secs(u64::MAX / 2), u32::MAX).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }
}

//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let local_addr = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %local_addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    provider_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "deaasd_starts_total",
            "Total number of times the telemetry daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.0005, 2.0, 12)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "deaasd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let provider_info = GaugeVec::new(
            Opts::new(
                "deaasd_provider_info",
                "Telemetry backend selected for the running daemon",
            ),
            &["version", "provider"],
        )?;
        registry.register(Box::new(provider_info.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
            provider_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_provider_info(&self, version: &str, provider: &str) {
        self.provider_info
            .with_label_values(&[version, provider])
            .set(1.0);
    }
}

/// Counters and gauges maintained by the telemetry providers.
#[derive(Clone)]
pub struct TelemetryMetrics {
    assets_watched: IntGaugeVec,
    updates_emitted: IntCounterVec,
    updates_dropped: IntCounter,
    simulation_ticks: IntCounter,
    subscriptions: IntGaugeVec,
    subscription_failures: IntCounter,
}

impl TelemetryMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let assets_watched = IntGaugeVec::new(
            Opts::new("deaas_assets_watched", "Assets currently watched by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(assets_watched.clone()))?;

        let updates_emitted = IntCounterVec::new(
            Opts::new(
                "deaas_updates_emitted_total",
                "Update events handed to the registered listener",
            ),
            &["source"],
        )?;
        registry.register(Box::new(updates_emitted.clone()))?;

        let updates_dropped = IntCounter::with_opts(Opts::new(
            "deaas_updates_dropped_total",
            "Update events discarded because no listener was registered",
        ))?;
        registry.register(Box::new(updates_dropped.clone()))?;

        let simulation_ticks = IntCounter::with_opts(Opts::new(
            "deaas_simulation_ticks_total",
            "Completed simulation ticks",
        ))?;
        registry.register(Box::new(simulation_ticks.clone()))?;

        let subscriptions = IntGaugeVec::new(
            Opts::new(
                "deaas_subscriptions",
                "Live process-variable subscriptions by state",
            ),
            &["state"],
        )?;
        registry.register(Box::new(subscriptions.clone()))?;

        let subscription_failures = IntCounter::with_opts(Opts::new(
            "deaas_subscription_failures_total",
            "Subscription attempts rejected by the hardware link",
        ))?;
        registry.register(Box::new(subscription_failures.clone()))?;

        Ok(Self {
            assets_watched,
            updates_emitted,
            updates_dropped,
            simulation_ticks,
            subscriptions,
            subscription_failures,
        })
    }

    pub fn set_assets_watched(&self, kind: &str, count: usize) {
        self.assets_watched
            .with_label_values(&[kind])
            .set(count as i64);
    }

    pub fn record_emitted(&self, source: &str) {
        self.updates_emitted.with_label_values(&[source]).inc();
    }

    pub fn record_dropped(&self) {
        self.updates_dropped.inc();
    }

    pub fn record_tick(&self) {
        self.simulation_ticks.inc();
    }

    pub fn set_subscriptions(&self, state: &str, count: usize) {
        self.subscriptions
            .with_label_values(&[state])
            .set(count as i64);
    }

    pub fn record_subscription_failure(&self) {
        self.subscription_failures.inc();
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_metrics_register_once() {
        let registry = new_registry();
        let metrics = TelemetryMetrics::new(&registry).unwrap();
        metrics.set_assets_watched("panel", 3);
        metrics.record_emitted("mock");
        metrics.record_tick();

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"deaas_assets_watched".to_owned()));
        assert!(names.contains(&"deaas_simulation_ticks_total".to_owned()));

        assert!(TelemetryMetrics::new(&registry).is_err());
    }

    #[tokio::test]
    async fn exporter_serves_registered_metrics() {
        let registry = new_registry();
        let daemon = DaemonMetrics::new(&registry).unwrap();
        daemon.inc_start();
        daemon.set_provider_info("0.1.0", "mock");

        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
        let url = format!("http://{}/metrics", server.addr());
        let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert!(body.contains("deaasd_starts_total 1"));
        assert!(body.contains("provider=\"mock\""));

        server.shutdown().await.unwrap();
    }
}

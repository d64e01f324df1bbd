//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tracing setup for the telemetry daemon."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "DEAAS_LOG";
const FALLBACK_ENV: &str = "RUST_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

/// Non-blocking writers stop flushing once their guard drops.
static WRITER_GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Line format for stdout. Log files are always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the global subscriber.
///
/// The filter comes from `DEAAS_LOG`, then `RUST_LOG`, then `info`. A daily
/// rolling file named after `logging.file_prefix` (or `service_name`) is
/// added when `logging.file_enabled` is set. Calling this twice keeps the
/// first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let (stdout, guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(guard);
    layers.push(output_layer(config.format, stdout));

    if config.file_enabled {
        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!("cannot create log directory {}", config.directory.display())
        })?;
        let appender = tracing_appender::rolling::daily(
            &config.directory,
            log_file_name(service_name, config.file_prefix.as_deref()),
        );
        let (file, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        layers.push(output_layer(LogFormat::StructuredJson, file));
    }

    let directive = filter_directive(|key| std::env::var(key).ok());
    let installed = tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(&directive))
        .try_init()
        .is_ok();
    if installed {
        let _ = WRITER_GUARDS.set(guards);
    }

    info!(
        service = %service_name,
        directive = %directive,
        log_file = ?config.file_enabled.then(|| log_path(service_name, config)),
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}

fn output_layer<W>(format: LogFormat, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.json().with_target(false).boxed(),
        LogFormat::Pretty => layer.with_target(true).boxed(),
    }
}

/// First non-blank directive among the recognised variables.
fn filter_directive<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    [LOG_ENV, FALLBACK_ENV]
        .into_iter()
        .filter_map(|key| lookup(key))
        .find(|directive| !directive.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_owned())
}

fn build_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|err| {
        eprintln!("ignoring log filter {directive:?} ({err}); using {DEFAULT_DIRECTIVE}");
        EnvFilter::new(DEFAULT_DIRECTIVE)
    })
}

fn log_file_name(service_name: &str, prefix: Option<&str>) -> String {
    format!("{}.log", prefix.unwrap_or(service_name))
}

fn log_path(service_name: &str, config: &LoggingConfig) -> PathBuf {
    config
        .directory
        .join(log_file_name(service_name, config.file_prefix.as_deref()))
}

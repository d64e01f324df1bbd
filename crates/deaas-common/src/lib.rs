//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry runtime."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the DEaaS workspace.
//! This crate exposes configuration loading and logging setup consumed by
//! the telemetry providers, the network surfaces and the daemon.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, LinkKind, LiveConfig, LoadedAppConfig, LoggingConfig, MetricsConfig,
    ProviderKind, ResubscribeConfig, SimulationConfig, TelemetryConfig,
};
pub use logging::{init_tracing, LogFormat};

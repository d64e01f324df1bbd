//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Provider selection from configuration."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use deaas_common::config::{LinkKind, LiveConfig, ProviderKind, TelemetryConfig};
use deaas_metrics::TelemetryMetrics;
use tracing::{info, warn};

use crate::error::TelemetryError;
use crate::link::{ChannelAccessLink, LoopbackLink, ProcessVariableLink};
use crate::live::{BackoffPolicy, LiveProvider};
use crate::provider::TelemetryProvider;
use crate::simulated::SimulatedProvider;

/// Link implementation selected by `live.link`.
pub fn link_from_config(config: &LiveConfig) -> Arc<dyn ProcessVariableLink> {
    match config.link {
        LinkKind::Loopback => Arc::new(LoopbackLink::new()),
        LinkKind::ChannelAccess => Arc::new(ChannelAccessLink::from_config(config)),
    }
}

/// Build the configured provider.
///
/// The simulated provider starts its clock immediately and therefore needs a
/// tokio runtime; outside one this returns [`TelemetryError::NoRuntime`].
/// Selecting the live provider fails when its link cannot be
/// used; callers treat that as fatal.
pub fn build_provider(
    config: &TelemetryConfig,
    metrics: Option<TelemetryMetrics>,
) -> Result<Arc<dyn TelemetryProvider>, TelemetryError> {
    build_provider_with_link(config, link_from_config(&config.live), metrics)
}

/// Same as [`build_provider`] with an explicit link for the live backend.
pub fn build_provider_with_link(
    config: &TelemetryConfig,
    link: Arc<dyn ProcessVariableLink>,
    metrics: Option<TelemetryMetrics>,
) -> Result<Arc<dyn TelemetryProvider>, TelemetryError> {
    config
        .validate()
        .map_err(|err| TelemetryError::InvalidConfig(format!("{err:#}")))?;

    match config.provider {
        ProviderKind::Mock => {
            let provider = SimulatedProvider::start(&config.simulation, metrics)?;
            info!(provider = "mock", "telemetry provider ready");
            Ok(Arc::new(provider))
        }
        ProviderKind::Live => {
            let provider = LiveProvider::connect(&config.pv_prefix, link, metrics)?;
            let resubscribe = &config.live.resubscribe;
            if resubscribe.enabled {
                if tokio::runtime::Handle::try_current().is_ok() {
                    provider.spawn_resubscriber(BackoffPolicy::from(resubscribe));
                } else {
                    warn!("no async runtime available; pending subscriptions retried on ensure only");
                }
            }
            info!(provider = "live", prefix = %config.pv_prefix, "telemetry provider ready");
            Ok(Arc::new(provider))
        }
    }
}

//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry provider exports and shared types."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Telemetry providers for solar panels and inverters.
//!
//! A provider lazily starts watching an asset on [`TelemetryProvider::ensure`],
//! keeps the latest metrics in a [`MetricCache`], answers cache reads, and
//! pushes an [`UpdateEvent`] to the single registered listener whenever a
//! value changes. [`SimulatedProvider`] fabricates values on a clock;
//! [`LiveProvider`] relays process-variable monitors from a hardware link.

pub mod cache;
pub mod emitter;
pub mod error;
pub mod factory;
pub mod link;
pub mod live;
pub mod model;
pub mod naming;
pub mod provider;
pub mod simulated;

pub use cache::MetricCache;
pub use emitter::{listener, UpdateEmitter, UpdateListener};
pub use error::{LinkError, TelemetryError};
pub use factory::{build_provider, build_provider_with_link, link_from_config};
pub use link::{
    ChannelAccessLink, LoopbackLink, ProcessVariableLink, PvSubscription, PvUpdate, ValueHandler,
};
pub use live::{BackoffPolicy, LiveProvider, SubscriptionState};
pub use model::{
    AssetId, AssetKey, AssetKind, EventSource, InverterStatus, MetricSet, MetricValue,
    UpdateEvent,
};
pub use naming::PvNaming;
pub use provider::TelemetryProvider;
pub use simulated::{InverterSampler, PanelSampler, SimulatedProvider};

//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Contract shared by every telemetry backend."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use crate::emitter::UpdateListener;
use crate::model::{AssetId, AssetKind, EventSource, MetricSet};

/// Unified interface implemented by the simulated and live backends.
///
/// `ensure` and `read` are synchronous and never perform blocking I/O.
/// Updates are pushed from the provider's own execution context to the
/// listener registered with [`TelemetryProvider::on_update`].
pub trait TelemetryProvider: Send + Sync {
    /// Tag carried by every event this provider emits.
    fn source(&self) -> EventSource;

    /// Start watching the asset if it is not watched yet. Idempotent.
    fn ensure(&self, kind: AssetKind, id: AssetId);

    /// Cached metrics for the asset; all-unknown when it was never ensured.
    fn read(&self, kind: AssetKind, id: AssetId) -> MetricSet;

    /// Register the downstream listener, replacing any earlier one.
    fn on_update(&self, listener: UpdateListener);

    /// Stop background work. Best-effort and idempotent.
    fn shutdown(&self);

    fn ensure_panel(&self, id: AssetId) {
        self.ensure(AssetKind::Panel, id);
    }

    fn ensure_inverter(&self, id: AssetId) {
        self.ensure(AssetKind::Inverter, id);
    }

    fn read_panel(&self, id: AssetId) -> MetricSet {
        self.read(AssetKind::Panel, id)
    }

    fn read_inverter(&self, id: AssetId) -> MetricSet {
        self.read(AssetKind::Inverter, id)
    }
}

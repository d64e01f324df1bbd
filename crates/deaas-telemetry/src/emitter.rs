//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Single-listener slot for provider push events."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use deaas_metrics::TelemetryMetrics;
use parking_lot::RwLock;
use tracing::trace;

use crate::model::UpdateEvent;

/// Downstream callback receiving every update event.
pub type UpdateListener = Arc<dyn Fn(UpdateEvent) + Send + Sync>;

/// Wrap a closure as an [`UpdateListener`].
pub fn listener<F>(callback: F) -> UpdateListener
where
    F: Fn(UpdateEvent) + Send + Sync + 'static,
{
    Arc::new(callback)
}

/// Holds at most one listener; the last registration wins.
///
/// The listener is invoked outside the slot lock, so a concurrent
/// registration never waits on a slow listener.
#[derive(Default)]
pub struct UpdateEmitter {
    listener: RwLock<Option<UpdateListener>>,
    emitted: AtomicU64,
    dropped: AtomicU64,
    metrics: Option<TelemetryMetrics>,
}

impl UpdateEmitter {
    pub fn new(metrics: Option<TelemetryMetrics>) -> Self {
        Self {
            metrics,
            ..Self::default()
        }
    }

    /// Install `listener`, returning true when it replaced an earlier one.
    pub fn register(&self, listener: UpdateListener) -> bool {
        self.listener.write().replace(listener).is_some()
    }

    pub fn clear(&self) {
        self.listener.write().take();
    }

    pub fn has_listener(&self) -> bool {
        self.listener.read().is_some()
    }

    /// Deliver `event`; without a listener it is dropped. Returns true if delivered.
    pub fn emit(&self, event: UpdateEvent) -> bool {
        let current = self.listener.read().clone();
        match current {
            Some(listener) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_emitted(event.source.as_str());
                }
                self.emitted.fetch_add(1, Ordering::Relaxed);
                listener(event);
                true
            }
            None => {
                trace!(kind = %event.kind, id = event.id, "no listener registered; dropping update");
                if let Some(metrics) = &self.metrics {
                    metrics.record_dropped();
                }
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for UpdateEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateEmitter")
            .field("has_listener", &self.has_listener())
            .field("emitted", &self.emitted())
            .field("dropped", &self.dropped())
            .finish()
    }
}

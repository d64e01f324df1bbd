//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-process process-variable link for tests and bench setups."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use super::{ProcessVariableLink, PvSubscription, PvUpdate, ValueHandler};
use crate::error::LinkError;
use crate::model::MetricValue;

#[derive(Default)]
struct LoopbackState {
    available: bool,
    values: HashMap<String, MetricValue>,
    subscribers: HashMap<String, Vec<(u64, ValueHandler)>>,
    rejected: HashSet<String>,
    next_id: u64,
    attempts: u64,
}

/// In-memory link that behaves like a monitored channel server.
///
/// Values are published with [`LoopbackLink::post`] and delivered to the
/// monitors on the posting thread. A new monitor immediately receives the
/// last posted value, as a channel-access monitor does on connect.
#[derive(Clone)]
pub struct LoopbackLink {
    state: Arc<Mutex<LoopbackState>>,
}

impl Default for LoopbackLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackLink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState {
                available: true,
                ..LoopbackState::default()
            })),
        }
    }

    /// A link whose `connect` fails, mimicking a missing client library.
    pub fn unavailable() -> Self {
        let link = Self::new();
        link.state.lock().available = false;
        link
    }

    /// Refuse future subscriptions to `pv`.
    pub fn reject(&self, pv: &str) {
        self.state.lock().rejected.insert(pv.to_owned());
    }

    /// Accept subscriptions to `pv` again.
    pub fn accept(&self, pv: &str) {
        self.state.lock().rejected.remove(pv);
    }

    /// Publish a value and deliver it to every monitor of `pv`.
    /// Returns the number of monitors notified.
    pub fn post(&self, pv: &str, value: impl Into<MetricValue>) -> usize {
        let value = value.into();
        let handlers: Vec<ValueHandler> = {
            let mut state = self.state.lock();
            state.values.insert(pv.to_owned(), value.clone());
            state
                .subscribers
                .get(pv)
                .map(|subs| subs.iter().map(|(_, handler)| handler.clone()).collect())
                .unwrap_or_default()
        };
        for handler in &handlers {
            handler(PvUpdate {
                pv: pv.to_owned(),
                value: value.clone(),
            });
        }
        trace!(pv, delivered = handlers.len(), "loopback value posted");
        handlers.len()
    }

    pub fn subscriber_count(&self, pv: &str) -> usize {
        self.state.lock().subscribers.get(pv).map_or(0, Vec::len)
    }

    pub fn total_subscribers(&self) -> usize {
        self.state.lock().subscribers.values().map(Vec::len).sum()
    }

    /// Subscription attempts seen so far, including rejected ones.
    pub fn subscribe_attempts(&self) -> u64 {
        self.state.lock().attempts
    }
}

impl ProcessVariableLink for LoopbackLink {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn connect(&self) -> Result<(), LinkError> {
        if self.state.lock().available {
            Ok(())
        } else {
            Err(LinkError::Unavailable("loopback link disabled".into()))
        }
    }

    fn subscribe(
        &self,
        pv: &str,
        handler: ValueHandler,
    ) -> Result<Box<dyn PvSubscription>, LinkError> {
        let (id, initial) = {
            let mut state = self.state.lock();
            state.attempts += 1;
            if !state.available {
                return Err(LinkError::Disconnected("loopback link disabled".into()));
            }
            if state.rejected.contains(pv) {
                return Err(LinkError::SubscribeRejected {
                    pv: pv.to_owned(),
                    reason: "channel not found".into(),
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            state
                .subscribers
                .entry(pv.to_owned())
                .or_default()
                .push((id, handler.clone()));
            (id, state.values.get(pv).cloned())
        };

        if let Some(value) = initial {
            handler(PvUpdate {
                pv: pv.to_owned(),
                value,
            });
        }

        Ok(Box::new(LoopbackSubscription {
            pv: pv.to_owned(),
            id,
            state: Arc::downgrade(&self.state),
        }))
    }
}

struct LoopbackSubscription {
    pv: String,
    id: u64,
    state: Weak<Mutex<LoopbackState>>,
}

impl PvSubscription for LoopbackSubscription {
    fn pv(&self) -> &str {
        &self.pv
    }

    fn cancel(&mut self) {
        if let Some(state) = self.state.upgrade() {
            let mut state = state.lock();
            if let Some(subs) = state.subscribers.get_mut(&self.pv) {
                subs.retain(|(id, _)| *id != self.id);
                if subs.is_empty() {
                    state.subscribers.remove(&self.pv);
                }
            }
        }
    }
}

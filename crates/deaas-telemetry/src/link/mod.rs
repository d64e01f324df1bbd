//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Hardware monitoring link capability used by the live provider."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use crate::error::LinkError;
use crate::model::MetricValue;

pub mod channel_access;
pub mod loopback;

pub use channel_access::ChannelAccessLink;
pub use loopback::LoopbackLink;

/// Value-change report for one process variable.
#[derive(Debug, Clone, PartialEq)]
pub struct PvUpdate {
    pub pv: String,
    pub value: MetricValue,
}

/// Callback invoked by the link on its own execution context.
pub type ValueHandler = Arc<dyn Fn(PvUpdate) + Send + Sync>;

/// Unified interface implemented by process-variable monitoring links.
pub trait ProcessVariableLink: Send + Sync {
    /// Short identifier used in logs and errors (e.g. `channel-access`).
    fn name(&self) -> &'static str;

    /// Verify the link can be used at all. Called once at provider construction.
    fn connect(&self) -> Result<(), LinkError>;

    /// Register a monitor for `pv`.
    ///
    /// Must return without waiting for the remote end; the handler receives
    /// the first value whenever the channel connects.
    fn subscribe(&self, pv: &str, handler: ValueHandler)
        -> Result<Box<dyn PvSubscription>, LinkError>;
}

/// Handle for an established monitor.
pub trait PvSubscription: Send {
    fn pv(&self) -> &str;

    /// Stop delivering values. Reports already in flight may still arrive.
    fn cancel(&mut self);
}

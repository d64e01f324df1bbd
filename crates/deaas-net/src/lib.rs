//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Dispatcher and network surfaces for plant telemetry."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---

pub mod dispatcher;
pub mod rest;
pub mod server;
pub mod websocket;

pub use dispatcher::{parse_ids, AssetReading, DispatchError, Dispatcher, TelemetryQuery};
pub use rest::{HealthResponse, TelemetryResponse};
pub use server::{ApiServerBuilder, ApiServerHandle};
pub use websocket::{SessionFrame, TelemetryBroadcaster, TelemetryFrame, TELEMETRY_EVENT};

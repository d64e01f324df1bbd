//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy for providers and hardware links."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---

/// Failures reported by a hardware monitoring link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The link capability is not present in this process.
    #[error("hardware link unavailable: {0}")]
    Unavailable(String),
    /// The link refused to monitor a process variable.
    #[error("subscription to {pv} rejected: {reason}")]
    SubscribeRejected { pv: String, reason: String },
    /// The link lost its connection to the control-system network.
    #[error("hardware link disconnected: {0}")]
    Disconnected(String),
}

/// Errors surfaced by provider construction and input parsing.
///
/// Reads and ensures never fail; only startup conditions are reported here.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The live provider was selected but its hardware link cannot be used.
    #[error("live telemetry requires the {link} link: {source}")]
    LinkUnavailable {
        link: &'static str,
        #[source]
        source: LinkError,
    },
    /// Provider settings that cannot be honoured.
    #[error("invalid telemetry configuration: {0}")]
    InvalidConfig(String),
    /// A provider that drives its own clock was built outside a tokio runtime.
    #[error("the {provider} provider must be started inside a tokio runtime")]
    NoRuntime { provider: &'static str },
    /// Asset category outside `panel` / `inverter`.
    #[error("unknown asset kind: {0}")]
    UnknownAssetKind(String),
}

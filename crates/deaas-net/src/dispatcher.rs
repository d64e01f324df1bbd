//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Composition of the telemetry provider with downstream transports."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use deaas_telemetry::{
    listener, AssetId, AssetKind, MetricSet, TelemetryProvider, UpdateEvent,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::websocket::{TelemetryBroadcaster, TelemetryFrame};

/// Rejected telemetry queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("type must be 'panel' or 'inverter'")]
    UnknownKind(String),
    #[error("ids query param required, e.g. ?type=panel&ids=1,2")]
    MissingIds,
}

/// Validated telemetry query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryQuery {
    pub kind: AssetKind,
    pub ids: Vec<AssetId>,
}

impl TelemetryQuery {
    /// Validate raw query parameters.
    ///
    /// `kind` defaults to `panel` and is case-insensitive. Entries of `ids`
    /// that are not decimal numbers are skipped; an empty result is rejected
    /// before the kind is checked.
    pub fn parse(kind: Option<&str>, ids: Option<&str>) -> Result<Self, DispatchError> {
        let ids = parse_ids(ids.unwrap_or_default());
        if ids.is_empty() {
            return Err(DispatchError::MissingIds);
        }
        let raw_kind = kind.unwrap_or("panel").trim().to_ascii_lowercase();
        let kind = raw_kind
            .parse::<AssetKind>()
            .map_err(|_| DispatchError::UnknownKind(raw_kind))?;
        Ok(Self { kind, ids })
    }
}

/// Comma-separated decimal ids, ignoring anything else.
pub fn parse_ids(raw: &str) -> Vec<AssetId> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// One asset's metrics in a telemetry response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetReading {
    pub id: AssetId,
    pub metrics: MetricSet,
}

/// Owns the provider and relays its updates to WebSocket clients.
pub struct Dispatcher {
    provider: Arc<dyn TelemetryProvider>,
    broadcaster: TelemetryBroadcaster,
}

impl Dispatcher {
    /// Wire `provider` to `broadcaster`, taking the provider's listener slot.
    pub fn new(provider: Arc<dyn TelemetryProvider>, broadcaster: TelemetryBroadcaster) -> Self {
        let relay = broadcaster.clone();
        provider.on_update(listener(move |event| relay_event(&relay, event)));
        debug!(provider = provider.source().as_str(), "dispatcher attached");
        Self {
            provider,
            broadcaster,
        }
    }

    pub fn provider(&self) -> &Arc<dyn TelemetryProvider> {
        &self.provider
    }

    /// Name reported by the health endpoint.
    pub fn provider_name(&self) -> &'static str {
        self.provider.source().as_str()
    }

    pub fn broadcaster(&self) -> &TelemetryBroadcaster {
        &self.broadcaster
    }

    /// Start watching the given assets.
    pub fn watch(&self, kind: AssetKind, ids: &[AssetId]) {
        for &id in ids {
            self.provider.ensure(kind, id);
        }
    }

    /// Watch, then read, the given assets in request order.
    pub fn telemetry(&self, kind: AssetKind, ids: &[AssetId]) -> Vec<AssetReading> {
        self.watch(kind, ids);
        ids.iter()
            .map(|&id| AssetReading {
                id,
                metrics: self.provider.read(kind, id),
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.provider.shutdown();
    }
}

fn relay_event(broadcaster: &TelemetryBroadcaster, event: UpdateEvent) {
    let channel = event.kind;
    let payload = match serde_json::to_value(&event) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, asset = %event.key(), "failed to encode update event");
            return;
        }
    };
    if broadcaster.send(TelemetryFrame::new(channel, payload)).is_err() {
        trace!(asset = %event.key(), "no websocket clients connected");
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("provider", &self.provider_name())
            .field("clients", &self.broadcaster.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_skip_non_numeric_entries() {
        assert_eq!(parse_ids("1, 2,x,,-3,4 "), vec![1, 2, 4]);
        assert!(parse_ids("").is_empty());
    }

    #[test]
    fn missing_ids_checked_before_kind() {
        assert_eq!(
            TelemetryQuery::parse(Some("battery"), Some("a,b")),
            Err(DispatchError::MissingIds)
        );
        assert_eq!(
            TelemetryQuery::parse(Some("battery"), Some("1")),
            Err(DispatchError::UnknownKind("battery".into()))
        );
    }

    #[test]
    fn kind_defaults_to_panel_and_ignores_case() {
        let query = TelemetryQuery::parse(None, Some("3")).unwrap();
        assert_eq!(query.kind, AssetKind::Panel);
        let query = TelemetryQuery::parse(Some("INVERTER"), Some("3,4")).unwrap();
        assert_eq!(query.kind, AssetKind::Inverter);
        assert_eq!(query.ids, vec![3, 4]);
    }

    #[test]
    fn error_messages_match_http_contract() {
        assert_eq!(
            DispatchError::MissingIds.to_string(),
            "ids query param required, e.g. ?type=panel&ids=1,2"
        );
        assert_eq!(
            DispatchError::UnknownKind("x".into()).to_string(),
            "type must be 'panel' or 'inverter'"
        );
    }
}

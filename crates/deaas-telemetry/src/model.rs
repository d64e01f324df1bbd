//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Asset, metric and update event data model."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::TelemetryError;

/// Fixed metric names per asset kind.
pub mod metric {
    pub const DC_POWER: &str = "DC_POWER";
    pub const VOLTAGE: &str = "VOLTAGE";
    pub const CURRENT: &str = "CURRENT";
    pub const AC_POWER: &str = "AC_POWER";
    pub const STATUS: &str = "STATUS";

    pub const PANEL: [&str; 3] = [DC_POWER, VOLTAGE, CURRENT];
    pub const INVERTER: [&str; 2] = [AC_POWER, STATUS];
}

/// Numeric asset identifier issued by the external asset registry.
pub type AssetId = u32;

/// Category of physical asset; selects the metric set and naming scheme.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Panel,
    Inverter,
}

impl AssetKind {
    pub const ALL: [AssetKind; 2] = [AssetKind::Panel, AssetKind::Inverter];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Panel => "panel",
            AssetKind::Inverter => "inverter",
        }
    }

    /// Metric names tracked for this kind, in their canonical order.
    pub fn metric_names(&self) -> &'static [&'static str] {
        match self {
            AssetKind::Panel => &metric::PANEL,
            AssetKind::Inverter => &metric::INVERTER,
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AssetKind {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "panel" => Ok(AssetKind::Panel),
            "inverter" => Ok(AssetKind::Inverter),
            other => Err(TelemetryError::UnknownAssetKind(other.to_owned())),
        }
    }
}

/// Cache key for one watched asset. Orders panels before inverters, then by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey {
    pub kind: AssetKind,
    pub id: AssetId,
}

impl AssetKey {
    pub fn new(kind: AssetKind, id: AssetId) -> Self {
        Self { kind, id }
    }

    pub fn panel(id: AssetId) -> Self {
        Self::new(AssetKind::Panel, id)
    }

    pub fn inverter(id: AssetId) -> Self {
        Self::new(AssetKind::Inverter, id)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Value reported for a single metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(value) => Some(*value as f64),
            MetricValue::Float(value) => Some(*value),
            MetricValue::Text(text) => text.trim().parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetricValue::Int(value) => Some(*value),
            MetricValue::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            MetricValue::Float(_) => None,
            MetricValue::Text(text) => text.trim().parse().ok(),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Int(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_owned())
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

impl From<InverterStatus> for MetricValue {
    fn from(status: InverterStatus) -> Self {
        MetricValue::Int(status.code())
    }
}

/// Inverter operating status as carried on the `STATUS` metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InverterStatus {
    Ok,
    Fault,
}

impl InverterStatus {
    pub fn code(&self) -> i64 {
        match self {
            InverterStatus::Ok => 1,
            InverterStatus::Fault => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(InverterStatus::Ok),
            2 => Some(InverterStatus::Fault),
            _ => None,
        }
    }
}

/// Ordered metric name to value mapping for one asset.
///
/// Every metric of the asset's kind is present; `None` marks a metric whose
/// value is not known yet and serialises as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricSet(IndexMap<String, Option<MetricValue>>);

impl MetricSet {
    /// Metric set for `kind` with every value unknown.
    pub fn unknown(kind: AssetKind) -> Self {
        Self(
            kind.metric_names()
                .iter()
                .map(|name| ((*name).to_owned(), None))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.0.get(name).and_then(Option::as_ref)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(MetricValue::as_f64)
    }

    /// Decoded `STATUS` metric, if present and recognised.
    pub fn status(&self) -> Option<InverterStatus> {
        self.get(metric::STATUS)
            .and_then(MetricValue::as_i64)
            .and_then(InverterStatus::from_code)
    }

    /// Store a value, appending the name when it is not part of the set yet.
    pub fn set(&mut self, name: &str, value: impl Into<MetricValue>) {
        self.set_raw(name, Some(value.into()));
    }

    pub fn set_raw(&mut self, name: &str, value: Option<MetricValue>) {
        match self.0.get_mut(name) {
            Some(slot) => *slot = value,
            None => {
                self.0.insert(name.to_owned(), value);
            }
        }
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True when no metric has a value.
    pub fn is_unknown(&self) -> bool {
        self.0.values().all(Option::is_none)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&MetricValue>)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Origin of an update event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Mock,
    Live,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Mock => "mock",
            EventSource::Live => "live",
        }
    }
}

/// Per-asset snapshot pushed to the registered listener whenever values change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    pub id: AssetId,
    pub metrics: MetricSet,
    pub source: EventSource,
    /// Process variable whose report triggered a live emission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pv: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UpdateEvent {
    pub fn simulated(key: AssetKey, metrics: MetricSet) -> Self {
        Self {
            kind: key.kind,
            id: key.id,
            metrics,
            source: EventSource::Mock,
            pv: None,
            timestamp: Utc::now(),
        }
    }

    pub fn live(key: AssetKey, metrics: MetricSet, pv: impl Into<String>) -> Self {
        Self {
            kind: key.kind,
            id: key.id,
            metrics,
            source: EventSource::Live,
            pv: Some(pv.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn key(&self) -> AssetKey {
        AssetKey::new(self.kind, self.id)
    }
}

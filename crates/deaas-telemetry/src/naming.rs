//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Process-variable naming scheme for watched assets."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use crate::model::{AssetId, AssetKind};

/// Derives process-variable names as `<prefix>:<KIND>:<id:03>:<METRIC>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvNaming {
    prefix: String,
}

impl PvNaming {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches(':').to_owned(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn base(&self, kind: AssetKind, id: AssetId) -> String {
        let segment = match kind {
            AssetKind::Panel => "PANEL",
            AssetKind::Inverter => "INV",
        };
        format!("{}:{}:{:03}", self.prefix, segment, id)
    }

    pub fn pv(&self, kind: AssetKind, id: AssetId, metric: &str) -> String {
        format!("{}:{}", self.base(kind, id), metric)
    }

    /// `(metric, pv)` pairs for every metric of the asset, in canonical order.
    pub fn pv_names(&self, kind: AssetKind, id: AssetId) -> Vec<(&'static str, String)> {
        let base = self.base(kind, id);
        kind.metric_names()
            .iter()
            .map(|metric| (*metric, format!("{}:{}", base, metric)))
            .collect()
    }
}

//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "EPICS Channel Access link and its optional native client."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use deaas_common::config::LiveConfig;
use parking_lot::Mutex;
use tracing::warn;

use super::{ProcessVariableLink, PvSubscription, ValueHandler};
use crate::error::LinkError;

#[cfg(feature = "channel-access")]
mod client;
#[cfg(feature = "channel-access")]
mod proto;

/// EPICS Channel Access link.
///
/// Built with the `channel-access` feature, `connect` starts a native client
/// on the current tokio runtime. Without it, `connect` reports the capability
/// as unavailable so that selecting the live backend fails at startup.
#[derive(Debug, Clone, Default)]
pub struct ChannelAccessLink {
    addr_list: Option<String>,
    auto_addr_list: Option<String>,
    client: Arc<Mutex<Option<ClientSlot>>>,
}

#[cfg(feature = "channel-access")]
type ClientSlot = client::ClientHandle;
#[cfg(not(feature = "channel-access"))]
type ClientSlot = std::convert::Infallible;

impl ChannelAccessLink {
    pub fn new(addr_list: Option<String>, auto_addr_list: Option<String>) -> Self {
        Self {
            addr_list,
            auto_addr_list,
            client: Arc::default(),
        }
    }

    pub fn from_config(config: &LiveConfig) -> Self {
        Self::new(config.ca_addr_list.clone(), config.ca_auto_addr_list.clone())
    }

    /// Value for `EPICS_CA_ADDR_LIST`, if configured.
    pub fn addr_list(&self) -> Option<&str> {
        self.addr_list.as_deref()
    }

    /// Value for `EPICS_CA_AUTO_ADDR_LIST`, if configured.
    pub fn auto_addr_list(&self) -> Option<&str> {
        self.auto_addr_list.as_deref()
    }

    /// Whether a client is running behind this link.
    pub fn is_connected(&self) -> bool {
        self.client.lock().is_some()
    }

    #[cfg(not(feature = "channel-access"))]
    fn start_client(&self) -> Result<ClientSlot, LinkError> {
        Err(LinkError::Unavailable(format!(
            "this build has no channel-access client; rebuild with the `channel-access` feature (addr_list={}, auto_addr_list={})",
            self.addr_list.as_deref().unwrap_or("<unset>"),
            self.auto_addr_list.as_deref().unwrap_or("<unset>"),
        )))
    }

    #[cfg(feature = "channel-access")]
    fn start_client(&self) -> Result<ClientSlot, LinkError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            LinkError::Unavailable("the channel-access client needs a tokio runtime".into())
        })?;
        let targets = client::search_targets(self.addr_list(), self.auto_addr_list())?;
        client::ClientHandle::start(targets, &runtime)
    }
}

impl ProcessVariableLink for ChannelAccessLink {
    fn name(&self) -> &'static str {
        "channel-access"
    }

    fn connect(&self) -> Result<(), LinkError> {
        let mut slot = self.client.lock();
        if slot.is_none() {
            *slot = Some(self.start_client()?);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        pv: &str,
        handler: ValueHandler,
    ) -> Result<Box<dyn PvSubscription>, LinkError> {
        let slot = self.client.lock();
        let Some(client) = slot.as_ref() else {
            warn!(pv, "channel-access subscribe requested before connect");
            return Err(LinkError::Unavailable(
                "channel-access link is not connected".into(),
            ));
        };
        #[cfg(feature = "channel-access")]
        return client.monitor(pv, handler);
        #[cfg(not(feature = "channel-access"))]
        {
            drop(handler);
            match *client {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn carries_address_settings() {
        let config = LiveConfig {
            ca_addr_list: Some("10.1.1.255".into()),
            ca_auto_addr_list: Some("NO".into()),
            ..LiveConfig::default()
        };
        let link = ChannelAccessLink::from_config(&config);
        assert_eq!(link.addr_list(), Some("10.1.1.255"));
        assert_eq!(link.auto_addr_list(), Some("NO"));
    }

    #[test]
    fn subscribe_before_connect_is_rejected() {
        let link = ChannelAccessLink::default();
        assert!(!link.is_connected());
        let err = link
            .subscribe("PV", Arc::new(|_: crate::link::PvUpdate| {}))
            .err()
            .unwrap();
        assert!(matches!(err, LinkError::Unavailable(_)));
    }

    #[cfg(not(feature = "channel-access"))]
    #[test]
    fn reports_missing_client() {
        let link = ChannelAccessLink::default();
        let err = link.connect().unwrap_err();
        assert!(matches!(err, LinkError::Unavailable(ref msg) if msg.contains("channel-access")));
        assert!(!link.is_connected());
    }

    #[cfg(feature = "channel-access")]
    #[test]
    fn client_needs_a_runtime() {
        let link = ChannelAccessLink::default();
        let err = link.connect().unwrap_err();
        assert!(matches!(err, LinkError::Unavailable(ref msg) if msg.contains("runtime")));
    }

    #[cfg(feature = "channel-access")]
    #[tokio::test]
    async fn connect_starts_one_shared_client() {
        let link = ChannelAccessLink::new(Some("127.0.0.1:5064".into()), Some("NO".into()));
        link.connect().unwrap();
        link.connect().unwrap();
        let clone = link.clone();
        assert!(clone.is_connected());
        let mut monitor = clone
            .subscribe("SITE:PANEL:001:DC_POWER", Arc::new(|_: crate::link::PvUpdate| {}))
            .unwrap();
        assert_eq!(monitor.pv(), "SITE:PANEL:001:DC_POWER");
        monitor.cancel();
    }

    #[cfg(feature = "channel-access")]
    #[tokio::test]
    async fn connect_without_search_addresses_fails() {
        let link = ChannelAccessLink::new(None, Some("NO".into()));
        assert!(link.connect().is_err());
        assert!(!link.is_connected());
    }
}

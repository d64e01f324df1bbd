//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Provider relaying process-variable monitors from a hardware link."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use deaas_common::config::ResubscribeConfig;
use deaas_metrics::TelemetryMetrics;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::MetricCache;
use crate::emitter::{UpdateEmitter, UpdateListener};
use crate::error::TelemetryError;
use crate::link::{ProcessVariableLink, PvSubscription, PvUpdate, ValueHandler};
use crate::model::{AssetId, AssetKey, AssetKind, EventSource, MetricSet, UpdateEvent};
use crate::naming::PvNaming;
use crate::provider::TelemetryProvider;

/// Lifecycle of a single process-variable monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Unsubscribed,
    /// Requested but not established; retried by a later `ensure` or the resubscriber.
    Subscribing,
    Subscribed,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Unsubscribed => "unsubscribed",
            SubscriptionState::Subscribing => "subscribing",
            SubscriptionState::Subscribed => "subscribed",
        }
    }
}

/// Exponential backoff applied between resubscription rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random delay added to each wait.
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter,
        }
    }

    /// Delay before retry round `attempt` (1-indexed), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    fn jittered<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.delay(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            base
        } else {
            base + Duration::from_millis(rng.gen_range(0..=jitter_ms))
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&ResubscribeConfig::default())
    }
}

impl From<&ResubscribeConfig> for BackoffPolicy {
    fn from(config: &ResubscribeConfig) -> Self {
        Self::new(config.base_delay, config.max_delay, config.base_delay / 4)
    }
}

/// Cache and listener shared with the link's callback contexts.
struct LiveCore {
    cache: MetricCache,
    emitter: UpdateEmitter,
    running: AtomicBool,
}

impl LiveCore {
    fn apply(&self, key: AssetKey, metric: &'static str, update: PvUpdate) {
        let PvUpdate { pv, value } = update;
        let Some(snapshot) = self.cache.update(&key, |set| {
            set.set(metric, value);
            set.clone()
        }) else {
            debug!(pv = %pv, asset = %key, "value for asset without cache entry ignored");
            return;
        };
        if self.running.load(Ordering::Acquire) {
            self.emitter.emit(UpdateEvent::live(key, snapshot, pv));
        }
    }
}

struct MetricSubscription {
    key: AssetKey,
    metric: &'static str,
    state: SubscriptionState,
    in_flight: bool,
    handle: Option<Box<dyn PvSubscription>>,
}

struct Resubscriber {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct LiveShared {
    naming: PvNaming,
    link: Arc<dyn ProcessVariableLink>,
    core: Arc<LiveCore>,
    subscriptions: Mutex<HashMap<String, MetricSubscription>>,
    resubscriber: Mutex<Option<Resubscriber>>,
    metrics: Option<TelemetryMetrics>,
}

impl LiveShared {
    /// Open monitors for every PV selected by `select`.
    ///
    /// Selected entries are marked in flight under the table lock, the link is
    /// called without holding it, and outcomes are recorded afterwards. Link
    /// callbacks may therefore fire synchronously from `subscribe`.
    fn subscribe_where<F>(&self, select: F) -> usize
    where
        F: Fn(&str, &MetricSubscription) -> bool,
    {
        let batch: Vec<(String, AssetKey, &'static str)> = {
            let mut table = self.subscriptions.lock();
            table
                .iter_mut()
                .filter(|(pv, entry)| {
                    entry.state != SubscriptionState::Subscribed
                        && !entry.in_flight
                        && select(pv, entry)
                })
                .map(|(pv, entry)| {
                    entry.state = SubscriptionState::Subscribing;
                    entry.in_flight = true;
                    (pv.clone(), entry.key, entry.metric)
                })
                .collect()
        };

        let mut outcomes = Vec::with_capacity(batch.len());
        for (pv, key, metric) in batch {
            let core = self.core.clone();
            let handler: ValueHandler = Arc::new(move |update| core.apply(key, metric, update));
            let outcome = self.link.subscribe(&pv, handler);
            if let Err(err) = &outcome {
                warn!(pv = %pv, link = self.link.name(), error = %err, "process variable subscription failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_subscription_failure();
                }
            }
            outcomes.push((pv, outcome));
        }

        let mut established = 0;
        let mut table = self.subscriptions.lock();
        for (pv, outcome) in outcomes {
            let Some(entry) = table.get_mut(&pv) else {
                continue;
            };
            entry.in_flight = false;
            match outcome {
                Ok(handle) if self.core.running.load(Ordering::Acquire) => {
                    debug!(pv = %pv, "process variable subscribed");
                    entry.state = SubscriptionState::Subscribed;
                    entry.handle = Some(handle);
                    established += 1;
                }
                Ok(mut handle) => {
                    handle.cancel();
                    entry.state = SubscriptionState::Unsubscribed;
                }
                Err(_) => entry.state = SubscriptionState::Subscribing,
            }
        }
        self.publish_gauges(&table);
        established
    }

    fn pending(&self) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|entry| entry.state == SubscriptionState::Subscribing)
            .count()
    }

    fn retry_pending(&self) -> usize {
        if !self.core.running.load(Ordering::Acquire) {
            return 0;
        }
        self.subscribe_where(|_, entry| entry.state == SubscriptionState::Subscribing);
        self.pending()
    }

    fn publish_gauges(&self, table: &HashMap<String, MetricSubscription>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        for state in [
            SubscriptionState::Unsubscribed,
            SubscriptionState::Subscribing,
            SubscriptionState::Subscribed,
        ] {
            let count = table.values().filter(|entry| entry.state == state).count();
            metrics.set_subscriptions(state.as_str(), count);
        }
    }
}

/// Telemetry provider fed by process-variable monitors.
///
/// One monitor is opened per metric per asset. Each value report updates the
/// asset's cache entry and emits the asset's full snapshot, tagged with the
/// reporting PV.
pub struct LiveProvider {
    shared: Arc<LiveShared>,
}

impl LiveProvider {
    /// Build the provider over `link`, failing when the link is unusable.
    pub fn connect(
        prefix: &str,
        link: Arc<dyn ProcessVariableLink>,
        metrics: Option<TelemetryMetrics>,
    ) -> Result<Self, TelemetryError> {
        link.connect()
            .map_err(|source| TelemetryError::LinkUnavailable {
                link: link.name(),
                source,
            })?;
        let naming = PvNaming::new(prefix);
        info!(link = link.name(), prefix = naming.prefix(), "live telemetry link connected");
        let core = LiveCore {
            cache: MetricCache::new(),
            emitter: UpdateEmitter::new(metrics.clone()),
            running: AtomicBool::new(true),
        };
        Ok(Self {
            shared: Arc::new(LiveShared {
                naming,
                link,
                core: Arc::new(core),
                subscriptions: Mutex::new(HashMap::new()),
                resubscriber: Mutex::new(None),
                metrics,
            }),
        })
    }

    pub fn naming(&self) -> &PvNaming {
        &self.shared.naming
    }

    pub fn subscription_state(&self, pv: &str) -> SubscriptionState {
        self.shared
            .subscriptions
            .lock()
            .get(pv)
            .map_or(SubscriptionState::Unsubscribed, |entry| entry.state)
    }

    /// PVs whose monitor has been requested but not established, sorted.
    pub fn pending_subscriptions(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .shared
            .subscriptions
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state == SubscriptionState::Subscribing)
            .map(|(pv, _)| pv.clone())
            .collect();
        pending.sort();
        pending
    }

    pub fn subscribed_count(&self) -> usize {
        self.shared
            .subscriptions
            .lock()
            .values()
            .filter(|entry| entry.state == SubscriptionState::Subscribed)
            .count()
    }

    /// Re-attempt every pending monitor. Returns how many remain pending.
    pub fn retry_pending(&self) -> usize {
        self.shared.retry_pending()
    }

    /// Retry pending monitors in the background with exponential backoff.
    ///
    /// Requires a tokio runtime. A second call replaces the running task.
    pub fn spawn_resubscriber(&self, policy: BackoffPolicy) {
        let weak = Arc::downgrade(&self.shared);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(resubscribe_loop(weak, policy, stop_rx));
        let previous = self
            .shared
            .resubscriber
            .lock()
            .replace(Resubscriber { stop: stop_tx, task });
        if let Some(previous) = previous {
            previous.stop.send_replace(true);
        }
        debug!(
            base_delay_ms = policy.base_delay.as_millis() as u64,
            max_delay_ms = policy.max_delay.as_millis() as u64,
            "resubscriber started"
        );
    }

    pub fn has_resubscriber(&self) -> bool {
        self.shared
            .resubscriber
            .lock()
            .as_ref()
            .is_some_and(|resub| !resub.task.is_finished())
    }
}

async fn resubscribe_loop(
    shared: Weak<LiveShared>,
    policy: BackoffPolicy,
    mut stop: watch::Receiver<bool>,
) {
    let mut rng = StdRng::from_entropy();
    let mut attempt = 0u32;
    loop {
        let wait = if attempt == 0 {
            policy.base_delay
        } else {
            policy.jittered(attempt, &mut rng)
        };
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(wait) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if shared.pending() == 0 {
                    attempt = 0;
                    continue;
                }
                let remaining = shared.retry_pending();
                if remaining == 0 {
                    info!("all pending process variables subscribed");
                    attempt = 0;
                } else {
                    attempt = attempt.saturating_add(1);
                    debug!(remaining, attempt, "process variables still pending");
                }
            }
        }
    }
    debug!("resubscriber stopped");
}

impl TelemetryProvider for LiveProvider {
    fn source(&self) -> EventSource {
        EventSource::Live
    }

    fn ensure(&self, kind: AssetKind, id: AssetId) {
        let shared = &self.shared;
        if !shared.core.running.load(Ordering::Acquire) {
            debug!(kind = %kind, id, "ensure ignored after shutdown");
            return;
        }
        let key = AssetKey::new(kind, id);
        let inserted = shared
            .core
            .cache
            .insert_if_absent(key, || MetricSet::unknown(kind));

        let names = shared.naming.pv_names(kind, id);
        {
            let mut table = shared.subscriptions.lock();
            for (metric, pv) in &names {
                table
                    .entry(pv.clone())
                    .or_insert_with(|| MetricSubscription {
                        key,
                        metric: *metric,
                        state: SubscriptionState::Unsubscribed,
                        in_flight: false,
                        handle: None,
                    });
            }
        }
        let established = shared.subscribe_where(|_, entry| entry.key == key);

        if inserted {
            info!(asset = %key, established, "live asset watched");
            if let Some(metrics) = &shared.metrics {
                metrics.set_assets_watched(kind.as_str(), shared.core.cache.count(kind));
            }
        }
    }

    fn read(&self, kind: AssetKind, id: AssetId) -> MetricSet {
        self.shared
            .core
            .cache
            .snapshot_or_unknown(&AssetKey::new(kind, id))
    }

    fn on_update(&self, listener: UpdateListener) {
        if self.shared.core.emitter.register(listener) {
            debug!("live provider listener replaced");
        }
    }

    fn shutdown(&self) {
        let shared = &self.shared;
        if !shared.core.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(resub) = shared.resubscriber.lock().take() {
            resub.stop.send_replace(true);
        }
        let mut table = shared.subscriptions.lock();
        let mut cancelled = 0;
        for entry in table.values_mut() {
            if let Some(mut handle) = entry.handle.take() {
                handle.cancel();
                cancelled += 1;
            }
            entry.state = SubscriptionState::Unsubscribed;
        }
        shared.publish_gauges(&table);
        info!(cancelled, "live telemetry subscriptions released");
    }
}

impl Drop for LiveProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for LiveProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveProvider")
            .field("link", &self.shared.link.name())
            .field("prefix", &self.shared.naming.prefix())
            .field("watched", &self.shared.core.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::listener;
    use crate::link::LoopbackLink;
    use crate::model::metric;

    fn provider(link: &LoopbackLink) -> LiveProvider {
        LiveProvider::connect("PLANT1:BUS0", Arc::new(link.clone()), None).unwrap()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(750),
            Duration::ZERO,
        );
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(750));
        assert_eq!(policy.delay(40), Duration::from_millis(750));
    }

    #[test]
    fn unavailable_link_is_fatal() {
        let err = LiveProvider::connect("P", Arc::new(LoopbackLink::unavailable()), None)
            .unwrap_err();
        assert!(matches!(err, TelemetryError::LinkUnavailable { link: "loopback", .. }));
    }

    #[test]
    fn ensure_opens_one_monitor_per_metric() {
        let link = LoopbackLink::new();
        let provider = provider(&link);
        provider.ensure_panel(1);
        provider.ensure_panel(1);
        assert_eq!(link.total_subscribers(), 3);
        assert_eq!(link.subscribe_attempts(), 3);
        assert_eq!(
            provider.subscription_state("PLANT1:BUS0:PANEL:001:VOLTAGE"),
            SubscriptionState::Subscribed
        );
        assert_eq!(
            provider.subscription_state("PLANT1:BUS0:PANEL:002:VOLTAGE"),
            SubscriptionState::Unsubscribed
        );
    }

    #[test]
    fn value_reports_update_only_their_metric() {
        let link = LoopbackLink::new();
        let provider = provider(&link);
        provider.ensure_inverter(7);
        link.post("PLANT1:BUS0:INV:007:AC_POWER", 3210.0);

        let set = provider.read_inverter(7);
        assert_eq!(set.f64(metric::AC_POWER), Some(3210.0));
        assert!(!set.is_known(metric::STATUS));
    }

    #[test]
    fn events_carry_asset_snapshot_and_trigger() {
        let link = LoopbackLink::new();
        let provider = provider(&link);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        provider.on_update(listener(move |event| sink.lock().push(event)));

        provider.ensure_panel(2);
        link.post("PLANT1:BUS0:PANEL:002:VOLTAGE", 41.2);
        link.post("PLANT1:BUS0:PANEL:002:DC_POWER", 250.0);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        let last = &events[1];
        assert_eq!(last.key(), AssetKey::panel(2));
        assert_eq!(last.source, EventSource::Live);
        assert_eq!(last.pv.as_deref(), Some("PLANT1:BUS0:PANEL:002:DC_POWER"));
        assert_eq!(last.metrics.f64(metric::VOLTAGE), Some(41.2));
        assert_eq!(last.metrics.f64(metric::DC_POWER), Some(250.0));
    }

    #[test]
    fn failed_subscription_stays_pending_until_retry() {
        let link = LoopbackLink::new();
        let bad = "PLANT1:BUS0:INV:003:STATUS";
        link.reject(bad);
        let provider = provider(&link);

        provider.ensure_inverter(3);
        assert_eq!(provider.subscription_state(bad), SubscriptionState::Subscribing);
        assert_eq!(provider.pending_subscriptions(), vec![bad.to_owned()]);
        assert_eq!(provider.subscribed_count(), 1);

        link.post(bad, 2_i64);
        assert!(!provider.read_inverter(3).is_known(metric::STATUS));

        assert_eq!(provider.retry_pending(), 1);
        link.accept(bad);
        provider.ensure_inverter(3);
        assert_eq!(provider.subscription_state(bad), SubscriptionState::Subscribed);
        assert_eq!(
            provider.read_inverter(3).status(),
            Some(crate::model::InverterStatus::Fault)
        );
    }

    #[test]
    fn shutdown_releases_monitors_and_silences_events() {
        let link = LoopbackLink::new();
        let provider = provider(&link);
        let count = Arc::new(Mutex::new(0usize));
        let seen = count.clone();
        provider.on_update(listener(move |_| *seen.lock() += 1));

        provider.ensure_panel(1);
        link.post("PLANT1:BUS0:PANEL:001:CURRENT", 5.0);
        provider.shutdown();
        provider.shutdown();

        assert_eq!(link.total_subscribers(), 0);
        assert_eq!(link.post("PLANT1:BUS0:PANEL:001:CURRENT", 6.0), 0);
        assert_eq!(*count.lock(), 1);

        provider.ensure_panel(9);
        assert_eq!(link.total_subscribers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscriber_recovers_pending_monitors() {
        let link = LoopbackLink::new();
        let bad = "PLANT1:BUS0:PANEL:005:DC_POWER";
        link.reject(bad);
        let provider = provider(&link);
        provider.ensure_panel(5);
        assert_eq!(provider.pending_subscriptions().len(), 1);

        provider.spawn_resubscriber(BackoffPolicy::new(
            Duration::from_millis(50),
            Duration::from_millis(200),
            Duration::ZERO,
        ));
        assert!(provider.has_resubscriber());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(provider.subscription_state(bad), SubscriptionState::Subscribing);

        link.accept(bad);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(provider.subscription_state(bad), SubscriptionState::Subscribed);
        assert!(provider.pending_subscriptions().is_empty());

        provider.shutdown();
    }
}

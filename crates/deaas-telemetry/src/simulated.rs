//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Clock-driven provider fabricating plausible panel and inverter values."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use deaas_common::config::SimulationConfig;
use deaas_metrics::TelemetryMetrics;
use parking_lot::Mutex;
use rand::distributions::{Bernoulli, Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::MetricCache;
use crate::emitter::{UpdateEmitter, UpdateListener};
use crate::error::TelemetryError;
use crate::model::{
    metric, AssetId, AssetKey, AssetKind, EventSource, InverterStatus, MetricSet, UpdateEvent,
};
use crate::provider::TelemetryProvider;

/// Lower bound applied to the voltage divisor when deriving current.
const VOLTAGE_EPSILON: f64 = 0.1;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Fabricates panel readings: DC power in `[100, 380]` W, voltage in `[38, 44]` V.
#[derive(Debug, Clone)]
pub struct PanelSampler {
    power: Uniform<f64>,
    voltage: Uniform<f64>,
    initial_voltage: Uniform<f64>,
}

impl Default for PanelSampler {
    fn default() -> Self {
        Self {
            power: Uniform::new_inclusive(100.0, 380.0),
            voltage: Uniform::new(38.0, 44.0),
            initial_voltage: Uniform::new(40.0, 45.0),
        }
    }
}

impl PanelSampler {
    /// State allocated on first watch: no power yet, nominal open-circuit voltage.
    pub fn initial<R: Rng + ?Sized>(&self, rng: &mut R) -> MetricSet {
        let mut set = MetricSet::unknown(AssetKind::Panel);
        set.set(metric::DC_POWER, 0.0);
        set.set(metric::VOLTAGE, round2(self.initial_voltage.sample(rng)));
        set.set(metric::CURRENT, 0.0);
        set
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> MetricSet {
        let power = round2(self.power.sample(rng));
        let voltage = round2(self.voltage.sample(rng));
        let current = round2(power / voltage.max(VOLTAGE_EPSILON));
        let mut set = MetricSet::unknown(AssetKind::Panel);
        set.set(metric::DC_POWER, power);
        set.set(metric::VOLTAGE, voltage);
        set.set(metric::CURRENT, current);
        set
    }
}

/// Fabricates inverter readings with an independent fault draw per sample.
#[derive(Debug, Clone)]
pub struct InverterSampler {
    power: Uniform<f64>,
    fault: Bernoulli,
}

impl InverterSampler {
    pub fn new(fault_probability: f64) -> Result<Self, TelemetryError> {
        let fault = Bernoulli::new(fault_probability).map_err(|err| {
            TelemetryError::InvalidConfig(format!(
                "fault probability {fault_probability} rejected: {err}"
            ))
        })?;
        Ok(Self {
            power: Uniform::new_inclusive(1500.0, 4500.0),
            fault,
        })
    }

    pub fn initial(&self) -> MetricSet {
        let mut set = MetricSet::unknown(AssetKind::Inverter);
        set.set(metric::AC_POWER, 0.0);
        set.set(metric::STATUS, InverterStatus::Ok);
        set
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> MetricSet {
        let status = if self.fault.sample(rng) {
            InverterStatus::Fault
        } else {
            InverterStatus::Ok
        };
        let mut set = MetricSet::unknown(AssetKind::Inverter);
        set.set(metric::AC_POWER, round2(self.power.sample(rng)));
        set.set(metric::STATUS, status);
        set
    }
}

struct SimulationCore {
    cache: MetricCache,
    emitter: UpdateEmitter,
    rng: Mutex<StdRng>,
    panels: PanelSampler,
    inverters: InverterSampler,
    metrics: Option<TelemetryMetrics>,
}

impl SimulationCore {
    fn ensure(&self, key: AssetKey) -> bool {
        let inserted = self.cache.insert_if_absent(key, || match key.kind {
            AssetKind::Panel => self.panels.initial(&mut *self.rng.lock()),
            AssetKind::Inverter => self.inverters.initial(),
        });
        if inserted {
            debug!(asset = %key, "simulated asset watched");
            if let Some(metrics) = &self.metrics {
                metrics.set_assets_watched(key.kind.as_str(), self.cache.count(key.kind));
            }
        }
        inserted
    }

    /// Advance every watched asset once and emit one event per asset.
    fn tick(&self) -> usize {
        let keys = self.cache.keys(None);
        let fresh: Vec<(AssetKey, MetricSet)> = {
            let mut rng = self.rng.lock();
            keys.into_iter()
                .map(|key| {
                    let set = match key.kind {
                        AssetKind::Panel => self.panels.sample(&mut *rng),
                        AssetKind::Inverter => self.inverters.sample(&mut *rng),
                    };
                    (key, set)
                })
                .collect()
        };

        let mut emitted = 0;
        for (key, set) in fresh {
            if self.cache.replace(&key, set.clone())
                && self.emitter.emit(UpdateEvent::simulated(key, set))
            {
                emitted += 1;
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_tick();
        }
        emitted
    }
}

/// Telemetry provider backed by fabricated values.
///
/// [`SimulatedProvider::start`] spawns the ticking task on the current tokio
/// runtime; [`SimulatedProvider::manual`] leaves ticking to the caller.
pub struct SimulatedProvider {
    core: Arc<SimulationCore>,
    tick_interval: Duration,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedProvider {
    /// Build the provider without a background clock.
    pub fn manual(
        config: &SimulationConfig,
        metrics: Option<TelemetryMetrics>,
    ) -> Result<Self, TelemetryError> {
        if config.tick_interval.is_zero() {
            return Err(TelemetryError::InvalidConfig(
                "simulation tick interval must be positive".into(),
            ));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let core = SimulationCore {
            cache: MetricCache::new(),
            emitter: UpdateEmitter::new(metrics.clone()),
            rng: Mutex::new(rng),
            panels: PanelSampler::default(),
            inverters: InverterSampler::new(config.fault_probability)?,
            metrics,
        };
        let (stop, _) = watch::channel(false);
        Ok(Self {
            core: Arc::new(core),
            tick_interval: config.tick_interval,
            stop,
            task: Mutex::new(None),
        })
    }

    /// Build the provider and start ticking on the current tokio runtime.
    ///
    /// Fails with [`TelemetryError::NoRuntime`] when called outside one.
    pub fn start(
        config: &SimulationConfig,
        metrics: Option<TelemetryMetrics>,
    ) -> Result<Self, TelemetryError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TelemetryError::NoRuntime { provider: "mock" })?;
        let provider = Self::manual(config, metrics)?;
        provider.spawn_clock(&runtime);
        Ok(provider)
    }

    fn spawn_clock(&self, runtime: &tokio::runtime::Handle) {
        let core = self.core.clone();
        let period = self.tick_interval;
        let mut stop = self.stop.subscribe();
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            debug!("simulation clock stopped");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let emitted = core.tick();
                        debug!(emitted, "simulation tick");
                    }
                }
            }
        });
        info!(tick_interval_ms = period.as_millis() as u64, "simulation clock started");
        *self.task.lock() = Some(handle);
    }

    /// Run one tick synchronously; returns the number of events delivered.
    pub fn tick(&self) -> usize {
        self.core.tick()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn watched(&self) -> Vec<AssetKey> {
        self.core.cache.keys(None)
    }

    /// Wait for the clock task to exit after [`TelemetryProvider::shutdown`].
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "simulation clock task join error");
            }
        }
    }
}

impl TelemetryProvider for SimulatedProvider {
    fn source(&self) -> EventSource {
        EventSource::Mock
    }

    fn ensure(&self, kind: AssetKind, id: AssetId) {
        self.core.ensure(AssetKey::new(kind, id));
    }

    fn read(&self, kind: AssetKind, id: AssetId) -> MetricSet {
        self.core.cache.snapshot_or_unknown(&AssetKey::new(kind, id))
    }

    fn on_update(&self, listener: UpdateListener) {
        if self.core.emitter.register(listener) {
            debug!("simulated provider listener replaced");
        }
    }

    fn shutdown(&self) {
        if !*self.stop.borrow() {
            info!("stopping simulation clock");
        }
        self.stop.send_replace(true);
    }
}

impl Drop for SimulatedProvider {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

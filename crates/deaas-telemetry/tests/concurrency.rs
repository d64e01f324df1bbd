//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "Concurrent ensure, tick, and read against shared providers."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use deaas_common::config::SimulationConfig;
use deaas_telemetry::model::metric;
use deaas_telemetry::{
    listener, LiveProvider, LoopbackLink, SimulatedProvider, TelemetryProvider,
};

const THREADS: usize = 8;

#[test]
fn concurrent_ensure_creates_single_entries() {
    let provider = Arc::new(SimulatedProvider::manual(&SimulationConfig::default(), None).unwrap());
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let provider = provider.clone();
            thread::spawn(move || {
                for id in 0..50 {
                    provider.ensure_panel(id);
                    provider.ensure_inverter(id);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(provider.watched().len(), 100);
}

#[test]
fn readers_never_observe_partial_panel_updates() {
    let provider = Arc::new(SimulatedProvider::manual(&SimulationConfig::default(), None).unwrap());
    for id in 1..=4 {
        provider.ensure_panel(id);
    }
    provider.tick();

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let provider = provider.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    provider.tick();
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..THREADS)
        .map(|_| {
            let provider = provider.clone();
            thread::spawn(move || {
                for round in 0..2_000u32 {
                    let set = provider.read_panel(round % 4 + 1);
                    let dc = set.f64(metric::DC_POWER).unwrap();
                    let voltage = set.f64(metric::VOLTAGE).unwrap();
                    let current = set.f64(metric::CURRENT).unwrap();
                    let expected = ((dc / voltage) * 100.0).round() / 100.0;
                    assert!(
                        (current - expected).abs() < 1e-9,
                        "torn read: dc={dc} voltage={voltage} current={current}"
                    );
                }
            })
        })
        .collect();
    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }
}

#[test]
fn live_monitors_are_opened_once_under_contention() {
    let link = LoopbackLink::new();
    let provider = Arc::new(LiveProvider::connect("SITE", Arc::new(link.clone()), None).unwrap());
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    provider.on_update(listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let provider = provider.clone();
            thread::spawn(move || {
                for id in 0..10 {
                    provider.ensure_inverter(id);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(link.total_subscribers(), 20);

    let posters: Vec<_> = (0..4)
        .map(|worker| {
            let link = link.clone();
            thread::spawn(move || {
                for id in 0..10usize {
                    link.post(&format!("SITE:INV:{id:03}:AC_POWER"), (worker * 100 + id) as f64);
                }
            })
        })
        .collect();
    for handle in posters {
        handle.join().unwrap();
    }
    assert_eq!(delivered.load(Ordering::SeqCst), 40);
    for id in 0..10 {
        assert!(provider.read_inverter(id).is_known(metric::AC_POWER));
    }
}

#[test]
fn distinct_metric_writers_never_tear_or_regress() {
    const GENERATIONS: u32 = 2_000;
    // Each writer owns one metric and tags its values with a disjoint offset.
    const WRITERS: [(&str, f64); 3] = [
        (metric::DC_POWER, 0.0),
        (metric::VOLTAGE, 10_000.0),
        (metric::CURRENT, 20_000.0),
    ];

    let link = LoopbackLink::new();
    let provider = Arc::new(LiveProvider::connect("SITE", Arc::new(link.clone()), None).unwrap());
    provider.ensure_panel(1);

    let writers: Vec<_> = WRITERS
        .iter()
        .map(|&(name, offset)| {
            let link = link.clone();
            thread::spawn(move || {
                let pv = format!("SITE:PANEL:001:{name}");
                for generation in 0..GENERATIONS {
                    link.post(&pv, offset + f64::from(generation));
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..THREADS)
        .map(|_| {
            let provider = provider.clone();
            thread::spawn(move || {
                let mut last = [None::<f64>; 3];
                for _ in 0..5_000 {
                    let set = provider.read_panel(1);
                    for (slot, &(name, offset)) in WRITERS.iter().enumerate() {
                        let seen = set.f64(name);
                        if let Some(value) = seen {
                            let generation = value - offset;
                            assert!(
                                generation.fract() == 0.0
                                    && (0.0..f64::from(GENERATIONS)).contains(&generation),
                                "{name} holds {value}, which no writer posted"
                            );
                        }
                        // `None` orders below any value, so this also rejects
                        // a metric reverting to unknown.
                        assert!(
                            seen >= last[slot],
                            "{name} went backwards: {seen:?} after {:?}",
                            last[slot]
                        );
                        last[slot] = seen;
                    }
                }
            })
        })
        .collect();
    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }

    let final_set = provider.read_panel(1);
    for &(name, offset) in &WRITERS {
        assert_eq!(final_set.f64(name), Some(offset + f64::from(GENERATIONS - 1)));
    }
}

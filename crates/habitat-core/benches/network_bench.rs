//! Criterion benchmarks for the network tick pipeline.
//!
//! Two benchmark groups:
//! - `tank_chain`: 200 tanks in a line joined by manual and residual branches
//! - `iterative_loop`: a pressure-driven chain of flow junctions solved as one
//!   iterative group

use criterion::{Criterion, criterion_group, criterion_main};
use habitat_core::builder::NetworkBuilder;
use habitat_core::network::Network;
use habitat_core::phase::{PhaseMode, PhaseSpec};
use habitat_core::solver::{FlowLaw, IterativeConfig, SolverHandler};
use habitat_core::store::Capacity;
use habitat_core::test_utils::*;

// ===========================================================================
// Network builders
// ===========================================================================

/// 200 tanks `T0 -> T1 -> ...`; even links are manual, odd links residual.
fn build_tank_chain(len: usize) -> Network {
    let registry = water_registry();
    let mut b = NetworkBuilder::new(registry.clone());
    for i in 0..len {
        let store = b.create_store(&format!("T{i}"), Capacity::Dynamic).unwrap();
        let phase = b
            .create_phase(
                store,
                PhaseSpec::liquid(
                    "Water",
                    single(&registry, 100.0),
                    ROOM_TEMPERATURE,
                    AMBIENT_PRESSURE,
                ),
            )
            .unwrap();
        b.create_port(phase, "In").unwrap();
        b.create_port(phase, "Out").unwrap();
    }
    for i in 0..len - 1 {
        let name = format!("L{i}");
        b.connect(&name, &format!("T{i}.Out"), &format!("T{}.In", i + 1))
            .unwrap();
        // A residual link passes on what its upstream tank receives.
        let handler = if i % 2 == 0 {
            SolverHandler::manual(0.1)
        } else {
            SolverHandler::residual()
        };
        b.set_handler(&name, handler).unwrap();
    }
    b.build().unwrap()
}

/// Boundary supply and exhaust joined through `junctions` flow phases.
fn build_iterative_chain(junctions: usize) -> Network {
    let registry = air_registry();
    let air = registry.vector(&[("N2", 0.78), ("O2", 0.22)]).unwrap();
    let mut b = NetworkBuilder::new(registry);
    let add = |b: &mut NetworkBuilder, name: &str, mode: PhaseMode, pressure: f64| {
        let store = b.create_store(name, Capacity::Fixed(1.0)).unwrap();
        let phase = b
            .create_phase(
                store,
                PhaseSpec::gas("Air", 0.5, air.clone(), ROOM_TEMPERATURE)
                    .mode(mode)
                    .pressure(pressure),
            )
            .unwrap();
        b.create_port(phase, "In").unwrap();
        b.create_port(phase, "Out").unwrap();
    };
    add(&mut b, "Supply", PhaseMode::Boundary, 2e5);
    for i in 0..junctions {
        add(&mut b, &format!("J{i}"), PhaseMode::Flow, 1.5e5);
    }
    add(&mut b, "Exhaust", PhaseMode::Boundary, 1e5);

    let group = b.create_iterative_group_with(IterativeConfig::default()).unwrap();
    let law = FlowLaw::Linear { conductance: 1e-5 };
    let mut names = vec!["Supply".to_string()];
    names.extend((0..junctions).map(|i| format!("J{i}")));
    names.push("Exhaust".to_string());
    for (i, pair) in names.windows(2).enumerate() {
        let name = format!("B{i}");
        b.connect(&name, &format!("{}.Out", pair[0]), &format!("{}.In", pair[1]))
            .unwrap();
        b.set_handler(&name, SolverHandler::iterative(group, law)).unwrap();
    }
    b.build().unwrap()
}

// ===========================================================================
// Benchmarks
// ===========================================================================

fn bench_tank_chain(c: &mut Criterion) {
    let mut net = build_tank_chain(200);
    c.bench_function("tank_chain_tick", |b| {
        b.iter(|| net.step());
    });
}

fn bench_iterative_loop(c: &mut Criterion) {
    let mut net = build_iterative_chain(20);
    c.bench_function("iterative_loop_tick", |b| {
        b.iter(|| net.step());
    });
}

criterion_group!(benches, bench_tank_chain, bench_iterative_loop);
criterion_main!(benches);

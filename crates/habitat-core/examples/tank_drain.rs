//! Tank drain example: one tank emptied into a sink by a manual branch.
//!
//! Builds a substance registry with water, a 10 kg tank and an empty sink,
//! drains the tank at 1 kg/s and prints both masses every simulated second.
//! The step shrinks as the tank empties; once it is dry the branch is held
//! at zero and the tick reports a negative-mass degradation.
//!
//! Run with: `cargo run -p habitat-core --example tank_drain`

use std::sync::Arc;

use habitat_core::builder::NetworkBuilder;
use habitat_core::phase::PhaseSpec;
use habitat_core::registry::RegistryBuilder;
use habitat_core::solver::SolverHandler;
use habitat_core::store::Capacity;

fn main() {
    // --- Step 1: Substances ---

    let mut registry = RegistryBuilder::new();
    registry
        .register("H2O", 0.018015, 998.0, 4186.0)
        .expect("register water");
    let registry = Arc::new(registry.build().expect("registry"));

    // --- Step 2: Matter structure ---

    let mut b = NetworkBuilder::new(Arc::clone(&registry));
    let tank = b.create_store("Tank", Capacity::Fixed(0.02)).expect("tank");
    let water = registry.vector(&[("H2O", 10.0)]).expect("water");
    let phase = b
        .create_phase(tank, PhaseSpec::liquid("Water", water, 293.15, 101_325.0))
        .expect("tank water");
    b.create_port(phase, "Out").expect("tank port");

    let sink = b.create_store("Sink", Capacity::Dynamic).expect("sink");
    let phase = b
        .create_phase(sink, PhaseSpec::liquid("Water", registry.zeros(), 293.15, 101_325.0))
        .expect("sink water");
    b.create_port(phase, "In").expect("sink port");

    // --- Step 3: Branch and handler ---

    b.connect("Drain", "Tank.Out", "Sink.In").expect("drain");
    b.set_handler("Drain", SolverHandler::manual(1.0)).expect("handler");
    let mut net = b.build().expect("network builds");

    let tank = net.phase_id("Tank.Water").expect("tank id");
    let sink = net.phase_id("Sink.Water").expect("sink id");

    // --- Step 4: Run ---

    for second in 1..=12 {
        let result = net.advance_to(second as f64);
        let tank = net.phase(tank).expect("tank phase");
        let sink = net.phase(sink).expect("sink phase");
        println!(
            "t={:>4.1}s  tank={:>7.4} kg  sink={:>7.4} kg  ticks={:>3}  degraded={}",
            net.time(),
            tank.mass(),
            sink.mass(),
            result.steps_run,
            result.degraded_steps,
        );
    }
}

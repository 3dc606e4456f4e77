//! Pressure loop example: a junction between two reservoirs solved as one
//! iterative group.
//!
//! A 2 bar supply feeds a 1 bar exhaust through a flow junction. Both links
//! are linear resistances in the same iterative multibranch group, which
//! settles the junction pressure and the loop flow each tick.
//!
//! Run with: `cargo run -p habitat-core --example pressure_loop`

use std::sync::Arc;

use habitat_core::builder::NetworkBuilder;
use habitat_core::phase::{PhaseMode, PhaseSpec};
use habitat_core::registry::RegistryBuilder;
use habitat_core::solver::{FlowLaw, SolverHandler};
use habitat_core::store::Capacity;

fn main() {
    let mut registry = RegistryBuilder::new();
    registry.register("N2", 0.028, 808.0, 1040.0).expect("N2");
    registry.register("O2", 0.032, 1141.0, 918.0).expect("O2");
    let registry = Arc::new(registry.build().expect("registry"));
    let air = registry
        .vector(&[("N2", 0.78), ("O2", 0.22)])
        .expect("air");

    let mut b = NetworkBuilder::new(Arc::clone(&registry));
    for (store, mode, pressure) in [
        ("Supply", PhaseMode::Boundary, 2e5),
        ("Junction", PhaseMode::Flow, 1.5e5),
        ("Exhaust", PhaseMode::Boundary, 1e5),
    ] {
        let id = b.create_store(store, Capacity::Fixed(1.0)).expect("store");
        let phase = b
            .create_phase(
                id,
                PhaseSpec::gas("Air", 0.5, air.clone(), 293.15)
                    .mode(mode)
                    .pressure(pressure),
            )
            .expect("phase");
        b.create_port(phase, "In").expect("inlet");
        b.create_port(phase, "Out").expect("outlet");
    }

    let group = b.create_iterative_group();
    let law = FlowLaw::Linear { conductance: 1e-5 };
    for (name, from, to) in [
        ("Inlet", "Supply.Out", "Junction.In"),
        ("Outlet", "Junction.Out", "Exhaust.In"),
    ] {
        b.connect(name, from, to).expect("branch");
        b.set_handler(name, SolverHandler::iterative(group, law))
            .expect("handler");
    }
    let mut net = b.build().expect("network builds");

    let report = net.step();
    println!("tick {} at t={:.3}s, degraded: {}", report.tick, net.time(), report.is_degraded());
    for snapshot in net.snapshot_all_branches() {
        println!("  {:<8} {:>8.4} kg/s", snapshot.name, snapshot.rate);
    }
    let junction = net.phase_id("Junction.Air").expect("junction");
    let junction = net.snapshot_phase(junction).expect("snapshot");
    println!("  junction pressure {:.1} Pa", junction.pressure);
}

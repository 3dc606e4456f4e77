//! Shared test helpers for unit tests, integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests and benchmarks (via the
//! `test-utils` feature).

use std::sync::Arc;

use crate::builder::NetworkBuilder;
use crate::config::EngineConfig;
use crate::network::Network;
use crate::phase::{PhaseMode, PhaseSpec};
use crate::registry::{Registry, RegistryBuilder};
use crate::solver::{FlowLaw, IterativeConfig, SolverHandler};
use crate::store::Capacity;

/// Room temperature used by every scenario, in K.
pub const ROOM_TEMPERATURE: f64 = 293.15;

/// Ambient pressure used by condensed scenario phases, in Pa.
pub const AMBIENT_PRESSURE: f64 = 101_325.0;

// ===========================================================================
// Registries
// ===========================================================================

/// A registry holding only water.
pub fn water_registry() -> Arc<Registry> {
    let mut b = RegistryBuilder::new();
    b.register("H2O", 0.018_015, 998.0, 4186.0)
        .expect("water registers");
    Arc::new(b.build().expect("registry builds"))
}

/// Cabin air constituents plus water: N2, O2, CO2, H2O in that order.
pub fn air_registry() -> Arc<Registry> {
    let mut b = RegistryBuilder::new();
    b.register("N2", 0.028_014, 808.0, 1040.0).expect("N2");
    b.register("O2", 0.031_998, 1141.0, 918.0).expect("O2");
    b.register("CO2", 0.044_009, 1101.0, 844.0).expect("CO2");
    b.register("H2O", 0.018_015, 998.0, 4186.0).expect("H2O");
    Arc::new(b.build().expect("registry builds"))
}

/// Mass vector with `kg` of the first substance and nothing else.
pub fn single(registry: &Registry, kg: f64) -> Vec<f64> {
    let mut masses = registry.zeros();
    masses[0] = kg;
    masses
}

// ===========================================================================
// Drain: Tank.Water --Drain (manual)--> Sink.Water
// ===========================================================================

/// A tank holding `mass` kg of the first substance drained at `rate` kg/s
/// into an empty, unbounded sink. The builder is returned so callers can add
/// processors, observers or further wiring before building.
pub fn drain_builder(
    registry: Arc<Registry>,
    config: EngineConfig,
    mass: f64,
    rate: f64,
) -> NetworkBuilder {
    let tank_masses = single(&registry, mass);
    let sink_masses = registry.zeros();
    let mut b = NetworkBuilder::with_config(registry, config);

    let tank = b.create_store("Tank", Capacity::Fixed(1.0)).expect("tank store");
    let water = b
        .create_phase(
            tank,
            PhaseSpec::liquid("Water", tank_masses, ROOM_TEMPERATURE, AMBIENT_PRESSURE),
        )
        .expect("tank phase");
    b.create_port(water, "Out").expect("tank port");

    let sink = b.create_store("Sink", Capacity::Dynamic).expect("sink store");
    let water = b
        .create_phase(
            sink,
            PhaseSpec::liquid("Water", sink_masses, ROOM_TEMPERATURE, AMBIENT_PRESSURE),
        )
        .expect("sink phase");
    b.create_port(water, "In").expect("sink port");

    b.connect("Drain", "Tank.Out", "Sink.In").expect("drain branch");
    b.set_handler("Drain", SolverHandler::manual(rate))
        .expect("drain handler");
    b
}

/// [`drain_builder`] with default settings, built.
pub fn drain_network(registry: Arc<Registry>, mass: f64, rate: f64) -> Network {
    drain_builder(registry, EngineConfig::default(), mass, rate)
        .build()
        .expect("drain network builds")
}

// ===========================================================================
// Overflow: Tank --Fill (manual)--> Buffer --Overflow (residual)--> Sink
// ===========================================================================

/// Water is pumped from a tank into a buffer at `rate` kg/s; a residual
/// branch carries away whatever the buffer receives.
pub fn overflow_network(buffer_mass: f64, rate: f64) -> Network {
    let registry = water_registry();
    let mut b = drain_builder(Arc::clone(&registry), EngineConfig::default(), 100.0, rate);

    let buffer = b
        .create_store("Buffer", Capacity::Fixed(1.0))
        .expect("buffer store");
    let water = b
        .create_phase(
            buffer,
            PhaseSpec::liquid(
                "Water",
                single(&registry, buffer_mass),
                ROOM_TEMPERATURE,
                AMBIENT_PRESSURE,
            ),
        )
        .expect("buffer phase");
    b.create_port(water, "In").expect("buffer inlet");
    b.create_port(water, "Out").expect("buffer outlet");

    let sink = b.phase_id("Sink.Water").expect("sink phase");
    b.create_port(sink, "Overflow").expect("sink overflow port");
    let tank = b.phase_id("Tank.Water").expect("tank phase");
    b.create_port(tank, "Fill").expect("tank fill port");

    b.connect("Fill", "Tank.Fill", "Buffer.In").expect("fill branch");
    b.set_handler("Fill", SolverHandler::manual(rate))
        .expect("fill handler");
    b.connect("Overflow", "Buffer.Out", "Sink.Overflow")
        .expect("overflow branch");
    b.set_handler("Overflow", SolverHandler::residual())
        .expect("overflow handler");
    b.build().expect("overflow network builds")
}

// ===========================================================================
// Pressure chain: Supply (boundary) -> Junction1..N (flow) -> Exhaust (boundary)
// ===========================================================================

/// Two boundary gas reservoirs at `p_high` and `p_low` joined through
/// `junctions` flow nodes in series, every link an iterative branch with the
/// same `law`. Links are named `Inlet`, `Link1`..`Link{N-1}` and `Outlet`.
/// Every junction starts at `p_low`, away from the solved pressures.
pub fn iterative_builder(
    p_high: f64,
    p_low: f64,
    junctions: usize,
    law: FlowLaw,
    group_config: IterativeConfig,
) -> NetworkBuilder {
    let registry = air_registry();
    let air = registry
        .vector(&[("N2", 0.78), ("O2", 0.22)])
        .expect("air vector");
    let mut b = NetworkBuilder::new(registry);

    let boundary = |name: &str, pressure: f64| {
        PhaseSpec::gas(name, 1.0, air.clone(), ROOM_TEMPERATURE)
            .mode(PhaseMode::Boundary)
            .pressure(pressure)
    };

    let supply = b.create_store("Supply", Capacity::Fixed(1.0)).expect("supply");
    let phase = b.create_phase(supply, boundary("Air", p_high)).expect("supply air");
    b.create_port(phase, "Out").expect("supply port");

    let exhaust = b.create_store("Exhaust", Capacity::Fixed(1.0)).expect("exhaust");
    let phase = b.create_phase(exhaust, boundary("Air", p_low)).expect("exhaust air");
    b.create_port(phase, "In").expect("exhaust port");

    for k in 1..=junctions {
        let store = b
            .create_store(&format!("Junction{k}"), Capacity::Fixed(1.0))
            .expect("junction");
        let phase = b
            .create_phase(
                store,
                PhaseSpec::gas("Air", 0.001, air.clone(), ROOM_TEMPERATURE)
                    .mode(PhaseMode::Flow)
                    .pressure(p_low),
            )
            .expect("junction air");
        b.create_port(phase, "In").expect("junction inlet");
        b.create_port(phase, "Out").expect("junction outlet");
    }

    let group = b
        .create_iterative_group_with(group_config)
        .expect("group config");
    let mut links = vec![("Inlet".to_string(), "Supply.Out".to_string(), "Junction1.In".to_string())];
    for k in 1..junctions {
        links.push((
            format!("Link{k}"),
            format!("Junction{k}.Out"),
            format!("Junction{}.In", k + 1),
        ));
    }
    links.push((
        "Outlet".to_string(),
        format!("Junction{junctions}.Out"),
        "Exhaust.In".to_string(),
    ));
    for (name, left, right) in &links {
        b.connect(name, left, right).expect("link");
        b.set_handler(name, SolverHandler::iterative(group, law))
            .expect("link handler");
    }
    b
}

/// [`iterative_builder`] with 2 bar / 1 bar reservoirs, one junction and a
/// conductance of 1e-5 kg/(s·Pa), which settles at 0.5 kg/s.
pub fn iterative_network(group_config: IterativeConfig) -> Network {
    let law = FlowLaw::Linear { conductance: 1e-5 };
    iterative_builder(2e5, 1e5, 1, law, group_config)
        .build()
        .expect("iterative network builds")
}

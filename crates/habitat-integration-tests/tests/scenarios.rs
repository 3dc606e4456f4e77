//! End-to-end scenarios on small reference networks.
//!
//! Each test drives a network through the public API only and checks the
//! bookkeeping a caller relies on: drained tanks stop at zero, residual
//! branches balance their node, iterative groups reach the analytic flow and
//! interval handlers hold their rate between resolutions.

use habitat_core::builder::NetworkBuilder;
use habitat_core::clock::TimeStepConfig;
use habitat_core::config::EngineConfig;
use habitat_core::network::Network;
use habitat_core::observer::TimeSeriesRecorder;
use habitat_core::phase::{PhaseMode, PhaseSpec};
use habitat_core::solver::{FlowLaw, IterativeConfig, SolverHandler};
use habitat_core::store::Capacity;
use habitat_core::test_utils::*;

// ===========================================================================
// Helpers
// ===========================================================================

fn mass_of(net: &Network, phase: &str) -> f64 {
    net.phase(net.phase_id(phase).unwrap()).unwrap().mass()
}

fn rate_of(net: &Network, branch: &str) -> f64 {
    net.branch(net.branch_id(branch).unwrap()).unwrap().flow_rate()
}

/// Default phase thresholds, but never more than a second per step.
fn capped_at_one_second() -> EngineConfig {
    EngineConfig {
        clock: TimeStepConfig {
            max_step: 1.0,
            ..TimeStepConfig::default()
        },
        ..EngineConfig::default()
    }
}

// ===========================================================================
// Manual drain
// ===========================================================================

#[test]
fn drain_reaches_half_then_empty() {
    let mut net = drain_builder(water_registry(), capped_at_one_second(), 10.0, 1.0)
        .build()
        .unwrap();

    net.advance_to(5.0);
    assert!((mass_of(&net, "Tank.Water") - 5.0).abs() < 1e-6);
    assert!((mass_of(&net, "Sink.Water") - 5.0).abs() < 1e-6);

    net.advance_to(10.0);
    assert!(mass_of(&net, "Tank.Water") < 1e-6);

    let result = net.advance_to(12.0);
    assert!(result.degraded_steps > 0);
    let tank = net.phase_id("Tank.Water").unwrap();
    assert!(result.last.unwrap().negative_mass().any(|(p, _, _)| p == tank));
    assert_eq!(mass_of(&net, "Tank.Water"), 0.0);
    assert_eq!(rate_of(&net, "Drain"), 0.0);
    assert!((mass_of(&net, "Sink.Water") - 10.0).abs() < 1e-9);
}

#[test]
fn adaptive_steps_shrink_as_the_tank_empties() {
    let mut net = drain_builder(water_registry(), capped_at_one_second(), 10.0, 1.0)
        .build()
        .unwrap();
    net.advance_to(6.0);
    let early = net.step().next_step;
    net.advance_to(9.0);
    let late = net.step().next_step;
    assert!(late < early, "{late} !< {early}");
    // 25% of the remaining mass per step at 1 kg/s.
    let remaining = mass_of(&net, "Tank.Water");
    assert!((late - 0.25 * remaining).abs() < 1e-6);
}

// ===========================================================================
// Residual balance
// ===========================================================================

#[test]
fn residual_matches_manual_inflow() {
    let mut net = overflow_network(5.0, 2.0);
    let tank = net.store_id("Tank").unwrap();
    let buffer = net.store_id("Buffer").unwrap();
    let sink = net.store_id("Sink").unwrap();
    let store_mass = |net: &Network, store| -> f64 {
        net.phases()
            .filter(|(_, p)| p.store() == store)
            .map(|(_, p)| p.mass())
            .sum()
    };

    for _ in 0..20 {
        let before = [store_mass(&net, tank), store_mass(&net, buffer), store_mass(&net, sink)];
        let report = net.step();
        assert_eq!(rate_of(&net, "Fill"), 2.0);
        assert_eq!(rate_of(&net, "Overflow"), 2.0);

        // The tank also feeds the sink through its 2 kg/s drain.
        let moved = 4.0 * report.dt;
        assert!((store_mass(&net, tank) - (before[0] - moved)).abs() < 1e-9);
        assert!((store_mass(&net, buffer) - before[1]).abs() < 1e-12);
        assert!((store_mass(&net, sink) - (before[2] + moved)).abs() < 1e-9);
    }
}

#[test]
fn phases_integrate_their_net_rates() {
    let mut net = overflow_network(5.0, 2.0);
    for _ in 0..10 {
        let before: Vec<(String, Vec<f64>)> = net
            .phases()
            .map(|(_, p)| (p.name().to_string(), p.masses().to_vec()))
            .collect();
        let report = net.step();
        for ((_, phase), (name, masses)) in net.phases().zip(&before) {
            assert_eq!(phase.name(), name);
            for (i, m) in masses.iter().enumerate() {
                let expected = m + phase.net_rates()[i] * report.dt;
                assert!((phase.masses()[i] - expected).abs() < 1e-12);
                assert!(phase.masses()[i] >= 0.0);
            }
        }
    }
}

// ===========================================================================
// Iterative multibranch
// ===========================================================================

#[test]
fn pressure_chain_settles_at_analytic_flow() {
    let mut net = iterative_network(IterativeConfig::default());
    let report = net.step();
    assert_eq!(report.non_converged().count(), 0);
    // (2 bar - 1 bar) / 2 links * 1e-5 kg/(s·Pa)
    assert!((rate_of(&net, "Inlet") - 0.5).abs() < 1e-6);
    assert!((rate_of(&net, "Outlet") - 0.5).abs() < 1e-6);
}

#[test]
fn iteration_cap_reports_non_convergence() {
    let mut net = iterative_network(IterativeConfig {
        max_iterations: 1,
        ..IterativeConfig::default()
    });
    let report = net.step();
    assert_eq!(report.non_converged().count(), 1);
    // The tick still completes with the last iterate.
    assert!(rate_of(&net, "Inlet").is_finite());
    assert_eq!(net.last_report(), Some(&report));
}

// ===========================================================================
// Interval handler
// ===========================================================================

#[test]
fn interval_rate_only_changes_at_resolutions() {
    let registry = air_registry();
    let air = registry.vector(&[("N2", 0.78), ("O2", 0.22)]).unwrap();
    let config = EngineConfig {
        clock: TimeStepConfig {
            initial_step: 0.2,
            min_step: 1e-8,
            max_step: 0.2,
        },
        ..EngineConfig::default()
    };
    let mut b = NetworkBuilder::with_config(registry, config);
    let supply = b.create_store("Supply", Capacity::Dynamic).unwrap();
    let phase = b
        .create_phase(
            supply,
            PhaseSpec::gas("Air", 1.0, air.clone(), ROOM_TEMPERATURE)
                .mode(PhaseMode::Boundary)
                .pressure(3e5),
        )
        .unwrap();
    b.create_port(phase, "Out").unwrap();
    let tank = b.create_store("Tank", Capacity::Fixed(1.0)).unwrap();
    let phase = b
        .create_phase(tank, PhaseSpec::gas("Air", 1.0, air, ROOM_TEMPERATURE))
        .unwrap();
    b.create_port(phase, "In").unwrap();
    b.connect("Valve", "Supply.Out", "Tank.In").unwrap();
    b.set_handler(
        "Valve",
        SolverHandler::interval(FlowLaw::Linear { conductance: 1e-6 }, 1.0),
    )
    .unwrap();
    let valve = b.branch_id("Valve").unwrap();
    b.add_observer(Box::new(TimeSeriesRecorder::new(Vec::new(), vec![valve])));
    let mut net = b.build().unwrap();

    net.advance_to(4.0);
    let series = net.observer::<TimeSeriesRecorder>().unwrap().branch_series(0);
    assert!(series.len() >= 20);
    // A tick ending at time t in (k, k+1] started inside [k, k+1).
    let interval_of = |t: f64| (t - 1e-9).floor();
    for pair in series.windows(2) {
        let ((t0, r0), (t1, r1)) = (pair[0], pair[1]);
        if interval_of(t0) == interval_of(t1) {
            assert_eq!(r0, r1, "rate changed inside interval at {t1}");
        }
    }
    // The tank fills, so each resolution sees a smaller pressure difference.
    let first = series.first().unwrap().1;
    let last = series.last().unwrap().1;
    assert!(first > last && last > 0.0);
}

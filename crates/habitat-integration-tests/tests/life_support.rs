//! Cross-crate life-support loop tests.
//!
//! Substances, a named cabin-air mixture and engine settings are loaded from
//! a data directory by `habitat-data`; the network is then assembled with
//! `habitat-core`: a crewed cabin whose air is circulated through a CO2
//! scrubber subsystem wired in through its interfaces.

use std::any::Any;
use std::fs;
use std::path::PathBuf;

use habitat_core::branch::BranchEnd;
use habitat_core::builder::NetworkBuilder;
use habitat_core::error::SetupError;
use habitat_core::network::Network;
use habitat_core::observer::TimeSeriesRecorder;
use habitat_core::phase::{Phase, PhaseSpec};
use habitat_core::processor::{Adsorber, ManualManipulator};
use habitat_core::solver::{ManualFlow, SolverHandler};
use habitat_core::store::Capacity;
use habitat_core::subsystem::{ExecContext, Subsystem};
use habitat_core::test_utils::{AMBIENT_PRESSURE, ROOM_TEMPERATURE};
use habitat_data::{DataLoadError, HabitatData, load_habitat_data};

// ===========================================================================
// Data directory
// ===========================================================================

const SUBSTANCES: &str = r#"
[[substances]]
name = "N2"
molar_mass = 0.028
density = 808.0
specific_heat = 1040.0

[[substances]]
name = "O2"
molar_mass = 0.032
density = 1141.0
specific_heat = 918.0

[[substances]]
name = "CO2"
molar_mass = 0.044
density = 1101.0
specific_heat = 844.0

[[substances]]
name = "H2O"
molar_mass = 0.018015
density = 998.0
specific_heat = 4186.0
"#;

const MIXTURES: &str = r#"[
    (name: "CabinAir", components: [("N2", 76.0), ("O2", 23.0), ("CO2", 1.0)]),
]"#;

const ENGINE: &str = r#"{
    "clock": { "initial_step": 1.0, "max_step": 1.0 },
    "time_step": {
        "r_max_change": 1e9,
        "max_temperature_change": 1e9,
        "r_max_pressure_change": 1e9
    }
}"#;

fn data_dir(suffix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "habitat_life_support_{suffix}_{}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("substances.toml"), SUBSTANCES).unwrap();
    fs::write(dir.join("mixtures.ron"), MIXTURES).unwrap();
    fs::write(dir.join("engine.json"), ENGINE).unwrap();
    dir
}

fn load(suffix: &str) -> HabitatData {
    let dir = data_dir(suffix);
    let data = load_habitat_data(&dir).unwrap();
    let _ = fs::remove_dir_all(&dir);
    data
}

// ===========================================================================
// Scrubber subsystem
// ===========================================================================

/// A duct that passes air through and an adsorber bed that takes 90% of the
/// CO2 arriving in the duct. The fan stops once the bed is full.
#[derive(Debug)]
struct Scrubber {
    duct_air: Vec<f64>,
    fan_rate: f64,
    bed_capacity: f64,
    bed_mass: f64,
    stopped: bool,
}

impl Scrubber {
    fn new(duct_air: Vec<f64>, fan_rate: f64, bed_capacity: f64) -> Self {
        Self {
            duct_air,
            fan_rate,
            bed_capacity,
            bed_mass: 0.0,
            stopped: false,
        }
    }
}

impl Subsystem for Scrubber {
    fn name(&self) -> &str {
        "Scrubber"
    }

    fn create_matter_structure(&mut self, b: &mut NetworkBuilder) -> Result<(), SetupError> {
        let co2 = b
            .registry()
            .id("CO2")
            .ok_or_else(|| SetupError::InvalidParameter {
                name: "CO2".into(),
                reason: "substance not registered".into(),
            })?;
        let zeros = b.registry().zeros();

        let store = b.create_store("Scrubber", Capacity::Fixed(0.2))?;
        let duct = b.create_phase(
            store,
            PhaseSpec::gas("Duct", 0.1, self.duct_air.clone(), ROOM_TEMPERATURE),
        )?;
        b.create_port(duct, "In")?;
        b.create_port(duct, "Out")?;
        b.create_port(duct, "ToBed")?;
        let bed = b.create_phase(
            store,
            PhaseSpec::solid("Bed", zeros, ROOM_TEMPERATURE, AMBIENT_PRESSURE),
        )?;
        b.create_port(bed, "FromDuct")?;
        b.add_phase_to_phase(
            "Adsorber",
            "Scrubber.ToBed",
            "Scrubber.FromDuct",
            Box::new(Adsorber::new(co2, 0.9, self.bed_capacity)?),
        )?;

        b.declare_interface("Inlet")?;
        b.declare_interface("Outlet")?;
        b.create_branch(
            "Fan",
            BranchEnd::interface("Inlet"),
            BranchEnd::port("Scrubber.In"),
            &[],
        )?;
        b.create_branch(
            "Return",
            BranchEnd::port("Scrubber.Out"),
            BranchEnd::interface("Outlet"),
            &[],
        )?;
        Ok(())
    }

    fn create_solver_structure(&mut self, b: &mut NetworkBuilder) -> Result<(), SetupError> {
        b.set_handler("Fan", SolverHandler::manual(self.fan_rate))?;
        b.set_handler("Return", SolverHandler::residual())
    }

    fn exec(&mut self, ctx: &mut ExecContext<'_>) {
        self.bed_mass = ctx.phase("Scrubber.Bed").map_or(0.0, Phase::mass);
        // The adsorber fills the last of its headroom in one step, which can
        // leave the bed an ulp short of capacity.
        if !self.stopped && self.bed_mass >= self.bed_capacity * (1.0 - 1e-9) {
            self.stopped = ctx.set_manual_flow("Fan", ManualFlow::Mass(0.0)).is_ok();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ===========================================================================
// Network assembly
// ===========================================================================

/// 24 kg of cabin air in 20 m³, a crew turning O2 into CO2 and a scrubber on
/// a 10 g/s fan loop.
fn cabin_loop(data: &HabitatData, bed_capacity: f64) -> Network {
    let cabin_air = data.masses("CabinAir", 24.0).unwrap();
    let duct_air = data.masses("CabinAir", 0.12).unwrap();
    let registry = data.registry.clone();
    let o2 = registry.id("O2").unwrap().index();
    let co2 = registry.id("CO2").unwrap().index();

    let mut b = NetworkBuilder::with_config(registry.clone(), data.config.clone());
    let store = b.create_store("Cabin", Capacity::Fixed(20.0)).unwrap();
    let air = b
        .create_phase(store, PhaseSpec::gas("Air", 20.0, cabin_air, ROOM_TEMPERATURE))
        .unwrap();
    b.create_port(air, "ToScrubber").unwrap();
    b.create_port(air, "FromScrubber").unwrap();

    let mut crew = registry.zeros();
    crew[o2] = -1e-5;
    crew[co2] = 1e-5;
    b.add_manipulator("Crew", air, Box::new(ManualManipulator::new(crew).unwrap()))
        .unwrap();

    b.add_subsystem(Box::new(Scrubber::new(duct_air, 0.01, bed_capacity)))
        .unwrap();
    b.set_if_flows("Scrubber", &["Cabin.ToScrubber", "Cabin.FromScrubber"])
        .unwrap();

    let fan = b.branch_id("Fan").unwrap();
    b.add_observer(Box::new(TimeSeriesRecorder::new(vec![air], vec![fan])));
    b.build().unwrap()
}

fn phase<'a>(net: &'a Network, name: &str) -> &'a Phase {
    net.phase(net.phase_id(name).unwrap()).unwrap()
}

// ===========================================================================
// Tests
// ===========================================================================

#[test]
fn data_directory_configures_the_network() {
    let data = load("config");
    assert_eq!(data.registry.len(), 4);
    let air = data.mixture("CabinAir").unwrap();
    assert!((air.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    assert!((air[2] - 0.01).abs() < 1e-12);

    let net = cabin_loop(&data, 1.0);
    assert_eq!(net.config().clock.max_step, 1.0);
    assert_eq!(net.phase_count(), 3);
    assert_eq!(net.branch_count(), 2);
    assert!(net.interfaces().iter().all(|i| i.bound_to().is_some()));
}

#[test]
fn scrubber_loop_conserves_mass() {
    let data = load("conserve");
    let mut net = cabin_loop(&data, 1.0);
    let before: f64 = net.total_mass().iter().sum();

    let result = net.advance_to(60.0);
    assert_eq!(result.steps_run, 60);
    assert_eq!(result.degraded_steps, 0);

    let after: f64 = net.total_mass().iter().sum();
    assert!((before - after).abs() < 1e-9, "{before} vs {after}");
    for (_, p) in net.phases() {
        assert!(p.masses().iter().all(|m| *m >= 0.0), "{}", p.name());
    }
}

#[test]
fn adsorber_collects_cabin_co2() {
    let data = load("adsorb");
    let mut net = cabin_loop(&data, 1.0);
    net.advance_to(60.0);

    // 90% of 10 g/s at 1% CO2 for a minute.
    let bed = phase(&net, "Scrubber.Bed").mass();
    assert!((bed - 5.4e-3).abs() < 0.05 * 5.4e-3, "bed holds {bed}");
    let co2 = net.registry().id("CO2").unwrap();
    assert_eq!(phase(&net, "Scrubber.Bed").mass_of(co2), bed);

    let scrubber = net.subsystem::<Scrubber>().unwrap();
    assert_eq!(scrubber.bed_mass, bed);
    assert!(!scrubber.stopped);
}

#[test]
fn full_bed_stops_the_fan() {
    let data = load("stop");
    let mut net = cabin_loop(&data, 1e-3);
    net.advance_to(30.0);

    assert!(net.subsystem::<Scrubber>().unwrap().stopped);
    let fan = net.branch(net.branch_id("Fan").unwrap()).unwrap();
    assert_eq!(fan.flow_rate(), 0.0);
    let bed = phase(&net, "Scrubber.Bed").mass();
    assert!(bed <= 1e-3 + 1e-12, "bed overfilled: {bed}");
}

#[test]
fn recorder_follows_the_cabin() {
    let data = load("record");
    let mut net = cabin_loop(&data, 1.0);
    net.advance_to(10.0);

    let recorder = net.observer::<TimeSeriesRecorder>().unwrap();
    assert_eq!(recorder.len(), 10);
    let fan = recorder.branch_series(0);
    assert!(fan.iter().all(|(_, rate)| *rate == 0.01));
    let cabin = recorder.phase_series(0);
    assert_eq!(cabin.last().unwrap().0, 10.0);
    assert!((cabin.last().unwrap().1 - phase(&net, "Cabin.Air").mass()).abs() < 1e-12);
}

#[test]
fn unknown_mixture_component_is_reported() {
    let dir = data_dir("unresolved");
    fs::write(
        dir.join("mixtures.ron"),
        r#"[(name: "Bad", components: [("Ar", 1.0)])]"#,
    )
    .unwrap();
    let err = load_habitat_data(&dir).unwrap_err();
    assert!(matches!(err, DataLoadError::UnresolvedRef { ref name, .. } if name == "Ar"));
    let _ = fs::remove_dir_all(&dir);
}

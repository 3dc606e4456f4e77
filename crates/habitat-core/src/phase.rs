//! Phases: homogeneous mass reservoirs with composition and thermodynamic state.
//!
//! A phase accumulates the per-substance flow rates that the network routes
//! into and out of it during a tick, then applies them once in
//! [`Phase::integrate`]. Temperature follows an enthalpy balance over the
//! inflows and heat sources; pressure follows an equation of state chosen by
//! the phase's [`PhaseKind`] and [`PhaseMode`].

use std::sync::Arc;

use crate::error::MatterError;
use crate::id::{PhaseId, PortId, StoreId, SubstanceId};
use crate::registry::{GAS_CONSTANT, Registry};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// State of matter of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseKind {
    Gas,
    Liquid,
    Solid,
    Mixture,
}

impl PhaseKind {
    /// Whether the phase volume follows from substance densities rather than
    /// being assigned.
    pub fn is_condensed(self) -> bool {
        !matches!(self, PhaseKind::Gas)
    }
}

/// How the engine treats a phase during integration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseMode {
    /// Ordinary reservoir: mass, temperature and pressure evolve.
    #[default]
    Stateful,
    /// Negligible-capacity node. Pressure is assigned by the iterative
    /// solver and the phase never constrains the time step.
    Flow,
    /// Infinite reservoir. State is held constant; exchanged mass is
    /// recorded in the boundary ledger.
    Boundary,
}

// ---------------------------------------------------------------------------
// Time-step properties
// ---------------------------------------------------------------------------

/// Thresholds bounding how far a phase may change within one step.
///
/// Infinite values disable the corresponding bound. An empty
/// `ar_max_change`, or a non-positive entry in it, disables the
/// per-substance bound for that substance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeStepProperties {
    /// Maximum relative change of total mass per step.
    pub r_max_change: f64,
    /// Maximum relative change of each substance's mass per step.
    pub ar_max_change: Vec<f64>,
    /// Maximum absolute temperature change per step in K.
    pub max_temperature_change: f64,
    /// Maximum relative pressure change per step (gas phases).
    pub r_max_pressure_change: f64,
    /// Absolute ceiling on the step this phase proposes, in seconds.
    pub max_step: f64,
}

impl Default for TimeStepProperties {
    fn default() -> Self {
        Self {
            r_max_change: 0.25,
            ar_max_change: Vec::new(),
            max_temperature_change: 10.0,
            r_max_pressure_change: 0.25,
            max_step: f64::INFINITY,
        }
    }
}

impl TimeStepProperties {
    /// Properties that never bound the step.
    pub fn unbounded() -> Self {
        Self {
            r_max_change: f64::INFINITY,
            ar_max_change: Vec::new(),
            max_temperature_change: f64::INFINITY,
            r_max_pressure_change: f64::INFINITY,
            max_step: f64::INFINITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Heat sources
// ---------------------------------------------------------------------------

/// A heat source attached to a phase's thermal capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeatSource {
    /// Constant heat flow into the phase in W (negative for cooling).
    Power { name: String, watts: f64 },
    /// Holds the phase at a fixed temperature regardless of heat flows.
    ConstantTemperature { name: String, temperature: f64 },
}

impl HeatSource {
    pub fn name(&self) -> &str {
        match self {
            HeatSource::Power { name, .. } | HeatSource::ConstantTemperature { name, .. } => name,
        }
    }
}

// ---------------------------------------------------------------------------
// Phase specification
// ---------------------------------------------------------------------------

/// Parameters for creating a phase in a store.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSpec {
    pub name: String,
    pub kind: PhaseKind,
    pub mode: PhaseMode,
    /// Initial per-substance masses in kg, one entry per registry substance.
    pub masses: Vec<f64>,
    /// Temperature in K.
    pub temperature: f64,
    /// Pressure in Pa. Required for condensed phases; for gas phases it
    /// overrides the equation of state only for flow and boundary modes.
    pub pressure: Option<f64>,
    /// Volume in m³. Required for gas phases; condensed phases derive it from
    /// substance densities when absent.
    pub volume: Option<f64>,
    /// Overrides the network's default time-step properties.
    pub time_step: Option<TimeStepProperties>,
}

impl PhaseSpec {
    /// A gas phase occupying a fixed volume.
    pub fn gas(name: &str, volume: f64, masses: Vec<f64>, temperature: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: PhaseKind::Gas,
            mode: PhaseMode::Stateful,
            masses,
            temperature,
            pressure: None,
            volume: Some(volume),
            time_step: None,
        }
    }

    /// A liquid phase whose volume follows from its masses.
    pub fn liquid(name: &str, masses: Vec<f64>, temperature: f64, pressure: f64) -> Self {
        Self::condensed(name, PhaseKind::Liquid, masses, temperature, pressure)
    }

    /// A solid phase whose volume follows from its masses.
    pub fn solid(name: &str, masses: Vec<f64>, temperature: f64, pressure: f64) -> Self {
        Self::condensed(name, PhaseKind::Solid, masses, temperature, pressure)
    }

    /// A mixture phase whose volume follows from its masses.
    pub fn mixture(name: &str, masses: Vec<f64>, temperature: f64, pressure: f64) -> Self {
        Self::condensed(name, PhaseKind::Mixture, masses, temperature, pressure)
    }

    fn condensed(
        name: &str,
        kind: PhaseKind,
        masses: Vec<f64>,
        temperature: f64,
        pressure: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            mode: PhaseMode::Stateful,
            masses,
            temperature,
            pressure: Some(pressure),
            volume: None,
            time_step: None,
        }
    }

    pub fn mode(mut self, mode: PhaseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn pressure(mut self, pressure: f64) -> Self {
        self.pressure = Some(pressure);
        self
    }

    pub fn volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn time_step(mut self, props: TimeStepProperties) -> Self {
        self.time_step = Some(props);
        self
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// A homogeneous mass reservoir owned by exactly one store.
#[derive(Debug, Clone)]
pub struct Phase {
    pub(crate) id: PhaseId,
    name: String,
    store: StoreId,
    kind: PhaseKind,
    mode: PhaseMode,
    registry: Arc<Registry>,
    masses: Vec<f64>,
    temperature: f64,
    pressure: f64,
    volume: f64,
    time_step: TimeStepProperties,
    heat_sources: Vec<HeatSource>,
    pub(crate) ports: Vec<PortId>,
    mass_tolerance: f64,

    // -- Per-tick accumulators, cleared by `integrate` --
    inflow: Vec<f64>,
    outflow: Vec<f64>,
    conversion: Vec<f64>,
    /// Enthalpy carried in by inflows, in W relative to 0 K.
    inflow_enthalpy: f64,

    // -- Results of the last integration --
    net_rates: Vec<f64>,
    temperature_rate: f64,
    boundary_exchange: Vec<f64>,
}

impl Phase {
    /// Build a phase from a validated [`PhaseSpec`]. Volume and pressure are
    /// derived where it leaves them open.
    pub(crate) fn new(
        id: PhaseId,
        store: StoreId,
        spec: PhaseSpec,
        registry: Arc<Registry>,
        default_time_step: &TimeStepProperties,
        mass_tolerance: f64,
    ) -> Self {
        let zeros = registry.zeros();
        let volume = match (spec.kind.is_condensed(), spec.volume) {
            (_, Some(v)) => v,
            (true, None) => registry.condensed_volume(&spec.masses),
            (false, None) => 0.0,
        };
        let mut phase = Self {
            id,
            name: spec.name,
            store,
            kind: spec.kind,
            mode: spec.mode,
            masses: spec.masses,
            temperature: spec.temperature,
            pressure: spec.pressure.unwrap_or(0.0),
            volume,
            time_step: spec
                .time_step
                .unwrap_or_else(|| default_time_step.clone()),
            heat_sources: Vec::new(),
            ports: Vec::new(),
            mass_tolerance,
            inflow: zeros.clone(),
            outflow: zeros.clone(),
            conversion: zeros.clone(),
            inflow_enthalpy: 0.0,
            net_rates: zeros.clone(),
            temperature_rate: 0.0,
            boundary_exchange: zeros,
            registry,
        };
        if phase.kind == PhaseKind::Gas
            && (phase.mode == PhaseMode::Stateful || spec.pressure.is_none())
        {
            phase.pressure = phase.gas_pressure();
        }
        phase
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> PhaseId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> StoreId {
        self.store
    }

    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    pub fn mode(&self) -> PhaseMode {
        self.mode
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Per-substance masses in kg.
    pub fn masses(&self) -> &[f64] {
        &self.masses
    }

    pub fn mass_of(&self, substance: SubstanceId) -> f64 {
        self.masses.get(substance.index()).copied().unwrap_or(0.0)
    }

    /// Total mass in kg.
    pub fn mass(&self) -> f64 {
        self.masses.iter().sum()
    }

    /// Mass fractions. All zero when the phase is empty.
    pub fn fractions(&self) -> Vec<f64> {
        let total = self.mass();
        if total <= 0.0 {
            return vec![0.0; self.masses.len()];
        }
        self.masses.iter().map(|m| m / total).collect()
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn pressure(&self) -> f64 {
        self.pressure
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Density in kg/m³; zero for a phase without volume.
    pub fn density(&self) -> f64 {
        if self.volume > 0.0 {
            self.mass() / self.volume
        } else {
            0.0
        }
    }

    /// Heat capacity in J/K.
    pub fn heat_capacity(&self) -> f64 {
        self.registry.heat_capacity(&self.masses)
    }

    pub fn ports(&self) -> &[PortId] {
        &self.ports
    }

    pub fn time_step_properties(&self) -> &TimeStepProperties {
        &self.time_step
    }

    pub fn set_time_step_properties(&mut self, props: TimeStepProperties) {
        self.time_step = props;
    }

    pub fn heat_sources(&self) -> &[HeatSource] {
        &self.heat_sources
    }

    pub(crate) fn add_heat_source(&mut self, source: HeatSource) {
        self.heat_sources.push(source);
    }

    /// Net per-substance rates (kg/s) applied by the last integration.
    pub fn net_rates(&self) -> &[f64] {
        &self.net_rates
    }

    /// Temperature rate (K/s) observed over the last integration.
    pub fn temperature_rate(&self) -> f64 {
        self.temperature_rate
    }

    /// Cumulative net mass that entered this boundary phase, per substance.
    /// Always zero for non-boundary phases.
    pub fn boundary_exchange(&self) -> &[f64] {
        &self.boundary_exchange
    }

    /// Per-substance conversion rates accumulated for this tick.
    pub(crate) fn pending_conversion(&self) -> &[f64] {
        &self.conversion
    }

    pub(crate) fn set_pressure(&mut self, pressure: f64) {
        self.pressure = pressure;
    }

    pub(crate) fn set_volume(&mut self, volume: f64) {
        self.volume = volume;
        if self.kind == PhaseKind::Gas && self.mode == PhaseMode::Stateful {
            self.pressure = self.gas_pressure();
        }
    }

    // -----------------------------------------------------------------------
    // Mass operations
    // -----------------------------------------------------------------------

    /// Add `delta` kg of `substance` (negative to remove). Returns the mass
    /// actually applied.
    ///
    /// If the result would fall below the negative tolerance the substance is
    /// clamped to zero and `MatterError::NegativeMass` reports the shortfall
    /// so the requester can reduce its own flow. Removals that leave less
    /// than the tolerance are snapped to zero silently. Boundary phases record the change in
    /// their ledger and keep their state.
    pub fn add_mass(&mut self, substance: SubstanceId, delta: f64) -> Result<f64, MatterError> {
        let unknown = MatterError::UnknownSubstance {
            phase: self.id,
            substance,
        };
        let idx = substance.index();
        if self.mode == PhaseMode::Boundary {
            let exchanged = self.boundary_exchange.get_mut(idx).ok_or(unknown)?;
            *exchanged += delta;
            return Ok(delta);
        }
        let (tolerance, id) = (self.mass_tolerance, self.id);
        let mass = self.masses.get_mut(idx).ok_or(unknown)?;
        let current = *mass;
        let next = current + delta;
        if next < -tolerance {
            *mass = 0.0;
            return Err(MatterError::NegativeMass {
                phase: id,
                substance,
                shortfall: -next,
            });
        }
        if next < 0.0 || (delta < 0.0 && next <= tolerance) {
            *mass = 0.0;
            return Ok(-current);
        }
        *mass = next;
        Ok(delta)
    }

    /// Queue an inflow of `rates` (kg/s per substance) arriving at
    /// `temperature`.
    pub(crate) fn accumulate_inflow(&mut self, rates: &[f64], temperature: f64) {
        for (i, q) in rates.iter().enumerate() {
            self.inflow[i] += q;
            self.inflow_enthalpy += q * self.registry_specific_heat(i) * temperature;
        }
    }

    /// Queue an outflow of `rates` (kg/s per substance).
    pub(crate) fn accumulate_outflow(&mut self, rates: &[f64]) {
        for (acc, q) in self.outflow.iter_mut().zip(rates) {
            *acc += q;
        }
    }

    /// Queue a mass-neutral conversion (kg/s per substance, summing to zero).
    pub(crate) fn accumulate_conversion(&mut self, rates: &[f64]) {
        for (acc, q) in self.conversion.iter_mut().zip(rates) {
            *acc += q;
        }
    }

    fn registry_specific_heat(&self, index: usize) -> f64 {
        self.registry
            .get(SubstanceId(index as u32))
            .map(|s| s.specific_heat)
            .unwrap_or(0.0)
    }

    // -----------------------------------------------------------------------
    // Integration
    // -----------------------------------------------------------------------

    /// Apply the accumulated net rates over `dt` seconds, then update
    /// temperature and pressure. Returns one error per clamped substance.
    pub fn integrate(&mut self, dt: f64) -> Vec<MatterError> {
        let n = self.masses.len();
        let mut clamped = Vec::new();
        let heat_capacity_before = self.heat_capacity();
        let enthalpy_before = heat_capacity_before * self.temperature;

        let mut outflow_enthalpy = 0.0;
        for i in 0..n {
            outflow_enthalpy += self.outflow[i] * self.registry_specific_heat(i) * self.temperature;
        }

        for i in 0..n {
            let net = self.inflow[i] - self.outflow[i] + self.conversion[i];
            self.net_rates[i] = net;
            if net != 0.0
                && let Err(err) = self.add_mass(SubstanceId(i as u32), net * dt)
            {
                clamped.push(err);
            }
        }

        let previous_temperature = self.temperature;
        if self.mode == PhaseMode::Stateful {
            self.update_temperature(enthalpy_before, outflow_enthalpy, dt);
            self.update_state();
        }
        self.temperature_rate = if dt > 0.0 {
            (self.temperature - previous_temperature) / dt
        } else {
            0.0
        };

        self.inflow.iter_mut().for_each(|v| *v = 0.0);
        self.outflow.iter_mut().for_each(|v| *v = 0.0);
        self.conversion.iter_mut().for_each(|v| *v = 0.0);
        self.inflow_enthalpy = 0.0;
        clamped
    }

    fn update_temperature(&mut self, enthalpy_before: f64, outflow_enthalpy: f64, dt: f64) {
        let mut heat = 0.0;
        let mut fixed = None;
        for source in &self.heat_sources {
            match source {
                HeatSource::Power { watts, .. } => heat += watts,
                HeatSource::ConstantTemperature { temperature, .. } => fixed = Some(*temperature),
            }
        }
        if let Some(t) = fixed {
            self.temperature = t;
            return;
        }
        let capacity = self.heat_capacity();
        if capacity <= 0.0 {
            return;
        }
        let enthalpy = enthalpy_before + (self.inflow_enthalpy - outflow_enthalpy + heat) * dt;
        if enthalpy > 0.0 {
            self.temperature = enthalpy / capacity;
        }
    }

    /// Recompute volume or pressure from the equation of state.
    fn update_state(&mut self) {
        if self.kind.is_condensed() {
            self.volume = self.registry.condensed_volume(&self.masses);
        } else {
            self.pressure = self.gas_pressure();
        }
    }

    /// Ideal-gas pressure for the current masses, temperature and volume.
    fn gas_pressure(&self) -> f64 {
        if self.volume <= 0.0 {
            return 0.0;
        }
        self.registry.total_moles(&self.masses) * GAS_CONSTANT * self.temperature / self.volume
    }

    // -----------------------------------------------------------------------
    // Time-step proposal
    // -----------------------------------------------------------------------

    /// Largest step in seconds that keeps the projected change of mass,
    /// temperature and pressure inside the configured thresholds, given the
    /// rates of the last integration. `f64::INFINITY` when nothing binds.
    /// Pure: repeated calls without mutation return the same value.
    pub fn propose_next_time_step(&self) -> f64 {
        if self.mode != PhaseMode::Stateful {
            return f64::INFINITY;
        }
        let props = &self.time_step;
        let mut step = props.max_step;

        let total = self.mass();
        let net_total: f64 = self.net_rates.iter().sum();
        if total > 0.0 && net_total != 0.0 {
            step = step.min(props.r_max_change * total / net_total.abs());
        }

        for (i, rate) in self.net_rates.iter().enumerate() {
            let limit = props.ar_max_change.get(i).copied().unwrap_or(0.0);
            let mass = self.masses[i];
            if limit > 0.0 && mass > 0.0 && *rate != 0.0 {
                step = step.min(limit * mass / rate.abs());
            }
        }

        if self.temperature_rate != 0.0 {
            step = step.min(props.max_temperature_change / self.temperature_rate.abs());
        }

        if self.kind == PhaseKind::Gas {
            let moles = self.registry.total_moles(&self.masses);
            let mole_rate = self.registry.total_moles(&self.net_rates);
            if moles > 0.0 && mole_rate != 0.0 {
                step = step.min(props.r_max_pressure_change * moles / mole_rate.abs());
            }
        }

        if step.is_nan() { f64::INFINITY } else { step }
    }
}

//! Processors: the three capabilities through which matter is transformed.
//!
//! - [`FlowToFlow`] sits inline on a branch and maps the flow entering it to
//!   the flow leaving it. Mass it keeps back is reported to the engine and
//!   counted in the conservation ledger.
//! - [`PhaseToPhase`] moves mass directly between two phases of one store.
//! - [`Manipulator`] rewrites the composition of a single phase while holding
//!   its total mass constant.
//!
//! Each role has its own trait and signature. The built-in implementations
//! cover the common cases; component models implement the traits directly.

use std::any::Any;
use std::fmt;

use crate::error::SetupError;
use crate::id::SubstanceId;
use crate::phase::Phase;

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// The fixed set of processor capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorRole {
    FlowToFlow,
    PhaseToPhase,
    Manipulator,
}

// ---------------------------------------------------------------------------
// Flow-to-flow
// ---------------------------------------------------------------------------

/// Matter moving through a branch: per-substance rates in kg/s (all
/// non-negative) at a temperature in K.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowPacket {
    pub rates: Vec<f64>,
    pub temperature: f64,
}

impl FlowPacket {
    pub fn total(&self) -> f64 {
        self.rates.iter().sum()
    }
}

/// An inline processor on a branch.
pub trait FlowToFlow: fmt::Debug {
    /// Map the flow entering this processor to the flow leaving it. No
    /// substance may leave faster than it enters.
    fn update(&mut self, inflow: &FlowPacket, dt: f64) -> FlowPacket;

    /// Reject configurations that refer to substances outside a registry of
    /// `substances` entries. Checked when the processor is registered.
    fn check_substances(&self, substances: usize) -> Result<(), SetupError> {
        let _ = substances;
        Ok(())
    }

    /// Called once the tick's transfers are final with the per-substance
    /// rates this processor actually retained.
    fn commit(&mut self, retained: &[f64], dt: f64) {
        let _ = (retained, dt);
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

fn registered(substance: SubstanceId, substances: usize) -> Result<(), SetupError> {
    if substance.index() < substances {
        Ok(())
    } else {
        Err(SetupError::InvalidParameter {
            name: "substance".into(),
            reason: format!(
                "index {} is outside a registry of {substances}",
                substance.index()
            ),
        })
    }
}

/// Pass-through conduit.
#[derive(Debug, Clone, Default)]
pub struct Pipe;

impl FlowToFlow for Pipe {
    fn update(&mut self, inflow: &FlowPacket, _dt: f64) -> FlowPacket {
        inflow.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Retains a fraction of one substance until its loading capacity is used up.
#[derive(Debug, Clone)]
pub struct Filter {
    substance: SubstanceId,
    fraction: f64,
    capacity: f64,
    loaded: f64,
}

impl Filter {
    /// `fraction` of the incoming `substance` is retained, up to `capacity` kg
    /// in total.
    pub fn new(substance: SubstanceId, fraction: f64, capacity: f64) -> Result<Self, SetupError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(SetupError::InvalidParameter {
                name: "fraction".into(),
                reason: format!("{fraction} is outside 0..=1"),
            });
        }
        if !(capacity >= 0.0) {
            return Err(SetupError::InvalidParameter {
                name: "capacity".into(),
                reason: format!("{capacity} is negative"),
            });
        }
        Ok(Self {
            substance,
            fraction,
            capacity,
            loaded: 0.0,
        })
    }

    /// Mass retained so far in kg.
    pub fn loaded(&self) -> f64 {
        self.loaded
    }

    pub fn is_saturated(&self) -> bool {
        self.loaded >= self.capacity
    }
}

impl FlowToFlow for Filter {
    fn update(&mut self, inflow: &FlowPacket, dt: f64) -> FlowPacket {
        let mut out = inflow.clone();
        let idx = self.substance.index();
        let Some(incoming) = inflow.rates.get(idx).copied() else {
            return out;
        };
        let headroom = (self.capacity - self.loaded).max(0.0);
        let mut retained = self.fraction * incoming;
        if dt > 0.0 {
            retained = retained.min(headroom / dt);
        }
        out.rates[idx] = incoming - retained;
        out
    }

    fn check_substances(&self, substances: usize) -> Result<(), SetupError> {
        registered(self.substance, substances)
    }

    fn commit(&mut self, retained: &[f64], dt: f64) {
        if let Some(rate) = retained.get(self.substance.index()) {
            self.loaded += rate * dt;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Phase-to-phase
// ---------------------------------------------------------------------------

/// Read-only view handed to a phase-to-phase processor.
#[derive(Debug)]
pub struct P2pContext<'a> {
    pub source: &'a Phase,
    pub sink: &'a Phase,
    /// Per-substance rates already flowing into the source this tick.
    pub source_inflow: &'a [f64],
    /// Simulated time at the start of the tick, in seconds.
    pub time: f64,
    pub dt: f64,
}

/// Transfer requested by a phase-to-phase processor.
#[derive(Debug, Clone, PartialEq)]
pub struct P2pFlow {
    /// Mass flow in kg/s. Positive moves mass from source to sink.
    pub rate: f64,
    /// Mass fractions of the transferred matter.
    pub composition: Vec<f64>,
}

impl P2pFlow {
    pub fn none(substances: usize) -> Self {
        Self {
            rate: 0.0,
            composition: vec![0.0; substances],
        }
    }

    /// Build a flow from per-substance rates (all non-negative).
    pub fn from_rates(rates: &[f64]) -> Self {
        let total: f64 = rates.iter().sum();
        if total <= 0.0 {
            return Self::none(rates.len());
        }
        Self {
            rate: total,
            composition: rates.iter().map(|r| r / total).collect(),
        }
    }
}

/// A direct transfer between two phases of the same store.
pub trait PhaseToPhase: fmt::Debug {
    fn calculate_flow_rate(&mut self, ctx: &P2pContext<'_>) -> P2pFlow;

    /// See [`FlowToFlow::check_substances`].
    fn check_substances(&self, substances: usize) -> Result<(), SetupError> {
        let _ = substances;
        Ok(())
    }

    /// Called with the per-substance rates actually transferred this tick.
    fn commit(&mut self, transferred: &[f64], dt: f64) {
        let _ = (transferred, dt);
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Transfers fixed per-substance rates.
#[derive(Debug, Clone)]
pub struct ManualP2p {
    rates: Vec<f64>,
}

impl ManualP2p {
    pub fn new(rates: Vec<f64>) -> Self {
        Self { rates }
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn set_rates(&mut self, rates: Vec<f64>) {
        self.rates = rates;
    }
}

impl PhaseToPhase for ManualP2p {
    fn calculate_flow_rate(&mut self, _ctx: &P2pContext<'_>) -> P2pFlow {
        P2pFlow::from_rates(&self.rates)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Extracts a fraction of one substance's inflow into the source phase and
/// moves it to the sink until the sink holds `capacity` kg of it.
#[derive(Debug, Clone)]
pub struct Adsorber {
    substance: SubstanceId,
    fraction: f64,
    capacity: f64,
}

impl Adsorber {
    pub fn new(substance: SubstanceId, fraction: f64, capacity: f64) -> Result<Self, SetupError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(SetupError::InvalidParameter {
                name: "fraction".into(),
                reason: format!("{fraction} is outside 0..=1"),
            });
        }
        Ok(Self {
            substance,
            fraction,
            capacity,
        })
    }
}

impl PhaseToPhase for Adsorber {
    fn calculate_flow_rate(&mut self, ctx: &P2pContext<'_>) -> P2pFlow {
        let n = ctx.source.masses().len();
        let idx = self.substance.index();
        let inflow = ctx.source_inflow.get(idx).copied().unwrap_or(0.0).max(0.0);
        let headroom = (self.capacity - ctx.sink.mass_of(self.substance)).max(0.0);
        let mut rate = self.fraction * inflow;
        if ctx.dt > 0.0 {
            rate = rate.min(headroom / ctx.dt);
        }
        if rate <= 0.0 {
            return P2pFlow::none(n);
        }
        let mut composition = vec![0.0; n];
        let Some(share) = composition.get_mut(idx) else {
            return P2pFlow::none(n);
        };
        *share = 1.0;
        P2pFlow { rate, composition }
    }

    fn check_substances(&self, substances: usize) -> Result<(), SetupError> {
        registered(self.substance, substances)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Manipulators
// ---------------------------------------------------------------------------

/// Read-only view handed to a manipulator.
#[derive(Debug)]
pub struct ManipContext<'a> {
    pub phase: &'a Phase,
    pub time: f64,
    pub dt: f64,
}

/// Rewrites the composition of its own phase.
pub trait Manipulator: fmt::Debug {
    /// Return the replacement mass vector for the phase after `ctx.dt`. The
    /// total must equal the current total and no entry may be negative;
    /// otherwise the engine rejects the result for this tick.
    fn update(&mut self, ctx: &ManipContext<'_>) -> Vec<f64>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Check a manipulator's output against the phase's current masses.
pub(crate) fn validate_replacement(
    current: &[f64],
    replacement: &[f64],
    tolerance: f64,
) -> Result<(), String> {
    if replacement.len() != current.len() {
        return Err(format!(
            "returned {} entries for {} substances",
            replacement.len(),
            current.len()
        ));
    }
    if let Some((i, m)) = replacement
        .iter()
        .enumerate()
        .find(|(_, m)| !m.is_finite() || **m < -tolerance)
    {
        return Err(format!("substance {i} would hold {m} kg"));
    }
    let before: f64 = current.iter().sum();
    let after: f64 = replacement.iter().sum();
    if (after - before).abs() > tolerance.max(before.abs() * 1e-9) {
        return Err(format!("total mass changed from {before} kg to {after} kg"));
    }
    Ok(())
}

/// Converts substances at fixed mass-neutral rates (kg/s, summing to zero).
/// Rates are scaled down when a consumed substance runs out.
#[derive(Debug, Clone)]
pub struct ManualManipulator {
    rates: Vec<f64>,
}

impl ManualManipulator {
    pub fn new(rates: Vec<f64>) -> Result<Self, SetupError> {
        let sum: f64 = rates.iter().sum();
        let scale = rates.iter().fold(0.0_f64, |acc, r| acc.max(r.abs()));
        if sum.abs() > 1e-12 * scale.max(1.0) {
            return Err(SetupError::InvalidParameter {
                name: "rates".into(),
                reason: format!("conversion rates sum to {sum}, not zero"),
            });
        }
        Ok(Self { rates })
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }
}

impl Manipulator for ManualManipulator {
    fn update(&mut self, ctx: &ManipContext<'_>) -> Vec<f64> {
        let masses = ctx.phase.masses();
        let mut scale: f64 = 1.0;
        for (m, r) in masses.iter().zip(&self.rates) {
            if *r < 0.0 && ctx.dt > 0.0 {
                scale = scale.min(m / (-r * ctx.dt));
            }
        }
        masses
            .iter()
            .zip(&self.rates)
            .map(|(m, r)| (m + r * scale * ctx.dt).max(0.0))
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// First-order conversion of one reactant into products with fixed mass
/// fractions.
#[derive(Debug, Clone)]
pub struct Reaction {
    reactant: SubstanceId,
    rate_constant: f64,
    products: Vec<(SubstanceId, f64)>,
}

impl Reaction {
    /// `rate_constant` is in 1/s. Product mass fractions must sum to one.
    pub fn new(
        reactant: SubstanceId,
        rate_constant: f64,
        products: Vec<(SubstanceId, f64)>,
    ) -> Result<Self, SetupError> {
        if !(rate_constant >= 0.0) {
            return Err(SetupError::InvalidParameter {
                name: "rate_constant".into(),
                reason: format!("{rate_constant} is negative"),
            });
        }
        let total: f64 = products.iter().map(|(_, f)| f).sum();
        if (total - 1.0).abs() > 1e-9 || products.iter().any(|(_, f)| *f < 0.0) {
            return Err(SetupError::InvalidParameter {
                name: "products".into(),
                reason: format!("mass fractions sum to {total}, not one"),
            });
        }
        Ok(Self {
            reactant,
            rate_constant,
            products,
        })
    }
}

impl Manipulator for Reaction {
    fn update(&mut self, ctx: &ManipContext<'_>) -> Vec<f64> {
        let mut masses = ctx.phase.masses().to_vec();
        let idx = self.reactant.index();
        let Some(available) = masses.get(idx).copied() else {
            return masses;
        };
        let converted = available * (1.0 - (-self.rate_constant * ctx.dt).exp());
        masses[idx] -= converted;
        for (product, fraction) in &self.products {
            if let Some(m) = masses.get_mut(product.index()) {
                *m += converted * fraction;
            }
        }
        masses
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

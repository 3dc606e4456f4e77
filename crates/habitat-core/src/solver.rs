//! Solver handlers: strategies that resolve a branch's flow rate each tick.
//!
//! Four strategies exist, dispatched by enum match:
//!
//! - **Manual**: a constant setpoint (mass or volumetric).
//! - **Residual**: balances the phase at its first port against every other
//!   flow into that phase.
//! - **Interval**: evaluates a flow law, but only when the configured
//!   interval of simulated time has elapsed since the last resolution.
//! - **IterativeMultibranch**: joins a group of branches whose rates depend on
//!   each other through the pressures of flow phases, solved together by a
//!   bounded fixed-point iteration.

use crate::fixed::{SimTime, seconds, to_seconds};
use crate::id::{BranchId, GroupId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Handler life cycle
// ---------------------------------------------------------------------------

/// Per-tick resolution state of a branch's handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandlerState {
    #[default]
    Idle,
    Resolving,
    Resolved,
}

/// Resolution order within a tick. Lower stages resolve first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResolutionStage {
    /// Manual and Interval handlers.
    Direct,
    Residual,
    Iterative,
}

// ---------------------------------------------------------------------------
// Flow laws
// ---------------------------------------------------------------------------

/// Pressure-driven flow law. Positive pressure difference (first port minus
/// second port) drives positive flow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FlowLaw {
    /// `q = conductance * dp`, conductance in kg/(s·Pa).
    Linear { conductance: f64 },
    /// `q = coefficient * sign(dp) * sqrt(|dp|)`, coefficient in
    /// kg/(s·√Pa).
    Quadratic { coefficient: f64 },
}

/// Pressure differences below this are treated as 1 Pa when linearizing a
/// quadratic law.
const MIN_LINEARIZATION_DP: f64 = 1.0;

impl FlowLaw {
    pub fn flow_rate(&self, dp: f64) -> f64 {
        match *self {
            FlowLaw::Linear { conductance } => conductance * dp,
            FlowLaw::Quadratic { coefficient } => coefficient * dp.signum() * dp.abs().sqrt(),
        }
    }

    /// Secant conductance `q / dp` at the given pressure difference.
    pub fn conductance(&self, dp: f64) -> f64 {
        match *self {
            FlowLaw::Linear { conductance } => conductance,
            FlowLaw::Quadratic { coefficient } => {
                coefficient / dp.abs().max(MIN_LINEARIZATION_DP).sqrt()
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let value = match *self {
            FlowLaw::Linear { conductance } => conductance,
            FlowLaw::Quadratic { coefficient } => coefficient,
        };
        if value.is_finite() && value >= 0.0 {
            Ok(())
        } else {
            Err(format!("flow law parameter {value} must be finite and non-negative"))
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Setpoint of a manual handler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ManualFlow {
    /// Mass flow in kg/s.
    Mass(f64),
    /// Volumetric flow in m³/s, converted with the upstream phase density.
    Volumetric(f64),
}

/// A flow law evaluated at fixed intervals of simulated time.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalHandler {
    pub law: FlowLaw,
    interval: SimTime,
    last_resolved: Option<SimTime>,
    cached_rate: f64,
}

impl IntervalHandler {
    pub fn new(law: FlowLaw, interval: f64) -> Self {
        Self {
            law,
            interval: seconds(interval),
            last_resolved: None,
            cached_rate: 0.0,
        }
    }

    pub fn interval(&self) -> f64 {
        to_seconds(self.interval)
    }

    pub fn last_resolved(&self) -> Option<SimTime> {
        self.last_resolved
    }

    pub fn cached_rate(&self) -> f64 {
        self.cached_rate
    }

    /// Whether the handler must recompute at `now`.
    pub fn is_due(&self, now: SimTime) -> bool {
        match self.last_resolved {
            None => true,
            Some(last) => now - last >= self.interval,
        }
    }

    /// Store a resolution made at `now`. A resolution within one interval of
    /// its scheduled instant is booked on that instant, so the schedule does
    /// not drift with the tick grid.
    pub(crate) fn record(&mut self, now: SimTime, rate: f64) {
        let resolved_at = match self.next_resolution() {
            Some(scheduled) if now >= scheduled && now - scheduled < self.interval => scheduled,
            _ => now,
        };
        self.last_resolved = Some(resolved_at);
        self.cached_rate = rate;
    }

    /// Instant of the next scheduled resolution, if the handler has resolved
    /// before.
    pub fn next_resolution(&self) -> Option<SimTime> {
        self.last_resolved.map(|last| last.saturating_add(self.interval))
    }

    /// Seconds from `now` until the next resolution instant, or infinity if
    /// the handler is already due.
    pub fn propose_next_time_step(&self, now: SimTime) -> f64 {
        match self.last_resolved {
            Some(last) => {
                let remaining = last + self.interval - now;
                if remaining > SimTime::ZERO {
                    to_seconds(remaining)
                } else {
                    f64::INFINITY
                }
            }
            None => f64::INFINITY,
        }
    }
}

/// Strategy bound 1:1 to a branch.
#[derive(Debug, Clone, PartialEq)]
pub enum SolverHandler {
    Manual(ManualFlow),
    Residual,
    Interval(IntervalHandler),
    IterativeMultibranch { group: GroupId, law: FlowLaw },
}

impl SolverHandler {
    pub fn manual(rate: f64) -> Self {
        SolverHandler::Manual(ManualFlow::Mass(rate))
    }

    pub fn manual_volumetric(rate: f64) -> Self {
        SolverHandler::Manual(ManualFlow::Volumetric(rate))
    }

    pub fn residual() -> Self {
        SolverHandler::Residual
    }

    pub fn interval(law: FlowLaw, interval: f64) -> Self {
        SolverHandler::Interval(IntervalHandler::new(law, interval))
    }

    pub fn iterative(group: GroupId, law: FlowLaw) -> Self {
        SolverHandler::IterativeMultibranch { group, law }
    }

    pub fn stage(&self) -> ResolutionStage {
        match self {
            SolverHandler::Manual(_) | SolverHandler::Interval(_) => ResolutionStage::Direct,
            SolverHandler::Residual => ResolutionStage::Residual,
            SolverHandler::IterativeMultibranch { .. } => ResolutionStage::Iterative,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            SolverHandler::Manual(ManualFlow::Mass(r) | ManualFlow::Volumetric(r)) => {
                if r.is_finite() {
                    Ok(())
                } else {
                    Err(format!("manual setpoint {r} is not finite"))
                }
            }
            SolverHandler::Residual => Ok(()),
            SolverHandler::Interval(h) => {
                if h.interval > SimTime::ZERO {
                    h.law.validate()
                } else {
                    Err("interval must be positive".to_string())
                }
            }
            SolverHandler::IterativeMultibranch { law, .. } => law.validate(),
        }
    }
}

// ---------------------------------------------------------------------------
// Iterative multibranch solver
// ---------------------------------------------------------------------------

/// Convergence settings of an iterative group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterativeConfig {
    /// Iteration stops once the largest relative change of any branch rate
    /// falls below this.
    pub max_error: f64,
    /// Hard cap on iterations per tick.
    pub max_iterations: u32,
    /// Under-relaxation factor applied to node pressure updates, in (0, 1].
    pub relaxation: f64,
}

impl Default for IterativeConfig {
    fn default() -> Self {
        Self {
            max_error: 1e-6,
            max_iterations: 1000,
            relaxation: 1.0,
        }
    }
}

impl IterativeConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if !(self.max_error > 0.0) {
            return Err(format!("max_error {} must be positive", self.max_error));
        }
        if self.max_iterations == 0 {
            return Err("max_iterations must be at least 1".to_string());
        }
        if !(self.relaxation > 0.0 && self.relaxation <= 1.0) {
            return Err(format!("relaxation {} must lie in (0, 1]", self.relaxation));
        }
        Ok(())
    }
}

/// A set of branches solved jointly.
#[derive(Debug, Clone, PartialEq)]
pub struct IterativeGroup {
    pub(crate) id: GroupId,
    pub(crate) config: IterativeConfig,
    pub(crate) branches: Vec<BranchId>,
}

impl IterativeGroup {
    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn config(&self) -> &IterativeConfig {
        &self.config
    }

    pub fn branches(&self) -> &[BranchId] {
        &self.branches
    }
}

/// A pressure node of an iterative problem.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Node {
    pub pressure: f64,
    /// Free nodes have their pressure solved for; fixed nodes keep theirs.
    pub free: bool,
    /// Mass flow into the node from outside the group, kg/s.
    pub external_inflow: f64,
}

/// A branch of an iterative problem, between two node indices.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Edge {
    pub from: usize,
    pub to: usize,
    pub law: FlowLaw,
    /// Rate at the end of the previous tick, the starting iterate.
    pub previous_rate: f64,
}

/// Outcome of one group solve.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Solution {
    pub rates: Vec<f64>,
    pub pressures: Vec<f64>,
    pub iterations: u32,
    /// Largest relative rate change in the final iteration.
    pub residual: f64,
    pub converged: bool,
}

fn relative_change(new: f64, old: f64) -> f64 {
    let scale = new.abs().max(old.abs());
    if scale == 0.0 {
        0.0
    } else {
        (new - old).abs() / scale
    }
}

/// Solve a group by Gauss-Seidel sweeps over free node pressures, each node
/// balancing its linearized branch flows against its external inflow. Stops
/// when the largest relative change of any branch rate drops below
/// `max_error`, or after `max_iterations` sweeps with the last iterate.
pub(crate) fn solve_group(nodes: &[Node], edges: &[Edge], config: &IterativeConfig) -> Solution {
    let mut pressures: Vec<f64> = nodes.iter().map(|n| n.pressure).collect();
    let mut rates: Vec<f64> = edges.iter().map(|e| e.previous_rate).collect();
    let mut residual = f64::INFINITY;

    for iteration in 1..=config.max_iterations {
        for (idx, node) in nodes.iter().enumerate() {
            if !node.free {
                continue;
            }
            let mut sum_g = 0.0;
            let mut sum_gp = 0.0;
            for edge in edges {
                let other = if edge.from == idx {
                    edge.to
                } else if edge.to == idx {
                    edge.from
                } else {
                    continue;
                };
                let g = edge.law.conductance(pressures[other] - pressures[idx]);
                sum_g += g;
                sum_gp += g * pressures[other];
            }
            if sum_g > 0.0 {
                let target = (sum_gp + node.external_inflow) / sum_g;
                pressures[idx] += config.relaxation * (target - pressures[idx]);
            }
        }

        residual = 0.0;
        for (edge, rate) in edges.iter().zip(rates.iter_mut()) {
            let next = edge.law.flow_rate(pressures[edge.from] - pressures[edge.to]);
            residual = f64::max(residual, relative_change(next, *rate));
            *rate = next;
        }
        tracing::trace!(iteration, residual, "iterative sweep");

        if residual < config.max_error {
            return Solution {
                rates,
                pressures,
                iterations: iteration,
                residual,
                converged: true,
            };
        }
    }

    Solution {
        rates,
        pressures,
        iterations: config.max_iterations,
        residual,
        converged: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn fixed(p: f64) -> Node {
        Node {
            pressure: p,
            free: false,
            external_inflow: 0.0,
        }
    }

    fn free(p: f64) -> Node {
        Node {
            pressure: p,
            free: true,
            external_inflow: 0.0,
        }
    }

    fn linear(from: usize, to: usize, g: f64) -> Edge {
        Edge {
            from,
            to,
            law: FlowLaw::Linear { conductance: g },
            previous_rate: 0.0,
        }
    }

    // -----------------------------------------------------------------------
    // Flow laws
    // -----------------------------------------------------------------------

    #[test]
    fn linear_law() {
        let law = FlowLaw::Linear { conductance: 1e-5 };
        assert_eq!(law.flow_rate(1e5), 1.0);
        assert_eq!(law.conductance(123.0), 1e-5);
    }

    #[test]
    fn quadratic_law_is_odd() {
        let law = FlowLaw::Quadratic { coefficient: 0.01 };
        assert!((law.flow_rate(1e4) - 1.0).abs() < 1e-12);
        assert!((law.flow_rate(-1e4) + 1.0).abs() < 1e-12);
        assert!((law.conductance(1e4) - 1e-4).abs() < 1e-15);
        assert!(law.conductance(0.0).is_finite());
    }

    #[test]
    fn negative_parameter_rejected() {
        assert!(FlowLaw::Linear { conductance: -1.0 }.validate().is_err());
        assert!(FlowLaw::Quadratic { coefficient: 1.0 }.validate().is_ok());
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    #[test]
    fn stages_order_resolution() {
        let law = FlowLaw::Linear { conductance: 1.0 };
        assert_eq!(SolverHandler::manual(1.0).stage(), ResolutionStage::Direct);
        assert_eq!(SolverHandler::interval(law, 1.0).stage(), ResolutionStage::Direct);
        assert_eq!(SolverHandler::residual().stage(), ResolutionStage::Residual);
        assert_eq!(
            SolverHandler::iterative(GroupId(0), law).stage(),
            ResolutionStage::Iterative
        );
        assert!(ResolutionStage::Direct < ResolutionStage::Residual);
        assert!(ResolutionStage::Residual < ResolutionStage::Iterative);
    }

    #[test]
    fn interval_due_and_proposal() {
        let mut h = IntervalHandler::new(FlowLaw::Linear { conductance: 1.0 }, 2.0);
        assert!(h.is_due(SimTime::ZERO));
        assert_eq!(h.propose_next_time_step(SimTime::ZERO), f64::INFINITY);
        h.record(SimTime::ZERO, 3.0);
        assert!(!h.is_due(seconds(1.5)));
        assert_eq!(h.propose_next_time_step(seconds(0.5)), 1.5);
        assert!(h.is_due(seconds(2.0)));
        assert_eq!(h.propose_next_time_step(seconds(2.0)), f64::INFINITY);
        assert_eq!(h.cached_rate(), 3.0);
    }

    #[test]
    fn late_resolution_keeps_schedule() {
        let mut h = IntervalHandler::new(FlowLaw::Linear { conductance: 1.0 }, 1.0);
        h.record(SimTime::ZERO, 1.0);
        assert_eq!(h.next_resolution(), Some(seconds(1.0)));
        h.record(seconds(1.25), 2.0);
        assert_eq!(h.last_resolved(), Some(seconds(1.0)));
        assert!(!h.is_due(seconds(1.75)));
        assert!(h.is_due(seconds(2.0)));
        // More than a whole interval late restarts the schedule.
        h.record(seconds(4.5), 3.0);
        assert_eq!(h.last_resolved(), Some(seconds(4.5)));
    }

    #[test]
    fn handler_validation() {
        assert!(SolverHandler::manual(f64::NAN).validate().is_err());
        assert!(
            SolverHandler::interval(FlowLaw::Linear { conductance: 1.0 }, 0.0)
                .validate()
                .is_err()
        );
        assert!(SolverHandler::residual().validate().is_ok());
    }

    // -----------------------------------------------------------------------
    // Iterative solver
    // -----------------------------------------------------------------------

    #[test]
    fn two_branch_series_matches_analytic() {
        // 2 bar -> node -> 1 bar through equal conductances: node sits at
        // 1.5 bar and both branches carry 0.5 kg/s.
        let nodes = [fixed(2e5), free(1e5), fixed(1e5)];
        let edges = [linear(0, 1, 1e-5), linear(1, 2, 1e-5)];
        let sol = solve_group(&nodes, &edges, &IterativeConfig::default());
        assert!(sol.converged);
        assert!((sol.pressures[1] - 1.5e5).abs() < 1e-6);
        for rate in &sol.rates {
            assert!((rate - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn unequal_conductances() {
        let nodes = [fixed(3e5), free(1e5), fixed(1e5)];
        let edges = [linear(0, 1, 1e-5), linear(1, 2, 3e-5)];
        let sol = solve_group(&nodes, &edges, &IterativeConfig::default());
        // Series conductance 0.75e-5 over 2 bar.
        assert!((sol.rates[0] - 1.5).abs() < 1e-6);
        assert!((sol.rates[1] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn iteration_cap_reports_non_convergence() {
        let nodes = [fixed(2e5), free(1e5), fixed(1e5)];
        let edges = [linear(0, 1, 1e-5), linear(1, 2, 1e-5)];
        let config = IterativeConfig {
            max_iterations: 1,
            ..IterativeConfig::default()
        };
        let sol = solve_group(&nodes, &edges, &config);
        assert!(!sol.converged);
        assert_eq!(sol.iterations, 1);
        assert!(sol.residual >= config.max_error);
    }

    #[test]
    fn quadratic_network_converges() {
        let nodes = [fixed(2e5), free(1e5), fixed(1e5)];
        let law = FlowLaw::Quadratic { coefficient: 1e-3 };
        let edges = [
            Edge { from: 0, to: 1, law, previous_rate: 0.0 },
            Edge { from: 1, to: 2, law, previous_rate: 0.0 },
        ];
        let sol = solve_group(&nodes, &edges, &IterativeConfig::default());
        assert!(sol.converged, "residual {}", sol.residual);
        assert!((sol.rates[0] - sol.rates[1]).abs() < 1e-4 * sol.rates[0]);
        assert!((sol.pressures[1] - 1.5e5).abs() < 1.0);
    }

    #[test]
    fn external_inflow_raises_node_pressure() {
        let mut node = free(1e5);
        node.external_inflow = 1.0;
        let nodes = [fixed(1e5), node];
        let edges = [linear(1, 0, 1e-5)];
        let sol = solve_group(&nodes, &edges, &IterativeConfig::default());
        assert!((sol.pressures[1] - 2e5).abs() < 1e-6);
        assert!((sol.rates[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn config_validation() {
        assert!(IterativeConfig::default().validate().is_ok());
        let bad = IterativeConfig {
            relaxation: 1.5,
            ..IterativeConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}

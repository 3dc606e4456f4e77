//! The assembled network and its tick pipeline.
//!
//! # Tick pipeline
//!
//! Each [`Network::step`] runs, in order:
//!
//! 1. **Resolve** -- solver handlers set branch flow rates: Manual and
//!    Interval first, then Residual, then every iterative group.
//! 2. **Process** -- flow-to-flow chains shape each branch's flow, then
//!    phase-to-phase processors compute direct transfers, then manipulators
//!    compute composition changes.
//! 3. **Limit** -- outgoing transfers that would overdraw a phase are scaled
//!    down, atomically on both ends, and the reduced rate is written back to
//!    the branch.
//! 4. **Integrate** -- every phase applies its net rates exactly once; stores
//!    with standard volume manipulators re-split their volume.
//! 5. **Exec** -- subsystem hooks run on the integrated state.
//! 6. **Propose** -- phases and interval handlers propose the next step; the
//!    clock takes the minimum within its bounds.
//! 7. **Observe** -- observers see the finished tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use slotmap::{SecondaryMap, SlotMap};
use tracing::{debug, trace, warn};

use crate::branch::Branch;
use crate::clock::{Clock, ClockState};
use crate::config::EngineConfig;
use crate::error::{MatterError, SetupError};
use crate::fixed::{SimTime, seconds, to_seconds};
use crate::id::{BranchId, F2fId, GroupId, ManipId, P2pId, PhaseId, PortId, StoreId, SubstanceId};
use crate::observer::Observer;
use crate::phase::{Phase, PhaseMode, TimeStepProperties};
use crate::port::{ExchangePort, Interface, PortBinding};
use crate::processor::{
    FlowPacket, FlowToFlow, ManipContext, Manipulator, P2pContext, P2pFlow, PhaseToPhase,
    ProcessorRole, validate_replacement,
};
use crate::query::{BranchSnapshot, PhaseSnapshot};
use crate::registry::Registry;
use crate::report::{AdvanceResult, Degradation, TickReport};
use crate::solver::{self, HandlerState, IterativeGroup, ManualFlow, SolverHandler};
use crate::store::Store;
use crate::subsystem::{ExecContext, Subsystem};

/// Passes the transfer limiter makes before leaving the rest to clamping.

// ---------------------------------------------------------------------------
// Shared wiring types
// ---------------------------------------------------------------------------

/// A named processor, by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorRef {
    FlowToFlow(F2fId),
    PhaseToPhase(P2pId),
    Manipulator(ManipId),
}

impl ProcessorRef {
    pub fn role(self) -> ProcessorRole {
        match self {
            ProcessorRef::FlowToFlow(_) => ProcessorRole::FlowToFlow,
            ProcessorRef::PhaseToPhase(_) => ProcessorRole::PhaseToPhase,
            ProcessorRef::Manipulator(_) => ProcessorRole::Manipulator,
        }
    }
}

/// Name registry built during wiring. Store, branch and processor names are
/// global; phases and ports are qualified as `"Store.Name"`.
#[derive(Debug, Clone, Default)]
pub(crate) struct NameIndex {
    pub stores: HashMap<String, StoreId>,
    pub phases: HashMap<String, PhaseId>,
    pub ports: HashMap<String, PortId>,
    pub branches: HashMap<String, BranchId>,
    pub processors: HashMap<String, ProcessorRef>,
}

#[derive(Debug)]
pub(crate) struct F2fSlot {
    pub name: String,
    pub processor: Box<dyn FlowToFlow>,
    pub branch: Option<BranchId>,
    /// Cumulative mass retained, per substance.
    pub retained: Vec<f64>,
}

#[derive(Debug)]
pub(crate) struct P2pSlot {
    pub name: String,
    pub source: PhaseId,
    pub sink: PhaseId,
    pub processor: Box<dyn PhaseToPhase>,
    /// Transfer applied in the last tick, after limiting.
    pub flow: P2pFlow,
}

#[derive(Debug)]
pub(crate) struct ManipSlot {
    pub name: String,
    pub phase: PhaseId,
    pub processor: Box<dyn Manipulator>,
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferOrigin {
    Branch(BranchId),
    PhaseToPhase(P2pId),
}

/// Mass moving between two phases during one tick.
#[derive(Debug, Clone)]
struct Transfer {
    origin: TransferOrigin,
    source: PhaseId,
    sink: PhaseId,
    /// Rates leaving the source, kg/s per substance.
    outflow: Vec<f64>,
    /// Rates reaching the sink, kg/s per substance.
    inflow: Vec<f64>,
    temperature: f64,
    /// Rates kept back by each flow-to-flow processor on the way.
    retained: Vec<(F2fId, Vec<f64>)>,
    /// Limiter factor in [0, 1] applied to every rate above.
    scale: f64,
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// An assembled flow network. Built by
/// [`NetworkBuilder`](crate::builder::NetworkBuilder); afterwards all access
/// goes through typed handles.
#[derive(Debug)]
pub struct Network {
    pub(crate) registry: Arc<Registry>,
    pub(crate) config: EngineConfig,
    pub(crate) clock: Clock,

    pub(crate) stores: SlotMap<StoreId, Store>,
    pub(crate) phases: SlotMap<PhaseId, Phase>,
    pub(crate) ports: SlotMap<PortId, ExchangePort>,
    pub(crate) branches: SlotMap<BranchId, Branch>,
    pub(crate) f2fs: SlotMap<F2fId, F2fSlot>,
    pub(crate) p2ps: SlotMap<P2pId, P2pSlot>,
    pub(crate) manipulators: SlotMap<ManipId, ManipSlot>,
    pub(crate) groups: Vec<IterativeGroup>,
    pub(crate) interfaces: Vec<Interface>,
    pub(crate) names: NameIndex,

    pub(crate) subsystems: Vec<Box<dyn Subsystem>>,
    pub(crate) observers: Vec<Box<dyn Observer>>,

    /// Manual and Interval branches, in wiring order.
    pub(crate) direct_order: Vec<BranchId>,
    /// Residual branches, in wiring order.
    pub(crate) residual_order: Vec<BranchId>,

    /// Net phase-to-phase inflow of each phase in the last tick, kg/s.
    pub(crate) p2p_inflow: SecondaryMap<PhaseId, f64>,
    pub(crate) last_report: Option<TickReport>,
}

impl Network {
    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Current simulated time in seconds.
    pub fn time(&self) -> f64 {
        self.clock.time_seconds()
    }

    pub fn last_report(&self) -> Option<&TickReport> {
        self.last_report.as_ref()
    }

    pub fn store_id(&self, name: &str) -> Option<StoreId> {
        self.names.stores.get(name).copied()
    }

    /// Look up a phase by `"Store.Phase"`.
    pub fn phase_id(&self, name: &str) -> Option<PhaseId> {
        self.names.phases.get(name).copied()
    }

    /// Look up a port by `"Store.Port"`.
    pub fn port_id(&self, name: &str) -> Option<PortId> {
        self.names.ports.get(name).copied()
    }

    pub fn branch_id(&self, name: &str) -> Option<BranchId> {
        self.names.branches.get(name).copied()
    }

    pub fn processor(&self, name: &str) -> Option<ProcessorRef> {
        self.names.processors.get(name).copied()
    }

    pub fn store(&self, id: StoreId) -> Option<&Store> {
        self.stores.get(id)
    }

    pub fn phase(&self, id: PhaseId) -> Option<&Phase> {
        self.phases.get(id)
    }

    pub fn port(&self, id: PortId) -> Option<&ExchangePort> {
        self.ports.get(id)
    }

    pub fn branch(&self, id: BranchId) -> Option<&Branch> {
        self.branches.get(id)
    }

    pub fn group(&self, id: GroupId) -> Option<&IterativeGroup> {
        self.groups.get(id.0 as usize)
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn phases(&self) -> impl Iterator<Item = (PhaseId, &Phase)> {
        self.phases.iter()
    }

    pub fn branches(&self) -> impl Iterator<Item = (BranchId, &Branch)> {
        self.branches.iter()
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Downcast a flow-to-flow processor by name.
    pub fn flow_to_flow<T: 'static>(&self, name: &str) -> Option<&T> {
        match self.processor(name)? {
            ProcessorRef::FlowToFlow(id) => self.f2fs.get(id)?.processor.as_any().downcast_ref(),
            _ => None,
        }
    }

    /// Downcast a phase-to-phase processor by name.
    pub fn phase_to_phase_mut<T: 'static>(&mut self, name: &str) -> Option<&mut T> {
        match self.processor(name)? {
            ProcessorRef::PhaseToPhase(id) => self
                .p2ps
                .get_mut(id)?
                .processor
                .as_any_mut()
                .downcast_mut(),
            _ => None,
        }
    }

    /// Downcast a manipulator by name.
    pub fn manipulator<T: 'static>(&self, name: &str) -> Option<&T> {
        match self.processor(name)? {
            ProcessorRef::Manipulator(id) => {
                self.manipulators.get(id)?.processor.as_any().downcast_ref()
            }
            _ => None,
        }
    }

    /// Transfer applied by a phase-to-phase processor in the last tick.
    pub fn phase_to_phase_flow(&self, name: &str) -> Option<&P2pFlow> {
        match self.processor(name)? {
            ProcessorRef::PhaseToPhase(id) => self.p2ps.get(id).map(|s| &s.flow),
            _ => None,
        }
    }

    /// First observer of type `T`.
    pub fn observer<T: 'static>(&self) -> Option<&T> {
        self.observers
            .iter()
            .find_map(|o| o.as_any().downcast_ref::<T>())
    }

    /// First subsystem of type `T`.
    pub fn subsystem<T: 'static>(&self) -> Option<&T> {
        self.subsystems
            .iter()
            .find_map(|s| s.as_any().downcast_ref::<T>())
    }

    // -----------------------------------------------------------------------
    // Run-time adjustments
    // -----------------------------------------------------------------------

    /// Change the setpoint of a manual branch.
    pub fn set_manual_flow(&mut self, branch: BranchId, flow: ManualFlow) -> Result<(), SetupError> {
        set_manual_flow(&mut self.branches, branch, flow)
    }

    pub fn set_time_step_properties(
        &mut self,
        phase: PhaseId,
        props: TimeStepProperties,
    ) -> Result<(), SetupError> {
        let p = self
            .phases
            .get_mut(phase)
            .ok_or_else(|| SetupError::UnknownPhase(format!("{phase:?}")))?;
        p.set_time_step_properties(props);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conservation ledger
    // -----------------------------------------------------------------------

    /// Mass retained by flow-to-flow processors so far, per substance.
    pub fn retained_mass(&self) -> Vec<f64> {
        let mut total = self.registry.zeros();
        for slot in self.f2fs.values() {
            for (t, r) in total.iter_mut().zip(&slot.retained) {
                *t += r;
            }
        }
        total
    }

    /// Per-substance mass accounted for by the network: phase contents,
    /// net exchange with boundary phases and flow-to-flow retention. Stays
    /// constant over a run up to clamping tolerances.
    pub fn total_mass(&self) -> Vec<f64> {
        let mut total = self.retained_mass();
        for phase in self.phases.values() {
            for (i, t) in total.iter_mut().enumerate() {
                *t += phase.masses()[i] + phase.boundary_exchange()[i];
            }
        }
        total
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn snapshot_phase(&self, id: PhaseId) -> Option<PhaseSnapshot> {
        self.phases.get(id).map(PhaseSnapshot::of)
    }

    pub fn snapshot_all_phases(&self) -> Vec<PhaseSnapshot> {
        self.phases.values().map(PhaseSnapshot::of).collect()
    }

    pub fn snapshot_branch(&self, id: BranchId) -> Option<BranchSnapshot> {
        self.branches.get(id).map(BranchSnapshot::of)
    }

    pub fn snapshot_all_branches(&self) -> Vec<BranchSnapshot> {
        self.branches.values().map(BranchSnapshot::of).collect()
    }

    // -----------------------------------------------------------------------
    // Run control
    // -----------------------------------------------------------------------

    /// Run one tick with the current step.
    pub fn step(&mut self) -> TickReport {
        self.step_internal(None)
    }

    /// Run ticks until simulated time reaches `t` seconds. The final tick is
    /// shortened to land exactly on `t`.
    pub fn advance_to(&mut self, t: f64) -> AdvanceResult {
        let end = seconds(t);
        let mut result = AdvanceResult::default();
        while self.clock.time() < end {
            let report = self.step_internal(Some(end));
            result.record(report);
        }
        result
    }

    /// Run ticks covering `duration` seconds from the current time.
    pub fn advance(&mut self, duration: f64) -> AdvanceResult {
        let end = self.clock.time() + seconds(duration);
        self.advance_to(to_seconds(end))
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    fn step_internal(&mut self, limit: Option<SimTime>) -> TickReport {
        let limit = match (limit, self.next_interval_resolution()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let dt_fixed = self.clock.next_dt(limit);
        let dt = to_seconds(dt_fixed);
        let now = self.clock.time();
        let mut degradations = Vec::new();

        self.clock.set_state(ClockState::Resolving);
        for branch in self.branches.values_mut() {
            branch.state = HandlerState::Idle;
        }
        self.resolve_direct(now);
        self.resolve_residual();
        self.resolve_iterative(&mut degradations);

        let mut transfers = self.branch_transfers(dt);
        let direct = self.p2p_transfers(&transfers, to_seconds(now), dt);
        transfers.extend(direct);
        self.run_manipulators(to_seconds(now), dt, &mut degradations);

        self.clock.set_state(ClockState::Integrating);
        self.limit_transfers(&mut transfers, dt, &mut degradations);
        self.apply_transfers(&transfers, dt);
        self.integrate(dt, &mut degradations);

        self.clock.advance(dt_fixed);
        self.run_subsystems(dt);
        let next_step = self.propose_next_step();
        self.clock.set_state(ClockState::AwaitingTick);

        for d in &degradations {
            log_degradation(d);
        }
        let report = TickReport {
            tick: self.clock.tick(),
            time: self.clock.time(),
            dt,
            next_step,
            degradations,
        };
        debug!(
            tick = report.tick,
            time = to_seconds(report.time),
            dt,
            next_step,
            degradations = report.degradations.len(),
            "tick complete"
        );

        let mut observers = std::mem::take(&mut self.observers);
        for observer in observers.iter_mut() {
            observer.on_tick(self, &report);
        }
        self.observers = observers;

        self.last_report = Some(report.clone());
        report
    }

    // -----------------------------------------------------------------------
    // Phase 1: Resolve
    // -----------------------------------------------------------------------

    /// Phase behind a port.
    fn phase_at(&self, port: PortId) -> Option<PhaseId> {
        self.ports.get(port).map(|p| p.phase())
    }

    fn resolve_direct(&mut self, now: SimTime) {
        for &id in &self.direct_order {
            let Some(branch) = self.branches.get_mut(id) else {
                continue;
            };
            branch.state = HandlerState::Resolving;
            let left = self.ports.get(branch.left).and_then(|p| self.phases.get(p.phase()));
            let right = self.ports.get(branch.right).and_then(|p| self.phases.get(p.phase()));
            let rate = match &mut branch.handler {
                SolverHandler::Manual(ManualFlow::Mass(rate)) => *rate,
                SolverHandler::Manual(ManualFlow::Volumetric(volume_rate)) => {
                    let upstream = if *volume_rate >= 0.0 { left } else { right };
                    *volume_rate * upstream.map_or(0.0, Phase::density)
                }
                SolverHandler::Interval(handler) => {
                    if handler.is_due(now) {
                        let dp = left.map_or(0.0, Phase::pressure) - right.map_or(0.0, Phase::pressure);
                        let rate = handler.law.flow_rate(dp);
                        handler.record(now, rate);
                        rate
                    } else {
                        handler.cached_rate()
                    }
                }
                SolverHandler::Residual | SolverHandler::IterativeMultibranch { .. } => continue,
            };
            branch.flow.rate = rate;
            branch.state = HandlerState::Resolved;
        }
    }

    /// Net inflow (kg/s) into `phase` through every branch except `exclude`,
    /// plus last tick's phase-to-phase inflow.
    fn inflow_except(&self, phase: PhaseId, exclude: Option<BranchId>) -> f64 {
        let Some(p) = self.phases.get(phase) else {
            return 0.0;
        };
        let mut total = self.p2p_inflow.get(phase).copied().unwrap_or(0.0);
        for &port_id in p.ports() {
            let Some(port) = self.ports.get(port_id) else {
                continue;
            };
            if let PortBinding::Branch(bid) = port.binding()
                && Some(bid) != exclude
                && let Some(branch) = self.branches.get(bid)
            {
                total += branch.rate_into(port_id);
            }
        }
        total
    }

    /// A residual branch balances the phase at its first port; if that phase
    /// is a boundary it balances the phase at its second port instead.
    fn resolve_residual(&mut self) {
        for idx in 0..self.residual_order.len() {
            let id = self.residual_order[idx];
            let Some(branch) = self.branches.get(id) else {
                continue;
            };
            let (left, right) = (branch.left, branch.right);
            let left_phase = self.phase_at(left);
            let balance_left = left_phase
                .and_then(|p| self.phases.get(p))
                .is_some_and(|p| p.mode() != PhaseMode::Boundary);
            let rate = if balance_left {
                left_phase.map_or(0.0, |p| self.inflow_except(p, Some(id)))
            } else {
                self.phase_at(right)
                    .map_or(0.0, |p| -self.inflow_except(p, Some(id)))
            };
            if let Some(branch) = self.branches.get_mut(id) {
                branch.state = HandlerState::Resolved;
                branch.flow.rate = rate;
            }
        }
    }

    fn resolve_iterative(&mut self, degradations: &mut Vec<Degradation>) {
        for gi in 0..self.groups.len() {
            let group = &self.groups[gi];
            let mut node_of: HashMap<PhaseId, usize> = HashMap::new();
            let mut node_phases: Vec<PhaseId> = Vec::new();
            let mut nodes: Vec<solver::Node> = Vec::new();
            let mut edges: Vec<solver::Edge> = Vec::new();
            let members: HashSet<BranchId> = group.branches.iter().copied().collect();

            for &bid in &group.branches {
                let Some(branch) = self.branches.get(bid) else {
                    continue;
                };
                let SolverHandler::IterativeMultibranch { law, .. } = branch.handler else {
                    continue;
                };
                let mut ends = [0usize; 2];
                for (slot, port) in [branch.left, branch.right].into_iter().enumerate() {
                    let Some(pid) = self.phase_at(port) else {
                        continue;
                    };
                    let idx = *node_of.entry(pid).or_insert_with(|| {
                        let phase = &self.phases[pid];
                        nodes.push(solver::Node {
                            pressure: phase.pressure(),
                            free: phase.mode() == PhaseMode::Flow,
                            external_inflow: 0.0,
                        });
                        node_phases.push(pid);
                        nodes.len() - 1
                    });
                    ends[slot] = idx;
                }
                edges.push(solver::Edge {
                    from: ends[0],
                    to: ends[1],
                    law,
                    previous_rate: branch.flow.rate,
                });
            }

            // Flow into free nodes from outside the group.
            for (idx, &pid) in node_phases.iter().enumerate() {
                if !nodes[idx].free {
                    continue;
                }
                let mut external = self.p2p_inflow.get(pid).copied().unwrap_or(0.0);
                for &port_id in self.phases[pid].ports() {
                    if let Some(PortBinding::Branch(bid)) = self.ports.get(port_id).map(|p| p.binding())
                        && !members.contains(&bid)
                        && let Some(b) = self.branches.get(bid)
                    {
                        external += b.rate_into(port_id);
                    }
                }
                nodes[idx].external_inflow = external;
            }

            let solution = solver::solve_group(&nodes, &edges, &group.config);
            if !solution.converged {
                degradations.push(Degradation::NonConvergent {
                    group: group.id,
                    iterations: solution.iterations,
                    residual: solution.residual,
                });
            }

            let member_list = group.branches.clone();
            for (bid, rate) in member_list.iter().zip(&solution.rates) {
                if let Some(branch) = self.branches.get_mut(*bid) {
                    branch.flow.rate = *rate;
                    branch.state = HandlerState::Resolved;
                }
            }
            for (idx, pid) in node_phases.iter().enumerate() {
                if nodes[idx].free
                    && let Some(phase) = self.phases.get_mut(*pid)
                {
                    phase.set_pressure(solution.pressures[idx]);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 2: Process
    // -----------------------------------------------------------------------

    /// Run every branch's flow-to-flow chain and collect the resulting
    /// transfers. The branch's composition is taken from the upstream phase,
    /// or kept from the previous tick when the upstream phase is empty.
    fn branch_transfers(&mut self, dt: f64) -> Vec<Transfer> {
        #[cfg(test)]
        self.clock.observe();
        let mut transfers = Vec::new();
        let ids: Vec<BranchId> = self.branches.keys().collect();
        for id in ids {
            let (rate, left, right, chain) = {
                let b = &self.branches[id];
                (b.flow.rate, b.left, b.right, b.chain.clone())
            };
            let (Some(left_phase), Some(right_phase)) = (self.phase_at(left), self.phase_at(right))
            else {
                continue;
            };
            let (source, sink) = if rate >= 0.0 {
                (left_phase, right_phase)
            } else {
                (right_phase, left_phase)
            };
            let upstream = &self.phases[source];
            let fractions = upstream.fractions();
            let temperature = upstream.temperature();

            let branch = &mut self.branches[id];
            if fractions.iter().sum::<f64>() > 0.0 {
                branch.flow.composition = fractions;
            }
            branch.flow.temperature = temperature;
            if rate == 0.0 {
                continue;
            }
            if branch.flow.composition.iter().sum::<f64>() <= 0.0 {
                // Nothing has ever been available upstream.
                branch.flow.rate = 0.0;
                continue;
            }

            let outflow = branch.flow.substance_rates();
            let mut packet = FlowPacket {
                rates: outflow.clone(),
                temperature,
            };
            let mut retained = Vec::new();
            let ordered: Vec<F2fId> = if rate >= 0.0 {
                chain
            } else {
                chain.into_iter().rev().collect()
            };
            for f2f in ordered {
                let Some(slot) = self.f2fs.get_mut(f2f) else {
                    continue;
                };
                let mut out = slot.processor.update(&packet, dt);
                out.rates.resize(packet.rates.len(), 0.0);
                let mut kept = vec![0.0; packet.rates.len()];
                for (i, r) in out.rates.iter_mut().enumerate() {
                    *r = r.clamp(0.0, packet.rates[i]);
                    kept[i] = packet.rates[i] - *r;
                }
                trace!(
                    processor = %slot.name,
                    retained = kept.iter().sum::<f64>(),
                    "flow-to-flow update"
                );
                retained.push((f2f, kept));
                packet = out;
            }

            transfers.push(Transfer {
                origin: TransferOrigin::Branch(id),
                source,
                sink,
                outflow,
                inflow: packet.rates,
                temperature: packet.temperature,
                retained,
                scale: 1.0,
            });
        }
        transfers
    }

    fn p2p_transfers(&mut self, branch_transfers: &[Transfer], time: f64, dt: f64) -> Vec<Transfer> {
        #[cfg(test)]
        self.clock.observe();
        let n = self.registry.len();
        let mut inflow: SecondaryMap<PhaseId, Vec<f64>> = SecondaryMap::new();
        for t in branch_transfers {
            let entry = inflow.entry(t.sink).map(|e| e.or_insert_with(|| vec![0.0; n]));
            if let Some(acc) = entry {
                for (a, r) in acc.iter_mut().zip(&t.inflow) {
                    *a += r;
                }
            }
        }
        let zeros = vec![0.0; n];

        let mut transfers = Vec::new();
        for (id, slot) in self.p2ps.iter_mut() {
            let (Some(source), Some(sink)) = (self.phases.get(slot.source), self.phases.get(slot.sink))
            else {
                continue;
            };
            let ctx = P2pContext {
                source,
                sink,
                source_inflow: inflow.get(slot.source).unwrap_or(&zeros),
                time,
                dt,
            };
            let mut flow = slot.processor.calculate_flow_rate(&ctx);
            flow.composition.resize(n, 0.0);
            let magnitude = flow.rate.abs();
            let rates: Vec<f64> = flow.composition.iter().map(|c| c.max(0.0) * magnitude).collect();
            let (from, to) = if flow.rate >= 0.0 {
                (slot.source, slot.sink)
            } else {
                (slot.sink, slot.source)
            };
            let temperature = self.phases[from].temperature();
            trace!(processor = %slot.name, rate = flow.rate, "phase-to-phase flow");
            slot.flow = flow;
            if magnitude == 0.0 {
                continue;
            }
            transfers.push(Transfer {
                origin: TransferOrigin::PhaseToPhase(id),
                source: from,
                sink: to,
                outflow: rates.clone(),
                inflow: rates,
                temperature,
                retained: Vec::new(),
                scale: 1.0,
            });
        }
        transfers
    }

    /// Compute manipulator output and queue it as mass-neutral conversions.
    fn run_manipulators(&mut self, time: f64, dt: f64, degradations: &mut Vec<Degradation>) {
        #[cfg(test)]
        self.clock.observe();
        if dt <= 0.0 {
            return;
        }
        let tolerance = self.config.mass_tolerance;
        for (id, slot) in self.manipulators.iter_mut() {
            let Some(phase) = self.phases.get_mut(slot.phase) else {
                continue;
            };
            let replacement = slot.processor.update(&ManipContext { phase, time, dt });
            if let Err(reason) = validate_replacement(phase.masses(), &replacement, tolerance) {
                degradations.push(Degradation::ManipulatorRejected {
                    manipulator: id,
                    reason: format!("{}: {reason}", slot.name),
                });
                continue;
            }
            let rates: Vec<f64> = replacement
                .iter()
                .zip(phase.masses())
                .map(|(new, old)| (new.max(0.0) - old) / dt)
                .collect();
            phase.accumulate_conversion(&rates);
        }
    }

    // -----------------------------------------------------------------------
    // Phase 3: Limit
    // -----------------------------------------------------------------------

    /// Scale down transfers leaving phases that cannot supply them. Each
    /// scaled transfer shrinks as a whole, so its composition and both of its
    /// ends stay consistent. Boundary phases are never limited.
    ///
    /// Shrinking a source also shrinks the inflow of everything downstream,
    /// so the passes repeat until no phase is overdrawn. After one pass per
    /// phase, any phase still overdrawn has its outgoing transfers cut to
    /// zero; each such pass silences at least one more phase, so the loop
    /// ends with every phase able to cover its demand.
    fn limit_transfers(
        &self,
        transfers: &mut [Transfer],
        dt: f64,
        degradations: &mut Vec<Degradation>,
    ) {
        if transfers.is_empty() || dt <= 0.0 {
            return;
        }
        let n = self.registry.len();
        let tolerance = self.config.mass_tolerance;
        let mut reported: HashSet<(PhaseId, usize)> = HashSet::new();

        let shrink_passes = self.phases.len() + 1;
        for pass in 0..2 * self.phases.len() + 2 {
            let cut_off = pass >= shrink_passes;
            let mut supply: SecondaryMap<PhaseId, Vec<f64>> = SecondaryMap::new();
            let mut demand: SecondaryMap<PhaseId, Vec<f64>> = SecondaryMap::new();
            for (id, phase) in &self.phases {
                if phase.mode() == PhaseMode::Boundary {
                    continue;
                }
                let available = phase
                    .masses()
                    .iter()
                    .zip(phase.pending_conversion())
                    .map(|(m, c)| m + c * dt)
                    .collect();
                supply.insert(id, available);
                demand.insert(id, vec![0.0; n]);
            }
            for t in transfers.iter() {
                if let Some(d) = demand.get_mut(t.source) {
                    for (acc, r) in d.iter_mut().zip(&t.outflow) {
                        *acc += r * t.scale * dt;
                    }
                }
                if let Some(s) = supply.get_mut(t.sink) {
                    for (acc, r) in s.iter_mut().zip(&t.inflow) {
                        *acc += r * t.scale * dt;
                    }
                }
            }

            let mut factors: SecondaryMap<PhaseId, f64> = SecondaryMap::new();
            for (pid, wanted) in &demand {
                let have = &supply[pid];
                for i in 0..n {
                    if wanted[i] > 0.0 && wanted[i] > have[i] + tolerance {
                        let factor = if cut_off {
                            0.0
                        } else {
                            (have[i].max(0.0) / wanted[i]).clamp(0.0, 1.0)
                        };
                        let entry = factors.entry(pid).map(|e| e.or_insert(1.0));
                        if let Some(f) = entry {
                            *f = f.min(factor);
                        }
                        if reported.insert((pid, i)) {
                            degradations.push(Degradation::NegativeMass {
                                phase: pid,
                                substance: SubstanceId(i as u32),
                                shortfall: wanted[i] - have[i].max(0.0),
                            });
                        }
                    }
                }
            }
            if factors.is_empty() {
                break;
            }
            for t in transfers.iter_mut() {
                if let Some(f) = factors.get(t.source) {
                    t.scale *= f;
                }
            }
        }
    }

    fn apply_transfers(&mut self, transfers: &[Transfer], dt: f64) {
        #[cfg(test)]
        self.clock.observe();
        for id in self.p2p_inflow.keys().collect::<Vec<_>>() {
            self.p2p_inflow[id] = 0.0;
        }
        for t in transfers {
            let scaled = |v: &[f64]| v.iter().map(|r| r * t.scale).collect::<Vec<f64>>();
            let outflow = scaled(&t.outflow);
            let inflow = scaled(&t.inflow);
            if let Some(source) = self.phases.get_mut(t.source) {
                source.accumulate_outflow(&outflow);
            }
            if let Some(sink) = self.phases.get_mut(t.sink) {
                sink.accumulate_inflow(&inflow, t.temperature);
            }
            for (f2f, kept) in &t.retained {
                if let Some(slot) = self.f2fs.get_mut(*f2f) {
                    let kept = scaled(kept);
                    slot.processor.commit(&kept, dt);
                    for (acc, r) in slot.retained.iter_mut().zip(&kept) {
                        *acc += r * dt;
                    }
                }
            }
            match t.origin {
                TransferOrigin::Branch(bid) => {
                    if let Some(branch) = self.branches.get_mut(bid) {
                        branch.flow.rate *= t.scale;
                    }
                }
                TransferOrigin::PhaseToPhase(pid) => {
                    if let Some(slot) = self.p2ps.get_mut(pid) {
                        slot.flow.rate *= t.scale;
                        slot.processor.commit(&outflow, dt);
                    }
                    let moved: f64 = outflow.iter().sum();
                    if let Some(entry) = self.p2p_inflow.entry(t.sink) {
                        *entry.or_insert(0.0) += moved;
                    }
                    if let Some(entry) = self.p2p_inflow.entry(t.source) {
                        *entry.or_insert(0.0) -= moved;
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 4: Integrate
    // -----------------------------------------------------------------------

    fn integrate(&mut self, dt: f64, degradations: &mut Vec<Degradation>) {
        for phase in self.phases.values_mut() {
            for err in phase.integrate(dt) {
                match err {
                    MatterError::NegativeMass {
                        phase,
                        substance,
                        shortfall,
                    } => degradations.push(Degradation::NegativeMass {
                        phase,
                        substance,
                        shortfall,
                    }),
                    MatterError::UnknownSubstance { .. } => {
                        warn!(%err, "integration skipped a substance")
                    }
                }
            }
        }
        for store in self.stores.values() {
            let overrun = if store.has_standard_volume() {
                store.apply_standard_volume(&mut self.phases)
            } else {
                store.overrun(&self.phases)
            };
            if let Some(excess) = overrun {
                degradations.push(Degradation::CapacityOverrun {
                    store: store.id(),
                    excess,
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phases 5-6: Exec and propose
    // -----------------------------------------------------------------------

    fn run_subsystems(&mut self, dt: f64) {
        if self.subsystems.is_empty() {
            return;
        }
        let mut subsystems = std::mem::take(&mut self.subsystems);
        let time = self.clock.time_seconds();
        {
            let mut ctx = ExecContext::new(
                time,
                dt,
                &mut self.phases,
                &mut self.branches,
                &mut self.p2ps,
                &self.names,
            );
            for subsystem in subsystems.iter_mut() {
                subsystem.exec(&mut ctx);
            }
        }
        self.subsystems = subsystems;
    }

    /// Earliest upcoming interval resolution strictly after the current time.
    fn next_interval_resolution(&self) -> Option<SimTime> {
        let now = self.clock.time();
        self.branches
            .values()
            .filter_map(|b| match &b.handler {
                SolverHandler::Interval(h) => h.next_resolution(),
                _ => None,
            })
            .filter(|&at| at > now)
            .min()
    }

    fn propose_next_step(&mut self) -> f64 {
        let now = self.clock.time();
        let phase_steps = self.phases.values().map(Phase::propose_next_time_step);
        let interval_steps = self.branches.values().filter_map(|b| match &b.handler {
            SolverHandler::Interval(h) => Some(h.propose_next_time_step(now)),
            _ => None,
        });
        let proposals: Vec<f64> = phase_steps.chain(interval_steps).collect();
        self.clock.select_next_step(proposals)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn set_manual_flow(
    branches: &mut SlotMap<BranchId, Branch>,
    id: BranchId,
    flow: ManualFlow,
) -> Result<(), SetupError> {
    let branch = branches
        .get_mut(id)
        .ok_or_else(|| SetupError::UnknownBranch(format!("{id:?}")))?;
    match &mut branch.handler {
        SolverHandler::Manual(setpoint) => {
            *setpoint = flow;
            Ok(())
        }
        _ => Err(SetupError::InvalidParameter {
            name: branch.name().to_string(),
            reason: "branch does not have a manual handler".to_string(),
        }),
    }
}

fn log_degradation(d: &Degradation) {
    match d {
        Degradation::NegativeMass {
            phase,
            substance,
            shortfall,
        } => warn!(?phase, ?substance, shortfall, "negative mass clamped"),
        Degradation::NonConvergent {
            group,
            iterations,
            residual,
        } => warn!(?group, iterations, residual, "iterative group did not converge"),
        Degradation::ManipulatorRejected {
            manipulator,
            reason,
        } => warn!(?manipulator, reason = reason.as_str(), "manipulator output rejected"),
        Degradation::CapacityOverrun { store, excess } => {
            warn!(?store, excess, "store capacity overrun")
        }
    }
}

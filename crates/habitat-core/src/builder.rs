//! Network assembly.
//!
//! Wiring is name-based: stores, branches and processors carry global names,
//! phases and ports are addressed as `"Store.Name"`. Every call validates as
//! it goes and fails with a [`SetupError`]; [`NetworkBuilder::build`] runs
//! the remaining whole-network checks and freezes the result into a
//! [`Network`] that is addressed by typed handles from then on.

use std::sync::Arc;

use slotmap::{SecondaryMap, SlotMap};
use tracing::info;

use crate::branch::{Branch, BranchEnd};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::SetupError;
use crate::id::{BranchId, F2fId, GroupId, ManipId, P2pId, PhaseId, PortId, StoreId};
use crate::network::{F2fSlot, ManipSlot, NameIndex, Network, P2pSlot, ProcessorRef};
use crate::observer::Observer;
use crate::phase::{HeatSource, Phase, PhaseKind, PhaseMode, PhaseSpec};
use crate::port::{ExchangePort, Interface, PortBinding};
use crate::processor::{FlowToFlow, Manipulator, P2pFlow, PhaseToPhase};
use crate::registry::Registry;
use crate::solver::{IterativeConfig, IterativeGroup, ResolutionStage, SolverHandler};
use crate::store::{Capacity, Store};
use crate::subsystem::Subsystem;

/// One end of a branch during wiring.
#[derive(Debug, Clone, PartialEq)]
enum PendingEnd {
    Port(PortId),
    Interface(String),
}

#[derive(Debug)]
struct PendingBranch {
    name: String,
    left: PendingEnd,
    right: PendingEnd,
    chain: Vec<F2fId>,
    handler: Option<SolverHandler>,
}

/// Collects the matter and solver structure of a network.
#[derive(Debug)]
pub struct NetworkBuilder {
    registry: Arc<Registry>,
    config: EngineConfig,
    stores: SlotMap<StoreId, Store>,
    phases: SlotMap<PhaseId, Phase>,
    ports: SlotMap<PortId, ExchangePort>,
    branches: SlotMap<BranchId, PendingBranch>,
    f2fs: SlotMap<F2fId, F2fSlot>,
    p2ps: SlotMap<P2pId, P2pSlot>,
    manipulators: SlotMap<ManipId, ManipSlot>,
    manipulated: SecondaryMap<PhaseId, ManipId>,
    groups: Vec<IterativeGroup>,
    interfaces: Vec<Interface>,
    names: NameIndex,
    subsystems: Vec<Box<dyn Subsystem>>,
    observers: Vec<Box<dyn Observer>>,
    /// Subsystem whose matter structure is being created.
    current_owner: Option<String>,
}

impl NetworkBuilder {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    pub fn with_config(registry: Arc<Registry>, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            stores: SlotMap::with_key(),
            phases: SlotMap::with_key(),
            ports: SlotMap::with_key(),
            branches: SlotMap::with_key(),
            f2fs: SlotMap::with_key(),
            p2ps: SlotMap::with_key(),
            manipulators: SlotMap::with_key(),
            manipulated: SecondaryMap::new(),
            groups: Vec::new(),
            interfaces: Vec::new(),
            names: NameIndex::default(),
            subsystems: Vec::new(),
            observers: Vec::new(),
            current_owner: None,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    fn port_named(&self, name: &str) -> Result<PortId, SetupError> {
        self.names
            .ports
            .get(name)
            .copied()
            .ok_or_else(|| SetupError::UnknownPort(name.to_string()))
    }

    pub fn store_id(&self, name: &str) -> Option<StoreId> {
        self.names.stores.get(name).copied()
    }

    pub fn phase_id(&self, name: &str) -> Option<PhaseId> {
        self.names.phases.get(name).copied()
    }

    pub fn port_id(&self, name: &str) -> Option<PortId> {
        self.names.ports.get(name).copied()
    }

    pub fn branch_id(&self, name: &str) -> Option<BranchId> {
        self.names.branches.get(name).copied()
    }

    fn claim_name(&self, map: &str, name: &str) -> Result<(), SetupError> {
        let taken = match map {
            "store" => self.names.stores.contains_key(name),
            "phase" => self.names.phases.contains_key(name),
            "port" => self.names.ports.contains_key(name),
            "branch" => self.names.branches.contains_key(name),
            _ => self.names.processors.contains_key(name),
        };
        if taken {
            Err(SetupError::DuplicateName(name.to_string()))
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Matter structure
    // -----------------------------------------------------------------------

    pub fn create_store(&mut self, name: &str, capacity: Capacity) -> Result<StoreId, SetupError> {
        self.claim_name("store", name)?;
        if let Capacity::Fixed(v) = capacity
            && !(v.is_finite() && v > 0.0)
        {
            return Err(SetupError::InvalidParameter {
                name: name.to_string(),
                reason: format!("capacity {v} must be positive"),
            });
        }
        let id = self.stores.insert_with_key(|id| Store::new(id, name, capacity));
        self.names.stores.insert(name.to_string(), id);
        Ok(id)
    }

    /// Create a phase in `store`, reserving its volume.
    pub fn create_phase(&mut self, store: StoreId, spec: PhaseSpec) -> Result<PhaseId, SetupError> {
        let store_name = self
            .stores
            .get(store)
            .map(|s| s.name().to_string())
            .ok_or_else(|| SetupError::UnknownStore(format!("{store:?}")))?;
        let qualified = format!("{store_name}.{}", spec.name);
        self.claim_name("phase", &qualified)?;
        self.validate_phase_spec(&qualified, &spec)?;

        let volume = match (spec.kind, spec.volume) {
            (_, Some(v)) => v,
            (_, None) => self.registry.condensed_volume(&spec.masses),
        };
        if let Some(s) = self.stores.get_mut(store) {
            s.reserve(volume)?;
        }

        let registry = Arc::clone(&self.registry);
        let defaults = self.config.time_step.clone();
        let tolerance = self.config.mass_tolerance;
        let id = self
            .phases
            .insert_with_key(|id| Phase::new(id, store, spec, registry, &defaults, tolerance));
        if let Some(s) = self.stores.get_mut(store) {
            s.phases.push(id);
        }
        self.names.phases.insert(qualified, id);
        Ok(id)
    }

    fn validate_phase_spec(&self, name: &str, spec: &PhaseSpec) -> Result<(), SetupError> {
        let invalid = |reason: String| SetupError::InvalidParameter {
            name: name.to_string(),
            reason,
        };
        if spec.masses.len() != self.registry.len() {
            return Err(SetupError::SubstanceCount {
                expected: self.registry.len(),
                found: spec.masses.len(),
            });
        }
        if let Some(m) = spec.masses.iter().find(|m| !(m.is_finite() && **m >= 0.0)) {
            return Err(invalid(format!("mass {m} must be finite and non-negative")));
        }
        if !(spec.temperature.is_finite() && spec.temperature > 0.0) {
            return Err(invalid(format!("temperature {} must be positive", spec.temperature)));
        }
        match spec.kind {
            PhaseKind::Gas => {
                if !spec.volume.is_some_and(|v| v.is_finite() && v > 0.0) {
                    return Err(invalid("gas phases need a positive volume".to_string()));
                }
            }
            PhaseKind::Liquid | PhaseKind::Solid | PhaseKind::Mixture => {
                if !spec.pressure.is_some_and(|p| p.is_finite() && p >= 0.0) {
                    return Err(invalid("condensed phases need a pressure".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Attach a port named `name` to `phase`; it is addressed as
    /// `"Store.name"`.
    pub fn create_port(&mut self, phase: PhaseId, name: &str) -> Result<PortId, SetupError> {
        let p = self
            .phases
            .get(phase)
            .ok_or_else(|| SetupError::UnknownPhase(format!("{phase:?}")))?;
        let store = p.store();
        let store_name = self.stores.get(store).map(|s| s.name()).unwrap_or_default();
        let qualified = format!("{store_name}.{name}");
        self.claim_name("port", &qualified)?;
        let id = self
            .ports
            .insert_with_key(|id| ExchangePort::new(id, &qualified, phase, store));
        if let Some(p) = self.phases.get_mut(phase) {
            p.ports.push(id);
        }
        self.names.ports.insert(qualified, id);
        Ok(id)
    }

    pub fn add_heat_source(&mut self, phase: PhaseId, source: HeatSource) -> Result<(), SetupError> {
        let p = self
            .phases
            .get_mut(phase)
            .ok_or_else(|| SetupError::UnknownPhase(format!("{phase:?}")))?;
        if p.heat_sources().iter().any(|h| h.name() == source.name()) {
            return Err(SetupError::DuplicateName(source.name().to_string()));
        }
        p.add_heat_source(source);
        Ok(())
    }

    /// After every integration, give the store's gas phases the volume its
    /// condensed phases leave free and share the gas pressure with them.
    pub fn add_standard_volume_manipulators(&mut self, store: StoreId) -> Result<(), SetupError> {
        let s = self
            .stores
            .get_mut(store)
            .ok_or_else(|| SetupError::UnknownStore(format!("{store:?}")))?;
        if s.capacity() == Capacity::Dynamic {
            return Err(SetupError::InvalidParameter {
                name: s.name().to_string(),
                reason: "standard volume needs a fixed capacity".to_string(),
            });
        }
        s.enable_standard_volume();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Processors
    // -----------------------------------------------------------------------

    /// Register a flow-to-flow processor for later placement on a branch.
    pub fn add_flow_to_flow(
        &mut self,
        name: &str,
        processor: Box<dyn FlowToFlow>,
    ) -> Result<F2fId, SetupError> {
        processor.check_substances(self.registry.len())?;
        self.claim_name("processor", name)?;
        let id = self.f2fs.insert(F2fSlot {
            name: name.to_string(),
            processor,
            branch: None,
            retained: self.registry.zeros(),
        });
        self.names
            .processors
            .insert(name.to_string(), ProcessorRef::FlowToFlow(id));
        Ok(id)
    }

    /// Connect two ports of one store through a phase-to-phase processor.
    pub fn add_phase_to_phase(
        &mut self,
        name: &str,
        source_port: &str,
        sink_port: &str,
        processor: Box<dyn PhaseToPhase>,
    ) -> Result<P2pId, SetupError> {
        processor.check_substances(self.registry.len())?;
        self.claim_name("processor", name)?;
        let source = self.port_named(source_port)?;
        let sink = self.port_named(sink_port)?;
        let (a, b) = (&self.ports[source], &self.ports[sink]);
        if a.store() != b.store() {
            return Err(SetupError::CrossStoreProcessor(name.to_string()));
        }
        if a.phase() == b.phase() {
            return Err(SetupError::InvalidParameter {
                name: name.to_string(),
                reason: "source and sink are the same phase".to_string(),
            });
        }
        for port in [a, b] {
            if port.is_bound() {
                return Err(SetupError::PortAlreadyBound(port.name().to_string()));
            }
        }
        let (source_phase, sink_phase, store) = (a.phase(), b.phase(), a.store());

        let id = self.p2ps.insert(P2pSlot {
            name: name.to_string(),
            source: source_phase,
            sink: sink_phase,
            processor,
            flow: P2pFlow::none(self.registry.len()),
        });
        self.ports[source].bind(PortBinding::PhaseToPhase(id))?;
        self.ports[sink].bind(PortBinding::PhaseToPhase(id))?;
        if let Some(s) = self.stores.get_mut(store) {
            s.p2ps.push(id);
        }
        self.names
            .processors
            .insert(name.to_string(), ProcessorRef::PhaseToPhase(id));
        Ok(id)
    }

    /// Attach a manipulator to a phase. Each phase takes at most one, and
    /// flow phases take none.
    pub fn add_manipulator(
        &mut self,
        name: &str,
        phase: PhaseId,
        processor: Box<dyn Manipulator>,
    ) -> Result<ManipId, SetupError> {
        self.claim_name("processor", name)?;
        let p = self
            .phases
            .get(phase)
            .ok_or_else(|| SetupError::UnknownPhase(format!("{phase:?}")))?;
        if p.mode() == PhaseMode::Flow {
            return Err(SetupError::ManipulatorInFlowPhase(name.to_string()));
        }
        if self.manipulated.contains_key(phase) {
            return Err(SetupError::PhaseAlreadyManipulated(p.name().to_string()));
        }
        let store = p.store();
        let id = self.manipulators.insert(ManipSlot {
            name: name.to_string(),
            phase,
            processor,
        });
        self.manipulated.insert(phase, id);
        if let Some(s) = self.stores.get_mut(store) {
            s.manipulators.push(id);
        }
        self.names
            .processors
            .insert(name.to_string(), ProcessorRef::Manipulator(id));
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Branches and interfaces
    // -----------------------------------------------------------------------

    fn resolve_end(&self, end: &BranchEnd) -> Result<PendingEnd, SetupError> {
        match end {
            BranchEnd::Port(name) => {
                let id = self.port_named(name)?;
                if self.ports[id].is_bound() {
                    return Err(SetupError::PortAlreadyBound(name.clone()));
                }
                Ok(PendingEnd::Port(id))
            }
            BranchEnd::Interface(name) => {
                let itf = self
                    .interfaces
                    .iter()
                    .find(|i| i.name() == name)
                    .ok_or_else(|| SetupError::UnknownInterface(name.clone()))?;
                let used = self.branches.values().any(|b| {
                    b.left == PendingEnd::Interface(name.clone())
                        || b.right == PendingEnd::Interface(name.clone())
                });
                if used || itf.bound_to().is_some() {
                    return Err(SetupError::PortAlreadyBound(name.clone()));
                }
                Ok(PendingEnd::Interface(name.clone()))
            }
        }
    }

    /// Create a branch between two ends, with flow-to-flow processors in
    /// `chain` applied in order for positive flow. Positive flow moves mass
    /// from `left` to `right`.
    pub fn create_branch(
        &mut self,
        name: &str,
        left: BranchEnd,
        right: BranchEnd,
        chain: &[&str],
    ) -> Result<BranchId, SetupError> {
        self.claim_name("branch", name)?;
        if left == right {
            return Err(SetupError::InvalidParameter {
                name: name.to_string(),
                reason: "both ends are the same".to_string(),
            });
        }
        let left = self.resolve_end(&left)?;
        let right = self.resolve_end(&right)?;

        let mut f2f_ids = Vec::with_capacity(chain.len());
        for proc_name in chain {
            match self.names.processors.get(*proc_name) {
                Some(ProcessorRef::FlowToFlow(id)) => {
                    if self.f2fs[*id].branch.is_some() || f2f_ids.contains(id) {
                        return Err(SetupError::ProcessorAlreadyPlaced(proc_name.to_string()));
                    }
                    f2f_ids.push(*id);
                }
                _ => return Err(SetupError::UnknownProcessor(proc_name.to_string())),
            }
        }

        let id = self.branches.insert(PendingBranch {
            name: name.to_string(),
            left: left.clone(),
            right: right.clone(),
            chain: f2f_ids.clone(),
            handler: None,
        });
        for end in [left, right] {
            if let PendingEnd::Port(port) = end {
                self.ports[port].bind(PortBinding::Branch(id))?;
            }
        }
        for f2f in f2f_ids {
            self.f2fs[f2f].branch = Some(id);
        }
        self.names.branches.insert(name.to_string(), id);
        Ok(id)
    }

    /// Shorthand for a processor-free branch between two ports.
    pub fn connect(&mut self, name: &str, left: &str, right: &str) -> Result<BranchId, SetupError> {
        self.create_branch(name, BranchEnd::port(left), BranchEnd::port(right), &[])
    }

    /// Declare an interface owned by the subsystem currently being added.
    pub fn declare_interface(&mut self, name: &str) -> Result<(), SetupError> {
        if self.interfaces.iter().any(|i| i.name() == name) {
            return Err(SetupError::DuplicateName(name.to_string()));
        }
        self.interfaces
            .push(Interface::new(name, self.current_owner.clone()));
        Ok(())
    }

    /// Bind an interface to a port. The branch ending at the interface then
    /// ends at that port.
    pub fn connect_interface(&mut self, interface: &str, port: &str) -> Result<(), SetupError> {
        let port_id = self.port_named(port)?;
        let idx = self
            .interfaces
            .iter()
            .position(|i| i.name() == interface)
            .ok_or_else(|| SetupError::UnknownInterface(interface.to_string()))?;
        if self.ports[port_id].is_bound() {
            return Err(SetupError::PortAlreadyBound(port.to_string()));
        }
        let pending = PendingEnd::Interface(interface.to_string());
        let (branch_id, branch) = self
            .branches
            .iter_mut()
            .find(|(_, b)| b.left == pending || b.right == pending)
            .ok_or_else(|| SetupError::UnknownBranch(format!("no branch ends at '{interface}'")))?;
        self.interfaces[idx].bind(port_id)?;
        if branch.left == pending {
            branch.left = PendingEnd::Port(port_id);
        } else {
            branch.right = PendingEnd::Port(port_id);
        }
        self.ports[port_id].bind(PortBinding::Branch(branch_id))?;
        Ok(())
    }

    /// Bind the interfaces of `subsystem`, in declaration order, to `ports`.
    pub fn set_if_flows(&mut self, subsystem: &str, ports: &[&str]) -> Result<(), SetupError> {
        let owned: Vec<String> = self
            .interfaces
            .iter()
            .filter(|i| i.owner() == Some(subsystem))
            .map(|i| i.name().to_string())
            .collect();
        if owned.len() != ports.len() {
            return Err(SetupError::InvalidParameter {
                name: subsystem.to_string(),
                reason: format!("{} interfaces declared, {} ports given", owned.len(), ports.len()),
            });
        }
        for (interface, port) in owned.iter().zip(ports) {
            self.connect_interface(interface, port)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Solver structure
    // -----------------------------------------------------------------------

    /// Create an iterative group with the configured default settings.
    pub fn create_iterative_group(&mut self) -> GroupId {
        let config = self.config.iterative;
        self.push_group(config)
    }

    /// Create an iterative group with its own convergence settings.
    pub fn create_iterative_group_with(
        &mut self,
        config: IterativeConfig,
    ) -> Result<GroupId, SetupError> {
        config.validate().map_err(|reason| SetupError::InvalidParameter {
            name: "iterative group".to_string(),
            reason,
        })?;
        Ok(self.push_group(config))
    }

    fn push_group(&mut self, config: IterativeConfig) -> GroupId {
        let id = GroupId(self.groups.len() as u32);
        self.groups.push(IterativeGroup {
            id,
            config,
            branches: Vec::new(),
        });
        id
    }

    /// Bind the branch's solver handler. A handler is set exactly once.
    pub fn set_handler(&mut self, branch: &str, handler: SolverHandler) -> Result<(), SetupError> {
        let id = self
            .names
            .branches
            .get(branch)
            .copied()
            .ok_or_else(|| SetupError::UnknownBranch(branch.to_string()))?;
        handler.validate().map_err(|reason| SetupError::InvalidParameter {
            name: branch.to_string(),
            reason,
        })?;
        if self.branches[id].handler.is_some() {
            return Err(SetupError::InvalidParameter {
                name: branch.to_string(),
                reason: "solver handler already set".to_string(),
            });
        }
        if let SolverHandler::IterativeMultibranch { group, .. } = &handler {
            let g = self
                .groups
                .get_mut(group.0 as usize)
                .ok_or_else(|| SetupError::InvalidGroup(format!("{group:?} does not exist")))?;
            g.branches.push(id);
        }
        self.branches[id].handler = Some(handler);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subsystems and observers
    // -----------------------------------------------------------------------

    /// Add a subsystem and create its matter structure. Its solver structure
    /// is created by [`build`](Self::build).
    pub fn add_subsystem(&mut self, mut subsystem: Box<dyn Subsystem>) -> Result<(), SetupError> {
        let name = subsystem.name().to_string();
        if self.subsystems.iter().any(|s| s.name() == name) {
            return Err(SetupError::DuplicateName(name));
        }
        let outer = self.current_owner.replace(name);
        let result = subsystem.create_matter_structure(self);
        self.current_owner = outer;
        result?;
        self.subsystems.push(subsystem);
        Ok(())
    }

    pub fn add_observer(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    // -----------------------------------------------------------------------
    // Build
    // -----------------------------------------------------------------------

    /// Create every subsystem's solver structure, validate the whole network
    /// and freeze it.
    pub fn build(mut self) -> Result<Network, SetupError> {
        self.config.validate()?;

        let mut subsystems = std::mem::take(&mut self.subsystems);
        for subsystem in subsystems.iter_mut() {
            let outer = self.current_owner.replace(subsystem.name().to_string());
            let result = subsystem.create_solver_structure(&mut self);
            self.current_owner = outer;
            result?;
        }
        self.subsystems = subsystems;

        if let Some(itf) = self.interfaces.iter().find(|i| i.bound_to().is_none()) {
            return Err(SetupError::UnboundInterface(itf.name().to_string()));
        }
        if let Some(group) = self.groups.iter().find(|g| g.branches.is_empty()) {
            return Err(SetupError::InvalidGroup(format!("{:?} has no branches", group.id)));
        }

        let substances = self.registry.len();
        let pending = std::mem::replace(&mut self.branches, SlotMap::with_key());
        let mut branches: SlotMap<BranchId, Branch> = SlotMap::with_key();
        let mut direct_order = Vec::new();
        let mut residual_order = Vec::new();
        // Re-inserting in key order keeps every BranchId valid.
        for (old_id, b) in pending {
            let (PendingEnd::Port(left), PendingEnd::Port(right)) = (&b.left, &b.right) else {
                return Err(SetupError::UnboundInterface(b.name));
            };
            let handler = b
                .handler
                .ok_or_else(|| SetupError::MissingHandler(b.name.clone()))?;
            match handler.stage() {
                ResolutionStage::Direct => direct_order.push(old_id),
                ResolutionStage::Residual => residual_order.push(old_id),
                ResolutionStage::Iterative => {}
            }
            let new_id = branches.insert_with_key(|id| {
                Branch::new(id, &b.name, *left, *right, b.chain, handler, substances)
            });
            if new_id != old_id {
                return Err(SetupError::UnknownBranch(b.name));
            }
        }

        info!(
            stores = self.stores.len(),
            phases = self.phases.len(),
            branches = branches.len(),
            groups = self.groups.len(),
            subsystems = self.subsystems.len(),
            "network assembled"
        );

        Ok(Network {
            clock: Clock::new(self.config.clock),
            registry: self.registry,
            config: self.config,
            stores: self.stores,
            phases: self.phases,
            ports: self.ports,
            branches,
            f2fs: self.f2fs,
            p2ps: self.p2ps,
            manipulators: self.manipulators,
            groups: self.groups,
            interfaces: self.interfaces,
            names: self.names,
            subsystems: self.subsystems,
            observers: self.observers,
            direct_order,
            residual_order,
            p2p_inflow: SecondaryMap::new(),
            last_report: None,
        })
    }
}

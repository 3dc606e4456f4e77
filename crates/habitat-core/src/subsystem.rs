//! Subsystems: collaborator-defined parts of the network.
//!
//! A subsystem registers its matter structure (stores, phases, ports,
//! branches, processors) when it is added to a
//! [`NetworkBuilder`], its solver structure (handlers) when the network is
//! built, and then runs an [`exec`](Subsystem::exec) hook once per tick after
//! the core has integrated. Open branch ends are exposed as named interfaces
//! which the parent binds with [`NetworkBuilder::set_if_flows`] or
//! [`NetworkBuilder::connect_interface`].

use std::any::Any;
use std::fmt;

use slotmap::SlotMap;

use crate::branch::Branch;
use crate::builder::NetworkBuilder;
use crate::error::SetupError;
use crate::id::{BranchId, P2pId, PhaseId};
use crate::network::{self, NameIndex, P2pSlot, ProcessorRef};
use crate::phase::{Phase, TimeStepProperties};
use crate::solver::ManualFlow;

// ---------------------------------------------------------------------------
// Subsystem trait
// ---------------------------------------------------------------------------

/// A collaborator model hooked into the network.
///
/// Only `name`, `create_matter_structure` and the downcast helpers are
/// required; the solver structure and the per-tick hook default to no-ops.
pub trait Subsystem: fmt::Debug {
    /// Unique name. Interfaces declared during `create_matter_structure` are
    /// owned by this name.
    fn name(&self) -> &str;

    /// Register stores, phases, ports, branches and processors.
    fn create_matter_structure(&mut self, builder: &mut NetworkBuilder) -> Result<(), SetupError>;

    /// Assign solver handlers. Runs for every subsystem, in the order they
    /// were added, once all matter structure exists.
    fn create_solver_structure(&mut self, builder: &mut NetworkBuilder) -> Result<(), SetupError> {
        let _ = builder;
        Ok(())
    }

    /// Called once per tick after integration.
    fn exec(&mut self, ctx: &mut ExecContext<'_>) {
        let _ = ctx;
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ---------------------------------------------------------------------------
// ExecContext
// ---------------------------------------------------------------------------

/// Access handed to [`Subsystem::exec`]. Phases are read-only except for their
/// time-step properties; branches accept new manual setpoints.
pub struct ExecContext<'a> {
    time: f64,
    dt: f64,
    phases: &'a mut SlotMap<PhaseId, Phase>,
    branches: &'a mut SlotMap<BranchId, Branch>,
    p2ps: &'a mut SlotMap<P2pId, P2pSlot>,
    names: &'a NameIndex,
}

impl<'a> ExecContext<'a> {
    pub(crate) fn new(
        time: f64,
        dt: f64,
        phases: &'a mut SlotMap<PhaseId, Phase>,
        branches: &'a mut SlotMap<BranchId, Branch>,
        p2ps: &'a mut SlotMap<P2pId, P2pSlot>,
        names: &'a NameIndex,
    ) -> Self {
        Self {
            time,
            dt,
            phases,
            branches,
            p2ps,
            names,
        }
    }

    /// Simulated time at the end of the tick, in seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Step of the tick that just completed, in seconds.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Phase by `"Store.Phase"`.
    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.names.phases.get(name).and_then(|id| self.phases.get(*id))
    }

    pub fn branch(&self, name: &str) -> Option<&Branch> {
        self.names.branches.get(name).and_then(|id| self.branches.get(*id))
    }

    /// Change the setpoint of a manual branch, effective next tick.
    pub fn set_manual_flow(&mut self, branch: &str, flow: ManualFlow) -> Result<(), SetupError> {
        let id = *self
            .names
            .branches
            .get(branch)
            .ok_or_else(|| SetupError::UnknownBranch(branch.to_string()))?;
        network::set_manual_flow(self.branches, id, flow)
    }

    pub fn set_time_step_properties(
        &mut self,
        phase: &str,
        props: TimeStepProperties,
    ) -> Result<(), SetupError> {
        let p = self
            .names
            .phases
            .get(phase)
            .and_then(|id| self.phases.get_mut(*id))
            .ok_or_else(|| SetupError::UnknownPhase(phase.to_string()))?;
        p.set_time_step_properties(props);
        Ok(())
    }

    /// Downcast a phase-to-phase processor by name, e.g. to change its rates.
    pub fn phase_to_phase_mut<T: 'static>(&mut self, name: &str) -> Option<&mut T> {
        match self.names.processors.get(name)? {
            ProcessorRef::PhaseToPhase(id) => {
                self.p2ps.get_mut(*id)?.processor.as_any_mut().downcast_mut()
            }
            _ => None,
        }
    }
}

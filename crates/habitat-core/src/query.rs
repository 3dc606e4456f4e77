//! Read-only snapshots of network state.
//!
//! Snapshots are owned copies with no references into engine storage, so
//! they can be kept across ticks, serialized, or handed to plotting code.

use serde::Serialize;

use crate::branch::Branch;
use crate::id::{BranchId, PhaseId, PortId};
use crate::phase::{Phase, PhaseKind, PhaseMode};
use crate::solver::{HandlerState, ResolutionStage};

// ---------------------------------------------------------------------------
// Phase snapshot
// ---------------------------------------------------------------------------

/// State of one phase at the end of a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSnapshot {
    #[serde(skip)]
    pub id: PhaseId,
    pub name: String,
    pub kind: PhaseKind,
    pub mode: PhaseMode,
    /// Per-substance masses in kg.
    pub masses: Vec<f64>,
    pub mass: f64,
    pub temperature: f64,
    pub pressure: f64,
    pub volume: f64,
    /// Per-substance net rates of the last tick, kg/s.
    pub net_rates: Vec<f64>,
}

impl PhaseSnapshot {
    pub fn of(phase: &Phase) -> Self {
        Self {
            id: phase.id(),
            name: phase.name().to_string(),
            kind: phase.kind(),
            mode: phase.mode(),
            masses: phase.masses().to_vec(),
            mass: phase.mass(),
            temperature: phase.temperature(),
            pressure: phase.pressure(),
            volume: phase.volume(),
            net_rates: phase.net_rates().to_vec(),
        }
    }
}

// ---------------------------------------------------------------------------
// Branch snapshot
// ---------------------------------------------------------------------------

/// Resolved flow of one branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchSnapshot {
    #[serde(skip)]
    pub id: BranchId,
    pub name: String,
    #[serde(skip)]
    pub left: PortId,
    #[serde(skip)]
    pub right: PortId,
    /// Signed mass flow rate, kg/s.
    pub rate: f64,
    pub composition: Vec<f64>,
    pub temperature: f64,
    #[serde(skip)]
    pub stage: ResolutionStage,
    #[serde(skip)]
    pub state: HandlerState,
}

impl BranchSnapshot {
    pub fn of(branch: &Branch) -> Self {
        let flow = branch.flow();
        Self {
            id: branch.id(),
            name: branch.name().to_string(),
            left: branch.left(),
            right: branch.right(),
            rate: flow.rate,
            composition: flow.composition.clone(),
            temperature: flow.temperature,
            stage: branch.handler().stage(),
            state: branch.handler_state(),
        }
    }

    /// Per-substance rates, non-negative; direction is the sign of `rate`.
    pub fn substance_rates(&self) -> Vec<f64> {
        let magnitude = self.rate.abs();
        self.composition.iter().map(|x| x * magnitude).collect()
    }
}

//! Branches: conduits between two exchange ports.

use crate::id::{BranchId, F2fId, PortId};
use crate::solver::{HandlerState, SolverHandler};

/// One end of a branch as named at wiring time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchEnd {
    /// A port given as `"Store.Port"`.
    Port(String),
    /// A subsystem interface, bound to a parent port later.
    Interface(String),
}

impl BranchEnd {
    pub fn port(name: &str) -> Self {
        BranchEnd::Port(name.to_string())
    }

    pub fn interface(name: &str) -> Self {
        BranchEnd::Interface(name.to_string())
    }
}

/// Resolved flow through a branch for the current tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowState {
    /// Signed mass flow rate in kg/s. Positive moves mass from the first port
    /// to the second.
    pub rate: f64,
    /// Mass fractions of the flowing matter as it leaves the upstream phase.
    /// Non-negative and summing to one whenever `rate` is non-zero.
    pub composition: Vec<f64>,
    /// Temperature of the flowing matter in K.
    pub temperature: f64,
}

impl FlowState {
    pub(crate) fn idle(substances: usize) -> Self {
        Self {
            rate: 0.0,
            composition: vec![0.0; substances],
            temperature: 0.0,
        }
    }

    /// Per-substance mass flow rates (always non-negative; direction is the
    /// sign of `rate`).
    pub fn substance_rates(&self) -> Vec<f64> {
        let magnitude = self.rate.abs();
        self.composition.iter().map(|x| x * magnitude).collect()
    }
}

/// A conduit between two ports with an optional chain of flow-to-flow
/// processors and exactly one solver handler.
#[derive(Debug, Clone)]
pub struct Branch {
    pub(crate) id: BranchId,
    name: String,
    pub(crate) left: PortId,
    pub(crate) right: PortId,
    pub(crate) chain: Vec<F2fId>,
    pub(crate) handler: SolverHandler,
    pub(crate) state: HandlerState,
    pub(crate) flow: FlowState,
}

impl Branch {
    pub(crate) fn new(
        id: BranchId,
        name: &str,
        left: PortId,
        right: PortId,
        chain: Vec<F2fId>,
        handler: SolverHandler,
        substances: usize,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            left,
            right,
            chain,
            handler,
            state: HandlerState::Idle,
            flow: FlowState::idle(substances),
        }
    }

    pub fn id(&self) -> BranchId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port at the upstream end for positive flow.
    pub fn left(&self) -> PortId {
        self.left
    }

    /// Port at the downstream end for positive flow.
    pub fn right(&self) -> PortId {
        self.right
    }

    /// Flow-to-flow processors in declaration order.
    pub fn chain(&self) -> &[F2fId] {
        &self.chain
    }

    pub fn handler(&self) -> &SolverHandler {
        &self.handler
    }

    pub fn handler_state(&self) -> HandlerState {
        self.state
    }

    pub fn flow(&self) -> &FlowState {
        &self.flow
    }

    pub fn flow_rate(&self) -> f64 {
        self.flow.rate
    }

    /// Signed rate at which this branch delivers mass into the phase behind
    /// `port`; zero if the port is not one of the branch ends.
    pub fn rate_into(&self, port: PortId) -> f64 {
        if port == self.right {
            self.flow.rate
        } else if port == self.left {
            -self.flow.rate
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn branch(rate: f64) -> Branch {
        let mut ports = SlotMap::<PortId, ()>::with_key();
        let mut ids = SlotMap::<BranchId, ()>::with_key();
        let mut b = Branch::new(
            ids.insert(()),
            "Drain",
            ports.insert(()),
            ports.insert(()),
            Vec::new(),
            SolverHandler::manual(rate),
            2,
        );
        b.flow.rate = rate;
        b.flow.composition = vec![0.25, 0.75];
        b
    }

    #[test]
    fn rate_into_respects_direction() {
        let b = branch(2.0);
        assert_eq!(b.rate_into(b.right()), 2.0);
        assert_eq!(b.rate_into(b.left()), -2.0);
    }

    #[test]
    fn substance_rates_use_magnitude() {
        let b = branch(-4.0);
        assert_eq!(b.flow().substance_rates(), vec![1.0, 3.0]);
    }

    #[test]
    fn new_branch_is_idle() {
        let b = branch(0.0);
        assert_eq!(b.handler_state(), HandlerState::Idle);
        assert_eq!(b.name(), "Drain");
    }
}

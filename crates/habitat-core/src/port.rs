//! Exchange ports and subsystem interfaces.
//!
//! A port is a named attachment point on a phase. Positive port flow means
//! mass entering the phase. Each port is bound to at most one branch or
//! phase-to-phase processor, once, at wiring time.

use crate::error::SetupError;
use crate::id::{BranchId, P2pId, PhaseId, PortId, StoreId};

/// What a port is bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PortBinding {
    #[default]
    Free,
    Branch(BranchId),
    PhaseToPhase(P2pId),
}

/// A named attachment point on a phase.
#[derive(Debug, Clone)]
pub struct ExchangePort {
    pub(crate) id: PortId,
    name: String,
    phase: PhaseId,
    store: StoreId,
    binding: PortBinding,
}

impl ExchangePort {
    pub(crate) fn new(id: PortId, name: &str, phase: PhaseId, store: StoreId) -> Self {
        Self {
            id,
            name: name.to_string(),
            phase,
            store,
            binding: PortBinding::Free,
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    /// Fully qualified name, `"Store.Port"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> PhaseId {
        self.phase
    }

    pub fn store(&self) -> StoreId {
        self.store
    }

    pub fn binding(&self) -> PortBinding {
        self.binding
    }

    pub fn is_bound(&self) -> bool {
        self.binding != PortBinding::Free
    }

    /// Bind the port. Fails with `PortAlreadyBound` if it already belongs to
    /// another branch or processor.
    pub(crate) fn bind(&mut self, binding: PortBinding) -> Result<(), SetupError> {
        if self.is_bound() {
            return Err(SetupError::PortAlreadyBound(self.name.clone()));
        }
        self.binding = binding;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Interfaces
// ---------------------------------------------------------------------------

/// A named open end exposed by a subsystem. The subsystem's branch ends at
/// the interface; the parent binds the interface to one of its own ports.
#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    name: String,
    /// Subsystem that declared the interface, if any.
    owner: Option<String>,
    bound_to: Option<PortId>,
}

impl Interface {
    pub(crate) fn new(name: &str, owner: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            owner,
            bound_to: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn bound_to(&self) -> Option<PortId> {
        self.bound_to
    }

    /// Bind the interface to a port. An interface is bound exactly once.
    pub(crate) fn bind(&mut self, port: PortId) -> Result<(), SetupError> {
        if self.bound_to.is_some() {
            return Err(SetupError::PortAlreadyBound(self.name.clone()));
        }
        self.bound_to = Some(port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn port() -> ExchangePort {
        let mut ports = SlotMap::<PortId, ()>::with_key();
        let mut phases = SlotMap::<PhaseId, ()>::with_key();
        let mut stores = SlotMap::<StoreId, ()>::with_key();
        ExchangePort::new(ports.insert(()), "Tank.Out", phases.insert(()), stores.insert(()))
    }

    #[test]
    fn port_binds_once() {
        let mut branches = SlotMap::<BranchId, ()>::with_key();
        let a = branches.insert(());
        let b = branches.insert(());
        let mut p = port();
        assert!(!p.is_bound());
        p.bind(PortBinding::Branch(a)).unwrap();
        assert_eq!(p.binding(), PortBinding::Branch(a));
        assert_eq!(
            p.bind(PortBinding::Branch(b)),
            Err(SetupError::PortAlreadyBound("Tank.Out".into()))
        );
        assert_eq!(p.binding(), PortBinding::Branch(a));
    }

    #[test]
    fn interface_binds_once() {
        let mut ports = SlotMap::<PortId, ()>::with_key();
        let a = ports.insert(());
        let mut itf = Interface::new("Inlet", Some("Filter".into()));
        assert_eq!(itf.owner(), Some("Filter"));
        itf.bind(a).unwrap();
        assert_eq!(itf.bound_to(), Some(a));
        assert!(matches!(itf.bind(a), Err(SetupError::PortAlreadyBound(_))));
    }
}

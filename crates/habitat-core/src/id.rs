use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a store (container of phases) in the network.
    pub struct StoreId;

    /// Identifies a phase inside a store.
    pub struct PhaseId;

    /// Identifies an exchange port attached to a phase.
    pub struct PortId;

    /// Identifies a branch connecting two exchange ports.
    pub struct BranchId;

    /// Identifies a flow-to-flow processor placed on a branch.
    pub struct F2fId;

    /// Identifies a phase-to-phase processor owned by a store.
    pub struct P2pId;

    /// Identifies a manipulator attached to a phase.
    pub struct ManipId;
}

/// Identifies a substance in the registry. Indexes every per-substance vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubstanceId(pub u32);

impl SubstanceId {
    /// Position of this substance in per-substance vectors.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifies a group of branches solved jointly by the iterative solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

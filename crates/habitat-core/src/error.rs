//! Error types.
//!
//! Wiring and assembly problems are [`SetupError`]s and abort the run before
//! the first tick. Arithmetic problems during a run are recovered locally and
//! surface as [`Degradation`](crate::report::Degradation) entries instead;
//! the only run-time error value is [`MatterError`], returned by
//! [`Phase::add_mass`](crate::phase::Phase::add_mass).

use crate::id::{PhaseId, SubstanceId};

/// Fatal errors raised while assembling a network.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SetupError {
    #[error("store '{store}' cannot hold {requested} m³, only {remaining} m³ remain")]
    CapacityExceeded {
        store: String,
        requested: f64,
        remaining: f64,
    },
    #[error("port '{0}' is already bound")]
    PortAlreadyBound(String),
    #[error("interface '{0}' was declared but never connected")]
    UnboundInterface(String),
    #[error("duplicate name: {0}")]
    DuplicateName(String),
    #[error("store not found: {0}")]
    UnknownStore(String),
    #[error("phase not found: {0}")]
    UnknownPhase(String),
    #[error("port not found: {0}")]
    UnknownPort(String),
    #[error("branch not found: {0}")]
    UnknownBranch(String),
    #[error("interface not found: {0}")]
    UnknownInterface(String),
    #[error("processor not found: {0}")]
    UnknownProcessor(String),
    #[error("branch '{0}' has no solver handler")]
    MissingHandler(String),
    #[error("flow-to-flow processor '{0}' is already placed on a branch")]
    ProcessorAlreadyPlaced(String),
    #[error("processor '{0}' connects phases of different stores")]
    CrossStoreProcessor(String),
    #[error("manipulator '{0}' cannot be attached to a flow phase")]
    ManipulatorInFlowPhase(String),
    #[error("phase '{0}' already has a manipulator")]
    PhaseAlreadyManipulated(String),
    #[error("invalid iterative group: {0}")]
    InvalidGroup(String),
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("substance vector has {found} entries, registry has {expected}")]
    SubstanceCount { expected: usize, found: usize },
}

/// Recoverable matter errors.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum MatterError {
    /// More mass was requested than available. The phase has already been
    /// clamped to zero for this substance; `shortfall` is the mass that could
    /// not be supplied.
    #[error("negative mass in {phase:?} for {substance:?}: short by {shortfall} kg")]
    NegativeMass {
        phase: PhaseId,
        substance: SubstanceId,
        shortfall: f64,
    },
    /// The substance index lies outside the phase's registry. Nothing was
    /// changed.
    #[error("{substance:?} is not registered for {phase:?}")]
    UnknownSubstance {
        phase: PhaseId,
        substance: SubstanceId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_error_display() {
        let err = SetupError::CapacityExceeded {
            store: "Tank".into(),
            requested: 2.0,
            remaining: 0.5,
        };
        assert_eq!(
            err.to_string(),
            "store 'Tank' cannot hold 2 m³, only 0.5 m³ remain"
        );
        assert_eq!(
            SetupError::UnboundInterface("Inlet".into()).to_string(),
            "interface 'Inlet' was declared but never connected"
        );
    }

    #[test]
    fn matter_error_display_mentions_shortfall() {
        let err = MatterError::NegativeMass {
            phase: PhaseId::default(),
            substance: SubstanceId(0),
            shortfall: 0.5,
        };
        assert!(err.to_string().contains("0.5"));
    }
}

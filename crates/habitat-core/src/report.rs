//! Per-tick reports and degradations.
//!
//! A degraded tick still completes: the engine recovers locally and records
//! what it had to do so callers can tell degraded ticks from clean ones.

use crate::fixed::SimTime;
use crate::id::{GroupId, ManipId, PhaseId, StoreId, SubstanceId};

/// A locally recovered numerical problem.
#[derive(Debug, Clone, PartialEq)]
pub enum Degradation {
    /// Outgoing transfers from a phase exceeded the available mass of a
    /// substance and were scaled down, or the phase was clamped to zero.
    NegativeMass {
        phase: PhaseId,
        substance: SubstanceId,
        shortfall: f64,
    },
    /// An iterative group hit its iteration cap; the last iterate was used.
    NonConvergent {
        group: GroupId,
        iterations: u32,
        residual: f64,
    },
    /// A manipulator returned a composition that does not conserve mass or
    /// holds a negative entry. The phase kept its previous composition.
    ManipulatorRejected { manipulator: ManipId, reason: String },
    /// Phases of a store occupy more than its fixed capacity.
    CapacityOverrun { store: StoreId, excess: f64 },
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// Index of the tick, starting at 1.
    pub tick: u64,
    /// Simulated time at the end of the tick.
    pub time: SimTime,
    /// Step taken, in seconds.
    pub dt: f64,
    /// Step chosen for the following tick, in seconds.
    pub next_step: f64,
    pub degradations: Vec<Degradation>,
}

impl TickReport {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    pub fn non_converged(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.degradations.iter().filter_map(|d| match d {
            Degradation::NonConvergent { group, .. } => Some(*group),
            _ => None,
        })
    }

    pub fn negative_mass(&self) -> impl Iterator<Item = (PhaseId, SubstanceId, f64)> + '_ {
        self.degradations.iter().filter_map(|d| match d {
            Degradation::NegativeMass {
                phase,
                substance,
                shortfall,
            } => Some((*phase, *substance, *shortfall)),
            _ => None,
        })
    }
}

/// Result of a multi-tick advance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvanceResult {
    /// Number of ticks executed.
    pub steps_run: u64,
    /// Number of those ticks that were degraded.
    pub degraded_steps: u64,
    /// Report of the final tick, if any ran.
    pub last: Option<TickReport>,
}

impl AdvanceResult {
    pub(crate) fn record(&mut self, report: TickReport) {
        self.steps_run += 1;
        if report.is_degraded() {
            self.degraded_steps += 1;
        }
        self.last = Some(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(degradations: Vec<Degradation>) -> TickReport {
        TickReport {
            tick: 1,
            time: SimTime::ZERO,
            dt: 0.1,
            next_step: 0.1,
            degradations,
        }
    }

    #[test]
    fn clean_tick_is_not_degraded() {
        assert!(!report(Vec::new()).is_degraded());
    }

    #[test]
    fn filters_by_kind() {
        let r = report(vec![
            Degradation::NonConvergent {
                group: GroupId(3),
                iterations: 10,
                residual: 0.1,
            },
            Degradation::NegativeMass {
                phase: PhaseId::default(),
                substance: SubstanceId(1),
                shortfall: 0.5,
            },
        ]);
        assert!(r.is_degraded());
        assert_eq!(r.non_converged().collect::<Vec<_>>(), vec![GroupId(3)]);
        assert_eq!(r.negative_mass().count(), 1);
    }

    #[test]
    fn advance_result_counts_degraded_ticks() {
        let mut result = AdvanceResult::default();
        result.record(report(Vec::new()));
        result.record(report(vec![Degradation::CapacityOverrun {
            store: StoreId::default(),
            excess: 0.1,
        }]));
        assert_eq!(result.steps_run, 2);
        assert_eq!(result.degraded_steps, 1);
        assert!(result.last.unwrap().is_degraded());
    }
}

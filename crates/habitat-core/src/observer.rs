//! Tick observers.
//!
//! Observers run after every tick with read-only access to the network and
//! the tick's report. They are the hook for logging, plotting and test
//! assertions that need every tick rather than the final state.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;

use crate::id::{BranchId, PhaseId};
use crate::network::Network;
use crate::report::TickReport;

pub trait Observer: fmt::Debug {
    /// Called once per tick, after subsystems have run.
    fn on_tick(&mut self, network: &Network, report: &TickReport);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ---------------------------------------------------------------------------
// TimeSeriesRecorder
// ---------------------------------------------------------------------------

/// One recorded tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Simulated time at the end of the tick, in seconds.
    pub time: f64,
    /// Total mass of each tracked phase, in tracking order.
    pub phase_masses: Vec<f64>,
    /// Signed flow rate of each tracked branch, in tracking order.
    pub branch_rates: Vec<f64>,
    pub degraded: bool,
}

/// Records phase masses and branch flow rates every tick.
///
/// When a capacity is set, the oldest samples are dropped once it is
/// reached.
#[derive(Debug, Clone, Default)]
pub struct TimeSeriesRecorder {
    phases: Vec<PhaseId>,
    branches: Vec<BranchId>,
    capacity: Option<usize>,
    samples: VecDeque<Sample>,
}

impl TimeSeriesRecorder {
    pub fn new(phases: Vec<PhaseId>, branches: Vec<BranchId>) -> Self {
        Self {
            phases,
            branches,
            capacity: None,
            samples: VecDeque::new(),
        }
    }

    /// Keep at most `capacity` samples. A capacity of zero is treated as one.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// `(time, mass)` pairs for the `index`-th tracked phase.
    pub fn phase_series(&self, index: usize) -> Vec<(f64, f64)> {
        self.samples
            .iter()
            .filter_map(|s| s.phase_masses.get(index).map(|m| (s.time, *m)))
            .collect()
    }

    /// `(time, rate)` pairs for the `index`-th tracked branch.
    pub fn branch_series(&self, index: usize) -> Vec<(f64, f64)> {
        self.samples
            .iter()
            .filter_map(|s| s.branch_rates.get(index).map(|r| (s.time, *r)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Observer for TimeSeriesRecorder {
    fn on_tick(&mut self, network: &Network, report: &TickReport) {
        let sample = Sample {
            time: network.time(),
            phase_masses: self
                .phases
                .iter()
                .map(|id| network.phase(*id).map_or(0.0, |p| p.mass()))
                .collect(),
            branch_rates: self
                .branches
                .iter()
                .map(|id| network.branch(*id).map_or(0.0, |b| b.flow_rate()))
                .collect(),
            degraded: report.is_degraded(),
        };
        if let Some(cap) = self.capacity
            && self.samples.len() >= cap
        {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

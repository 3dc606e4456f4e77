//! The time-step governor.
//!
//! The clock owns simulated time and the global step. Time is kept in
//! fixed-point so long runs of variable steps accumulate without drift; the
//! step itself is chosen in `f64` seconds from the proposals of every phase
//! and interval handler, clamped to `[min_step, max_step]`.

use crate::fixed::{SimTime, seconds, to_seconds};
use serde::{Deserialize, Serialize};

/// Step bounds of the clock, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeStepConfig {
    /// Step of the first tick, before any proposal exists.
    pub initial_step: f64,
    pub min_step: f64,
    pub max_step: f64,
}

impl Default for TimeStepConfig {
    fn default() -> Self {
        Self {
            initial_step: 0.1,
            min_step: 1e-8,
            max_step: 20.0,
        }
    }
}

impl TimeStepConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if !(self.min_step > 0.0 && self.min_step.is_finite()) {
            return Err(format!("min_step {} must be positive", self.min_step));
        }
        if !(self.max_step >= self.min_step && self.max_step.is_finite()) {
            return Err(format!(
                "max_step {} must be finite and at least min_step {}",
                self.max_step, self.min_step
            ));
        }
        if !(self.initial_step > 0.0) {
            return Err(format!("initial_step {} must be positive", self.initial_step));
        }
        Ok(())
    }
}

/// Where the governor is within a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClockState {
    #[default]
    AwaitingTick,
    Resolving,
    Integrating,
}

/// Simulated time and the global step size.
#[derive(Debug, Clone)]
pub struct Clock {
    time: SimTime,
    step: f64,
    tick: u64,
    state: ClockState,
    config: TimeStepConfig,
    /// States seen by pipeline steps, in order.
    #[cfg(test)]
    pub(crate) observed: Vec<ClockState>,
}

impl Clock {
    pub fn new(config: TimeStepConfig) -> Self {
        Self {
            time: SimTime::ZERO,
            step: config.initial_step.clamp(config.min_step, config.max_step),
            tick: 0,
            state: ClockState::AwaitingTick,
            config,
            #[cfg(test)]
            observed: Vec::new(),
        }
    }

    pub fn time(&self) -> SimTime {
        self.time
    }

    pub fn time_seconds(&self) -> f64 {
        to_seconds(self.time)
    }

    /// Step the next tick will take, in seconds.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Number of completed ticks.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn config(&self) -> &TimeStepConfig {
        &self.config
    }

    pub(crate) fn set_state(&mut self, state: ClockState) {
        self.state = state;
    }

    #[cfg(test)]
    pub(crate) fn observe(&mut self) {
        self.observed.push(self.state);
    }

    /// Duration of the next tick. With `limit`, the tick ends exactly on
    /// `limit` when the regular step would overshoot it or stop less than
    /// `min_step` short of it.
    pub(crate) fn next_dt(&self, limit: Option<SimTime>) -> SimTime {
        let dt = seconds(self.step).max(SimTime::DELTA);
        match limit {
            Some(end) if end > self.time => {
                let remaining = end - self.time;
                let slack = seconds(self.config.min_step).max(SimTime::DELTA);
                if remaining <= dt.saturating_add(slack) {
                    remaining
                } else {
                    dt
                }
            }
            _ => dt,
        }
    }

    pub(crate) fn advance(&mut self, dt: SimTime) {
        self.time += dt;
        self.tick += 1;
    }

    /// Choose the next global step as the smallest proposal, clamped to the
    /// configured bounds. Non-finite proposals are ignored.
    pub(crate) fn select_next_step(&mut self, proposals: impl IntoIterator<Item = f64>) -> f64 {
        let smallest = proposals
            .into_iter()
            .filter(|p| !p.is_nan())
            .fold(f64::INFINITY, f64::min);
        self.step = smallest.clamp(self.config.min_step, self.config.max_step);
        self.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> Clock {
        Clock::new(TimeStepConfig {
            initial_step: 0.5,
            min_step: 0.01,
            max_step: 2.0,
        })
    }

    #[test]
    fn starts_at_zero_awaiting() {
        let c = clock();
        assert_eq!(c.time(), SimTime::ZERO);
        assert_eq!(c.tick(), 0);
        assert_eq!(c.step(), 0.5);
        assert_eq!(c.state(), ClockState::AwaitingTick);
    }

    #[test]
    fn minimum_proposal_wins() {
        let mut c = clock();
        assert_eq!(c.select_next_step([1.5, 0.75, f64::INFINITY]), 0.75);
    }

    #[test]
    fn proposals_are_clamped() {
        let mut c = clock();
        assert_eq!(c.select_next_step([1e-6]), 0.01);
        assert_eq!(c.select_next_step([f64::INFINITY]), 2.0);
        assert_eq!(c.select_next_step(std::iter::empty()), 2.0);
        assert_eq!(c.select_next_step([f64::NAN, 1.0]), 1.0);
    }

    #[test]
    fn advance_accumulates_exactly() {
        let mut c = clock();
        for _ in 0..8 {
            let dt = c.next_dt(None);
            c.advance(dt);
        }
        assert_eq!(c.time(), seconds(4.0));
        assert_eq!(c.tick(), 8);
    }

    #[test]
    fn limit_shortens_last_step() {
        let mut c = clock();
        c.advance(seconds(0.75));
        assert_eq!(c.next_dt(Some(seconds(1.0))), seconds(0.25));
        assert_eq!(c.next_dt(Some(seconds(5.0))), seconds(0.5));
    }

    #[test]
    fn limit_absorbs_sliver_shorter_than_min_step() {
        let mut c = clock();
        c.advance(seconds(0.495));
        // 0.5 s would stop 0.005 s short of 1.0, below min_step.
        assert_eq!(c.next_dt(Some(seconds(1.0))), seconds(1.0) - seconds(0.495));
        assert_eq!(c.next_dt(Some(seconds(1.2))), seconds(0.5));
    }

    #[test]
    fn inexact_steps_land_on_limit() {
        let mut c = Clock::new(TimeStepConfig {
            initial_step: 0.2,
            min_step: 1e-8,
            max_step: 1.0,
        });
        let end = seconds(1.0);
        while c.time() < end {
            let dt = c.next_dt(Some(end));
            c.advance(dt);
        }
        assert_eq!(c.time(), end);
        assert_eq!(c.tick(), 5);
    }

    #[test]
    fn config_validation() {
        assert!(TimeStepConfig::default().validate().is_ok());
        let bad = TimeStepConfig {
            min_step: 1.0,
            max_step: 0.5,
            ..TimeStepConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}

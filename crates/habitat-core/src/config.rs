//! Engine configuration.
//!
//! Every field has a default, so a configuration file only needs to name
//! what it changes.

use crate::clock::TimeStepConfig;
use crate::error::SetupError;
use crate::phase::TimeStepProperties;
use crate::solver::IterativeConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub clock: TimeStepConfig,
    /// Time-step properties for phases that do not set their own.
    pub time_step: TimeStepProperties,
    /// Settings for iterative groups created without explicit settings.
    pub iterative: IterativeConfig,
    /// Negative mass tolerated before a clamp is reported, in kg.
    pub mass_tolerance: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clock: TimeStepConfig::default(),
            time_step: TimeStepProperties::default(),
            iterative: IterativeConfig::default(),
            mass_tolerance: 1e-10,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), SetupError> {
        let invalid = |name: &str, reason: String| SetupError::InvalidParameter {
            name: name.to_string(),
            reason,
        };
        self.clock.validate().map_err(|r| invalid("clock", r))?;
        self.iterative.validate().map_err(|r| invalid("iterative", r))?;
        if !(self.mass_tolerance >= 0.0 && self.mass_tolerance.is_finite()) {
            return Err(invalid(
                "mass_tolerance",
                format!("{} must be finite and non-negative", self.mass_tolerance),
            ));
        }
        Ok(())
    }
}

//! Serde data file structs for habitat definitions.
//!
//! These structs define the on-disk format for substances, property
//! overrides and named mixtures. They are deserialized from RON, JSON, or
//! TOML data files and then resolved against the substance registry by the
//! loader.

use serde::Deserialize;

// ===========================================================================
// Substances
// ===========================================================================

/// A substance definition in a data file.
#[derive(Debug, Clone, Deserialize)]
pub struct SubstanceData {
    pub name: String,
    /// kg/mol.
    pub molar_mass: f64,
    /// Condensed-phase density, kg/m³.
    pub density: f64,
    /// J/(kg·K).
    pub specific_heat: f64,
}

/// TOML wrapper: `[[substances]]` tables.
#[derive(Debug, Clone, Deserialize)]
pub struct TomlSubstances {
    pub substances: Vec<SubstanceData>,
}

/// Adjusts properties of an already defined substance. Fields left out keep
/// their defined value.
#[derive(Debug, Clone, Deserialize)]
pub struct SubstanceOverrideData {
    pub name: String,
    #[serde(default)]
    pub molar_mass: Option<f64>,
    #[serde(default)]
    pub density: Option<f64>,
    #[serde(default)]
    pub specific_heat: Option<f64>,
}

// ===========================================================================
// Mixtures
// ===========================================================================

/// A named composition, e.g. cabin air, given as mass fractions or masses.
/// Entries are normalized to fractions on load.
#[derive(Debug, Clone, Deserialize)]
pub struct MixtureData {
    pub name: String,
    pub components: Vec<(String, f64)>,
}

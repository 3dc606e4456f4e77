use crate::id::SubstanceId;
use std::collections::HashMap;

/// Universal gas constant in J/(mol·K).
pub const GAS_CONSTANT: f64 = 8.314_462_618;

/// A substance definition in the registry.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SubstanceDef {
    pub name: String,
    /// Molar mass in kg/mol.
    pub molar_mass: f64,
    /// Condensed-phase density in kg/m³. Used for liquid, solid and mixture
    /// phases; gas densities come from the equation of state.
    pub density: f64,
    /// Specific heat capacity in J/(kg·K).
    pub specific_heat: f64,
}

/// Errors that can occur while building a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate substance: {0}")]
    Duplicate(String),
    #[error("substance not found: {0}")]
    NotFound(String),
    #[error("invalid property {property} for substance {name}: {value}")]
    InvalidProperty {
        name: String,
        property: &'static str,
        value: f64,
    },
    #[error("registry contains no substances")]
    Empty,
}

/// Builder for constructing an immutable [`Registry`].
/// Substances are registered, optionally adjusted by name, then frozen.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    substances: Vec<SubstanceDef>,
    name_to_id: HashMap<String, SubstanceId>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a substance. Returns its ID.
    pub fn register(
        &mut self,
        name: &str,
        molar_mass: f64,
        density: f64,
        specific_heat: f64,
    ) -> Result<SubstanceId, RegistryError> {
        self.register_def(SubstanceDef {
            name: name.to_string(),
            molar_mass,
            density,
            specific_heat,
        })
    }

    /// Register a fully described substance. Returns its ID.
    pub fn register_def(&mut self, def: SubstanceDef) -> Result<SubstanceId, RegistryError> {
        if self.name_to_id.contains_key(&def.name) {
            return Err(RegistryError::Duplicate(def.name));
        }
        for (property, value) in [
            ("molar_mass", def.molar_mass),
            ("density", def.density),
            ("specific_heat", def.specific_heat),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(RegistryError::InvalidProperty {
                    name: def.name,
                    property,
                    value,
                });
            }
        }
        let id = SubstanceId(self.substances.len() as u32);
        self.name_to_id.insert(def.name.clone(), id);
        self.substances.push(def);
        Ok(id)
    }

    /// Mutate an already registered substance by name.
    pub fn mutate<F>(&mut self, name: &str, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut SubstanceDef),
    {
        let id = self
            .name_to_id
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        f(&mut self.substances[id.index()]);
        Ok(())
    }

    /// Lookup substance ID by name.
    pub fn id(&self, name: &str) -> Option<SubstanceId> {
        self.name_to_id.get(name).copied()
    }

    /// Finalize and build the immutable registry.
    pub fn build(self) -> Result<Registry, RegistryError> {
        if self.substances.is_empty() {
            return Err(RegistryError::Empty);
        }
        Ok(Registry {
            substances: self.substances,
            name_to_id: self.name_to_id,
        })
    }
}

/// Immutable substance table. Frozen after `build()` and shared by every
/// phase through an `Arc`.
#[derive(Debug)]
pub struct Registry {
    substances: Vec<SubstanceDef>,
    name_to_id: HashMap<String, SubstanceId>,
}

impl Registry {
    /// Number of registered substances; the length of every mass vector.
    pub fn len(&self) -> usize {
        self.substances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.substances.is_empty()
    }

    pub fn id(&self, name: &str) -> Option<SubstanceId> {
        self.name_to_id.get(name).copied()
    }

    pub fn get(&self, id: SubstanceId) -> Option<&SubstanceDef> {
        self.substances.get(id.index())
    }

    pub fn name(&self, id: SubstanceId) -> &str {
        self.substances
            .get(id.index())
            .map(|s| s.name.as_str())
            .unwrap_or("<unknown>")
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubstanceId, &SubstanceDef)> {
        self.substances
            .iter()
            .enumerate()
            .map(|(i, s)| (SubstanceId(i as u32), s))
    }

    /// A zero-filled per-substance vector.
    pub fn zeros(&self) -> Vec<f64> {
        vec![0.0; self.substances.len()]
    }

    /// Build a per-substance vector from `(name, value)` pairs.
    pub fn vector(&self, entries: &[(&str, f64)]) -> Result<Vec<f64>, RegistryError> {
        let mut out = self.zeros();
        for (name, value) in entries {
            let id = self
                .id(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            out[id.index()] += *value;
        }
        Ok(out)
    }

    /// Amount of substance in mol for each entry of a mass vector, summed.
    pub fn total_moles(&self, masses: &[f64]) -> f64 {
        masses
            .iter()
            .zip(&self.substances)
            .map(|(m, s)| m / s.molar_mass)
            .sum()
    }

    /// Volume a condensed phase with these masses occupies.
    pub fn condensed_volume(&self, masses: &[f64]) -> f64 {
        masses
            .iter()
            .zip(&self.substances)
            .map(|(m, s)| m / s.density)
            .sum()
    }

    /// Heat capacity in J/K of a mass vector.
    pub fn heat_capacity(&self, masses: &[f64]) -> f64 {
        masses
            .iter()
            .zip(&self.substances)
            .map(|(m, s)| m * s.specific_heat)
            .sum()
    }
}

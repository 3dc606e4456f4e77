//! Resolution pipeline: reads data files, resolves substance names, builds
//! the registry and engine configuration.
//!
//! A data directory holds up to four files, each in RON, TOML or JSON:
//!
//! | Base name | Required | Contents |
//! |---|---|---|
//! | `substances` | yes | [`SubstanceData`] list |
//! | `overrides` | no | [`SubstanceOverrideData`] list |
//! | `mixtures` | no | [`MixtureData`] list |
//! | `engine` | no | [`EngineConfig`] |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use habitat_core::config::EngineConfig;
use habitat_core::error::SetupError;
use habitat_core::registry::{Registry, RegistryBuilder, RegistryError, SubstanceDef};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::schema::{MixtureData, SubstanceData, SubstanceOverrideData};

// ===========================================================================
// Errors
// ===========================================================================

/// Errors that can occur during data loading.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    /// A required data file was not found in the given directory.
    #[error("required file '{file}' not found in {dir}")]
    MissingRequired { file: String, dir: PathBuf },

    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// Two files with the same base name but different formats exist.
    #[error("conflicting formats: {a} and {b}")]
    ConflictingFormats { a: PathBuf, b: PathBuf },

    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// A substance name could not be resolved.
    #[error("unresolved {expected_kind} reference '{name}' in {file}")]
    UnresolvedRef {
        file: PathBuf,
        name: String,
        expected_kind: &'static str,
    },

    #[error("duplicate name '{name}' in {file}")]
    DuplicateName { file: PathBuf, name: String },

    /// A value is outside its allowed range.
    #[error("invalid value in {file}: {detail}")]
    InvalidValue { file: PathBuf, detail: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] SetupError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Format detection
// ===========================================================================

/// Supported data file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

impl Format {
    const ALL: [(Format, &'static str); 3] = [
        (Format::Ron, "ron"),
        (Format::Toml, "toml"),
        (Format::Json, "json"),
    ];

    /// Format of a file, from its extension.
    pub fn of(path: &Path) -> Result<Format, DataLoadError> {
        let ext = path.extension().and_then(|e| e.to_str());
        Self::ALL
            .iter()
            .find(|(_, e)| Some(*e) == ext)
            .map(|(f, _)| *f)
            .ok_or_else(|| DataLoadError::UnsupportedFormat {
                file: path.to_path_buf(),
            })
    }
}

// ===========================================================================
// File discovery
// ===========================================================================

/// Find `{base_name}.ron`, `.toml` or `.json` in `dir`.
///
/// Returns `Ok(None)` when none exists and `ConflictingFormats` when more
/// than one does.
pub fn find_data_file(dir: &Path, base_name: &str) -> Result<Option<PathBuf>, DataLoadError> {
    let mut found: Option<PathBuf> = None;
    for (_, ext) in Format::ALL {
        let candidate = dir.join(format!("{base_name}.{ext}"));
        if !candidate.exists() {
            continue;
        }
        if let Some(existing) = found {
            return Err(DataLoadError::ConflictingFormats {
                a: existing,
                b: candidate,
            });
        }
        found = Some(candidate);
    }
    Ok(found)
}

/// Like [`find_data_file`], but a missing file is an error.
pub fn require_data_file(dir: &Path, base_name: &str) -> Result<PathBuf, DataLoadError> {
    find_data_file(dir, base_name)?.ok_or_else(|| DataLoadError::MissingRequired {
        file: base_name.to_string(),
        dir: dir.to_path_buf(),
    })
}

// ===========================================================================
// Deserialization
// ===========================================================================

fn parse_error(path: &Path, detail: impl ToString) -> DataLoadError {
    DataLoadError::Parse {
        file: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

/// Read a file and deserialize it in the format given by its extension.
pub fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let format = Format::of(path)?;
    let content = std::fs::read_to_string(path)?;
    match format {
        Format::Ron => ron::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Json => serde_json::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Toml => toml::from_str(&content).map_err(|e| parse_error(path, e)),
    }
}

/// Deserialize a list. RON and JSON files hold the list itself; TOML files
/// hold it as an array of tables under `toml_key`.
pub fn deserialize_list<T: DeserializeOwned>(
    path: &Path,
    toml_key: &str,
) -> Result<Vec<T>, DataLoadError> {
    if Format::of(path)? != Format::Toml {
        return deserialize_file(path);
    }
    let mut table: toml::Table = deserialize_file(path)?;
    let array = table
        .remove(toml_key)
        .ok_or_else(|| parse_error(path, format!("missing key '{toml_key}' in TOML file")))?;
    array
        .try_into()
        .map_err(|e: toml::de::Error| parse_error(path, e))
}

// ===========================================================================
// Loaded data
// ===========================================================================

/// Everything loaded from a data directory.
#[derive(Debug, Clone)]
pub struct HabitatData {
    pub registry: Arc<Registry>,
    pub config: EngineConfig,
    /// Named compositions as mass-fraction vectors over the registry.
    pub mixtures: HashMap<String, Vec<f64>>,
}

impl HabitatData {
    pub fn mixture(&self, name: &str) -> Option<&[f64]> {
        self.mixtures.get(name).map(Vec::as_slice)
    }

    /// Per-substance masses for `total` kg of the named mixture.
    pub fn masses(&self, mixture: &str, total: f64) -> Option<Vec<f64>> {
        self.mixture(mixture)
            .map(|fractions| fractions.iter().map(|x| x * total).collect())
    }
}

/// Load substances, overrides, mixtures and engine settings from `dir`.
pub fn load_habitat_data(dir: &Path) -> Result<HabitatData, DataLoadError> {
    let substances_path = require_data_file(dir, "substances")?;
    let substances: Vec<SubstanceData> = deserialize_list(&substances_path, "substances")?;
    let mut builder = build_registry(&substances_path, substances)?;

    if let Some(path) = find_data_file(dir, "overrides")? {
        let overrides: Vec<SubstanceOverrideData> = deserialize_list(&path, "overrides")?;
        debug!(file = %path.display(), count = overrides.len(), "applying substance overrides");
        apply_overrides(&mut builder, &path, overrides)?;
    }
    let registry = Arc::new(builder.build()?);

    let mixtures = match find_data_file(dir, "mixtures")? {
        Some(path) => {
            let list: Vec<MixtureData> = deserialize_list(&path, "mixtures")?;
            resolve_mixtures(&registry, &path, list)?
        }
        None => HashMap::new(),
    };

    let config = match find_data_file(dir, "engine")? {
        Some(path) => {
            let config: EngineConfig = deserialize_file(&path)?;
            config.validate()?;
            config
        }
        None => EngineConfig::default(),
    };

    info!(
        dir = %dir.display(),
        substances = registry.len(),
        mixtures = mixtures.len(),
        "habitat data loaded"
    );
    Ok(HabitatData {
        registry,
        config,
        mixtures,
    })
}

fn build_registry(
    path: &Path,
    substances: Vec<SubstanceData>,
) -> Result<RegistryBuilder, DataLoadError> {
    let mut builder = RegistryBuilder::new();
    for s in substances {
        if builder.id(&s.name).is_some() {
            return Err(DataLoadError::DuplicateName {
                file: path.to_path_buf(),
                name: s.name,
            });
        }
        builder.register_def(SubstanceDef {
            name: s.name,
            molar_mass: s.molar_mass,
            density: s.density,
            specific_heat: s.specific_heat,
        })?;
    }
    Ok(builder)
}

fn apply_overrides(
    builder: &mut RegistryBuilder,
    path: &Path,
    overrides: Vec<SubstanceOverrideData>,
) -> Result<(), DataLoadError> {
    for o in overrides {
        if builder.id(&o.name).is_none() {
            return Err(DataLoadError::UnresolvedRef {
                file: path.to_path_buf(),
                name: o.name,
                expected_kind: "substance",
            });
        }
        for (property, value) in [
            ("molar_mass", o.molar_mass),
            ("density", o.density),
            ("specific_heat", o.specific_heat),
        ] {
            if let Some(v) = value
                && !(v.is_finite() && v > 0.0)
            {
                return Err(DataLoadError::InvalidValue {
                    file: path.to_path_buf(),
                    detail: format!("{property} of '{}' must be positive, got {v}", o.name),
                });
            }
        }
        builder.mutate(&o.name, |def| {
            if let Some(v) = o.molar_mass {
                def.molar_mass = v;
            }
            if let Some(v) = o.density {
                def.density = v;
            }
            if let Some(v) = o.specific_heat {
                def.specific_heat = v;
            }
        })?;
    }
    Ok(())
}

fn resolve_mixtures(
    registry: &Registry,
    path: &Path,
    list: Vec<MixtureData>,
) -> Result<HashMap<String, Vec<f64>>, DataLoadError> {
    let mut mixtures = HashMap::new();
    for m in list {
        if mixtures.contains_key(&m.name) {
            return Err(DataLoadError::DuplicateName {
                file: path.to_path_buf(),
                name: m.name,
            });
        }
        let mut fractions = registry.zeros();
        for (substance, amount) in &m.components {
            let id = registry
                .id(substance)
                .ok_or_else(|| DataLoadError::UnresolvedRef {
                    file: path.to_path_buf(),
                    name: substance.clone(),
                    expected_kind: "substance",
                })?;
            if !(amount.is_finite() && *amount >= 0.0) {
                return Err(DataLoadError::InvalidValue {
                    file: path.to_path_buf(),
                    detail: format!("amount of '{substance}' in '{}' is {amount}", m.name),
                });
            }
            fractions[id.index()] += amount;
        }
        let total: f64 = fractions.iter().sum();
        if total <= 0.0 {
            return Err(DataLoadError::InvalidValue {
                file: path.to_path_buf(),
                detail: format!("mixture '{}' is empty", m.name),
            });
        }
        fractions.iter_mut().for_each(|x| *x /= total);
        mixtures.insert(m.name, fractions);
    }
    Ok(mixtures)
}

// ===========================================================================
// Tests
// ===========================================================================

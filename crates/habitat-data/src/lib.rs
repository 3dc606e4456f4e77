//! Data-file loading for habitat networks.
//!
//! Reads the substance table, property overrides, named mixtures and engine
//! settings from RON, TOML or JSON files in a directory.

pub mod loader;
pub mod schema;

pub use loader::{DataLoadError, HabitatData, load_habitat_data};

//! Run configuration for a reduction.
//!
//! Every field has a default, so a JSON file only needs to name the values
//! it changes.

use crate::combine::CombineSettings;
use crate::flat::FlatSettings;
use crate::noise::{ErrorCombination, NoiseModel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DarkSettings {
    /// Largest exposure difference, in seconds, accepted for a scaled dark
    pub match_tolerance: f64,
}

impl Default for DarkSettings {
    fn default() -> Self {
        Self {
            match_tolerance: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    pub combine: CombineSettings,
    pub darks: DarkSettings,
    pub flats: FlatSettings,
    pub noise: NoiseModel,
    pub error_combination: ErrorCombination,
    /// Subtract a matched master dark from science frames before flat
    /// correction
    pub dark_correct_science: bool,
    /// Abort on the first per-frame failure instead of recording it
    pub fail_fast: bool,
    /// Science frames whose VIEW_POS starts with this carry a spectrum
    pub spectrum_tag_prefix: String,
    /// Extension of every product written
    pub file_extension: String,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            combine: CombineSettings::default(),
            darks: DarkSettings::default(),
            flats: FlatSettings::default(),
            noise: NoiseModel::default(),
            error_combination: ErrorCombination::default(),
            dark_correct_science: true,
            fail_fast: false,
            spectrum_tag_prefix: "open".to_string(),
            file_extension: "fits".to_string(),
        }
    }
}

impl ReductionConfig {
    /// Save to JSON file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from JSON file
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

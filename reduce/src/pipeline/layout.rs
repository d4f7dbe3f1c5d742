//! Where each stage writes its products.
//!
//! Products live in stage-private subdirectories of the directory holding
//! the corresponding raw frames, so distinct stages never write to the same
//! path.

use std::path::{Path, PathBuf};

pub const CALI_BIAS_DIR: &str = "cali_bias";
pub const CALI_DARK_DIR: &str = "cali_dark";
pub const CALI_FLAT_DIR: &str = "cali_flat";
pub const CALI_SCIENCE_DIR: &str = "cali_science";
pub const FINAL_DIR: &str = "Final_calibrated_science";
pub const ERROR_DIR: &str = "Error_final_calibrated_science";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    extension: String,
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self::new("fits")
    }
}

impl OutputLayout {
    pub fn new(extension: impl Into<String>) -> Self {
        let extension = extension.into();
        Self {
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn cali_bias_dir(&self, bias_dir: &Path) -> PathBuf {
        bias_dir.join(CALI_BIAS_DIR)
    }

    pub fn master_bias(&self, bias_dir: &Path) -> PathBuf {
        self.cali_bias_dir(bias_dir)
            .join(format!("master_bias.{}", self.extension))
    }

    pub fn cali_dark_dir(&self, dark_dir: &Path) -> PathBuf {
        dark_dir.join(CALI_DARK_DIR)
    }

    /// Bias-corrected copy of a raw dark.
    pub fn corrected_dark(&self, dark_dir: &Path, name: &str) -> PathBuf {
        self.cali_dark_dir(dark_dir).join(name)
    }

    /// Master dark for one exposure time, e.g. `combined_dark_10.000.fits`.
    pub fn combined_dark(&self, dark_dir: &Path, exptime: f64) -> PathBuf {
        self.cali_dark_dir(dark_dir)
            .join(format!("combined_dark_{exptime:.3}.{}", self.extension))
    }

    pub fn cali_flat_dir(&self, flat_dir: &Path) -> PathBuf {
        flat_dir.join(CALI_FLAT_DIR)
    }

    pub fn corrected_flat(&self, flat_dir: &Path, name: &str) -> PathBuf {
        self.cali_flat_dir(flat_dir).join(format!("flat-{name}"))
    }

    pub fn master_flat(&self, flat_dir: &Path) -> PathBuf {
        self.cali_flat_dir(flat_dir)
            .join(format!("master_flat.{}", self.extension))
    }

    pub fn cali_science_dir(&self, science_dir: &Path) -> PathBuf {
        science_dir.join(CALI_SCIENCE_DIR)
    }

    pub fn calibrated_science(&self, science_dir: &Path, name: &str) -> PathBuf {
        self.cali_science_dir(science_dir).join(name)
    }

    pub fn final_dir(&self, science_dir: &Path) -> PathBuf {
        science_dir.join(FINAL_DIR)
    }

    pub fn sky_subtracted(&self, science_dir: &Path, name: &str) -> PathBuf {
        self.final_dir(science_dir).join(format!("sky_sub_{name}"))
    }

    pub fn error_dir(&self, science_dir: &Path) -> PathBuf {
        science_dir.join(ERROR_DIR)
    }

    pub fn sky_subtracted_error(&self, science_dir: &Path, name: &str) -> PathBuf {
        self.error_dir(science_dir).join(format!("sky_sub_err_{name}"))
    }
}

//! Outcome of a pipeline run.

use super::Stage;
use crate::dark::DarkMatchStrategy;
use std::path::PathBuf;
use tracing::{info, warn};

/// A frame that could not be processed; the run carried on without it.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameFailure {
    pub stage: Stage,
    pub path: PathBuf,
    pub error: String,
}

/// Everything a run wrote and everything it skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// Every product written, in write order
    pub products: Vec<PathBuf>,
    pub failures: Vec<FrameFailure>,
    /// How each flat and science frame was dark-corrected
    pub dark_matches: Vec<(PathBuf, DarkMatchStrategy)>,
    /// True when no bias frames were given
    pub without_bias: bool,
    pub master_darks: usize,
    pub sky_pairs: usize,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn wrote(&mut self, path: PathBuf) {
        self.products.push(path);
    }

    pub(crate) fn failed(&mut self, stage: Stage, path: PathBuf, error: String) {
        self.failures.push(FrameFailure { stage, path, error });
    }

    /// Products under `dir`.
    pub fn products_in(&self, dir: &std::path::Path) -> Vec<&PathBuf> {
        self.products
            .iter()
            .filter(|p| p.parent() == Some(dir))
            .collect()
    }

    pub fn log_summary(&self) {
        info!("==================== REDUCTION SUMMARY ====================");
        if self.without_bias {
            info!("Bias: none (frames were not bias-subtracted)");
        }
        info!("Master darks: {}", self.master_darks);
        let scaled = self
            .dark_matches
            .iter()
            .filter(|(_, s)| matches!(s, DarkMatchStrategy::Scaled { .. }))
            .count();
        info!(
            "Dark matches: {} exact, {} scaled",
            self.dark_matches.len() - scaled,
            scaled
        );
        info!("Sky-subtracted pairs: {}", self.sky_pairs);
        info!("Products written: {}", self.products.len());
        if self.failures.is_empty() {
            info!("No frame failures");
        } else {
            warn!("{} frames failed:", self.failures.len());
            for failure in &self.failures {
                warn!(
                    "  [{}] {}: {}",
                    failure.stage,
                    failure.path.display(),
                    failure.error
                );
            }
        }
    }
}

//! Flat-field normalisation and correction.

use crate::combine::{CombineError, Combiner, MasterFrame};
use crate::error::CalibrationError;
use frames::stats::median;
use frames::{Frame, FrameStore};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Reciprocal of the frame's median, NaN when undefined.
///
/// Used as the per-frame scale when combining flats so that every flat
/// contributes at unit median brightness.
pub fn inverse_median(data: &Array2<f64>) -> f64 {
    let values: Vec<f64> = data.iter().copied().collect();
    median(&values).map_or(f64::NAN, |m| 1.0 / m)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatSettings {
    /// Master flat pixels with an absolute value below this are unusable
    pub min_flat_value: f64,
}

impl Default for FlatSettings {
    fn default() -> Self {
        Self {
            min_flat_value: 1e-6,
        }
    }
}

/// Builds normalised master flats and divides frames by them.
#[derive(Debug, Clone, Default)]
pub struct FlatNormalizer {
    combiner: Combiner,
    settings: FlatSettings,
}

impl FlatNormalizer {
    pub fn new(combiner: Combiner, settings: FlatSettings) -> Self {
        Self { combiner, settings }
    }

    /// Combine bias- and dark-corrected flats, each scaled to unit median.
    pub fn build_master_flat(&self, flats: &[Frame]) -> Result<MasterFrame, CombineError> {
        self.combiner.combine(flats, Some(&inverse_median))
    }

    /// Same as [`FlatNormalizer::build_master_flat`] for flats held in a store.
    pub fn build_master_flat_from_store(
        &self,
        store: &dyn FrameStore,
        paths: &[PathBuf],
    ) -> Result<MasterFrame, CombineError> {
        self.combiner
            .combine_from_store(store, paths, Some(&inverse_median))
    }

    /// Number of master flat pixels that would blow up a division.
    pub fn unusable_pixels(&self, master_flat: &Frame) -> usize {
        master_flat
            .data
            .iter()
            .filter(|v| !v.is_finite() || v.abs() < self.settings.min_flat_value)
            .count()
    }

    /// `frame / master_flat`, pixel by pixel.
    ///
    /// Refuses to divide when the master flat holds zero, near-zero or
    /// non-finite pixels rather than letting inf/NaN into the product.
    pub fn apply(&self, frame: &Frame, master_flat: &Frame) -> Result<Frame, CalibrationError> {
        frame.check_same_shape(master_flat)?;
        let count = self.unusable_pixels(master_flat);
        if count > 0 {
            return Err(CalibrationError::NearZeroFlat {
                count,
                threshold: self.settings.min_flat_value,
            });
        }

        let mut data = Array2::<f64>::zeros(frame.shape());
        Zip::from(&mut data)
            .and(&frame.data)
            .and(&master_flat.data)
            .for_each(|out, &signal, &flat| *out = signal / flat);

        let mut corrected = frame.with_data(data);
        corrected.header.provenance.flat_corrected = true;
        Ok(corrected)
    }
}

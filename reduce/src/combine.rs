//! Robust combination of same-type frames into a master frame.
//!
//! Each output pixel is the mean of the input values that survive iterative
//! sigma clipping around the median, with the spread estimated from the
//! median absolute deviation. Pixels are independent of each other, so the
//! frame stack can be processed in row bands (to respect a memory limit) and
//! the bands in parallel, without changing the result.

use frames::stats::{center_and_spread_in_place, mean};
use frames::{check_shape, Frame, FrameStore, ShapeMismatch, StoreError};
use ndarray::{s, Array2, ArrayView2, ArrayViewMut1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// A frame produced by combining several inputs; `provenance.combined` is set.
pub type MasterFrame = Frame;

/// Per-frame multiplicative scale applied before combination.
pub type ScaleFn = dyn Fn(&Array2<f64>) -> f64 + Sync;

#[derive(Error, Debug)]
pub enum CombineError {
    #[error("no frames to combine")]
    EmptyInput,
    #[error("frame {index} has a different shape: {source}")]
    ShapeMismatch {
        index: usize,
        #[source]
        source: ShapeMismatch,
    },
    #[error("scale factor for frame {index} is unusable: {factor}")]
    DegenerateScale { index: usize, factor: f64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Sigma-clipping and memory parameters of a combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombineSettings {
    /// Reject values more than this many sigma below the centre
    pub low_thresh: f64,
    /// Reject values more than this many sigma above the centre
    pub high_thresh: f64,
    /// Upper bound on clipping passes per pixel
    pub max_iters: usize,
    /// Bytes of input pixels allowed in memory at once
    pub memory_limit_bytes: usize,
}

impl Default for CombineSettings {
    fn default() -> Self {
        Self {
            low_thresh: 5.0,
            high_thresh: 5.0,
            max_iters: 5,
            memory_limit_bytes: 350_000_000,
        }
    }
}

impl CombineSettings {
    /// Rows per band such that `num_frames` bands of `cols` doubles stay
    /// under the memory limit. Never less than one row.
    pub fn rows_per_band(&self, num_frames: usize, rows: usize, cols: usize) -> usize {
        let bytes_per_row = num_frames.max(1) * cols.max(1) * std::mem::size_of::<f64>();
        (self.memory_limit_bytes / bytes_per_row).clamp(1, rows.max(1))
    }
}

/// Sigma-clipped mean of one pixel stack.
///
/// NaN inputs are ignored; an all-NaN stack yields NaN. The value at the
/// centre can never be rejected, so at least one value always survives.
pub fn clipped_mean(stack: &[f64], settings: &CombineSettings) -> f64 {
    let mut survivors: Vec<f64> = stack.iter().copied().filter(|v| !v.is_nan()).collect();
    if survivors.is_empty() {
        return f64::NAN;
    }

    let mut scratch = Vec::with_capacity(survivors.len());
    for _ in 0..settings.max_iters {
        scratch.clear();
        scratch.extend_from_slice(&survivors);
        let (center, spread) = center_and_spread_in_place(&mut scratch);

        let lower = center - settings.low_thresh * spread;
        let upper = center + settings.high_thresh * spread;
        let kept: Vec<f64> = survivors
            .iter()
            .copied()
            .filter(|&v| v >= lower && v <= upper)
            .collect();

        if kept.len() == survivors.len() || kept.is_empty() {
            break;
        }
        survivors = kept;
    }

    mean(&survivors).unwrap_or(f64::NAN)
}

/// Combine one band of rows. All views share the band's shape.
fn combine_band(
    bands: &[ArrayView2<f64>],
    factors: &[f64],
    settings: &CombineSettings,
    mut out: ndarray::ArrayViewMut2<f64>,
) {
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(row, mut out_row): (usize, ArrayViewMut1<f64>)| {
            let mut stack = Vec::with_capacity(bands.len());
            for (col, out_px) in out_row.iter_mut().enumerate() {
                stack.clear();
                stack.extend(
                    bands
                        .iter()
                        .zip(factors)
                        .map(|(band, factor)| band[[row, col]] * factor),
                );
                *out_px = clipped_mean(&stack, settings);
            }
        });
}

fn checked_factor(index: usize, data: &Array2<f64>, scale: Option<&ScaleFn>) -> Result<f64, CombineError> {
    let factor = scale.map_or(1.0, |f| f(data));
    if !factor.is_finite() || factor == 0.0 {
        return Err(CombineError::DegenerateScale { index, factor });
    }
    Ok(factor)
}

fn mark_combined(mut frame: Frame) -> MasterFrame {
    frame.header.provenance.combined = true;
    frame.uncertainty = None;
    frame
}

/// Combines frames held in memory or in a [`FrameStore`].
#[derive(Debug, Clone, Default)]
pub struct Combiner {
    settings: CombineSettings,
}

impl Combiner {
    pub fn new(settings: CombineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CombineSettings {
        &self.settings
    }

    /// Combine frames already in memory.
    ///
    /// The master's header is a copy of the first frame's header with the
    /// `combined` flag set.
    pub fn combine(&self, frames: &[Frame], scale: Option<&ScaleFn>) -> Result<MasterFrame, CombineError> {
        let first = frames.first().ok_or(CombineError::EmptyInput)?;
        let shape = first.shape();
        for (index, frame) in frames.iter().enumerate() {
            check_shape(shape, frame.shape())
                .map_err(|source| CombineError::ShapeMismatch { index, source })?;
        }

        let factors = frames
            .iter()
            .enumerate()
            .map(|(index, f)| checked_factor(index, &f.data, scale))
            .collect::<Result<Vec<_>, _>>()?;
        let views: Vec<ArrayView2<f64>> = frames.iter().map(|f| f.data.view()).collect();
        let mut data = Array2::<f64>::zeros(shape);
        combine_band(&views, &factors, &self.settings, data.view_mut());

        Ok(mark_combined(first.with_data(data)))
    }

    /// Combine frames read from `store`, holding at most a memory-limited
    /// band of rows from every frame at once.
    ///
    /// Scale factors need whole frames and are computed first, reading one
    /// frame at a time. The result equals [`Combiner::combine`] on the same
    /// frames.
    ///
    /// # Arguments
    ///
    /// * `store` - Where the input frames live
    /// * `paths` - Input frames; the first one supplies the master's header
    /// * `scale` - Optional per-frame factor applied before clipping
    ///
    /// # Returns
    ///
    /// * `Ok(master)` - Sigma-clipped mean with `provenance.combined` set
    /// * `Err(EmptyInput)` - `paths` is empty
    /// * `Err(ShapeMismatch)` - An input differs in shape from the first
    /// * `Err(DegenerateScale)` - A scale factor is zero or non-finite
    pub fn combine_from_store(
        &self,
        store: &dyn FrameStore,
        paths: &[PathBuf],
        scale: Option<&ScaleFn>,
    ) -> Result<MasterFrame, CombineError> {
        let first_path = paths.first().ok_or(CombineError::EmptyInput)?;
        let first_info = store.read_info(first_path)?;
        let shape = first_info.shape;
        for (index, path) in paths.iter().enumerate().skip(1) {
            let info = store.read_info(path)?;
            check_shape(shape, info.shape)
                .map_err(|source| CombineError::ShapeMismatch { index, source })?;
        }

        let factors = match scale {
            Some(_) => paths
                .iter()
                .enumerate()
                .map(|(index, p)| {
                    let frame = store.read_frame(p)?;
                    checked_factor(index, &frame.data, scale)
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![1.0; paths.len()],
        };

        let (rows, cols) = shape;
        let band_rows = self.settings.rows_per_band(paths.len(), rows, cols);
        debug!(
            "Combining {} frames of {}x{} in bands of {} rows",
            paths.len(),
            rows,
            cols,
            band_rows
        );

        let mut data = Array2::<f64>::zeros(shape);
        let mut start = 0;
        while start < rows {
            let count = band_rows.min(rows - start);
            let bands = paths
                .iter()
                .map(|p| store.read_rows(p, start, count))
                .collect::<Result<Vec<_>, _>>()?;
            let views: Vec<ArrayView2<f64>> = bands.iter().map(|b| b.view()).collect();
            combine_band(
                &views,
                &factors,
                &self.settings,
                data.slice_mut(s![start..start + count, ..]),
            );
            start += count;
        }

        Ok(mark_combined(Frame::new(data, first_info.header)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use frames::{FrameHeader, ImageType, MemoryStore};
    use test_helpers::noise_frame;

    fn settings() -> CombineSettings {
        CombineSettings::default()
    }

    #[test]
    fn test_clipped_mean_without_outliers_is_mean() {
        let stack = [10.0, 11.0, 9.0, 10.5, 9.5];
        assert_relative_eq!(clipped_mean(&stack, &settings()), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_clipped_mean_rejects_single_outlier() {
        let stack = [100.0, 101.0, 99.0, 100.5, 100_000.0];
        assert_relative_eq!(clipped_mean(&stack, &settings()), 100.125, epsilon = 1e-9);
    }

    #[test]
    fn test_clipped_mean_zero_spread_keeps_center() {
        let stack = [7.0, 7.0, 7.0, 7.0, 7000.0];
        assert_eq!(clipped_mean(&stack, &settings()), 7.0);
    }

    #[test]
    fn test_clipped_mean_ignores_nan() {
        assert_eq!(clipped_mean(&[1.0, f64::NAN, 3.0], &settings()), 2.0);
        assert!(clipped_mean(&[f64::NAN], &settings()).is_nan());
    }

    #[test]
    fn test_clipped_mean_no_iterations_is_plain_mean() {
        let s = CombineSettings {
            max_iters: 0,
            ..settings()
        };
        assert_eq!(clipped_mean(&[0.0, 0.0, 0.0, 0.0, 500.0], &s), 100.0);
    }

    /// Frames whose pixel stacks are evenly spread around `level`, so that
    /// no value sits anywhere near the clipping thresholds.
    fn spread_frames(n: usize, shape: (usize, usize), level: f64) -> Vec<Frame> {
        (0..n)
            .map(|k| {
                let offset = k as f64 - (n as f64 - 1.0) / 2.0;
                let data = Array2::from_shape_fn(shape, |(r, c)| {
                    level + offset * (0.5 + ((r + c) % 3) as f64)
                });
                Frame::new(data, FrameHeader::new(ImageType::Dark, 10.0))
            })
            .collect()
    }

    #[test]
    fn test_combine_unclipped_stack_is_arithmetic_mean() {
        let frames = spread_frames(7, (16, 12), 200.0);
        let master = Combiner::default().combine(&frames, None).unwrap();

        for ((r, c), &v) in master.data.indexed_iter() {
            let mean = frames.iter().map(|f| f.data[[r, c]]).sum::<f64>() / frames.len() as f64;
            assert_relative_eq!(v, mean, epsilon = 1e-9);
        }
        assert!(master.header.provenance.combined);
        assert_eq!(master.header.exptime, Some(10.0));
    }

    #[test]
    fn test_combine_excludes_injected_outlier() {
        let mut frames: Vec<Frame> = [100.0, 99.0, 99.5, 100.5, 101.0]
            .iter()
            .map(|&v| Frame::constant((8, 8), v, FrameHeader::new(ImageType::Bias, 0.0)))
            .collect();
        let local_mean = 100.0;
        frames[0].data[[3, 4]] = 1000.0 * local_mean;

        let master = Combiner::default().combine(&frames, None).unwrap();
        assert_relative_eq!(master.data[[3, 4]], local_mean, epsilon = 1e-12);
        assert_relative_eq!(master.data[[0, 0]], 100.0, epsilon = 1e-12);
    }

    #[test]
    fn test_combine_empty_input() {
        let err = Combiner::default().combine(&[], None).unwrap_err();
        assert!(matches!(err, CombineError::EmptyInput));
    }

    #[test]
    fn test_combine_shape_mismatch() {
        let a = Frame::constant((2, 2), 1.0, FrameHeader::default());
        let b = Frame::constant((3, 2), 1.0, FrameHeader::default());
        let err = Combiner::default().combine(&[a, b], None).unwrap_err();
        assert!(matches!(err, CombineError::ShapeMismatch { index: 1, .. }));
    }

    #[test]
    fn test_combine_with_scale() {
        let a = Frame::constant((2, 2), 50.0, FrameHeader::default());
        let b = Frame::constant((2, 2), 200.0, FrameHeader::default());
        let inverse_mean = |d: &Array2<f64>| 1.0 / d.mean().unwrap_or(f64::NAN);
        let master = Combiner::default().combine(&[a, b], Some(&inverse_mean)).unwrap();
        assert!(master.data.iter().all(|&v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_degenerate_scale_rejected() {
        let a = Frame::constant((2, 2), 0.0, FrameHeader::default());
        let inverse = |d: &Array2<f64>| 1.0 / d[[0, 0]];
        let err = Combiner::default().combine(&[a], Some(&inverse)).unwrap_err();
        assert!(matches!(err, CombineError::DegenerateScale { index: 0, .. }));
    }

    #[test]
    fn test_banded_store_combine_matches_in_memory() {
        let store = MemoryStore::new();
        let mut inputs = Vec::new();
        let mut paths = Vec::new();
        for seed in 0..6 {
            let mut frame = noise_frame((37, 11), 500.0, 20.0, seed, FrameHeader::new(ImageType::Flat, 2.0));
            if seed == 2 {
                frame.data[[20, 5]] = 1.0e6;
            }
            let path = PathBuf::from(format!("/flats/f{seed}.fits"));
            store.insert(path.clone(), frame.clone());
            inputs.push(frame);
            paths.push(path);
        }

        // Room for roughly two rows of six frames.
        let tiny = Combiner::new(CombineSettings {
            memory_limit_bytes: 2 * 6 * 11 * 8 + 5,
            ..CombineSettings::default()
        });
        assert_eq!(tiny.settings().rows_per_band(6, 37, 11), 2);

        let inverse_median =
            |d: &Array2<f64>| 1.0 / frames::stats::median(d.as_slice().unwrap_or(&[])).unwrap_or(f64::NAN);
        let banded = tiny
            .combine_from_store(&store, &paths, Some(&inverse_median))
            .unwrap();
        let whole = Combiner::default()
            .combine(&inputs, Some(&inverse_median))
            .unwrap();

        assert_eq!(banded.data, whole.data);
        assert!(banded.header.provenance.combined);
    }

    #[test]
    fn test_rows_per_band_bounds() {
        let s = CombineSettings {
            memory_limit_bytes: 0,
            ..CombineSettings::default()
        };
        assert_eq!(s.rows_per_band(10, 100, 100), 1);
        assert_eq!(CombineSettings::default().rows_per_band(3, 64, 64), 64);
    }
}

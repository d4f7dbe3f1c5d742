//! Dark-current correction.
//!
//! Master darks are keyed by exposure time. A frame is matched to the dark
//! with the same exposure when one exists, and otherwise to the closest
//! exposure within a tolerance, in which case the dark is scaled linearly by
//! the exposure ratio. Linear scaling assumes the dark current is linear in
//! time and that bias has been removed from both frames.

use crate::combine::MasterFrame;
use crate::error::CalibrationError;
use frames::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exposure time in `available` matching `target`.
///
/// An exact match always wins. Otherwise, with a positive `tolerance`, the
/// closest exposure no further than `tolerance` away is returned, ties going
/// to the shorter exposure. With `tolerance == 0` only exact matches count.
pub fn find_nearest(target: f64, available: &[f64], tolerance: f64) -> Option<f64> {
    if available.iter().any(|&t| t == target) {
        return Some(target);
    }
    if tolerance <= 0.0 {
        return None;
    }
    available
        .iter()
        .copied()
        .filter(|t| t.is_finite())
        .map(|t| ((t - target).abs(), t))
        .filter(|(diff, _)| *diff <= tolerance)
        .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)))
        .map(|(_, t)| t)
}

/// How a master dark is applied to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DarkMatchStrategy {
    /// Dark with the frame's own exposure, subtracted as is
    Exact(f64),
    /// Dark of another exposure, multiplied by `ratio` = frame / dark exposure
    Scaled { exptime: f64, ratio: f64 },
}

impl DarkMatchStrategy {
    /// Exposure time of the master dark this strategy uses.
    pub fn dark_exptime(&self) -> f64 {
        match *self {
            DarkMatchStrategy::Exact(t) => t,
            DarkMatchStrategy::Scaled { exptime, .. } => exptime,
        }
    }

    /// Multiplier applied to the dark before subtraction.
    pub fn ratio(&self) -> f64 {
        match *self {
            DarkMatchStrategy::Exact(_) => 1.0,
            DarkMatchStrategy::Scaled { ratio, .. } => ratio,
        }
    }
}

impl fmt::Display for DarkMatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DarkMatchStrategy::Exact(t) => write!(f, "exact {t}s dark"),
            DarkMatchStrategy::Scaled { exptime, ratio } => {
                write!(f, "{exptime}s dark scaled by {ratio:.4}")
            }
        }
    }
}

/// Decide which dark serves a frame of exposure `target`.
///
/// Tries an exact match first, then the nearest exposure within
/// `tolerance`.
///
/// # Arguments
///
/// * `target` - Exposure time of the frame to correct, in seconds
/// * `available` - Exposure times of the master darks on hand
/// * `tolerance` - Largest accepted exposure difference for a scaled match
///
/// # Returns
///
/// * `Ok(Exact)` - A master dark with exactly `target` seconds exists
/// * `Ok(Scaled)` - The nearest dark, with the ratio `target / exptime`
/// * `Err(ExposureMatchExhausted)` - No dark within `tolerance`
/// * `Err(InvalidDarkExposure)` - The nearest dark has a zero exposure
pub fn resolve_dark_strategy(
    target: f64,
    available: &[f64],
    tolerance: f64,
) -> Result<DarkMatchStrategy, CalibrationError> {
    if let Some(exptime) = find_nearest(target, available, 0.0) {
        return Ok(DarkMatchStrategy::Exact(exptime));
    }
    match find_nearest(target, available, tolerance) {
        Some(exptime) if exptime > 0.0 => Ok(DarkMatchStrategy::Scaled {
            exptime,
            ratio: target / exptime,
        }),
        Some(exptime) => Err(CalibrationError::InvalidDarkExposure(exptime)),
        None => Err(CalibrationError::ExposureMatchExhausted {
            target,
            tolerance,
            available: available.to_vec(),
        }),
    }
}

/// Subtract a master dark according to `strategy`.
pub fn apply_dark(
    frame: &Frame,
    dark: &Frame,
    strategy: DarkMatchStrategy,
) -> Result<Frame, CalibrationError> {
    frame.check_same_shape(dark)?;
    let data = match strategy {
        DarkMatchStrategy::Exact(exptime) => {
            let frame_exptime = frame
                .exptime()
                .ok_or(CalibrationError::MissingExposureTime("frame"))?;
            if frame_exptime != exptime || dark.exptime() != Some(exptime) {
                return Err(CalibrationError::ExposureMismatch {
                    frame: frame_exptime,
                    dark: dark.exptime().unwrap_or(f64::NAN),
                });
            }
            &frame.data - &dark.data
        }
        DarkMatchStrategy::Scaled { ratio, .. } => &frame.data - &(&dark.data * ratio),
    };
    let mut corrected = frame.with_data(data);
    corrected.header.provenance.dark_subtracted = true;
    Ok(corrected)
}

/// Subtract `dark` from `frame`.
///
/// Without `scale` the exposures must be equal. With `scale` the dark is
/// multiplied by `frame.exptime / dark.exptime` first.
pub fn subtract_dark(frame: &Frame, dark: &Frame, scale: bool) -> Result<Frame, CalibrationError> {
    let frame_exptime = frame
        .exptime()
        .ok_or(CalibrationError::MissingExposureTime("frame"))?;
    let dark_exptime = dark
        .exptime()
        .ok_or(CalibrationError::MissingExposureTime("master dark"))?;
    let strategy = if scale {
        if dark_exptime <= 0.0 {
            return Err(CalibrationError::InvalidDarkExposure(dark_exptime));
        }
        DarkMatchStrategy::Scaled {
            exptime: dark_exptime,
            ratio: frame_exptime / dark_exptime,
        }
    } else {
        DarkMatchStrategy::Exact(dark_exptime)
    };
    apply_dark(frame, dark, strategy)
}

/// Master darks keyed by exposure time, ascending.
#[derive(Debug, Clone, Default)]
pub struct DarkLibrary {
    entries: Vec<(f64, MasterFrame)>,
}

impl DarkLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a master dark under `exptime`, replacing any previous one.
    ///
    /// The dark's own `EXPTIME` must equal the key.
    pub fn insert(&mut self, exptime: f64, dark: MasterFrame) -> Result<(), CalibrationError> {
        if dark.exptime() != Some(exptime) {
            return Err(CalibrationError::DarkKeyMismatch {
                key: exptime,
                header: dark.exptime(),
            });
        }
        match self
            .entries
            .binary_search_by(|(t, _)| t.total_cmp(&exptime))
        {
            Ok(idx) => self.entries[idx].1 = dark,
            Err(idx) => self.entries.insert(idx, (exptime, dark)),
        }
        Ok(())
    }

    pub fn exposures(&self) -> Vec<f64> {
        self.entries.iter().map(|(t, _)| *t).collect()
    }

    pub fn get(&self, exptime: f64) -> Option<&MasterFrame> {
        self.entries
            .iter()
            .find(|(t, _)| *t == exptime)
            .map(|(_, dark)| dark)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pick a dark for `frame` and subtract it.
    pub fn correct(
        &self,
        frame: &Frame,
        tolerance: f64,
    ) -> Result<(Frame, DarkMatchStrategy), CalibrationError> {
        let target = frame
            .exptime()
            .ok_or(CalibrationError::MissingExposureTime("frame"))?;
        let strategy = resolve_dark_strategy(target, &self.exposures(), tolerance)?;
        let dark = self.get(strategy.dark_exptime()).ok_or(
            CalibrationError::ExposureMatchExhausted {
                target,
                tolerance,
                available: self.exposures(),
            },
        )?;
        Ok((apply_dark(frame, dark, strategy)?, strategy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use frames::{FrameHeader, ImageType};

    fn dark(exptime: f64, value: f64) -> Frame {
        let mut header = FrameHeader::new(ImageType::Dark, exptime);
        header.provenance.combined = true;
        Frame::constant((3, 3), value, header)
    }

    fn flat(exptime: f64, value: f64) -> Frame {
        Frame::constant((3, 3), value, FrameHeader::new(ImageType::Flat, exptime))
    }

    #[test]
    fn test_find_nearest_exact_only_without_tolerance() {
        assert_eq!(find_nearest(30.0, &[10.0, 20.0, 45.0], 0.0), None);
        assert_eq!(find_nearest(20.0, &[10.0, 20.0, 45.0], 0.0), Some(20.0));
    }

    #[test]
    fn test_find_nearest_with_tolerance_picks_closest() {
        assert_eq!(find_nearest(30.0, &[10.0, 20.0, 45.0], 20.0), Some(20.0));
        assert_eq!(find_nearest(30.0, &[10.0, 20.0, 45.0], 5.0), None);
    }

    #[test]
    fn test_find_nearest_tie_prefers_shorter() {
        assert_eq!(find_nearest(15.0, &[20.0, 10.0], 100.0), Some(10.0));
    }

    #[test]
    fn test_find_nearest_empty() {
        assert_eq!(find_nearest(15.0, &[], 100.0), None);
    }

    #[test]
    fn test_resolve_strategy() {
        assert_eq!(
            resolve_dark_strategy(10.0, &[10.0, 60.0], 100.0).unwrap(),
            DarkMatchStrategy::Exact(10.0)
        );
        let scaled = resolve_dark_strategy(1.0, &[10.0, 60.0], 100.0).unwrap();
        assert_eq!(scaled.dark_exptime(), 10.0);
        assert_relative_eq!(scaled.ratio(), 0.1);
        assert!(matches!(
            resolve_dark_strategy(500.0, &[10.0], 100.0),
            Err(CalibrationError::ExposureMatchExhausted { .. })
        ));
        assert_eq!(
            resolve_dark_strategy(50.0, &[0.0], 100.0),
            Err(CalibrationError::InvalidDarkExposure(0.0))
        );
    }

    #[test]
    fn test_subtract_dark_unscaled() {
        let out = subtract_dark(&flat(10.0, 102.0), &dark(10.0, 2.0), false).unwrap();
        assert!(out.data.iter().all(|&v| v == 100.0));
        assert!(out.header.provenance.dark_subtracted);
        assert!(!out.header.provenance.combined);
    }

    #[test]
    fn test_subtract_dark_unscaled_requires_equal_exposure() {
        let err = subtract_dark(&flat(5.0, 102.0), &dark(10.0, 2.0), false).unwrap_err();
        assert_eq!(
            err,
            CalibrationError::ExposureMismatch {
                frame: 5.0,
                dark: 10.0
            }
        );
    }

    #[test]
    fn test_subtract_dark_scaled() {
        let out = subtract_dark(&flat(1.0, 100.2), &dark(10.0, 2.0), true).unwrap();
        for &v in out.data.iter() {
            assert_relative_eq!(v, 100.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_library_rejects_key_mismatch() {
        let mut lib = DarkLibrary::new();
        assert!(matches!(
            lib.insert(20.0, dark(10.0, 1.0)),
            Err(CalibrationError::DarkKeyMismatch { .. })
        ));
        assert!(lib.is_empty());
    }

    #[test]
    fn test_library_sorted_and_correct() {
        let mut lib = DarkLibrary::new();
        lib.insert(60.0, dark(60.0, 12.0)).unwrap();
        lib.insert(10.0, dark(10.0, 2.0)).unwrap();
        assert_eq!(lib.exposures(), vec![10.0, 60.0]);

        let (exact, strategy) = lib.correct(&flat(60.0, 112.0), 100.0).unwrap();
        assert_eq!(strategy, DarkMatchStrategy::Exact(60.0));
        assert!(exact.data.iter().all(|&v| v == 100.0));

        let (scaled, strategy) = lib.correct(&flat(20.0, 104.0), 100.0).unwrap();
        assert_eq!(strategy.dark_exptime(), 10.0);
        for &v in scaled.data.iter() {
            assert_relative_eq!(v, 100.0, epsilon = 1e-12);
        }

        assert!(matches!(
            lib.correct(&flat(20.0, 104.0), 0.0),
            Err(CalibrationError::ExposureMatchExhausted { .. })
        ));
    }
}

//! Errors raised by the pixel-level correction operators.

use frames::ShapeMismatch;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatch),

    #[error("{0} has no EXPTIME")]
    MissingExposureTime(&'static str),

    #[error("unscaled dark subtraction needs equal exposures: frame {frame}s, dark {dark}s")]
    ExposureMismatch { frame: f64, dark: f64 },

    #[error("cannot scale a dark with exposure {0}s")]
    InvalidDarkExposure(f64),

    #[error("no master dark within {tolerance}s of {target}s (available: {available:?})")]
    ExposureMatchExhausted {
        target: f64,
        tolerance: f64,
        available: Vec<f64>,
    },

    #[error("master dark keyed at {key}s records EXPTIME {header:?}")]
    DarkKeyMismatch { key: f64, header: Option<f64> },

    #[error("master flat has {count} pixels with |value| below {threshold}")]
    NearZeroFlat { count: usize, threshold: f64 },

    #[error("cannot pair an odd number of frames ({0})")]
    OddFrameCount(usize),

    #[error("both frames of a nod pair were taken at VIEW_POS {0}")]
    SameNodPosition(String),

    #[error("frame is not flat-corrected: {0}")]
    NotCalibrated(String),
}

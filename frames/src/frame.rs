//! In-memory frame: pixel array, header and optional uncertainty.

use crate::header::FrameHeader;
use ndarray::Array2;
use thiserror::Error;

/// Two operands of a pixel-wise operation disagree in shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("shape mismatch: {expected:?} vs {found:?}")]
pub struct ShapeMismatch {
    pub expected: (usize, usize),
    pub found: (usize, usize),
}

/// A 2-D exposure in ADU.
///
/// Frames are treated as values: corrections build new frames rather than
/// mutating the pixels of their inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Array2<f64>,
    pub header: FrameHeader,
    /// One-sigma uncertainty per pixel, same shape as `data`
    pub uncertainty: Option<Array2<f64>>,
}

impl Frame {
    pub fn new(data: Array2<f64>, header: FrameHeader) -> Self {
        Self {
            data,
            header,
            uncertainty: None,
        }
    }

    /// Frame filled with a single value.
    pub fn constant(shape: (usize, usize), value: f64, header: FrameHeader) -> Self {
        Self::new(Array2::from_elem(shape, value), header)
    }

    /// (rows, columns)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn exptime(&self) -> Option<f64> {
        self.header.exptime
    }

    /// Replace the pixel data, keeping the header.
    pub fn with_data(&self, data: Array2<f64>) -> Self {
        Self::new(data, self.header.clone())
    }

    pub fn with_uncertainty(mut self, uncertainty: Array2<f64>) -> Self {
        self.uncertainty = Some(uncertainty);
        self
    }

    /// Fail unless `other` has the same pixel dimensions.
    pub fn check_same_shape(&self, other: &Frame) -> Result<(), ShapeMismatch> {
        check_shape(self.shape(), other.shape())
    }
}

pub fn check_shape(expected: (usize, usize), found: (usize, usize)) -> Result<(), ShapeMismatch> {
    if expected == found {
        Ok(())
    } else {
        Err(ShapeMismatch { expected, found })
    }
}

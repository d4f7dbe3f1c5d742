//! Nod-pair sky subtraction.
//!
//! Two exposures taken at alternating nod positions each contain the sky
//! seen by the other. Differencing them in both directions removes the sky
//! and leaves the target positive in one product and negative in the other;
//! downstream code has to track which sign belongs to which nod position.

use crate::error::CalibrationError;
use frames::Frame;

/// Two fully calibrated exposures of one target at two nod positions, in
/// discovery order.
#[derive(Debug, Clone, PartialEq)]
pub struct ScienceFramePair {
    pub first: Frame,
    pub second: Frame,
}

impl ScienceFramePair {
    /// Pair two frames, checking that both are flat-corrected, of equal
    /// shape and not tagged with the same nod position.
    pub fn new(first: Frame, second: Frame) -> Result<Self, CalibrationError> {
        for (label, frame) in [("first", &first), ("second", &second)] {
            if !frame.header.provenance.flat_corrected {
                return Err(CalibrationError::NotCalibrated(format!(
                    "{label} frame of pair (view {})",
                    frame.header.view_pos.as_deref().unwrap_or("?")
                )));
            }
        }
        if let (Some(a), Some(b)) = (&first.header.view_pos, &second.header.view_pos) {
            if a == b {
                return Err(CalibrationError::SameNodPosition(a.clone()));
            }
        }
        first.check_same_shape(&second)?;
        Ok(Self { first, second })
    }

    /// `(first - second, second - first)`.
    pub fn subtract(&self) -> Result<(Frame, Frame), CalibrationError> {
        subtract_pair(&self.first, &self.second)
    }
}

/// Group items two at a time in order. An odd count is an error rather
/// than silently dropping the last item.
pub fn pair_in_order<T>(items: Vec<T>) -> Result<Vec<(T, T)>, CalibrationError> {
    if items.len() % 2 != 0 {
        return Err(CalibrationError::OddFrameCount(items.len()));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(a), Some(b)) = (iter.next(), iter.next()) {
        pairs.push((a, b));
    }
    Ok(pairs)
}

/// Pair calibrated science frames in discovery order.
pub fn pair_frames(frames: Vec<Frame>) -> Result<Vec<ScienceFramePair>, CalibrationError> {
    pair_in_order(frames)?
        .into_iter()
        .map(|(a, b)| ScienceFramePair::new(a, b))
        .collect()
}

fn sky_subtracted(minuend: &Frame, subtrahend: &Frame) -> Frame {
    let mut out = minuend.with_data(&minuend.data - &subtrahend.data);
    out.header.provenance.sky_subtracted = true;
    out
}

/// Difference a nod pair both ways. Each output keeps the header of its
/// minuend and is flagged sky-subtracted.
pub fn subtract_pair(frame_a: &Frame, frame_b: &Frame) -> Result<(Frame, Frame), CalibrationError> {
    frame_a.check_same_shape(frame_b)?;
    Ok((
        sky_subtracted(frame_a, frame_b),
        sky_subtracted(frame_b, frame_a),
    ))
}

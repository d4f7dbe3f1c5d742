//! Bias subtraction.

use crate::error::CalibrationError;
use frames::Frame;

/// `frame - master_bias`, pixel by pixel.
pub fn subtract_bias(frame: &Frame, master_bias: &Frame) -> Result<Frame, CalibrationError> {
    frame.check_same_shape(master_bias)?;
    let mut corrected = frame.with_data(&frame.data - &master_bias.data);
    corrected.header.provenance.bias_subtracted = true;
    Ok(corrected)
}

/// Subtract the master bias when one exists; otherwise pass the frame
/// through untouched (the run's no-bias mode).
pub fn subtract_bias_if_present(
    frame: Frame,
    master_bias: Option<&Frame>,
) -> Result<Frame, CalibrationError> {
    match master_bias {
        Some(bias) => subtract_bias(&frame, bias),
        None => Ok(frame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frames::{FrameHeader, ImageType};
    use ndarray::Array2;

    #[test]
    fn test_subtract_bias() {
        let frame = Frame::new(
            Array2::from_shape_fn((2, 3), |(r, c)| 100.0 + (r * 3 + c) as f64),
            FrameHeader::new(ImageType::Dark, 10.0),
        );
        let bias = Frame::constant((2, 3), 100.0, FrameHeader::new(ImageType::Bias, 0.0));

        let corrected = subtract_bias(&frame, &bias).unwrap();
        assert_eq!(corrected.data[[0, 0]], 0.0);
        assert_eq!(corrected.data[[1, 2]], 5.0);
        assert!(corrected.header.provenance.bias_subtracted);
        assert_eq!(corrected.header.exptime, Some(10.0));
        assert!(!frame.header.provenance.bias_subtracted);
    }

    #[test]
    fn test_subtract_bias_shape_mismatch() {
        let frame = Frame::constant((2, 3), 1.0, FrameHeader::default());
        let bias = Frame::constant((3, 2), 1.0, FrameHeader::default());
        assert!(matches!(
            subtract_bias(&frame, &bias),
            Err(CalibrationError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_missing_bias_passes_through() {
        let frame = Frame::constant((2, 2), 7.0, FrameHeader::default());
        let out = subtract_bias_if_present(frame.clone(), None).unwrap();
        assert_eq!(out, frame);
    }
}

//! Robust statistics used for frame combination and normalisation

use thiserror::Error;

/// Scale factor turning a median absolute deviation into a Gaussian sigma.
pub const MAD_TO_SIGMA: f64 = 1.482_602_218_505_602;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("insufficient data: {total} values, 0 valid (all NaN)")]
    NoValidValues { total: usize },
}

/// Median of the non-NaN values in `values`.
///
/// Infinite values take part in the ordering. For even-length data the
/// result is the average of the two middle values.
pub fn median(values: &[f64]) -> Result<f64, StatsError> {
    let mut valid: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();
    if valid.is_empty() {
        return Err(StatsError::NoValidValues {
            total: values.len(),
        });
    }
    Ok(median_in_place(&mut valid))
}

/// Median of a non-empty, NaN-free buffer. Reorders the buffer.
///
/// Used in the per-pixel clipping loop where the caller owns a scratch
/// buffer and has already filtered NaNs.
pub fn median_in_place(values: &mut [f64]) -> f64 {
    debug_assert!(!values.is_empty());
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    } else {
        values[n / 2]
    }
}

/// Median and MAD-derived sigma of a non-empty, NaN-free buffer.
///
/// The buffer is overwritten with absolute deviations. Shared by
/// [`mad_std`] and the per-pixel clipping loop, which reuses one scratch
/// buffer across iterations.
pub fn center_and_spread_in_place(values: &mut [f64]) -> (f64, f64) {
    let center = median_in_place(values);
    for v in values.iter_mut() {
        *v = (*v - center).abs();
    }
    (center, MAD_TO_SIGMA * median_in_place(values))
}

/// Standard deviation estimated from the median absolute deviation.
pub fn mad_std(values: &[f64]) -> Result<f64, StatsError> {
    let mut valid: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();
    if valid.is_empty() {
        return Err(StatsError::NoValidValues {
            total: values.len(),
        });
    }
    Ok(center_and_spread_in_place(&mut valid).1)
}

/// Arithmetic mean of the non-NaN values.
pub fn mean(values: &[f64]) -> Result<f64, StatsError> {
    let (sum, count) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        return Err(StatsError::NoValidValues {
            total: values.len(),
        });
    }
    Ok(sum / count as f64)
}

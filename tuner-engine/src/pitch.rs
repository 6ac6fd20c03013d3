//! Correlation-based detection of the dominant periodicity.

use crate::buffers::AutoCorrelation;

/// Extremum of a parabola fitted through three equally spaced samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakOfPolynomialFit {
    /// Position of the extremum.
    pub position: f32,
    /// Value of the extremum.
    pub value: f32,
}

/// Fit a parabola through three equally spaced values and return its
/// extremum. Flat samples or a vanishing second difference return the center
/// value unchanged.
pub fn peak_of_polynomial_fit(
    value_left: f32,
    value_center: f32,
    value_right: f32,
    position_center: f32,
    dx: f32,
) -> PeakOfPolynomialFit {
    let second_difference = value_left - 2.0 * value_center + value_right;
    if (value_left == value_center && value_right == value_center) || second_difference == 0.0 {
        return PeakOfPolynomialFit {
            position: position_center,
            value: value_center,
        };
    }

    let a = 0.5 * (value_left + value_right) - value_center;
    let b = 0.5 * (value_right - value_left);
    let c = value_center;
    let x_rel = (value_left - value_right) / (2.0 * second_difference);

    PeakOfPolynomialFit {
        position: position_center + dx * x_rel,
        value: a * x_rel * x_rel + b * x_rel + c,
    }
}

/// Parabolic fit around an index of an array.
///
/// At the array bounds no extrapolation takes place; the boundary value is
/// returned verbatim.
pub fn peak_of_polynomial_fit_array(index_center: usize, data: &[f32]) -> PeakOfPolynomialFit {
    if index_center == 0 || index_center == data.len() - 1 {
        return PeakOfPolynomialFit {
            position: index_center as f32,
            value: data[index_center],
        };
    }
    peak_of_polynomial_fit(
        data[index_center - 1],
        data[index_center],
        data[index_center + 1],
        index_center as f32,
        1.0,
    )
}

/// Frequency detected from the autocorrelation.
///
/// `frequency == 0` marks "no detection".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CorrelationBasedFrequency {
    /// Detected frequency.
    pub frequency: f32,
    /// Time shift corresponding to the detected frequency.
    pub time_shift: f32,
    /// Correlation value at the detected time shift.
    pub correlation_at_time_shift: f32,
}

impl CorrelationBasedFrequency {
    fn set(&mut self, frequency: f32, time_shift: f32, correlation_at_time_shift: f32) {
        self.frequency = frequency;
        self.time_shift = time_shift;
        self.correlation_at_time_shift = correlation_at_time_shift;
    }
}

fn is_local_max(index: usize, values: &[f32]) -> bool {
    values[index] >= values[index - 1] && values[index] >= values[index + 1]
}

/// Find the largest local maximum in `values[begin..end]`.
fn find_global_local_maximum(begin: usize, end: usize, values: &[f32]) -> Option<usize> {
    let mut maximum_index = None;
    let mut maximum_value = f32::NEG_INFINITY;
    for i in begin.max(1)..end.min(values.len() - 1) {
        if values[i] > maximum_value && is_local_max(i, values) {
            maximum_index = Some(i);
            maximum_value = values[i];
        }
    }
    maximum_index
}

/// Detect the dominant periodicity of an autocorrelation array.
///
/// The search skips the zero-lag peak by starting at the first lag with a
/// negative correlation value (lag 1 if none exists) and is clamped by the
/// given frequency bounds. The located maximum is refined by a parabolic fit
/// and corrected for sub-harmonics: divisors are probed from the largest
/// possible down to 2, and the first candidate whose fitted peak reaches
/// `subharmonic_peak_ratio` times the initial peak replaces it.
///
/// `results` is set to the zero sentinel when no local maximum exists in the
/// search range.
pub fn find_correlation_based_frequency(
    results: &mut CorrelationBasedFrequency,
    correlation: &AutoCorrelation,
    frequency_min: f32,
    frequency_max: f32,
    subharmonics_tolerance: f32,
    subharmonic_peak_ratio: f32,
) {
    let values = &correlation.values;
    let dt = correlation.dt;

    let index_end = if frequency_min > 0.0 {
        let lag_frequency_min = (1.0 / (dt * frequency_min)) as usize + 1;
        lag_frequency_min.min(correlation.size - 1)
    } else {
        correlation.size - 1
    };

    let first_negative = values
        .iter()
        .position(|&value| value < 0.0)
        .unwrap_or(1)
        .max(1);

    let index_begin = if frequency_max > 0.0 {
        let lag_frequency_max = (1.0 / (dt * frequency_max)).ceil() as usize;
        lag_frequency_max.max(first_negative)
    } else {
        first_negative
    };

    if index_begin >= index_end {
        results.set(0.0, 0.0, 0.0);
        return;
    }

    let Some(global_maximum_index) = find_global_local_maximum(index_begin, index_end, values)
    else {
        results.set(0.0, 0.0, 0.0);
        return;
    };

    let mut fitted = peak_of_polynomial_fit_array(global_maximum_index, values);

    // Prefer a sub-harmonic peak at a fraction of the found lag if it is
    // nearly as strong; probed from the largest divisor downwards.
    let required_peak = subharmonic_peak_ratio * fitted.value;
    let maximum_division = (fitted.position / index_begin as f32).ceil() as i32;

    for division in (2..=maximum_division).rev() {
        let division = division as f32;
        let mut window_begin =
            ((fitted.position / (division + subharmonics_tolerance)).ceil() as usize).max(1);
        let mut window_end = ((fitted.position / (division - subharmonics_tolerance)) as usize + 1)
            .min(correlation.size - 1);
        if window_end <= window_begin {
            window_begin = ((fitted.position / division).round() as usize)
                .clamp(1, correlation.size - 2);
            window_end = window_begin + 1;
        }

        if let Some(local_maximum_index) =
            find_global_local_maximum(window_begin, window_end, values)
        {
            let fitted_local = peak_of_polynomial_fit_array(local_maximum_index, values);
            if fitted_local.value >= required_peak {
                fitted = fitted_local;
                break;
            }
        }
    }

    results.set(
        1.0 / (fitted.position * dt),
        fitted.position * dt,
        fitted.value,
    );
}

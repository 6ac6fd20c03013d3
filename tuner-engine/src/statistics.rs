//! Weighted online statistics and acoustic amplitude weighting.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::harmonics::Harmonics;

/// Single-pass weighted mean and variance (Welford).
///
/// Zero-weight updates contribute nothing; the variance of an empty set
/// is 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedStatistics {
    weight_sum: f32,
    s: f32,
    mean: f32,
}

impl WeightedStatistics {
    pub fn clear(&mut self) {
        self.weight_sum = 0.0;
        self.s = 0.0;
        self.mean = 0.0;
    }

    /// Incorporate a value with the given weight.
    pub fn update(&mut self, value: f32, weight: f32) {
        if weight <= 0.0 {
            return;
        }
        self.weight_sum += weight;
        let mean_old = self.mean;
        self.mean = mean_old + (weight / self.weight_sum) * (value - mean_old);
        self.s += weight * (value - mean_old) * (value - self.mean);
    }

    pub fn mean(&self) -> f32 {
        self.mean
    }

    pub fn variance(&self) -> f32 {
        if self.weight_sum == 0.0 {
            0.0
        } else {
            self.s / self.weight_sum
        }
    }

    pub fn standard_deviation(&self) -> f32 {
        self.variance().sqrt()
    }
}

/// Perceptual weighting of spectral amplitudes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcousticWeighting {
    /// No weighting, the amplitude is used as is.
    Flat,
    /// IEC 61672 A-weighting, normalized at 1 kHz.
    AWeighting,
    /// IEC 61672 C-weighting, normalized at 1 kHz.
    CWeighting,
}

fn a_weighting_raw(frequency: f32) -> f32 {
    let f_sqr = frequency * frequency;
    (12194.0 * f_sqr).powi(2)
        / ((f_sqr + 20.6f32.powi(2))
            * ((f_sqr + 107.7f32.powi(2)) * (f_sqr + 737.9f32.powi(2))).sqrt()
            * (f_sqr + 12194.0f32.powi(2)))
}

fn c_weighting_raw(frequency: f32) -> f32 {
    let f_sqr = frequency * frequency;
    (12194.0 * f_sqr) / ((f_sqr + 20.6f32.powi(2)) * (f_sqr + 12194.0f32.powi(2)))
}

static A_WEIGHTING_AT_1KHZ: Lazy<f32> = Lazy::new(|| a_weighting_raw(1000.0));
static C_WEIGHTING_AT_1KHZ: Lazy<f32> = Lazy::new(|| c_weighting_raw(1000.0));

impl AcousticWeighting {
    /// Apply the weighting to an amplitude at a given frequency.
    pub fn apply_to_amplitude(self, amplitude: f32, frequency: f32) -> f32 {
        match self {
            AcousticWeighting::Flat => amplitude,
            AcousticWeighting::AWeighting => {
                amplitude * a_weighting_raw(frequency) / *A_WEIGHTING_AT_1KHZ
            }
            AcousticWeighting::CWeighting => {
                amplitude * c_weighting_raw(frequency) / *C_WEIGHTING_AT_1KHZ
            }
        }
    }
}

/// Weighted aggregate over a harmonics collection.
///
/// The mean of `frequency / harmonic_number` is the refined fundamental
/// estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct HarmonicStatistics {
    frequency_statistics: WeightedStatistics,
}

impl HarmonicStatistics {
    pub fn clear(&mut self) {
        self.frequency_statistics.clear();
    }

    pub fn evaluate(&mut self, harmonics: &Harmonics, weighting: AcousticWeighting) {
        self.clear();
        for harmonic in harmonics.iter() {
            let amplitude = harmonic.spectrum_amplitude_squared.sqrt();
            let weight = weighting.apply_to_amplitude(amplitude, harmonic.frequency);
            let frequency_base = harmonic.frequency / harmonic.harmonic_number as f32;
            self.frequency_statistics.update(frequency_base, weight);
        }
    }

    /// Refined fundamental frequency; 0 when no harmonics were evaluated.
    pub fn frequency(&self) -> f32 {
        self.frequency_statistics.mean()
    }

    pub fn frequency_variance(&self) -> f32 {
        self.frequency_statistics.variance()
    }

    pub fn frequency_standard_deviation(&self) -> f32 {
        self.frequency_statistics.standard_deviation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn weighted_mean_matches_closed_form() {
        let pairs = [(1.0f32, 2.0f32), (4.0, 1.0), (2.0, 3.0), (8.0, 0.5)];
        let mut statistics = WeightedStatistics::default();
        for (value, weight) in pairs {
            statistics.update(value, weight);
        }
        let weight_sum: f32 = pairs.iter().map(|p| p.1).sum();
        let expected: f32 = pairs.iter().map(|p| p.0 * p.1).sum::<f32>() / weight_sum;
        assert_relative_eq!(statistics.mean(), expected, max_relative = 1e-6);

        let expected_variance: f32 = pairs
            .iter()
            .map(|p| p.1 * (p.0 - expected) * (p.0 - expected))
            .sum::<f32>()
            / weight_sum;
        assert_relative_eq!(statistics.variance(), expected_variance, max_relative = 1e-5);
    }

    #[test]
    fn zero_weight_never_changes_the_mean() {
        let mut statistics = WeightedStatistics::default();
        statistics.update(5.0, 1.0);
        let mean = statistics.mean();
        statistics.update(1000.0, 0.0);
        assert_eq!(statistics.mean(), mean);
    }

    #[test]
    fn empty_statistics_have_zero_variance() {
        let statistics = WeightedStatistics::default();
        assert_eq!(statistics.variance(), 0.0);
        assert_eq!(statistics.mean(), 0.0);
    }

    #[test]
    fn weighting_is_normalized_at_1khz() {
        assert_abs_diff_eq!(
            AcousticWeighting::AWeighting.apply_to_amplitude(1.0, 1000.0),
            1.0,
            epsilon = 1e-5
        );
        assert_abs_diff_eq!(
            AcousticWeighting::CWeighting.apply_to_amplitude(1.0, 1000.0),
            1.0,
            epsilon = 1e-5
        );
        assert_eq!(AcousticWeighting::Flat.apply_to_amplitude(0.7, 20.0), 0.7);
    }

    #[test]
    fn weighting_attenuates_low_frequencies() {
        let low = AcousticWeighting::AWeighting.apply_to_amplitude(1.0, 50.0);
        assert!(low < 0.2, "A-weighting at 50 Hz should be strongly reduced");
        let c_low = AcousticWeighting::CWeighting.apply_to_amplitude(1.0, 50.0);
        assert!(c_low > low, "C-weighting rolls off later than A-weighting");
    }

    #[test]
    fn harmonic_statistics_refine_the_fundamental() {
        let mut harmonics = Harmonics::new(4);
        // Harmonics of 100 Hz with slight measurement scatter.
        harmonics.add(1, 100.2, 50, 1.0);
        harmonics.add(2, 199.6, 100, 1.0);
        harmonics.add(3, 300.3, 150, 1.0);

        let mut statistics = HarmonicStatistics::default();
        statistics.evaluate(&harmonics, AcousticWeighting::Flat);
        assert_relative_eq!(statistics.frequency(), 100.0, max_relative = 2e-3);
        assert!(statistics.frequency_standard_deviation() < 0.5);
    }
}

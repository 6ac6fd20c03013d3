//! Inharmonicity measures derived from detected harmonics.

use linreg::linear_regression;

use crate::harmonics::{Harmonic, Harmonics};
use crate::statistics::{AcousticWeighting, WeightedStatistics};

/// Pairwise inharmonicity of two harmonics.
///
/// 0 means the two frequencies sit at the ideal ratio of their harmonic
/// numbers; positive values mean the partials are spread further apart than
/// ideal (stretched), negative values mean they are compressed.
pub fn pairwise_inharmonicity(
    frequency1: f32,
    harmonic_number1: i32,
    frequency2: f32,
    harmonic_number2: i32,
) -> f32 {
    debug_assert_ne!(harmonic_number1, harmonic_number2);
    let (frequency_high, harmonic_high, frequency_low, harmonic_low) =
        if harmonic_number1 > harmonic_number2 {
            (frequency1, harmonic_number1, frequency2, harmonic_number2)
        } else {
            (frequency2, harmonic_number2, frequency1, harmonic_number1)
        };
    (frequency_high / frequency_low).ln() / (harmonic_high as f32 / harmonic_low as f32).ln() - 1.0
}

/// Aggregates the pairwise inharmonicity of the loudest harmonics of a
/// window into one scalar.
pub struct InharmonicityDetector {
    /// Number of harmonics considered at most.
    pub max_num_harmonics: usize,
    selected: Vec<Harmonic>,
    statistics: WeightedStatistics,
}

impl InharmonicityDetector {
    pub fn new(max_num_harmonics: usize) -> Self {
        Self {
            max_num_harmonics,
            selected: Vec::with_capacity(max_num_harmonics),
            statistics: WeightedStatistics::default(),
        }
    }

    /// Keep the loudest harmonics, ordered by harmonic number.
    fn select_loudest(&mut self, harmonics: &Harmonics) {
        self.selected.clear();
        for &harmonic in harmonics.iter() {
            if self.selected.len() < self.max_num_harmonics {
                self.selected.push(harmonic);
                continue;
            }
            let (weakest_index, weakest) = self
                .selected
                .iter()
                .enumerate()
                .min_by(|a, b| {
                    a.1.spectrum_amplitude_squared
                        .total_cmp(&b.1.spectrum_amplitude_squared)
                })
                .map(|(i, h)| (i, h.spectrum_amplitude_squared))
                .unwrap_or((0, f32::NEG_INFINITY));
            if harmonic.spectrum_amplitude_squared > weakest {
                self.selected[weakest_index] = harmonic;
            }
        }
        self.selected.sort_by_key(|h| h.harmonic_number);
    }

    /// Weighted mean of the pairwise inharmonicity between neighboring
    /// selected harmonics; 0 with fewer than two harmonics.
    pub fn compute(&mut self, harmonics: &Harmonics, weighting: AcousticWeighting) -> f32 {
        self.select_loudest(harmonics);
        if self.selected.len() < 2 {
            return 0.0;
        }
        self.statistics.clear();

        let mut previous = self.selected[0];
        let mut weight_previous = weighting.apply_to_amplitude(
            previous.spectrum_amplitude_squared.sqrt(),
            previous.frequency,
        );
        for &harmonic in &self.selected[1..] {
            let weight = weighting.apply_to_amplitude(
                harmonic.spectrum_amplitude_squared.sqrt(),
                harmonic.frequency,
            );
            let inharmonicity = pairwise_inharmonicity(
                previous.frequency,
                previous.harmonic_number,
                harmonic.frequency,
                harmonic.harmonic_number,
            );
            self.statistics.update(inharmonicity, weight_previous * weight);
            previous = harmonic;
            weight_previous = weight;
        }
        self.statistics.mean()
    }
}

/// Estimate the stiff-string coefficient B from measured partials.
///
/// For partial frequencies following `f_n = n * f_1 * sqrt(1 + B * n^2)`, a
/// linear regression of `(f_n / n)^2` over `n^2` yields `B` as the ratio of
/// slope to intercept. Needs at least three usable harmonics.
pub fn estimate_b_coefficient(harmonics: &Harmonics) -> Option<f32> {
    if harmonics.len() < 3 {
        return None;
    }

    let (xs, ys): (Vec<f64>, Vec<f64>) = harmonics
        .iter()
        .filter(|h| h.harmonic_number > 0 && h.frequency > 0.0)
        .map(|h| {
            let n = h.harmonic_number as f64;
            let f_over_n = h.frequency as f64 / n;
            (n * n, f_over_n * f_over_n)
        })
        .unzip();
    if xs.len() < 3 {
        return None;
    }

    let (slope, intercept) = linear_regression::<_, _, f64>(&xs, &ys).ok()?;
    if intercept.abs() > 1e-6 {
        Some((slope / intercept) as f32)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn ideal_ratio_has_zero_inharmonicity() {
        assert_abs_diff_eq!(pairwise_inharmonicity(100.0, 1, 300.0, 3), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(pairwise_inharmonicity(440.0, 2, 220.0, 1), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn stretched_partials_are_positive() {
        // Octave wider than 2:1.
        assert!(pairwise_inharmonicity(100.0, 1, 205.0, 2) > 0.0);
        // Octave narrower than 2:1.
        assert!(pairwise_inharmonicity(100.0, 1, 195.0, 2) < 0.0);
    }

    #[test]
    fn detector_averages_neighboring_pairs() {
        let mut harmonics = Harmonics::new(4);
        harmonics.add(1, 100.0, 50, 1.0);
        harmonics.add(2, 200.0, 100, 1.0);
        harmonics.add(3, 300.0, 150, 1.0);

        let mut detector = InharmonicityDetector::new(8);
        let inharmonicity = detector.compute(&harmonics, AcousticWeighting::Flat);
        assert_abs_diff_eq!(inharmonicity, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn detector_keeps_only_the_loudest_harmonics() {
        let mut harmonics = Harmonics::new(8);
        harmonics.add(1, 100.0, 50, 1.0);
        harmonics.add(2, 200.0, 100, 0.8);
        // A weak, wildly stretched harmonic which must be ignored.
        harmonics.add(3, 330.0, 165, 1e-6);

        let mut detector = InharmonicityDetector::new(2);
        let inharmonicity = detector.compute(&harmonics, AcousticWeighting::Flat);
        assert_abs_diff_eq!(inharmonicity, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn single_harmonic_yields_zero() {
        let mut harmonics = Harmonics::new(2);
        harmonics.add(1, 100.0, 50, 1.0);
        let mut detector = InharmonicityDetector::new(8);
        assert_eq!(detector.compute(&harmonics, AcousticWeighting::Flat), 0.0);
    }

    #[test]
    fn b_coefficient_recovered_from_stretched_partials() {
        let b = 1e-4f64;
        let f1 = 220.0f64;
        let mut harmonics = Harmonics::new(8);
        for n in 1..=6i32 {
            let frequency = n as f64 * f1 * (1.0 + b * (n * n) as f64).sqrt();
            harmonics.add(n, frequency as f32, n as usize * 10, 1.0);
        }
        let estimate = estimate_b_coefficient(&harmonics).expect("regression succeeds");
        assert_relative_eq!(estimate, b as f32, max_relative = 0.05);
    }

    #[test]
    fn b_coefficient_needs_three_harmonics() {
        let mut harmonics = Harmonics::new(4);
        harmonics.add(1, 100.0, 50, 1.0);
        harmonics.add(2, 200.0, 100, 1.0);
        assert!(estimate_b_coefficient(&harmonics).is_none());
    }
}

//! Engine configuration.
//!
//! All tunables are fixed at pipeline construction; changing one means
//! tearing the pipeline down and rebuilding it, since buffer shapes derive
//! from these values.

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::fft::WindowingFunction;
use crate::statistics::AcousticWeighting;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sample rate in Hertz.
    pub sample_rate: u32,
    /// Window size in samples.
    pub window_size: usize,
    /// Overlap between successive windows, within `[0, 1)`.
    pub overlap: f32,
    /// Windowing function applied before the FFT.
    pub windowing: WindowingFunction,
    /// Lowest frequency considered for detection.
    pub frequency_min: f32,
    /// Highest frequency considered for detection.
    pub frequency_max: f32,
    /// Allowed relative lag deviation when probing sub-harmonic peaks.
    pub subharmonics_tolerance: f32,
    /// Required strength of a sub-harmonic peak relative to the main peak.
    pub subharmonic_peak_ratio: f32,
    /// Search radius for harmonic peaks, relative to the base frequency.
    pub harmonic_tolerance: f32,
    /// Factor a harmonic peak must exceed the local spectral mean by.
    pub minimum_factor_over_local_mean: f32,
    /// Successive missing harmonics after which the search stops.
    pub max_gap_between_harmonics: usize,
    /// Number of harmonics entering the inharmonicity aggregate.
    pub max_num_harmonics_for_inharmonicity: usize,
    /// Perceptual weighting of harmonic amplitudes.
    pub acoustic_weighting: AcousticWeighting,
    /// Window size of the outlier-removing smoother.
    pub num_moving_average: usize,
    /// Successive outliers a smoother buffer tolerates before clearing.
    pub max_num_successive_outliers: usize,
    /// Noise ratio above which a window is ignored by the evaluator.
    pub max_noise: f32,
    /// Required relative harmonic energy content of a window.
    pub min_harmonic_energy_content: f32,
    /// Input sensitivity from 0 (quiet signals ignored) to 100.
    pub sensitivity: f32,
    /// Tolerance in cents within which a note counts as in tune.
    pub tolerance_in_cents: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            window_size: 4096,
            overlap: 0.25,
            windowing: WindowingFunction::Tophat,
            frequency_min: 16.0,
            frequency_max: 16000.0,
            subharmonics_tolerance: 0.05,
            subharmonic_peak_ratio: 0.9,
            harmonic_tolerance: 0.1,
            minimum_factor_over_local_mean: 5.0,
            max_gap_between_harmonics: 10,
            max_num_harmonics_for_inharmonicity: 8,
            acoustic_weighting: AcousticWeighting::Flat,
            num_moving_average: 5,
            max_num_successive_outliers: 1,
            max_noise: 0.1,
            min_harmonic_energy_content: 0.1,
            sensitivity: 90.0,
            tolerance_in_cents: 5.0,
        }
    }
}

impl Config {
    /// Check the configuration; invalid values are fatal to the pipeline
    /// instance being built from it.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.sample_rate > 0, "sample rate must be positive");
        ensure!(self.window_size > 0, "window size must be positive");
        ensure!(
            (0.0..1.0).contains(&self.overlap),
            "overlap must be within [0, 1), got {}",
            self.overlap
        );
        ensure!(
            self.frequency_min > 0.0 && self.frequency_max > self.frequency_min,
            "frequency bounds must satisfy 0 < min < max"
        );
        ensure!(
            self.subharmonics_tolerance > 0.0 && self.subharmonics_tolerance < 0.5,
            "subharmonics tolerance must be within (0, 0.5)"
        );
        ensure!(
            self.subharmonic_peak_ratio > 0.0 && self.subharmonic_peak_ratio <= 1.0,
            "subharmonic peak ratio must be within (0, 1]"
        );
        ensure!(
            self.harmonic_tolerance > 0.0,
            "harmonic tolerance must be positive"
        );
        ensure!(
            self.num_moving_average > 0,
            "smoother window size must be positive"
        );
        ensure!(
            (0.0..=100.0).contains(&self.sensitivity),
            "sensitivity must be within [0, 100]"
        );
        ensure!(
            self.tolerance_in_cents >= 0.0,
            "tolerance in cents must not be negative"
        );
        Ok(())
    }
}

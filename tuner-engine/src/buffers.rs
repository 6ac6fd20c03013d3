//! Window-sized data buffers shared along the analysis pipeline.
//!
//! All three buffer types are allocated once per shape and recycled through
//! the memory pool; the analysis stage overwrites them in place each cycle.

use rustfft::num_complex::Complex32;

/// A time series with constant sample spacing.
pub struct TimeSeries {
    /// Number of samples.
    pub size: usize,
    /// Time difference between two successive samples.
    pub dt: f32,
    /// Absolute frame position of the first sample.
    pub frame_position: i64,
    /// Sample values.
    pub values: Vec<f32>,
}

impl TimeSeries {
    pub fn new(size: usize, dt: f32) -> Self {
        Self {
            size,
            dt,
            frame_position: 0,
            values: vec![0.0; size],
        }
    }

    /// Mean-removed standard deviation of the stored samples.
    pub fn standard_deviation(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.values.iter().sum::<f32>() / self.size as f32;
        let sum_sqr = self
            .values
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f32>();
        (sum_sqr / self.size as f32).sqrt()
    }
}

/// One-sided complex spectrum of a zero-padded time series.
///
/// For a time series of N samples the spectrum has `N + 1` bins and a
/// resolution of `df = 1 / (2 * N * dt)`. Bin `i` corresponds to the
/// frequency `i * df`.
pub struct FrequencySpectrum {
    /// Number of frequency bins.
    pub size: usize,
    /// Frequency resolution.
    pub df: f32,
    /// Complex spectrum values (re/im interleaved in memory).
    pub spectrum: Vec<Complex32>,
    /// Squared amplitudes, normalized to the amplitude of the input signal.
    pub amplitude_spectrum_squared: Vec<f32>,
}

impl FrequencySpectrum {
    pub fn new(size: usize, df: f32) -> Self {
        Self {
            size,
            df,
            spectrum: vec![Complex32::new(0.0, 0.0); size],
            amplitude_spectrum_squared: vec![0.0; size],
        }
    }

    /// Frequency of a given bin.
    pub fn frequency(&self, index: usize) -> f32 {
        index as f32 * self.df
    }

    /// Real part of the spectrum at a given bin.
    pub fn real(&self, index: usize) -> f32 {
        self.spectrum[index].re
    }

    /// Imaginary part of the spectrum at a given bin.
    pub fn imag(&self, index: usize) -> f32 {
        self.spectrum[index].im
    }

    /// Copy spectrum values from another instance of the same shape.
    pub fn copy_from(&mut self, other: &FrequencySpectrum) {
        debug_assert_eq!(self.size, other.size);
        self.spectrum.copy_from_slice(&other.spectrum);
        self.amplitude_spectrum_squared
            .copy_from_slice(&other.amplitude_spectrum_squared);
    }
}

/// Autocorrelation of a time series, indexed by lag.
///
/// `values[0]` is the zero-lag correlation (the signal energy) and is the
/// largest entry for a well-formed real signal.
pub struct AutoCorrelation {
    /// Number of lags (time series size + 1).
    pub size: usize,
    /// Time shift between two successive lags.
    pub dt: f32,
    /// Correlation values.
    pub values: Vec<f32>,
}

impl AutoCorrelation {
    pub fn new(size: usize, dt: f32) -> Self {
        Self {
            size,
            dt,
            values: vec![0.0; size],
        }
    }

    /// Time shift of a given lag index.
    pub fn time(&self, index: usize) -> f32 {
        index as f32 * self.dt
    }
}

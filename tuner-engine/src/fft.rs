//! FFT-backed computation of autocorrelation and frequency spectrum.

use std::f32::consts::PI;
use std::sync::Arc;

use anyhow::{Result, ensure};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::buffers::{AutoCorrelation, FrequencySpectrum};

/// Windowing function applied before the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowingFunction {
    /// No windowing.
    Tophat,
    Hamming,
    Hann,
}

impl WindowingFunction {
    /// Window curve of a given length.
    pub fn curve(self, size: usize) -> Vec<f32> {
        (0..size)
            .map(|i| {
                let phase = 2.0 * PI * i as f32 / size as f32;
                match self {
                    WindowingFunction::Tophat => 1.0,
                    WindowingFunction::Hamming => 0.54 - 0.46 * phase.cos(),
                    WindowingFunction::Hann => 0.5 * (1.0 - phase.cos()),
                }
            })
            .collect()
    }

    /// Mean value of the window curve, used for amplitude normalization.
    pub fn integral(self) -> f32 {
        match self {
            WindowingFunction::Tophat => 1.0,
            WindowingFunction::Hamming => 0.54,
            WindowingFunction::Hann => 0.5,
        }
    }
}

/// Computes the autocorrelation and the one-sided spectrum of a real time
/// series of fixed length.
///
/// The input is windowed and zero-padded to twice its length, so a series of
/// N samples yields N + 1 spectrum bins with `df = 1 / (2 * N * dt)` and
/// N + 1 correlation lags. The autocorrelation at lag 0 equals the energy of
/// the windowed signal.
pub struct Correlation {
    /// Time series length the processor was planned for.
    pub size: usize,
    /// Windowing function applied to the input.
    pub window_type: WindowingFunction,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    work: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl Correlation {
    pub fn new(size: usize, window_type: WindowingFunction) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(2 * size);
        let inverse = planner.plan_fft_inverse(2 * size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        Self {
            size,
            window_type,
            window: window_type.curve(size),
            forward,
            inverse,
            work: vec![Complex32::new(0.0, 0.0); 2 * size],
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
        }
    }

    /// Fill `correlation` (and optionally `spectrum`) from the given input.
    ///
    /// Shape mismatches between the planned size and the passed buffers are
    /// configuration errors.
    pub fn correlate(
        &mut self,
        input: &[f32],
        correlation: &mut AutoCorrelation,
        mut spectrum: Option<&mut FrequencySpectrum>,
    ) -> Result<()> {
        ensure!(
            input.len() == self.size,
            "input size {} does not match correlation size {}",
            input.len(),
            self.size
        );
        ensure!(
            correlation.values.len() == self.size + 1,
            "correlation buffer must hold size + 1 lags"
        );
        if let Some(spectrum) = spectrum.as_deref() {
            ensure!(
                spectrum.size == self.size + 1,
                "spectrum buffer must hold size + 1 bins"
            );
        }

        for ((work, &sample), &window) in self.work.iter_mut().zip(input).zip(&self.window) {
            *work = Complex32::new(sample * window, 0.0);
        }
        for work in self.work.iter_mut().skip(self.size) {
            *work = Complex32::new(0.0, 0.0);
        }
        self.forward
            .process_with_scratch(&mut self.work, &mut self.scratch);

        if let Some(spectrum) = spectrum.as_deref_mut() {
            spectrum.spectrum.copy_from_slice(&self.work[..=self.size]);
            // One-sided amplitude spectrum of the windowed input; the factor
            // 2 accounts for the energy in the mirrored half.
            let normalization =
                (2.0 / (self.size as f32 * self.window_type.integral())).powi(2);
            for (amplitude, bin) in spectrum
                .amplitude_spectrum_squared
                .iter_mut()
                .zip(&self.work[..=self.size])
            {
                *amplitude = normalization * bin.norm_sqr();
            }
        }

        for work in self.work.iter_mut() {
            *work = Complex32::new(work.norm_sqr(), 0.0);
        }
        self.inverse
            .process_with_scratch(&mut self.work, &mut self.scratch);

        // rustfft leaves the inverse transform unnormalized.
        let scale = 1.0 / (2 * self.size) as f32;
        for (value, work) in correlation.values.iter_mut().zip(&self.work) {
            *value = work.re * scale;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sine(size: usize, dt: f32, frequency: f32) -> Vec<f32> {
        (0..size)
            .map(|i| (2.0 * PI * frequency * i as f32 * dt).sin())
            .collect()
    }

    #[test]
    fn zero_lag_equals_signal_energy() {
        let size = 256;
        let dt = 1.0 / 8000.0;
        let input = sine(size, dt, 500.0);
        let energy: f32 = input.iter().map(|v| v * v).sum();

        let mut correlation = Correlation::new(size, WindowingFunction::Tophat);
        let mut result = AutoCorrelation::new(size + 1, dt);
        correlation
            .correlate(&input, &mut result, None)
            .unwrap();

        assert_relative_eq!(result.values[0], energy, max_relative = 1e-3);
        for &value in &result.values[1..] {
            assert!(value <= result.values[0] * (1.0 + 1e-6));
        }
    }

    #[test]
    fn correlation_peaks_at_signal_period() {
        let size = 1024;
        let sample_rate = 8192.0;
        let dt = 1.0 / sample_rate;
        // Period of exactly 32 samples.
        let input = sine(size, dt, sample_rate / 32.0);

        let mut correlation = Correlation::new(size, WindowingFunction::Tophat);
        let mut result = AutoCorrelation::new(size + 1, dt);
        correlation
            .correlate(&input, &mut result, None)
            .unwrap();

        let peak_lag = (1..=64)
            .max_by(|&a, &b| result.values[a].total_cmp(&result.values[b]))
            .unwrap();
        assert_eq!(peak_lag, 32);
    }

    #[test]
    fn spectrum_peak_sits_at_signal_bin() {
        let size = 512;
        let dt = 1.0 / 8192.0;
        // 16 periods in the window, i.e. bin 32 of the zero-padded spectrum.
        let input = sine(size, dt, 16.0 / (size as f32 * dt));

        let mut correlation = Correlation::new(size, WindowingFunction::Hann);
        let mut result = AutoCorrelation::new(size + 1, dt);
        let mut spectrum = FrequencySpectrum::new(size + 1, 1.0 / (2.0 * size as f32 * dt));
        correlation
            .correlate(&input, &mut result, Some(&mut spectrum))
            .unwrap();

        let peak_bin = (0..spectrum.size)
            .max_by(|&a, &b| {
                spectrum.amplitude_spectrum_squared[a]
                    .total_cmp(&spectrum.amplitude_spectrum_squared[b])
            })
            .unwrap();
        assert_eq!(peak_bin, 32);
        // A full-scale sine has a squared one-sided amplitude of 1.
        assert_relative_eq!(
            spectrum.amplitude_spectrum_squared[peak_bin],
            1.0,
            max_relative = 0.1
        );
    }

    #[test]
    fn rejects_mismatched_buffer_sizes() {
        let mut correlation = Correlation::new(64, WindowingFunction::Tophat);
        let mut result = AutoCorrelation::new(64, 1.0); // one lag short
        assert!(
            correlation
                .correlate(&vec![0.0; 64], &mut result, None)
                .is_err()
        );
    }
}

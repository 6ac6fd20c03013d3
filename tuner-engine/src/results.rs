//! Per-window result aggregate and the collector which fills it.

use anyhow::{Result, anyhow};

use crate::buffers::{AutoCorrelation, FrequencySpectrum, TimeSeries};
use crate::config::Config;
use crate::fft::{Correlation, WindowingFunction};
use crate::harmonics::{
    AccuratePeakFrequency, Harmonics, find_harmonics_from_spectrum, harmonic_energy_absolute,
    harmonic_energy_relative,
};
use crate::inharmonicity::{InharmonicityDetector, estimate_b_coefficient};
use crate::memory::{MemoryPool, RefCounted};
use crate::pitch::{CorrelationBasedFrequency, find_correlation_based_frequency};
use crate::sample_buffer::SampleWindow;
use crate::statistics::{AcousticWeighting, HarmonicStatistics};

/// Everything the engine derives from one window of samples.
///
/// The aggregate is pool-recycled; all fields are overwritten in place each
/// cycle. The previous window's spectrum is carried along to enable
/// phase-based sub-bin peak frequencies.
pub struct CollectedResults {
    /// Window size the aggregate was shaped for.
    pub size_of_time_series: usize,
    /// Sample rate the aggregate was shaped for.
    pub sample_rate: u32,

    /// Raw samples of the window.
    pub time_series: TimeSeries,
    /// Standard deviation of the raw samples.
    pub time_series_standard_deviation: f32,
    /// Spectrum of the current window.
    pub spectrum: FrequencySpectrum,
    /// Spectrum of the previous window, copied over by the collector.
    pub previous_spectrum: FrequencySpectrum,
    /// Frame position the previous spectrum belongs to; -1 when there is
    /// none.
    pub previous_frame_position: i64,
    /// Autocorrelation of the window.
    pub autocorrelation: AutoCorrelation,
    /// Relative noise of the signal (0 clean, towards 1 noisy).
    pub noise: f32,
    /// Frequency detected from the autocorrelation.
    pub correlation_based_frequency: CorrelationBasedFrequency,
    /// Harmonics found in the spectrum.
    pub harmonics: Harmonics,
    /// Weighted statistics over the harmonics.
    pub harmonic_statistics: HarmonicStatistics,
    /// Energy near harmonic peaks relative to the total spectral energy.
    pub harmonic_energy_relative: f32,
    /// Absolute energy near harmonic peaks.
    pub harmonic_energy_absolute: f32,
    /// Pairwise inharmonicity aggregated over the loudest harmonics.
    pub inharmonicity: f32,
    /// Stiff-string coefficient estimated from the harmonics, when possible.
    pub inharmonicity_b: Option<f32>,
}

impl CollectedResults {
    pub fn new(size_of_time_series: usize, sample_rate: u32) -> Self {
        let dt = 1.0 / sample_rate as f32;
        // Zero-padding to twice the window size halves the bin width.
        let df = 1.0 / (2.0 * size_of_time_series as f32 * dt);
        Self {
            size_of_time_series,
            sample_rate,
            time_series: TimeSeries::new(size_of_time_series, dt),
            time_series_standard_deviation: 0.0,
            spectrum: FrequencySpectrum::new(size_of_time_series + 1, df),
            previous_spectrum: FrequencySpectrum::new(size_of_time_series + 1, df),
            previous_frame_position: -1,
            autocorrelation: AutoCorrelation::new(size_of_time_series + 1, dt),
            noise: 0.0,
            correlation_based_frequency: CorrelationBasedFrequency::default(),
            harmonics: Harmonics::new(size_of_time_series),
            harmonic_statistics: HarmonicStatistics::default(),
            harmonic_energy_relative: 0.0,
            harmonic_energy_absolute: 0.0,
            inharmonicity: 0.0,
            inharmonicity_b: None,
        }
    }

    /// The best available fundamental frequency of the window: the
    /// harmonic-refined one when harmonics were found, the correlation-based
    /// one otherwise.
    pub fn frequency(&self) -> f32 {
        if self.harmonic_statistics.frequency() != 0.0 {
            self.harmonic_statistics.frequency()
        } else {
            self.correlation_based_frequency.frequency
        }
    }
}

/// Runs the full analysis of one sample window into a pooled
/// [`CollectedResults`] aggregate.
pub struct ResultCollector {
    frequency_min: f32,
    frequency_max: f32,
    subharmonics_tolerance: f32,
    subharmonic_peak_ratio: f32,
    harmonic_tolerance: f32,
    minimum_factor_over_local_mean: f32,
    max_gap_between_harmonics: usize,
    window_type: WindowingFunction,
    acoustic_weighting: AcousticWeighting,

    results_pool: MemoryPool<CollectedResults>,
    correlation: Option<Correlation>,
    inharmonicity_detector: InharmonicityDetector,
    /// Last produced results, retained for the previous-spectrum carry.
    previous_results: Option<RefCounted<CollectedResults>>,
}

impl ResultCollector {
    pub fn new(config: &Config) -> Self {
        Self {
            frequency_min: config.frequency_min,
            frequency_max: config.frequency_max,
            subharmonics_tolerance: config.subharmonics_tolerance,
            subharmonic_peak_ratio: config.subharmonic_peak_ratio,
            harmonic_tolerance: config.harmonic_tolerance,
            minimum_factor_over_local_mean: config.minimum_factor_over_local_mean,
            max_gap_between_harmonics: config.max_gap_between_harmonics,
            window_type: config.windowing,
            acoustic_weighting: config.acoustic_weighting,
            results_pool: MemoryPool::default(),
            correlation: None,
            inharmonicity_detector: InharmonicityDetector::new(
                config.max_num_harmonics_for_inharmonicity,
            ),
            previous_results: None,
        }
    }

    /// Analyze one window. The returned handle is owned by the caller.
    pub fn collect(
        &mut self,
        window: &RefCounted<SampleWindow>,
    ) -> Result<RefCounted<CollectedResults>> {
        let (size, sample_rate) = window
            .with(|w| (w.size, w.sample_rate))
            .ok_or_else(|| anyhow!("sample window was recycled while still in use"))?;

        let results = self.results_pool.acquire(
            || CollectedResults::new(size, sample_rate),
            |r| r.size_of_time_series == size && r.sample_rate == sample_rate,
        );

        // Carry the previous spectrum over for phase-based refinement; a
        // shape change discards the carry instead of reinterpreting data.
        let previous = self.previous_results.take();
        results.with_mut(|r| {
            r.previous_frame_position = -1;
            if let Some(previous) = &previous {
                previous.with(|p| {
                    if p.size_of_time_series == r.size_of_time_series {
                        r.previous_frame_position = p.time_series.frame_position;
                        r.previous_spectrum.copy_from(&p.spectrum);
                    }
                });
            }
        });
        if let Some(previous) = previous {
            previous.release();
        }

        let collect_result = results
            .with_mut(|r| self.fill(window, r))
            .ok_or_else(|| anyhow!("collected results were recycled while still in use"))?;
        if let Err(error) = collect_result {
            results.release();
            return Err(error);
        }

        // Keep one reference for the next cycle's previous-spectrum carry.
        if let Some(alias) = results.try_clone() {
            self.previous_results = Some(alias);
        }
        Ok(results)
    }

    fn fill(&mut self, window: &RefCounted<SampleWindow>, results: &mut CollectedResults) -> Result<()> {
        window
            .with(|w| {
                results.time_series.frame_position = w.frame_position;
                results.time_series.values.copy_from_slice(&w.data);
            })
            .ok_or_else(|| anyhow!("sample window was recycled while still in use"))?;

        results.time_series_standard_deviation = results.time_series.standard_deviation();

        // Rebuild the FFT plan when the window shape changed.
        let size = results.size_of_time_series;
        let window_type = self.window_type;
        let correlation = match &mut self.correlation {
            Some(c) if c.size == size && c.window_type == window_type => c,
            slot => slot.insert(Correlation::new(size, window_type)),
        };
        correlation.correlate(
            &results.time_series.values,
            &mut results.autocorrelation,
            Some(&mut results.spectrum),
        )?;

        results.noise = if results.autocorrelation.values[0] > 0.0 {
            1.0 - results.autocorrelation.values[1] / results.autocorrelation.values[0]
        } else {
            1.0
        };

        find_correlation_based_frequency(
            &mut results.correlation_based_frequency,
            &results.autocorrelation,
            self.frequency_min,
            self.frequency_max,
            self.subharmonics_tolerance,
            self.subharmonic_peak_ratio,
        );

        if results.correlation_based_frequency.frequency != 0.0 {
            let time_shift = if results.previous_frame_position < 0 {
                0.0
            } else {
                results.time_series.dt
                    * (results.time_series.frame_position - results.previous_frame_position) as f32
            };
            let accurate_frequency = AccuratePeakFrequency::new(
                (results.previous_frame_position >= 0).then_some(&results.previous_spectrum),
                &results.spectrum,
                time_shift,
            );
            find_harmonics_from_spectrum(
                &mut results.harmonics,
                results.correlation_based_frequency.frequency,
                self.frequency_min,
                self.frequency_max,
                &results.spectrum,
                &accurate_frequency,
                self.harmonic_tolerance,
                self.minimum_factor_over_local_mean,
                self.max_gap_between_harmonics,
            );
            results.harmonics.sort();

            results
                .harmonic_statistics
                .evaluate(&results.harmonics, self.acoustic_weighting);
            results.harmonic_energy_relative = harmonic_energy_relative(
                &results.harmonics,
                &results.spectrum.amplitude_spectrum_squared,
                1,
            );
            results.harmonic_energy_absolute = harmonic_energy_absolute(
                &results.harmonics,
                &results.spectrum.amplitude_spectrum_squared,
                1,
            );
            results.inharmonicity = self
                .inharmonicity_detector
                .compute(&results.harmonics, self.acoustic_weighting);
            results.inharmonicity_b = estimate_b_coefficient(&results.harmonics);
        } else {
            results.harmonics.clear();
            results.harmonic_statistics.clear();
            results.harmonic_energy_relative = 0.0;
            results.harmonic_energy_absolute = 0.0;
            results.inharmonicity = 0.0;
            results.inharmonicity_b = None;
        }
        Ok(())
    }
}

impl Drop for ResultCollector {
    fn drop(&mut self) {
        if let Some(previous) = self.previous_results.take() {
            previous.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::PI;

    use crate::memory::MemoryPool;

    fn window_with_tone(
        pool: &MemoryPool<SampleWindow>,
        size: usize,
        sample_rate: u32,
        frame_position: i64,
        frequency: f32,
    ) -> RefCounted<SampleWindow> {
        let window = pool.acquire(
            || SampleWindow::new(size, sample_rate, frame_position),
            |w| w.size == size && w.sample_rate == sample_rate,
        );
        window.with_mut(|w| {
            w.reset(frame_position);
            let dt = 1.0 / sample_rate as f32;
            let chunk: Vec<f32> = (0..size)
                .map(|i| (2.0 * PI * frequency * (frame_position + i as i64) as f32 * dt).sin())
                .collect();
            w.add_chunk(frame_position, &chunk);
            assert!(w.is_full());
        });
        window
    }

    #[test]
    fn tone_window_produces_consistent_results() {
        let config = Config::default();
        let mut collector = ResultCollector::new(&config);
        let pool = MemoryPool::default();

        let window = window_with_tone(&pool, 4096, 44100, 0, 440.0);
        let results = collector.collect(&window).unwrap();
        window.release();

        results.with(|r| {
            assert_relative_eq!(
                r.correlation_based_frequency.frequency,
                440.0,
                max_relative = 0.01
            );
            assert!(r.noise < 0.05, "pure tone must be low noise, got {}", r.noise);
            assert!(!r.harmonics.is_empty());
            assert_eq!(r.harmonics[0].harmonic_number, 1);
            assert_relative_eq!(r.frequency(), 440.0, max_relative = 0.01);
            assert!(r.previous_frame_position < 0);
            assert!(r.time_series_standard_deviation > 0.5);
        });
        results.release();
    }

    #[test]
    fn previous_spectrum_is_carried_between_windows() {
        let config = Config::default();
        let mut collector = ResultCollector::new(&config);
        let pool = MemoryPool::default();

        let first = window_with_tone(&pool, 4096, 44100, 0, 440.0);
        let first_results = collector.collect(&first).unwrap();
        first.release();
        first_results.release();

        let second = window_with_tone(&pool, 4096, 44100, 3072, 440.0);
        let second_results = collector.collect(&second).unwrap();
        second.release();

        second_results.with(|r| {
            assert_eq!(r.previous_frame_position, 0);
            // With phase refinement the estimate tightens well below the
            // bin width of ~5.4 Hz.
            assert_relative_eq!(r.frequency(), 440.0, max_relative = 2e-3);
        });
        second_results.release();
    }

    #[test]
    fn silence_produces_no_detection() {
        let config = Config::default();
        let mut collector = ResultCollector::new(&config);
        let pool = MemoryPool::default();

        let window = pool.acquire(
            || SampleWindow::new(4096, 44100, 0),
            |w| w.size == 4096,
        );
        window.with_mut(|w| {
            w.reset(0);
            w.add_chunk(0, &vec![0.0; 4096]);
        });

        let results = collector.collect(&window).unwrap();
        window.release();
        results.with(|r| {
            // Silence is flagged as pure noise and carries no harmonic
            // energy; the evaluator gates such windows out downstream.
            assert_eq!(r.noise, 1.0);
            assert_eq!(r.harmonic_energy_absolute, 0.0);
            assert_eq!(r.harmonic_statistics.frequency(), 0.0);
        });
        results.release();
    }
}

//! Search for integer-multiple peaks of a fundamental in the amplitude
//! spectrum, with phase-based sub-bin peak frequencies.

use std::f32::consts::PI;

use crate::buffers::FrequencySpectrum;

/// A single detected harmonic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Harmonic {
    /// Harmonic number (1 = fundamental).
    pub harmonic_number: i32,
    /// Frequency of the harmonic.
    pub frequency: f32,
    /// Index in the amplitude spectrum where the harmonic was found.
    pub spectrum_index: usize,
    /// Squared amplitude of the spectrum at that index.
    pub spectrum_amplitude_squared: f32,
}

/// Bounded collection of harmonics.
///
/// Capacity is fixed at construction; the collection is sorted ascending by
/// harmonic number before consumption.
pub struct Harmonics {
    harmonics: Vec<Harmonic>,
    capacity: usize,
}

impl Harmonics {
    pub fn new(capacity: usize) -> Self {
        Self {
            harmonics: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.harmonics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.harmonics.is_empty()
    }

    /// Append a harmonic; appends beyond the capacity are ignored.
    pub fn add(
        &mut self,
        harmonic_number: i32,
        frequency: f32,
        spectrum_index: usize,
        spectrum_amplitude_squared: f32,
    ) {
        if self.harmonics.len() == self.capacity {
            return;
        }
        self.harmonics.push(Harmonic {
            harmonic_number,
            frequency,
            spectrum_index,
            spectrum_amplitude_squared,
        });
    }

    /// Sort ascending by harmonic number.
    pub fn sort(&mut self) {
        self.harmonics.sort_by_key(|h| h.harmonic_number);
    }

    pub fn clear(&mut self) {
        self.harmonics.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Harmonic> {
        self.harmonics.iter()
    }
}

impl std::ops::Index<usize> for Harmonics {
    type Output = Harmonic;

    fn index(&self, index: usize) -> &Harmonic {
        &self.harmonics[index]
    }
}

/// Sub-bin peak frequencies from the phase shift between two successive
/// spectra of the same signal.
///
/// Without a previous spectrum (or with a zero time shift) the plain bin
/// center frequency is returned.
pub struct AccuratePeakFrequency<'a> {
    previous: Option<&'a FrequencySpectrum>,
    current: &'a FrequencySpectrum,
    /// Time shift between the two underlying windows.
    pub time_shift: f32,
}

impl<'a> AccuratePeakFrequency<'a> {
    pub fn new(
        previous: Option<&'a FrequencySpectrum>,
        current: &'a FrequencySpectrum,
        time_shift: f32,
    ) -> Self {
        Self {
            previous,
            current,
            time_shift,
        }
    }

    /// Refined frequency at a given spectrum bin.
    pub fn at(&self, index: usize) -> f32 {
        let frequency_low_accuracy = self.current.frequency(index);
        let Some(previous) = self.previous else {
            return frequency_low_accuracy;
        };
        if self.time_shift == 0.0 {
            return frequency_low_accuracy;
        }

        let phase_previous = previous.imag(index).atan2(previous.real(index));
        let phase_current = self.current.imag(index).atan2(self.current.real(index));
        let mut phase_diff = phase_current - phase_previous;
        if phase_diff < -PI {
            phase_diff += 2.0 * PI;
        } else if phase_diff > PI {
            phase_diff -= 2.0 * PI;
        }

        let turns = phase_diff / (2.0 * PI);
        let num_waves = (self.time_shift * frequency_low_accuracy - turns).round();
        (num_waves + turns) / self.time_shift
    }
}

/// Find the largest in-range local maximum of an array.
///
/// The bounds are clamped so that boundary samples can never win.
pub fn find_global_maximum_index(
    index_begin: usize,
    index_end: usize,
    values: &[f32],
) -> Option<usize> {
    let mut maximum_index = None;
    let mut maximum_value = f32::NEG_INFINITY;
    for i in index_begin.max(1)..index_end.min(values.len() - 1) {
        if values[i] > maximum_value && values[i] >= values[i - 1] && values[i] >= values[i + 1] {
            maximum_index = Some(i);
            maximum_value = values[i];
        }
    }
    maximum_index
}

/// Find a local maximum around a predicted position.
///
/// The winner within the search radius must be a strict local maximum and
/// must exceed `minimum_factor_over_mean` times the local mean (computed
/// over `mean_radius`, the peak itself excluded).
pub fn find_local_maximum_index(
    values: &[f32],
    center: f32,
    search_radius: f32,
    minimum_factor_over_mean: f32,
    mean_radius: usize,
) -> Option<usize> {
    let index_begin = ((center - search_radius).ceil() as isize).max(1) as usize;
    let index_end = (((center + search_radius).floor() as isize + 1).max(0) as usize)
        .min(values.len().saturating_sub(1));
    if index_end <= index_begin {
        return None;
    }

    let mut maximum_value = values[index_begin];
    let mut maximum_index = index_begin;
    for (i, &value) in values.iter().enumerate().take(index_end).skip(index_begin) {
        if value > maximum_value {
            maximum_value = value;
            maximum_index = i;
        }
    }
    if values[maximum_index - 1] >= maximum_value || values[maximum_index + 1] >= maximum_value {
        return None;
    }

    let mean_begin = maximum_index.saturating_sub(mean_radius);
    let mean_end = (maximum_index + mean_radius + 1).min(values.len());
    if mean_end <= mean_begin {
        return None;
    }

    let mut average = 0.0;
    if mean_end - mean_begin > 1 {
        for &value in &values[mean_begin..mean_end] {
            average += value;
        }
        average -= maximum_value;
        average /= (mean_end - mean_begin - 1) as f32;
    }

    if maximum_value < average * minimum_factor_over_mean {
        return None;
    }
    Some(maximum_index)
}

/// Extract harmonics of a candidate fundamental from the amplitude spectrum.
///
/// The strongest in-range local maximum anchors the search; its harmonic
/// number is estimated from the refined peak frequency. From the anchor the
/// search walks outward in both directions, predicting each next peak from
/// the per-harmonic frequency of the previously found one. A direction stops
/// once `max_num_fail` successive predictions found no acceptable peak or the
/// prediction leaves the frequency bounds.
#[allow(clippy::too_many_arguments)]
pub fn find_harmonics_from_spectrum(
    harmonics: &mut Harmonics,
    fundamental: f32,
    frequency_min: f32,
    frequency_max: f32,
    spectrum: &FrequencySpectrum,
    accurate_frequency: &AccuratePeakFrequency,
    harmonic_tolerance: f32,
    minimum_factor_over_local_mean: f32,
    max_num_fail: usize,
) {
    harmonics.clear();

    let df = spectrum.df;
    let amplitudes = &spectrum.amplitude_spectrum_squared;
    // The second bound keeps a later rounding from producing harmonic 0.
    let index_begin = ((frequency_min / df).ceil() as usize)
        .max((0.5 * fundamental / df).ceil() as usize);
    let index_end = amplitudes
        .len()
        .min((frequency_max / df).floor() as usize + 1);
    let Some(global_maximum_index) = find_global_maximum_index(index_begin, index_end, amplitudes)
    else {
        return;
    };

    let frequency_of_global_max = accurate_frequency.at(global_maximum_index);
    let harmonic_of_global_max = (frequency_of_global_max / fundamental).round() as i32;
    if harmonic_of_global_max == 0 {
        return;
    }

    harmonics.add(
        harmonic_of_global_max,
        frequency_of_global_max,
        global_maximum_index,
        amplitudes[global_maximum_index],
    );

    let search_radius =
        harmonic_tolerance * global_maximum_index as f32 / harmonic_of_global_max as f32;
    let mean_radius = ((global_maximum_index as f32 / (2.0 * harmonic_of_global_max as f32))
        .round() as usize)
        .max(1);

    for increment in [-1i32, 1] {
        let mut previous_found = harmonics[0]; // the anchor
        let mut probable_harmonic_number = previous_found.harmonic_number + increment;
        let mut num_fail = 0;

        while num_fail < max_num_fail && probable_harmonic_number > 0 {
            let frequency_per_harmonic =
                previous_found.frequency / previous_found.harmonic_number as f32;
            let predicted_frequency = frequency_per_harmonic * probable_harmonic_number as f32;
            let center = predicted_frequency / df;

            let maximum_index = find_local_maximum_index(
                amplitudes,
                center,
                search_radius,
                minimum_factor_over_local_mean,
                mean_radius,
            );
            match maximum_index {
                Some(index) if index != previous_found.spectrum_index => {
                    let actual_frequency = accurate_frequency.at(index);
                    if actual_frequency < frequency_min || actual_frequency > frequency_max {
                        break;
                    }
                    harmonics.add(
                        probable_harmonic_number,
                        actual_frequency,
                        index,
                        amplitudes[index],
                    );
                    previous_found = harmonics[harmonics.len() - 1];
                    num_fail = 0;
                }
                _ => {
                    if predicted_frequency < frequency_min || predicted_frequency > frequency_max {
                        break;
                    }
                    num_fail += 1;
                }
            }
            probable_harmonic_number += increment;
        }
    }
}

/// Energy near the found harmonic peaks relative to the total spectral
/// energy.
pub fn harmonic_energy_relative(
    harmonics: &Harmonics,
    amplitude_spectrum_squared: &[f32],
    radius: usize,
) -> f32 {
    let total: f64 = amplitude_spectrum_squared.iter().map(|&v| v as f64).sum();
    if total == 0.0 {
        return 0.0;
    }
    (harmonic_energy_absolute(harmonics, amplitude_spectrum_squared, radius) as f64 / total) as f32
}

/// Absolute energy near the found harmonic peaks.
pub fn harmonic_energy_absolute(
    harmonics: &Harmonics,
    amplitude_spectrum_squared: &[f32],
    radius: usize,
) -> f32 {
    let mut energy = 0.0;
    for harmonic in harmonics.iter() {
        let begin = harmonic.spectrum_index.saturating_sub(radius);
        let end = (harmonic.spectrum_index + radius + 1).min(amplitude_spectrum_squared.len());
        for &value in &amplitude_spectrum_squared[begin..end] {
            energy += value;
        }
    }
    energy
}

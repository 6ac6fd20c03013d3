//! Musical-scale context and the evaluation of detected frequencies into
//! tuning targets.

use std::sync::Arc;

use crate::results::CollectedResults;
use crate::smoother::OutlierRemovingSmoother;

/// Convert a cent offset to a frequency ratio.
pub fn cents_to_ratio(cents: f32) -> f32 {
    2.0f32.powf(cents / 1200.0)
}

/// Convert a frequency ratio to a cent offset.
pub fn ratio_to_cents(ratio: f32) -> f32 {
    1200.0 * ratio.log2()
}

/// Musical scale as seen by the engine: note indices are opaque integers,
/// the scale maps between them and frequencies.
pub trait MusicalScale: Send + Sync {
    /// Index of the note closest to a frequency.
    fn closest_note_index(&self, frequency: f32) -> i32;
    /// Reference frequency of a note.
    fn note_frequency(&self, note_index: i32) -> f32;
    /// Note the scale is anchored to (index 0 by convention).
    fn reference_note_index(&self) -> i32 {
        0
    }
}

/// Twelve-tone equal temperament anchored at a reference note.
///
/// Note index 0 is the reference note (A4 by convention); each step is one
/// semitone.
pub struct EqualTemperament {
    /// Frequency of the reference note.
    pub reference_frequency: f32,
}

impl EqualTemperament {
    pub fn new(reference_frequency: f32) -> Self {
        Self {
            reference_frequency,
        }
    }
}

impl Default for EqualTemperament {
    fn default() -> Self {
        Self::new(440.0)
    }
}

impl MusicalScale for EqualTemperament {
    fn closest_note_index(&self, frequency: f32) -> i32 {
        if frequency <= 0.0 {
            return 0;
        }
        (12.0 * (frequency / self.reference_frequency).log2()).round() as i32
    }

    fn note_frequency(&self, note_index: i32) -> f32 {
        self.reference_frequency * 2.0f32.powf(note_index as f32 / 12.0)
    }
}

/// The strings of an instrument as a set of scale note indices.
#[derive(Debug, Clone)]
pub struct Instrument {
    /// Sorted, distinct note indices of the strings.
    strings: Vec<i32>,
    /// A chromatic instrument matches every note of the scale.
    pub is_chromatic: bool,
}

impl Instrument {
    /// Instrument with a fixed set of strings; duplicates are merged.
    pub fn with_strings(mut strings: Vec<i32>) -> Self {
        strings.sort_unstable();
        strings.dedup();
        Self {
            strings,
            is_chromatic: false,
        }
    }

    /// Instrument matching every note of the scale.
    pub fn chromatic() -> Self {
        Self {
            strings: Vec::new(),
            is_chromatic: true,
        }
    }

    pub fn strings(&self) -> &[i32] {
        &self.strings
    }

    /// Whether a note belongs to the instrument's string set.
    pub fn contains_note(&self, note_index: i32) -> bool {
        self.is_chromatic || self.strings.binary_search(&note_index).is_ok()
    }
}

/// Target the user should tune towards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningTarget {
    /// Scale note index of the target.
    pub note: i32,
    /// Reference frequency of the target note.
    pub frequency: f32,
    /// Whether the note belongs to the instrument's string set.
    pub is_part_of_instrument: bool,
}

/// Relation of a detected frequency to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningState {
    InTune,
    TooLow,
    TooHigh,
    Unknown,
}

/// Classify a frequency against a target frequency with a cent tolerance.
pub fn check_tuning(frequency: f32, target_frequency: f32, tolerance_in_cents: f32) -> TuningState {
    if frequency < 0.0 || target_frequency <= 0.0 || tolerance_in_cents < 0.0 {
        return TuningState::Unknown;
    }
    let ratio = cents_to_ratio(tolerance_in_cents);
    if frequency < target_frequency / ratio {
        TuningState::TooLow
    } else if frequency > target_frequency * ratio {
        TuningState::TooHigh
    } else {
        TuningState::InTune
    }
}

/// Minimum cent deviation before the target note may move away from the
/// previous one.
const MIN_CENT_DEVIATION_FOR_TARGET_CHANGE: f32 = 20.0;
/// Fraction of the distance to a neighboring string within which the
/// previous string target is kept.
const RELATIVE_DEVIATION_FOR_TARGET_CHANGE: f32 = 0.6;

/// Selects the target note for a frequency, with hysteresis around the
/// previously selected note so jitter near a note boundary does not flicker
/// the target.
pub struct TargetNoteSelector {
    scale: Arc<dyn MusicalScale>,
    instrument: Instrument,
    tolerance_in_cents: f32,
}

impl TargetNoteSelector {
    pub fn new(
        scale: Arc<dyn MusicalScale>,
        instrument: Instrument,
        tolerance_in_cents: f32,
    ) -> Self {
        Self {
            scale,
            instrument,
            tolerance_in_cents,
        }
    }

    /// Compute the tuning target for a detected frequency.
    pub fn select(
        &self,
        frequency: f32,
        previous_note: Option<i32>,
        user_defined_note: Option<i32>,
    ) -> TuningTarget {
        if let Some(note) = user_defined_note {
            return self.target_for_note(note);
        }

        if frequency <= 0.0 {
            return self.target_for_note(self.scale.reference_note_index());
        }

        if let Some(previous) = previous_note {
            if self.instrument.contains_note(previous) {
                let (lower, upper) = self.sticky_frequency_range(previous);
                if (lower..=upper).contains(&frequency) {
                    return self.target_for_note(previous);
                }
            }
        }

        let note = if self.instrument.is_chromatic || self.instrument.strings().is_empty() {
            self.scale.closest_note_index(frequency)
        } else {
            self.closest_string_note(frequency)
        };
        self.target_for_note(note)
    }

    fn target_for_note(&self, note: i32) -> TuningTarget {
        TuningTarget {
            note,
            frequency: self.scale.note_frequency(note),
            is_part_of_instrument: self.instrument.contains_note(note),
        }
    }

    fn closest_string_note(&self, frequency: f32) -> i32 {
        let mut best = self.instrument.strings()[0];
        let mut best_distance = f32::INFINITY;
        for &note in self.instrument.strings() {
            let distance = ratio_to_cents(frequency / self.scale.note_frequency(note)).abs();
            if distance < best_distance {
                best_distance = distance;
                best = note;
            }
        }
        best
    }

    /// Frequency range within which the previous target note is kept.
    fn sticky_frequency_range(&self, note: i32) -> (f32, f32) {
        let center = self.scale.note_frequency(note);
        let (lower_neighbor, upper_neighbor) =
            if self.instrument.is_chromatic || self.instrument.strings().is_empty() {
                (
                    Some(self.scale.note_frequency(note - 1)),
                    Some(self.scale.note_frequency(note + 1)),
                )
            } else {
                let strings = self.instrument.strings();
                match strings.binary_search(&note) {
                    Ok(position) => (
                        position
                            .checked_sub(1)
                            .map(|p| self.scale.note_frequency(strings[p])),
                        strings
                            .get(position + 1)
                            .map(|&n| self.scale.note_frequency(n)),
                    ),
                    // The note left the instrument; never stick to it.
                    Err(_) => return (f32::INFINITY, f32::NEG_INFINITY),
                }
            };

        // Stick for a fraction of the distance to the neighbor, but at
        // least the minimum cent deviation (capped so the sticky range can
        // never reach into the neighbor's tolerance band).
        let bound_cents = |cents_to_neighbor: f32| {
            (RELATIVE_DEVIATION_FOR_TARGET_CHANGE * cents_to_neighbor).max(
                MIN_CENT_DEVIATION_FOR_TARGET_CHANGE
                    .min(cents_to_neighbor - self.tolerance_in_cents),
            )
        };
        let lower = match lower_neighbor {
            Some(neighbor) => {
                center / cents_to_ratio(bound_cents(ratio_to_cents(center / neighbor)))
            }
            None => f32::NEG_INFINITY,
        };
        let upper = match upper_neighbor {
            Some(neighbor) => {
                center * cents_to_ratio(bound_cents(ratio_to_cents(neighbor / center)))
            }
            None => f32::INFINITY,
        };
        (lower, upper)
    }
}

/// Result of evaluating one window against the musical context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyEvaluationResult {
    /// Smoothed frequency, 0 while the smoother has no valid output.
    pub smoothed_frequency: f32,
    /// Refreshed tuning target, if this window produced one.
    pub target: Option<TuningTarget>,
    /// Seconds since the last window with a successful detection.
    pub time_since_last_detection: f32,
    /// Frame position of the evaluated window.
    pub frame_position: i64,
}

/// Per-window evaluation: noise/energy gating, smoothing, tuning target.
///
/// Owns the smoothing state and must therefore be driven from a single
/// sequential context, in frame order.
pub struct FrequencyEvaluator {
    smoother: OutlierRemovingSmoother,
    target_selector: TargetNoteSelector,
    max_noise: f32,
    min_harmonic_energy_content: f32,
    sensitivity: f32,
    current_target_note: Option<i32>,
    last_detection_frame: i64,
}

impl FrequencyEvaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_moving_average: usize,
        frequency_min: f32,
        frequency_max: f32,
        max_num_successive_outliers: usize,
        max_noise: f32,
        min_harmonic_energy_content: f32,
        sensitivity: f32,
        tolerance_in_cents: f32,
        scale: Arc<dyn MusicalScale>,
        instrument: Instrument,
    ) -> Self {
        Self {
            smoother: OutlierRemovingSmoother::new(
                num_moving_average,
                frequency_min,
                frequency_max,
                0.1,
                max_num_successive_outliers,
                2,
                3,
            ),
            target_selector: TargetNoteSelector::new(scale, instrument, tolerance_in_cents),
            max_noise,
            min_harmonic_energy_content,
            sensitivity,
            current_target_note: None,
            last_detection_frame: 0,
        }
    }

    /// Evaluate the collected results of one window.
    pub fn evaluate(
        &mut self,
        results: &CollectedResults,
        user_defined_note: Option<i32>,
    ) -> FrequencyEvaluationResult {
        let frame_position = results.time_series.frame_position;
        let dt = results.time_series.dt;
        let mut smoothed_frequency = 0.0;

        // Subtract a sliver so sensitivity 100 always passes a zero level.
        let required_energy_level = 100.0 - self.sensitivity - 1e-4;
        let eligible = results.noise < self.max_noise
            && results.harmonic_energy_relative >= self.min_harmonic_energy_content
            && energy_to_level(results.harmonic_energy_absolute) >= required_energy_level;

        let new_target = if eligible {
            smoothed_frequency = self.smoother.smooth(results.frequency());
            if smoothed_frequency > 0.0 {
                self.last_detection_frame = frame_position;
                Some(self.target_selector.select(
                    smoothed_frequency,
                    self.current_target_note,
                    user_defined_note,
                ))
            } else {
                None
            }
        } else {
            None
        };

        if let Some(target) = &new_target {
            self.current_target_note = Some(target.note);
        }

        FrequencyEvaluationResult {
            smoothed_frequency,
            target: new_target,
            time_since_last_detection: (frame_position - self.last_detection_frame) as f32 * dt,
            frame_position,
        }
    }
}

/// Map an absolute harmonic energy onto a 0–100 level.
///
/// Full-scale sine waves have an energy near 1, typical input sits far
/// below; the mapping is logarithmic between 1e-7 and 1e-2.
fn energy_to_level(energy: f32) -> f32 {
    let min_value = 1e-7f32;
    let max_value = 1e-2f32;
    let min_level = min_value.log10();
    let max_level = max_value.log10();
    let energy_level = energy.max(min_value).log10();
    (100.0 * (energy_level - min_level) / (max_level - min_level)).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn cents_round_trip() {
        assert_relative_eq!(ratio_to_cents(cents_to_ratio(33.0)), 33.0, max_relative = 1e-5);
        assert_relative_eq!(cents_to_ratio(1200.0), 2.0, max_relative = 1e-6);
    }

    #[test]
    fn equal_temperament_maps_notes_and_frequencies() {
        let scale = EqualTemperament::default();
        assert_relative_eq!(scale.note_frequency(0), 440.0);
        assert_relative_eq!(scale.note_frequency(12), 880.0);
        assert_eq!(scale.closest_note_index(440.0), 0);
        assert_eq!(scale.closest_note_index(446.0), 0);
        assert_eq!(scale.closest_note_index(467.0), 1);
    }

    #[test]
    fn tuning_state_classification() {
        assert_eq!(check_tuning(440.0, 440.0, 5.0), TuningState::InTune);
        assert_eq!(check_tuning(441.0, 440.0, 5.0), TuningState::InTune);
        assert_eq!(check_tuning(430.0, 440.0, 5.0), TuningState::TooLow);
        assert_eq!(check_tuning(450.0, 440.0, 5.0), TuningState::TooHigh);
        assert_eq!(check_tuning(-1.0, 440.0, 5.0), TuningState::Unknown);
    }

    #[test]
    fn chromatic_selection_finds_the_nearest_note() {
        let selector = TargetNoteSelector::new(
            Arc::new(EqualTemperament::default()),
            Instrument::chromatic(),
            5.0,
        );
        let target = selector.select(442.0, None, None);
        assert_eq!(target.note, 0);
        assert_relative_eq!(target.frequency, 440.0);
        assert!(target.is_part_of_instrument);
    }

    #[test]
    fn previous_note_sticks_near_the_boundary() {
        let selector = TargetNoteSelector::new(
            Arc::new(EqualTemperament::default()),
            Instrument::chromatic(),
            5.0,
        );
        // 452 Hz is slightly closer to A#4 (466.16), but within the sticky
        // range no flicker happens...
        let boundary = 440.0 * cents_to_ratio(50.0);
        let target = selector.select(boundary * 1.001, Some(0), None);
        assert_eq!(target.note, 0);
        // ...while a clearly different pitch moves the target.
        let target = selector.select(465.0, Some(0), None);
        assert_eq!(target.note, 1);
    }

    #[test]
    fn string_instrument_selects_nearest_string() {
        // Strings at A3 (220 Hz, index -12) and A4 (440 Hz, index 0).
        let instrument = Instrument::with_strings(vec![-12, 0]);
        let selector = TargetNoteSelector::new(
            Arc::new(EqualTemperament::default()),
            instrument,
            5.0,
        );
        let target = selector.select(300.0, None, None);
        assert_eq!(target.note, -12);
        assert!(target.is_part_of_instrument);
        let target = selector.select(400.0, None, None);
        assert_eq!(target.note, 0);
    }

    #[test]
    fn user_pinned_note_wins() {
        let selector = TargetNoteSelector::new(
            Arc::new(EqualTemperament::default()),
            Instrument::with_strings(vec![0]),
            5.0,
        );
        let target = selector.select(880.0, None, Some(3));
        assert_eq!(target.note, 3);
        assert!(!target.is_part_of_instrument);
    }

    #[test]
    fn energy_level_mapping_is_clamped() {
        assert_abs_diff_eq!(energy_to_level(1e-7), 0.0);
        assert_abs_diff_eq!(energy_to_level(1e-2), 100.0);
        assert_abs_diff_eq!(energy_to_level(1.0), 100.0);
        assert!(energy_to_level(1e-4) > 0.0 && energy_to_level(1e-4) < 100.0);
    }
}

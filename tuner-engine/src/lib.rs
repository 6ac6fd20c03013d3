// tuner-engine/src/lib.rs

//! Real-time pitch and frequency detection for a musical-instrument tuner.
//! This crate turns a stream of audio sample frames into a stable,
//! low-jitter fundamental-frequency estimate plus harmonic and
//! inharmonicity metrics. It is completely headless and contains no GUI
//! code; audio capture, rendering and persistence live in the surrounding
//! application.
//!
//! The processing chain per window: samples are assembled into overlapping
//! windows, transformed into an autocorrelation and a spectrum, searched for
//! the dominant periodicity (with sub-harmonic disambiguation) and its
//! harmonics (with phase-based sub-bin peak frequencies), aggregated into
//! weighted statistics, smoothed over time with outlier rejection, and
//! finally matched against a musical scale to produce a tuning target.

pub mod audio;
pub mod buffers;
pub mod config;
pub mod fft;
pub mod harmonics;
pub mod inharmonicity;
pub mod memory;
pub mod pipeline;
pub mod pitch;
pub mod results;
pub mod sample_buffer;
pub mod smoother;
pub mod statistics;
pub mod tuning;

pub use audio::{ChannelSource, GeneratorSource, SampleSource};
pub use config::Config;
pub use fft::WindowingFunction;
pub use pipeline::Pipeline;
pub use results::CollectedResults;
pub use statistics::AcousticWeighting;
pub use tuning::{
    EqualTemperament, FrequencyEvaluationResult, Instrument, MusicalScale, TuningState,
    TuningTarget, check_tuning,
};

#[cfg(feature = "capture")]
pub use audio::start_audio_capture;

//! The bounded, ordered analysis pipeline.
//!
//! Three stages run on their own threads, connected by small bounded
//! channels which drop their oldest item on overflow: capture/window
//! assembly, the compute-heavy analysis, and the sequential evaluation stage
//! owning the smoothing state. Windows flow in non-decreasing frame-position
//! order; under backpressure whole windows are dropped, never reordered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Result, ensure};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, trace, warn};

use crate::audio::SampleSource;
use crate::config::Config;
use crate::memory::RefCounted;
use crate::results::{CollectedResults, ResultCollector};
use crate::sample_buffer::WindowAssembler;
use crate::tuning::{FrequencyEvaluationResult, FrequencyEvaluator, Instrument, MusicalScale};

/// Capacity of the inter-stage queues; bounded staleness is preferred over
/// unbounded growth or blocking the producer.
const QUEUE_CAPACITY: usize = 2;
/// Chunk size the capture stage pulls from the source.
const CAPTURE_CHUNK_SIZE: usize = 1024;

/// Send to a bounded queue, dropping the oldest buffered item on overflow.
fn send_dropping_oldest<T>(
    sender: &Sender<T>,
    stale_receiver: &Receiver<T>,
    mut item: T,
    on_drop: impl Fn(T),
) {
    loop {
        match sender.try_send(item) {
            Ok(()) => return,
            Err(TrySendError::Full(returned)) => {
                if let Ok(stale) = stale_receiver.try_recv() {
                    trace!("pipeline queue full, dropping oldest item");
                    on_drop(stale);
                }
                item = returned;
            }
            Err(TrySendError::Disconnected(returned)) => {
                on_drop(returned);
                return;
            }
        }
    }
}

/// Running detection pipeline.
///
/// Stopping (or dropping) the pipeline cancels the capture stage first and
/// then lets the in-flight windows drain; every pooled buffer is released on
/// the way out. Reconfiguration means building a new pipeline.
pub struct Pipeline {
    stop: Arc<AtomicBool>,
    user_note: Arc<Mutex<Option<i32>>>,
    results_rx: Receiver<RefCounted<CollectedResults>>,
    evaluations_rx: Receiver<FrequencyEvaluationResult>,
    threads: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Build and start a pipeline for the given configuration and
    /// collaborators. Fails fast on an invalid configuration.
    pub fn spawn(
        config: Config,
        mut source: Box<dyn SampleSource>,
        scale: Arc<dyn MusicalScale>,
        instrument: Instrument,
    ) -> Result<Self> {
        config.validate()?;
        ensure!(
            source.sample_rate() == config.sample_rate,
            "sample source delivers {} Hz, configuration expects {} Hz",
            source.sample_rate(),
            config.sample_rate
        );

        let mut assembler =
            WindowAssembler::new(config.window_size, config.sample_rate, config.overlap)?;

        let stop = Arc::new(AtomicBool::new(false));
        let user_note = Arc::new(Mutex::new(None));

        let (windows_tx, windows_rx) = bounded(QUEUE_CAPACITY);
        let (eval_tx, eval_rx) = bounded(QUEUE_CAPACITY);
        let (results_tx, results_rx) = bounded(QUEUE_CAPACITY);
        let (evaluations_tx, evaluations_rx) = bounded(QUEUE_CAPACITY);

        // Capture: pull chunks, assemble windows, hand them downstream.
        let capture_stop = Arc::clone(&stop);
        let capture_windows_rx = windows_rx.clone();
        let capture = std::thread::spawn(move || {
            let mut chunk = vec![0.0f32; CAPTURE_CHUNK_SIZE];
            let mut frame: i64 = 0;
            let mut full_windows = Vec::new();
            while !capture_stop.load(Ordering::Relaxed) {
                let num_read = source.read(&mut chunk);
                if num_read == 0 {
                    // No samples arriving; keep running and produce nothing.
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                assembler.push_chunk(frame, &chunk[..num_read], &mut full_windows);
                frame += num_read as i64;
                for window in full_windows.drain(..) {
                    send_dropping_oldest(&windows_tx, &capture_windows_rx, window, |stale| {
                        stale.release()
                    });
                }
            }
            debug!("capture stage stopped at frame {frame}");
        });

        // Analysis: correlation, spectrum and harmonic search per window.
        let analysis_config = config.clone();
        let analysis_eval_rx = eval_rx.clone();
        let analysis_results_rx = results_rx.clone();
        let analysis = std::thread::spawn(move || {
            let mut collector = ResultCollector::new(&analysis_config);
            for window in windows_rx.iter() {
                let collected = collector.collect(&window);
                window.release();
                match collected {
                    Ok(results) => {
                        if let Some(for_evaluation) = results.try_clone() {
                            send_dropping_oldest(&eval_tx, &analysis_eval_rx, for_evaluation, |stale| {
                                stale.release()
                            });
                        }
                        send_dropping_oldest(&results_tx, &analysis_results_rx, results, |stale| {
                            stale.release()
                        });
                    }
                    Err(error) => warn!("window analysis failed: {error}"),
                }
            }
            debug!("analysis stage stopped");
        });

        // Evaluation: smoothing and tuning-target computation, strictly
        // ordered on a single thread.
        let evaluation_user_note = Arc::clone(&user_note);
        let evaluation_evaluations_rx = evaluations_rx.clone();
        let evaluation = std::thread::spawn(move || {
            let mut evaluator = FrequencyEvaluator::new(
                config.num_moving_average,
                config.frequency_min,
                config.frequency_max,
                config.max_num_successive_outliers,
                config.max_noise,
                config.min_harmonic_energy_content,
                config.sensitivity,
                config.tolerance_in_cents,
                scale,
                instrument,
            );
            for results in eval_rx.iter() {
                let pinned_note = *evaluation_user_note.lock().unwrap();
                let evaluation = results.with(|r| evaluator.evaluate(r, pinned_note));
                results.release();
                if let Some(evaluation) = evaluation {
                    send_dropping_oldest(
                        &evaluations_tx,
                        &evaluation_evaluations_rx,
                        evaluation,
                        |_| {},
                    );
                }
            }
            debug!("evaluation stage stopped");
        });

        Ok(Self {
            stop,
            user_note,
            results_rx,
            evaluations_rx,
            threads: vec![capture, analysis, evaluation],
        })
    }

    /// Per-window analysis results. Handles received here are owned by the
    /// consumer and must be released after use.
    pub fn results(&self) -> &Receiver<RefCounted<CollectedResults>> {
        &self.results_rx
    }

    /// Per-accepted-update tuning evaluation events.
    pub fn evaluations(&self) -> &Receiver<FrequencyEvaluationResult> {
        &self.evaluations_rx
    }

    /// Pin the target note, or un-pin it with `None`.
    pub fn set_user_note(&self, note: Option<i32>) {
        *self.user_note.lock().unwrap() = note;
    }

    /// Stop the pipeline: capture first, then drain the in-flight windows.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        // Release whatever the consumer did not pick up.
        while let Ok(results) = self.results_rx.try_recv() {
            results.release();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::GeneratorSource;
    use crate::tuning::EqualTemperament;
    use std::f32::consts::PI;

    fn tone_source(sample_rate: u32, frequency: f32) -> Box<dyn SampleSource> {
        Box::new(GeneratorSource::new(sample_rate, move |frame, dt| {
            (2.0 * PI * frequency * frame as f32 * dt).sin()
        }))
    }

    #[test]
    fn invalid_config_fails_fast() {
        let config = Config {
            overlap: 1.5,
            ..Config::default()
        };
        assert!(
            Pipeline::spawn(
                config,
                tone_source(44100, 440.0),
                Arc::new(EqualTemperament::default()),
                Instrument::chromatic(),
            )
            .is_err()
        );
    }

    #[test]
    fn mismatched_sample_rate_fails_fast() {
        let config = Config::default(); // expects 44100 Hz
        assert!(
            Pipeline::spawn(
                config,
                tone_source(48000, 440.0),
                Arc::new(EqualTemperament::default()),
                Instrument::chromatic(),
            )
            .is_err()
        );
    }

    #[test]
    fn drop_oldest_keeps_the_newest_items() {
        let (tx, rx) = bounded(2);
        for value in 0..5 {
            send_dropping_oldest(&tx, &rx, value, |_| {});
        }
        assert_eq!(rx.try_recv(), Ok(3));
        assert_eq!(rx.try_recv(), Ok(4));
    }

    #[test]
    fn pipeline_emits_results_in_frame_order() {
        let mut pipeline = Pipeline::spawn(
            Config::default(),
            tone_source(44100, 440.0),
            Arc::new(EqualTemperament::default()),
            Instrument::chromatic(),
        )
        .unwrap();

        let mut last_frame = -1i64;
        for _ in 0..5 {
            let results = pipeline
                .results()
                .recv_timeout(Duration::from_secs(10))
                .expect("pipeline produces results");
            let frame = results
                .with(|r| r.time_series.frame_position)
                .expect("results alive");
            results.release();
            assert!(frame > last_frame, "windows must arrive in frame order");
            last_frame = frame;
        }
        pipeline.stop();
    }
}

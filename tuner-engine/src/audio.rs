//! Sample sources feeding the pipeline.
//!
//! The engine only depends on the [`SampleSource`] contract. A deterministic
//! generator source is always available; live microphone capture through
//! cpal sits behind the `capture` feature.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

/// Source of raw sample chunks.
///
/// The capture stage pulls chunks and accumulates the frame position; a
/// return of 0 means no data is available right now (the pipeline keeps
/// running and simply produces no windows).
pub trait SampleSource: Send {
    /// Sample rate of the produced data in Hertz.
    fn sample_rate(&self) -> u32;

    /// Fill `out` with as many samples as available; returns the number of
    /// samples written, starting at `out[0]`.
    fn read(&mut self, out: &mut [f32]) -> usize;
}

/// Deterministic source computing samples from a function of frame and
/// sample spacing.
pub struct GeneratorSource {
    sample_rate: u32,
    frame: i64,
    generator: Box<dyn FnMut(i64, f32) -> f32 + Send>,
    paced: bool,
}

impl GeneratorSource {
    /// Source producing `generator(frame, dt)` as fast as it is pulled.
    pub fn new(sample_rate: u32, generator: impl FnMut(i64, f32) -> f32 + Send + 'static) -> Self {
        Self {
            sample_rate,
            frame: 0,
            generator: Box::new(generator),
            paced: false,
        }
    }

    /// Throttle reads to real time, mimicking a live device.
    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }
}

impl SampleSource for GeneratorSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        let dt = 1.0 / self.sample_rate as f32;
        for sample in out.iter_mut() {
            *sample = (self.generator)(self.frame, dt);
            self.frame += 1;
        }
        if self.paced {
            std::thread::sleep(Duration::from_secs_f32(out.len() as f32 * dt));
        }
        out.len()
    }
}

/// Source draining chunks delivered through a channel, e.g. from an audio
/// device callback.
pub struct ChannelSource {
    sample_rate: u32,
    receiver: Receiver<Vec<f32>>,
    pending: Vec<f32>,
    timeout: Duration,
}

impl ChannelSource {
    pub fn new(sample_rate: u32, receiver: Receiver<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            receiver,
            pending: Vec::new(),
            timeout: Duration::from_millis(250),
        }
    }
}

impl SampleSource for ChannelSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        if self.pending.is_empty() {
            match self.receiver.recv_timeout(self.timeout) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return 0,
            }
        }
        let num_copy = out.len().min(self.pending.len());
        out[..num_copy].copy_from_slice(&self.pending[..num_copy]);
        self.pending.drain(..num_copy);
        num_copy
    }
}

#[cfg(feature = "capture")]
pub use capture::start_audio_capture;

#[cfg(feature = "capture")]
mod capture {
    use anyhow::{Result, anyhow};
    use cpal::SupportedStreamConfigRange;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use crossbeam_channel::Sender;
    use tracing::{info, warn};

    /// Start capture from the default input device, streaming chunks into
    /// `sender`.
    ///
    /// The returned stream must be kept alive by the caller; dropping it
    /// stops the capture. Chunks that cannot be queued are dropped.
    pub fn start_audio_capture(
        sender: Sender<Vec<f32>>,
        target_sample_rate: u32,
    ) -> Result<(cpal::Stream, u32)> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("no input device available"))?;
        info!("using audio input device: {}", device.name()?);

        let configs = device.supported_input_configs()?.collect::<Vec<_>>();
        let supported_config = find_supported_config(configs, target_sample_rate)
            .ok_or_else(|| anyhow!("no suitable f32 input format found"))?;

        let sample_rate = target_sample_rate
            .clamp(
                supported_config.min_sample_rate().0,
                supported_config.max_sample_rate().0,
            );
        let config: cpal::StreamConfig = supported_config
            .with_sample_rate(cpal::SampleRate(sample_rate))
            .into();
        info!("selected sample rate: {} Hz", sample_rate);

        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = sender.try_send(data.to_vec());
            },
            |error| warn!("audio stream error: {error}"),
            None,
        )?;
        stream.play()?;
        Ok((stream, sample_rate))
    }

    /// Pick the mono f32 configuration closest to the target sample rate.
    fn find_supported_config(
        configs: Vec<SupportedStreamConfigRange>,
        target_rate: u32,
    ) -> Option<SupportedStreamConfigRange> {
        configs
            .into_iter()
            .filter(|c| c.channels() == 1 && c.sample_format() == cpal::SampleFormat::F32)
            .min_by_key(|c| {
                let min_diff = (c.min_sample_rate().0 as i64 - target_rate as i64).abs();
                let max_diff = (c.max_sample_rate().0 as i64 - target_rate as i64).abs();
                min_diff.min(max_diff)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn generator_source_is_deterministic() {
        let mut source = GeneratorSource::new(8000, |frame, _dt| frame as f32);
        let mut chunk = [0.0f32; 4];
        assert_eq!(source.read(&mut chunk), 4);
        assert_eq!(chunk, [0.0, 1.0, 2.0, 3.0]);
        assert_eq!(source.read(&mut chunk), 4);
        assert_eq!(chunk, [4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn channel_source_drains_chunks_across_reads() {
        let (tx, rx) = bounded(4);
        tx.send(vec![1.0, 2.0, 3.0]).unwrap();
        let mut source = ChannelSource::new(44100, rx);

        let mut out = [0.0f32; 2];
        assert_eq!(source.read(&mut out), 2);
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(source.read(&mut out), 1);
        assert_eq!(out[0], 3.0);
    }

    #[test]
    fn disconnected_channel_reports_no_data() {
        let (tx, rx) = bounded::<Vec<f32>>(1);
        drop(tx);
        let mut source = ChannelSource::new(44100, rx);
        let mut out = [0.0f32; 8];
        assert_eq!(source.read(&mut out), 0);
    }
}

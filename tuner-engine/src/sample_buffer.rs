//! Assembly of raw sample chunks into fixed-size, overlapping windows.

use anyhow::{Result, ensure};

use crate::memory::{MemoryPool, RefCounted};

/// A fixed-size window of samples collected from the input stream.
///
/// Chunks may arrive in pieces of arbitrary length; the window tracks the
/// smallest and largest written index and reports itself full once both ends
/// were reached.
pub struct SampleWindow {
    /// Window size in samples.
    pub size: usize,
    /// Sample rate in Hertz.
    pub sample_rate: u32,
    /// Absolute frame position of the first sample.
    pub frame_position: i64,
    /// Sample storage.
    pub data: Vec<f32>,

    min_level: usize,
    max_level: usize,
}

impl SampleWindow {
    pub fn new(size: usize, sample_rate: u32, frame_position: i64) -> Self {
        Self {
            size,
            sample_rate,
            frame_position,
            data: vec![0.0; size],
            min_level: usize::MAX,
            max_level: 0,
        }
    }

    /// Prepare a recycled window for a new frame position.
    pub fn reset(&mut self, frame_position: i64) {
        self.frame_position = frame_position;
        self.min_level = usize::MAX;
        self.max_level = 0;
    }

    /// True once data was written up to both window bounds.
    pub fn is_full(&self) -> bool {
        self.min_level == 0 && self.max_level == self.size
    }

    /// Copy the overlapping part of a chunk into the window.
    ///
    /// `chunk_frame_position` is the absolute frame position of the first
    /// chunk sample; parts outside the window range are ignored.
    pub fn add_chunk(&mut self, chunk_frame_position: i64, chunk: &[f32]) {
        let start_data = (chunk_frame_position - self.frame_position).max(0) as usize;
        let start_chunk = (self.frame_position - chunk_frame_position).max(0) as usize;
        if start_data >= self.size || start_chunk >= chunk.len() {
            return;
        }

        let num_copy = (self.size - start_data).min(chunk.len() - start_chunk);
        if num_copy > 0 {
            self.data[start_data..start_data + num_copy]
                .copy_from_slice(&chunk[start_chunk..start_chunk + num_copy]);
            self.max_level = self.max_level.max(start_data + num_copy);
            self.min_level = self.min_level.min(start_data);
        }
    }
}

/// Turns a stream of `(frame position, chunk)` pairs into pool-backed,
/// overlapping windows, emitted in non-decreasing frame-position order.
pub struct WindowAssembler {
    window_size: usize,
    sample_rate: u32,
    /// Frame distance between two successive windows.
    step: i64,
    /// Frame position of the next window to open.
    next_window_frame: i64,
    in_flight: Vec<RefCounted<SampleWindow>>,
    pool: MemoryPool<SampleWindow>,
}

impl WindowAssembler {
    /// Create an assembler; fails fast on an invalid overlap or window size.
    pub fn new(window_size: usize, sample_rate: u32, overlap: f32) -> Result<Self> {
        ensure!(window_size > 0, "window size must be positive");
        ensure!(sample_rate > 0, "sample rate must be positive");
        ensure!(
            (0.0..1.0).contains(&overlap),
            "overlap must be within [0, 1), got {overlap}"
        );
        let step = (((1.0 - overlap) * window_size as f32).round() as i64).max(1);
        Ok(Self {
            window_size,
            sample_rate,
            step,
            next_window_frame: 0,
            in_flight: Vec::new(),
            pool: MemoryPool::default(),
        })
    }

    /// Windows start every `step` frames.
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Feed a chunk and append every window completed by it to `out`.
    ///
    /// Windows are emitted in frame order and handed over with their
    /// reference count owned by the caller.
    pub fn push_chunk(
        &mut self,
        frame_position: i64,
        chunk: &[f32],
        out: &mut Vec<RefCounted<SampleWindow>>,
    ) {
        // Open every window that starts within the reach of this chunk.
        while self.next_window_frame <= frame_position + chunk.len() as i64 {
            let window_size = self.window_size;
            let sample_rate = self.sample_rate;
            let frame = self.next_window_frame;
            let window = self.pool.acquire(
                || SampleWindow::new(window_size, sample_rate, frame),
                |w| w.size == window_size && w.sample_rate == sample_rate,
            );
            window.with_mut(|w| w.reset(frame));
            self.in_flight.push(window);
            self.next_window_frame += self.step;
        }

        for window in &self.in_flight {
            window.with_mut(|w| w.add_chunk(frame_position, chunk));
        }

        // Drain completed windows; in-flight windows are ordered by frame
        // position, so draining preserves emission order.
        let mut index = 0;
        while index < self.in_flight.len() {
            let full = self.in_flight[index]
                .with(|w| w.is_full())
                .unwrap_or(false);
            if full {
                out.push(self.in_flight.remove(index));
            } else {
                index += 1;
            }
        }
    }
}

impl Drop for WindowAssembler {
    fn drop(&mut self) {
        for window in self.in_flight.drain(..) {
            window.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_windows(
        assembler: &mut WindowAssembler,
        chunk_size: usize,
        num_chunks: usize,
    ) -> Vec<(i64, Vec<f32>)> {
        let mut out = Vec::new();
        for c in 0..num_chunks {
            let frame = (c * chunk_size) as i64;
            let chunk: Vec<f32> = (0..chunk_size).map(|i| (frame + i as i64) as f32).collect();
            assembler.push_chunk(frame, &chunk, &mut out);
        }
        out.iter()
            .map(|w| {
                let summary = w
                    .with(|w| (w.frame_position, w.data.clone()))
                    .expect("window alive");
                w.release();
                summary
            })
            .collect()
    }

    #[test]
    fn rejects_invalid_overlap() {
        assert!(WindowAssembler::new(64, 44100, 1.0).is_err());
        assert!(WindowAssembler::new(64, 44100, -0.1).is_err());
        assert!(WindowAssembler::new(0, 44100, 0.25).is_err());
    }

    #[test]
    fn window_spacing_follows_overlap() {
        let assembler = WindowAssembler::new(100, 44100, 0.25).unwrap();
        assert_eq!(assembler.step(), 75);
        let assembler = WindowAssembler::new(100, 44100, 0.995).unwrap();
        assert_eq!(assembler.step(), 1);
    }

    #[test]
    fn emits_full_windows_in_order() {
        let mut assembler = WindowAssembler::new(16, 44100, 0.5).unwrap();
        let windows = collect_windows(&mut assembler, 10, 6);

        assert!(windows.len() >= 5);
        for (i, (frame, data)) in windows.iter().enumerate() {
            assert_eq!(*frame, i as i64 * 8);
            // Sample value equals its absolute frame index by construction.
            for (k, value) in data.iter().enumerate() {
                assert_eq!(*value, (*frame + k as i64) as f32);
            }
        }
    }

    #[test]
    fn never_emits_partial_windows() {
        let mut assembler = WindowAssembler::new(32, 44100, 0.0).unwrap();
        let mut out = Vec::new();
        assembler.push_chunk(0, &[0.5; 31], &mut out);
        assert!(out.is_empty());
        assembler.push_chunk(31, &[0.5; 1], &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].with(|w| w.is_full()), Some(true));
        out[0].release();
    }
}

//! Outlier-robust temporal smoothing of the frequency estimate.

/// Circular mean buffer which rejects outliers.
///
/// A value is rejected when it lies outside the plausibility bounds or
/// deviates too far from the current mean. Too many successive rejects clear
/// the buffer, letting it re-lock onto a new sustained value.
struct OutlierRemovingSmoothingBuffer {
    values: Vec<f32>,
    index_zero: usize,
    min_value: f32,
    max_value: f32,
    max_relative_deviation: f32,
    max_num_successive_outliers: usize,
    num_successive_outliers: usize,
    size: usize,
    mean: f32,
}

impl OutlierRemovingSmoothingBuffer {
    fn new(
        max_size: usize,
        min_value: f32,
        max_value: f32,
        max_relative_deviation: f32,
        max_num_successive_outliers: usize,
    ) -> Self {
        Self {
            values: vec![0.0; max_size],
            index_zero: 0,
            min_value,
            max_value,
            max_relative_deviation,
            max_num_successive_outliers,
            num_successive_outliers: 0,
            size: 0,
            mean: 0.0,
        }
    }

    fn clear(&mut self) {
        self.index_zero = 0;
        self.size = 0;
        self.mean = 0.0;
        self.num_successive_outliers = 0;
    }

    /// Append a value; returns false when it was rejected as an outlier.
    fn append(&mut self, value: f32) -> bool {
        if self.values.is_empty() {
            return false;
        }
        if value < self.min_value
            || value > self.max_value
            || self.deviation(value) > self.max_relative_deviation
        {
            self.increment_outlier_count();
            false
        } else {
            self.push_value(value);
            self.num_successive_outliers = 0;
            self.mean = self.compute_mean();
            true
        }
    }

    /// Count a value that was accepted elsewhere (or nowhere) as an outlier
    /// for this buffer.
    fn increment_outlier_count(&mut self) {
        self.num_successive_outliers += 1;
        if self.num_successive_outliers > self.max_num_successive_outliers {
            self.clear();
        }
    }

    fn get(&self, index: usize) -> f32 {
        debug_assert!(index < self.size);
        self.values[(self.index_zero + index) % self.values.len()]
    }

    fn push_value(&mut self, value: f32) {
        let max_size = self.values.len();
        let index = (self.index_zero + self.size) % max_size;
        self.values[index] = value;
        if self.size == max_size {
            self.index_zero = (self.index_zero + 1) % max_size;
        } else {
            self.size += 1;
        }
    }

    fn compute_mean(&self) -> f32 {
        debug_assert!(self.size > 0);
        let mut sum = 0.0;
        for i in 0..self.size {
            sum += self.get(i);
        }
        sum / self.size as f32
    }

    /// Relative deviation from the current mean; 0 for an empty buffer.
    fn deviation(&self, value: f32) -> f32 {
        if self.size == 0 {
            0.0
        } else {
            (value - self.mean).abs() / self.mean.abs()
        }
    }
}

/// Streaming smoother which suppresses transient misdetections while
/// tracking genuine changes with low latency.
///
/// Several mean buffers run in parallel: the first buffer accepting a value
/// takes it, all others count it as an outlier. A buffer that saw too many
/// successive outliers clears itself and is free to lock onto a newly
/// emerging value, while the most-established buffer keeps providing the
/// output.
pub struct OutlierRemovingSmoother {
    buffers: Vec<OutlierRemovingSmoothingBuffer>,
    min_num_values_for_valid_mean: usize,
    smoothed_value: f32,
}

impl OutlierRemovingSmoother {
    pub fn new(
        size: usize,
        min_value: f32,
        max_value: f32,
        relative_deviation_to_be_an_outlier: f32,
        max_num_successive_outliers: usize,
        min_num_values_for_valid_mean: usize,
        num_buffers: usize,
    ) -> Self {
        Self {
            buffers: (0..num_buffers.max(1))
                .map(|_| {
                    OutlierRemovingSmoothingBuffer::new(
                        size,
                        min_value,
                        max_value,
                        relative_deviation_to_be_an_outlier,
                        max_num_successive_outliers,
                    )
                })
                .collect(),
            min_num_values_for_valid_mean: min_num_values_for_valid_mean.min(size),
            smoothed_value: 0.0,
        }
    }

    /// Feed a new value and return the smoothed value, or 0 while no buffer
    /// provides a valid mean.
    pub fn smooth(&mut self, value: f32) -> f32 {
        let mut appended = false;
        for buffer in &mut self.buffers {
            if appended {
                buffer.increment_outlier_count();
            } else {
                appended = buffer.append(value);
            }
        }

        if self.buffers[0].size < self.min_num_values_for_valid_mean {
            self.buffers.sort_by(|a, b| b.size.cmp(&a.size));
        }

        let primary = &self.buffers[0];
        if primary.num_successive_outliers == 0
            && primary.size >= self.min_num_values_for_valid_mean
        {
            self.smoothed_value = primary.mean;
            self.smoothed_value
        } else {
            0.0
        }
    }

    /// Most recent valid smoothed value.
    pub fn smoothed_value(&self) -> f32 {
        self.smoothed_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn smoother(size: usize) -> OutlierRemovingSmoother {
        OutlierRemovingSmoother::new(size, 16.0, 16000.0, 0.1, 1, 2, 3)
    }

    #[test]
    fn steady_input_yields_its_mean() {
        let mut smoother = smoother(5);
        assert_eq!(smoother.smooth(440.0), 0.0); // below the valid-mean size
        for _ in 0..4 {
            assert_relative_eq!(smoother.smooth(440.0), 440.0);
        }
    }

    #[test]
    fn single_outlier_leaves_output_unchanged() {
        let mut smoother = smoother(5);
        for _ in 0..5 {
            smoother.smooth(440.0);
        }
        // 50 % above the mean, clearly outside the 10 % deviation band: the
        // call yields no update and the held value stays untouched.
        assert_eq!(smoother.smooth(660.0), 0.0);
        assert_relative_eq!(smoother.smoothed_value(), 440.0);
        // The next in-range value restores a valid output immediately.
        assert_relative_eq!(smoother.smooth(440.0), 440.0);
    }

    #[test]
    fn sustained_new_value_is_relocked() {
        let mut smoother = smoother(5);
        for _ in 0..5 {
            smoother.smooth(440.0);
        }
        // A genuinely changed pitch: a secondary buffer locks onto it and
        // becomes the primary one once it is better established.
        let mut last = 0.0;
        for _ in 0..8 {
            last = smoother.smooth(880.0);
        }
        assert_relative_eq!(last, 880.0);
    }

    #[test]
    fn out_of_range_values_clear_the_buffer() {
        let mut smoother = OutlierRemovingSmoother::new(4, 16.0, 16000.0, 0.1, 1, 2, 1);
        smoother.smooth(440.0);
        smoother.smooth(440.0);
        assert!(smoother.smooth(440.0) > 0.0);
        // max_num_successive_outliers + 1 rejects clear the buffer.
        assert_eq!(smoother.smooth(5.0), 0.0);
        assert_eq!(smoother.smooth(5.0), 0.0);
        // The buffer restarts from scratch.
        assert_eq!(smoother.smooth(440.0), 0.0);
        assert!(smoother.smooth(440.0) > 0.0);
    }

    #[test]
    fn first_value_is_never_a_deviation_outlier() {
        let mut smoother = OutlierRemovingSmoother::new(3, 16.0, 16000.0, 0.1, 1, 1, 1);
        // An empty buffer has deviation 0, so any in-range value is accepted.
        assert_relative_eq!(smoother.smooth(1234.0), 1234.0);
    }
}

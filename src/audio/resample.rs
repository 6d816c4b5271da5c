//! Channel mixing and sample-rate conversion.
//!
//! Capture devices run at whatever rate and channel count the hardware
//! prefers (commonly 48 kHz stereo); the wire carries mono at
//! `audio.wire_sample_rate`, and the peer track runs at the codec clock
//! (48 kHz Opus or 8 kHz PCMU).  Every stream keeps its own
//! [`StreamResampler`].
//!
//! The resampler is linear interpolation, good enough for speech.

// ---------------------------------------------------------------------------
// downmix
// ---------------------------------------------------------------------------

/// Mix interleaved multi-channel audio down to mono by averaging channels.
///
/// ```rust
/// use voice_call::audio::downmix;
///
/// let mono = downmix(&[0.5, -0.5, 0.2, 0.4], 2);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[1] - 0.3).abs() < 1e-6);
/// ```
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// StreamResampler
// ---------------------------------------------------------------------------

/// Linear resampler for a continuous mono stream delivered in blocks.
///
/// The fractional read position and the previous block's last sample carry
/// over, so cutting a stream into chunks yields the same samples as
/// resampling it whole and the output length never drifts.
///
/// ```rust
/// use voice_call::audio::StreamResampler;
///
/// let mut down = StreamResampler::new(48_000, 16_000);
/// assert_eq!(down.process(&vec![0.5; 480]).len(), 160);
///
/// // 44.1 kHz in 10 ms blocks: 441 samples each, 160 out on average.
/// let mut odd = StreamResampler::new(44_100, 16_000);
/// let total: usize = (0..100).map(|_| odd.process(&vec![0.0; 441]).len()).sum();
/// assert_eq!(total, 16_000);
/// ```
#[derive(Debug, Clone)]
pub struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    /// Source position of the next output sample, relative to the first
    /// sample of the next block.  In `(-1, 0]` it falls between `last` and
    /// that sample.
    position: f64,
    last: Option<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            position: 0.0,
            last: None,
        }
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Resample the next block.  Equal rates return a copy; a zero rate on
    /// either side yields nothing.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.from_rate == self.to_rate {
            return input.to_vec();
        }
        if input.is_empty() || self.from_rate == 0 || self.to_rate == 0 {
            return Vec::new();
        }

        let step = self.from_rate as f64 / self.to_rate as f64;
        let last_index = (input.len() - 1) as f64;
        let expected = ((last_index - self.position) / step).max(0.0) as usize + 1;
        let mut output = Vec::with_capacity(expected);

        while self.position <= last_index {
            let floor = self.position.floor();
            let frac = (self.position - floor) as f32;
            let a = if floor < 0.0 {
                self.last.unwrap_or(input[0])
            } else {
                input[floor as usize]
            };
            let b = input.get((floor + 1.0) as usize).copied().unwrap_or(a);
            output.push(a + (b - a) * frac);
            self.position += step;
        }

        self.position -= input.len() as f64;
        self.last = input.last().copied();
        output
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_two_channels_averages() {
        let out = downmix(&[1.0_f32, -1.0, 0.5, 0.5], 2);
        assert_eq!(out.len(), 2);
        assert!(out[0].abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn downmix_mono_and_zero_channels() {
        assert_eq!(downmix(&[0.1, 0.2], 1), vec![0.1, 0.2]);
        assert!(downmix(&[1.0, 2.0], 0).is_empty());
    }

    fn chunked(resampler: &mut StreamResampler, input: &[f32], block: usize) -> Vec<f32> {
        input
            .chunks(block)
            .flat_map(|chunk| resampler.process(chunk))
            .collect()
    }

    #[test]
    fn equal_rates_are_identity() {
        let input: Vec<f32> = (0..160).map(|i| i as f32 / 160.0).collect();
        assert_eq!(StreamResampler::new(16_000, 16_000).process(&input), input);
    }

    #[test]
    fn capture_rate_to_wire_rate_length() {
        // 20 ms at 48 kHz becomes 20 ms at 16 kHz.
        assert_eq!(StreamResampler::new(48_000, 16_000).process(&[0.0; 960]).len(), 320);
        assert_eq!(StreamResampler::new(48_000, 16_000).process(&[0.0; 12]).len(), 4);
    }

    #[test]
    fn chunked_stream_matches_whole_stream() {
        let input: Vec<f32> = (0..4_410).map(|i| (i as f32 * 0.01).sin()).collect();
        let whole = StreamResampler::new(44_100, 16_000).process(&input);
        let pieces = chunked(&mut StreamResampler::new(44_100, 16_000), &input, 441);

        assert_eq!(whole.len(), pieces.len());
        for (a, b) in whole.iter().zip(&pieces) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn long_calls_do_not_drift() {
        // One minute of 44.1 kHz in odd-sized device buffers.
        let mut resampler = StreamResampler::new(44_100, 16_000);
        let produced: usize = (0..6_000).map(|_| resampler.process(&[0.0; 441]).len()).sum();
        assert_eq!(produced, 960_000);
    }

    #[test]
    fn upsampling_interpolates_across_block_edges() {
        let mut resampler = StreamResampler::new(8_000, 48_000);
        let first = resampler.process(&[0.0; 80]);
        let second = resampler.process(&[1.0; 80]);
        // 160 samples at 8 kHz span 955 output positions.
        assert!((first.len() + second.len()).abs_diff(955) <= 1);
        // The first outputs of the second block ramp from 0 towards 1.
        assert!(second[0] > 0.0 && second[0] < 1.0);
        assert!(second.iter().skip(6).all(|&s| (s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn constant_signal_keeps_amplitude() {
        for &s in &StreamResampler::new(48_000, 16_000).process(&[0.5_f32; 480]) {
            assert!((s - 0.5).abs() < 1e-5, "amplitude drift: {s}");
        }
    }

    #[test]
    fn degenerate_inputs_are_empty() {
        assert!(StreamResampler::new(48_000, 16_000).process(&[]).is_empty());
        assert!(StreamResampler::new(0, 16_000).process(&[0.1]).is_empty());
    }
}

//! Sample rate conversion and level helpers
//!
//! Conforms blocks recorded at a device's native rate to the 48kHz pipeline
//! rate. Uses the rubato crate for band-limited FFT resampling and falls back
//! to linear interpolation if the resampler can't be built or fails.

use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::{Fft, FixedSync, Resampler};
use tracing::debug;

use voxlink_common::voice::{MONO_CHANNELS, VOICE_SAMPLE_RATE, VOICE_SAMPLES_PER_FRAME};

// =============================================================================
// Constants
// =============================================================================

/// Chunk size fed to the FFT resampler (one 20ms block at 48kHz)
const CHUNK_SIZE: usize = VOICE_SAMPLES_PER_FRAME as usize;

/// Number of channels for mono audio
const MONO: usize = MONO_CHANNELS as usize;

/// Number of sub-chunks for FFT resampler (1 = lowest latency)
const RESAMPLER_SUB_CHUNKS: usize = 1;

/// Device rates within this distance of 48kHz are used as-is
pub const RESAMPLE_TOLERANCE_HZ: u32 = 100;

// =============================================================================
// Helpers
// =============================================================================

/// Check if a block recorded at `device_rate` must be resampled
///
/// Rates within [`RESAMPLE_TOLERANCE_HZ`] of the pipeline rate are treated
/// as already conformed.
pub fn needs_resampling(device_rate: u32) -> bool {
    device_rate.abs_diff(VOICE_SAMPLE_RATE) > RESAMPLE_TOLERANCE_HZ
}

/// Number of output samples produced when converting `len` samples
pub fn resampled_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    (len as f64 * to_rate as f64 / from_rate as f64).round() as usize
}

/// Root mean square energy of a block
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Euclidean norm of a block
pub fn l2_norm(samples: &[f32]) -> f32 {
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    sum_squares.sqrt() as f32
}

// =============================================================================
// Normalize
// =============================================================================

/// Apply a volume factor and guard against clipping
///
/// A factor of zero (or below) yields a full-length block of silence.
/// Otherwise every sample is scaled, and if the resulting peak exceeds 1.0
/// the whole block is divided by that peak so relative dynamics are kept.
pub fn normalize(chunk: &[f32], volume_factor: f32) -> Vec<f32> {
    if !(volume_factor > 0.0) {
        return vec![0.0; chunk.len()];
    }

    let mut out: Vec<f32> = chunk.iter().map(|&s| s * volume_factor).collect();
    let peak = out.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
    if peak > 1.0 {
        for sample in &mut out {
            *sample /= peak;
        }
    }
    out
}

// =============================================================================
// Resample
// =============================================================================

/// Convert mono samples from one rate to another
///
/// Returns the input unchanged when the rates match. Otherwise the output has
/// `round(len * to_rate / from_rate)` samples. Never fails: if band-limited
/// resampling is unavailable the linear fallback is used.
///
/// Builds a fresh resampler on every call. Streams converting block after
/// block should hold a [`RateConverter`] instead.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    RateConverter::new().convert(samples, from_rate, to_rate)
}

/// Linear interpolation over `linspace(0, len - 1, out_len)`
pub fn resample_linear(samples: &[f32], out_len: usize) -> Vec<f32> {
    if samples.is_empty() {
        return vec![0.0; out_len];
    }
    if out_len <= 1 || samples.len() == 1 {
        return vec![samples[0]; out_len];
    }

    let last = samples.len() - 1;
    let step = last as f64 / (out_len - 1) as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

// =============================================================================
// Rate Converter
// =============================================================================

/// Block-by-block resampling that reuses one rubato instance per rate pair
///
/// Each block is still converted independently with the same length contract
/// as [`resample`]; only the FFT plan and work buffers are kept. A block at a
/// new rate pair replaces the cached resampler.
#[derive(Default)]
pub struct RateConverter {
    cached: Option<BlockResampler>,
}

impl std::fmt::Debug for RateConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateConverter")
            .field("cached_rates", &self.cached_rates())
            .finish()
    }
}

impl RateConverter {
    /// Create a converter with nothing cached
    pub fn new() -> Self {
        Self::default()
    }

    /// Rate pair of the cached resampler, if any
    pub fn cached_rates(&self) -> Option<(u32, u32)> {
        self.cached.as_ref().map(|r| (r.from_rate, r.to_rate))
    }

    /// Convert one block; see [`resample`] for the contract
    pub fn convert(&mut self, samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
        if from_rate == to_rate || samples.is_empty() {
            return samples.to_vec();
        }
        if from_rate == 0 || to_rate == 0 {
            debug!(from_rate, to_rate, "invalid sample rate, passing block through");
            return samples.to_vec();
        }

        let out_len = resampled_len(samples.len(), from_rate, to_rate);
        match self.band_limited(samples, from_rate, to_rate, out_len) {
            Ok(out) => out,
            Err(e) => {
                debug!("band-limited resampling failed, using linear: {}", e);
                self.cached = None;
                resample_linear(samples, out_len)
            }
        }
    }

    fn band_limited(
        &mut self,
        samples: &[f32],
        from_rate: u32,
        to_rate: u32,
        out_len: usize,
    ) -> Result<Vec<f32>, String> {
        let reusable = self
            .cached
            .as_ref()
            .is_some_and(|r| r.from_rate == from_rate && r.to_rate == to_rate);
        if !reusable {
            self.cached = Some(BlockResampler::new(from_rate, to_rate)?);
        }
        match self.cached.as_mut() {
            Some(resampler) => resampler.process(samples, out_len),
            None => Err("resampler missing".to_string()),
        }
    }
}

/// FFT resampler plus work buffers for one rate pair
struct BlockResampler {
    from_rate: u32,
    to_rate: u32,
    resampler: Fft<f32>,
    work_in: Vec<Vec<f32>>,
    work_out: Vec<Vec<f32>>,
}

impl BlockResampler {
    fn new(from_rate: u32, to_rate: u32) -> Result<Self, String> {
        let resampler = Fft::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            CHUNK_SIZE,
            RESAMPLER_SUB_CHUNKS,
            MONO,
            FixedSync::Input,
        )
        .map_err(|e| format!("Failed to create resampler: {}", e))?;

        let input_frames_max = resampler.input_frames_max();
        let output_frames_max = resampler.output_frames_max();

        Ok(Self {
            from_rate,
            to_rate,
            resampler,
            work_in: vec![vec![0.0; input_frames_max]],
            work_out: vec![vec![0.0; output_frames_max]],
        })
    }

    /// Resample a whole block from a clean state
    ///
    /// Feeds zero-padded fixed-size chunks through rubato, drops the
    /// resampler's startup delay, and returns exactly `out_len` samples.
    fn process(&mut self, samples: &[f32], out_len: usize) -> Result<Vec<f32>, String> {
        self.resampler.reset();

        let delay = self.resampler.output_delay();
        let wanted = delay + out_len;
        let mut output: Vec<f32> = Vec::with_capacity(wanted);
        let mut consumed = 0usize;

        // Enough rounds to push all input plus the delay tail through
        let max_rounds = (samples.len() + delay) / self.resampler.input_frames_next().max(1) + 4;

        for _ in 0..max_rounds {
            if output.len() >= wanted {
                break;
            }

            let frames_needed = self.resampler.input_frames_next();
            let available = samples.len().saturating_sub(consumed).min(frames_needed);
            self.work_in[0][..available].copy_from_slice(&samples[consumed..consumed + available]);
            self.work_in[0][available..frames_needed].fill(0.0);
            consumed += available;

            let input_adapter = SequentialSliceOfVecs::new(&self.work_in[..], MONO, frames_needed)
                .map_err(|e| format!("Input adapter error: {}", e))?;

            let output_frames = self.resampler.output_frames_next();
            let mut output_adapter =
                SequentialSliceOfVecs::new_mut(&mut self.work_out[..], MONO, output_frames)
                    .map_err(|e| format!("Output adapter error: {}", e))?;

            let (_, frames_written) = self
                .resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, None)
                .map_err(|e| format!("Resampler error: {}", e))?;

            output.extend_from_slice(&self.work_out[0][..frames_written]);
        }

        if output.len() < wanted {
            return Err(format!(
                "resampler produced {} of {} frames",
                output.len(),
                wanted
            ));
        }

        Ok(output[delay..wanted].to_vec())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = i as f32 / rate as f32;
                amplitude * (2.0 * std::f32::consts::PI * freq * t).sin()
            })
            .collect()
    }

    #[test]
    fn test_needs_resampling() {
        assert!(!needs_resampling(48000));
        assert!(!needs_resampling(48050));
        assert!(!needs_resampling(47900));
        assert!(needs_resampling(44100));
        assert!(needs_resampling(16000));
        assert!(needs_resampling(96000));
    }

    #[test]
    fn test_normalize_zero_volume_is_silence() {
        let chunk = vec![0.5, -0.25, 0.9, -1.0];
        let out = normalize(&chunk, 0.0);
        assert_eq!(out, vec![0.0; 4]);

        let out = normalize(&chunk, -0.5);
        assert_eq!(out.len(), chunk.len());
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_normalize_unity_leaves_quiet_audio_alone() {
        let chunk = vec![0.1, -0.2, 0.3];
        assert_eq!(normalize(&chunk, 1.0), chunk);
    }

    #[test]
    fn test_normalize_scales() {
        let out = normalize(&[0.1, -0.2], 2.0);
        assert!((out[0] - 0.2).abs() < 1e-6);
        assert!((out[1] + 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_peak_guard() {
        let chunk = vec![0.5, -0.8, 0.25];
        let out = normalize(&chunk, 4.0);
        let peak = out.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= 1.0 + 1e-6);
        // Loudest sample lands on the rail, ratios preserved
        assert!((out[1] + 1.0).abs() < 1e-6);
        assert!((out[0] / out[2] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_normalize_never_exceeds_unity() {
        for volume in [0.1f32, 1.0, 1.5, 3.0, 10.0] {
            let chunk = sine(440.0, 48000, 960, 0.9);
            let out = normalize(&chunk, volume);
            assert!(out.iter().all(|s| s.abs() <= 1.0 + 1e-6));
        }
    }

    #[test]
    fn test_resample_identity() {
        let chunk = sine(300.0, 48000, 960, 0.5);
        assert_eq!(resample(&chunk, 48000, 48000), chunk);
    }

    #[test]
    fn test_resample_output_lengths() {
        let cases = [
            (882usize, 44100u32, 48000u32),
            (320, 16000, 48000),
            (960, 48000, 16000),
            (960, 48000, 44100),
            (1001, 44100, 48000),
            (441, 22050, 48000),
        ];
        for (len, from, to) in cases {
            let chunk = sine(200.0, from, len, 0.4);
            let out = resample(&chunk, from, to);
            let expected = (len as f64 * to as f64 / from as f64).round() as usize;
            assert_eq!(out.len(), expected, "{} -> {} with {} samples", from, to, len);
        }
    }

    #[test]
    fn test_resample_preserves_level() {
        let chunk = sine(440.0, 44100, 4410, 0.5);
        let out = resample(&chunk, 44100, 48000);
        // Skip edges where padding and filter ramps distort the signal
        let middle = &out[out.len() / 4..out.len() * 3 / 4];
        let level = rms(middle);
        assert!((level - 0.5 / 2f32.sqrt()).abs() < 0.05, "rms {}", level);
    }

    #[test]
    fn test_resample_linear_endpoints() {
        let samples = vec![0.0, 1.0, 0.0, -1.0];
        let out = resample_linear(&samples, 7);
        assert_eq!(out.len(), 7);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[6], -1.0);
        // Midpoint between samples 0 and 1
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_resample_linear_constant() {
        let out = resample_linear(&[0.25; 10], 23);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_resample_linear_degenerate() {
        assert_eq!(resample_linear(&[0.7], 3), vec![0.7; 3]);
        assert_eq!(resample_linear(&[], 2), vec![0.0; 2]);
        assert!(resample_linear(&[0.1, 0.2], 0).is_empty());
    }

    #[test]
    fn test_converter_reuses_resampler_per_rate_pair() {
        let mut converter = RateConverter::new();
        assert_eq!(converter.cached_rates(), None);

        let block = sine(440.0, 44100, 882, 0.5);
        let first = converter.convert(&block, 44100, 48000);
        assert_eq!(converter.cached_rates(), Some((44100, 48000)));
        let second = converter.convert(&block, 44100, 48000);

        // Blocks are independent: same input, same output, and the same as one-shot
        assert_eq!(first.len(), 960);
        assert_eq!(first, second);
        assert_eq!(first, resample(&block, 44100, 48000));
    }

    #[test]
    fn test_converter_switches_rate_pair() {
        let mut converter = RateConverter::new();
        converter.convert(&sine(440.0, 44100, 882, 0.5), 44100, 48000);

        let out = converter.convert(&sine(440.0, 16000, 320, 0.5), 16000, 48000);
        assert_eq!(out.len(), 960);
        assert_eq!(converter.cached_rates(), Some((16000, 48000)));

        // Identity never touches the cache
        let same = converter.convert(&[0.1, 0.2], 48000, 48000);
        assert_eq!(same, vec![0.1, 0.2]);
        assert_eq!(converter.cached_rates(), Some((16000, 48000)));
    }

    #[test]
    fn test_rms_and_norm() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5; 100]) - 0.5).abs() < 1e-6);
        assert!((l2_norm(&[3.0, 4.0]) - 5.0).abs() < 1e-6);
    }
}

//! Voice audio format and wire value types
//!
//! All audio crossing a component boundary is raw 32-bit float PCM at
//! 48kHz mono. Chunks that arrive in another format are tagged with their
//! actual rate so the receiving side can conform them.

use serde::{Deserialize, Serialize};

use crate::UserId;

// =============================================================================
// Constants
// =============================================================================

/// Sample rate for voice audio (48kHz)
pub const VOICE_SAMPLE_RATE: u32 = 48000;

/// Frame duration in milliseconds (20ms blocks)
pub const VOICE_FRAME_DURATION_MS: u32 = 20;

/// Number of samples per block at 48kHz with 20ms blocks
pub const VOICE_SAMPLES_PER_FRAME: u32 = VOICE_SAMPLE_RATE * VOICE_FRAME_DURATION_MS / 1000;

/// Number of audio channels (mono)
pub const VOICE_CHANNELS: u16 = 1;

/// Mono channel count
pub const MONO_CHANNELS: u16 = 1;

/// Stereo channel count
pub const STEREO_CHANNELS: u16 = 2;

/// RMS energy above which a block counts as speech
pub const VAD_RMS_THRESHOLD: f32 = 0.02;

/// Milliseconds a remote speaker stays highlighted after the last activity
pub const VOICE_ACTIVITY_TIMEOUT_MS: u64 = 1000;

// =============================================================================
// Sample Type
// =============================================================================

/// Sample representation tag carried with every voice chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleType {
    /// 32-bit float normalized to [-1.0, 1.0]
    #[default]
    #[serde(rename = "float32")]
    Float32,
}

impl SampleType {
    /// Wire name of the sample type
    pub fn as_str(self) -> &'static str {
        match self {
            SampleType::Float32 => "float32",
        }
    }
}

impl std::fmt::Display for SampleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Audio Format
// =============================================================================

/// Fixed audio format for the voice pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples per second
    pub sample_rate_hz: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Sample representation
    pub sample_type: SampleType,
    /// Frames per processing block
    pub block_size_frames: usize,
}

impl AudioFormat {
    /// The only format used inside the pipeline: 48kHz mono f32, 20ms blocks
    pub const STANDARD: AudioFormat = AudioFormat {
        sample_rate_hz: VOICE_SAMPLE_RATE,
        channels: VOICE_CHANNELS,
        sample_type: SampleType::Float32,
        block_size_frames: VOICE_SAMPLES_PER_FRAME as usize,
    };

    /// Duration of one block
    pub fn block_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(
            self.block_size_frames as f64 / self.sample_rate_hz as f64,
        )
    }

    /// Number of frames in a block of the same duration at another rate
    pub fn block_frames_at(&self, sample_rate_hz: u32) -> usize {
        (self.block_size_frames as u64 * sample_rate_hz as u64 / self.sample_rate_hz as u64)
            as usize
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::STANDARD
    }
}

// =============================================================================
// Voice Chunk
// =============================================================================

/// A block of raw voice samples with its format tags
///
/// No compression is applied; `samples` is mono PCM at `sample_rate_hz`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceChunk {
    /// Samples normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Sample rate the samples were recorded at
    pub sample_rate_hz: u32,
    /// Channel count
    pub channels: u16,
    /// Sample representation
    #[serde(default)]
    pub dtype: SampleType,
}

impl VoiceChunk {
    /// Create a chunk in the standard format
    pub fn new(samples: Vec<f32>) -> Self {
        Self::with_rate(samples, VOICE_SAMPLE_RATE)
    }

    /// Create a mono float chunk at an explicit sample rate
    pub fn with_rate(samples: Vec<f32>, sample_rate_hz: u32) -> Self {
        Self {
            samples,
            sample_rate_hz,
            channels: VOICE_CHANNELS,
            dtype: SampleType::Float32,
        }
    }

    /// Number of frames in the chunk
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

// =============================================================================
// Roster
// =============================================================================

/// A user reported present in a voice channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// User identifier
    pub user_id: UserId,
    /// Display name
    pub username: String,
}

impl RosterEntry {
    /// Create a roster entry
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_format() {
        let format = AudioFormat::STANDARD;
        assert_eq!(format.sample_rate_hz, 48000);
        assert_eq!(format.channels, 1);
        assert_eq!(format.block_size_frames, 960);
        assert_eq!(format.sample_type, SampleType::Float32);
    }

    #[test]
    fn test_block_duration_is_20ms() {
        assert_eq!(
            AudioFormat::STANDARD.block_duration(),
            std::time::Duration::from_millis(20)
        );
    }

    #[test]
    fn test_block_frames_at_other_rates() {
        let format = AudioFormat::STANDARD;
        assert_eq!(format.block_frames_at(48000), 960);
        assert_eq!(format.block_frames_at(44100), 882);
        assert_eq!(format.block_frames_at(16000), 320);
    }

    #[test]
    fn test_voice_chunk_defaults_to_standard_format() {
        let chunk = VoiceChunk::new(vec![0.0; 960]);
        assert_eq!(chunk.sample_rate_hz, VOICE_SAMPLE_RATE);
        assert_eq!(chunk.channels, 1);
        assert_eq!(chunk.dtype, SampleType::Float32);
        assert_eq!(chunk.frames(), 960);
    }

    #[test]
    fn test_voice_chunk_dtype_wire_name() {
        let chunk = VoiceChunk::new(vec![0.5]);
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains("\"dtype\":\"float32\""));
    }

    #[test]
    fn test_voice_chunk_missing_dtype_defaults() {
        let json = r#"{"samples":[0.1,0.2],"sample_rate_hz":44100,"channels":1}"#;
        let chunk: VoiceChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.dtype, SampleType::Float32);
        assert_eq!(chunk.sample_rate_hz, 44100);
    }
}

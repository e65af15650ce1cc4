//! Application-wide constants
//!
//! Shared constants used across multiple modules.

use std::time::Duration;

/// Application directory name (used in config directory path)
pub const APP_DIR_NAME: &str = "voxlink";

/// Config file name
pub const CONFIG_FILE_NAME: &str = "config.json";

/// How long a stop waits for an audio thread before abandoning it
pub const AUDIO_THREAD_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a start waits for an audio thread to open its device
pub const AUDIO_THREAD_START_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll interval of the capture, playback and mic test threads
pub const AUDIO_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Input volume restored when unmuting with the fader at zero
pub const DEFAULT_UNMUTE_VOLUME: f32 = 0.8;

/// Default input volume (unity gain)
pub const DEFAULT_INPUT_VOLUME: f32 = 1.0;

/// Maximum number of chunks waiting in the playback FIFO
pub const PLAYBACK_QUEUE_CAPACITY: usize = 20;

/// Topic prefix while a voice channel is joined
pub const TOPIC_PREFIX_VOICE: &str = "Voice";

/// Topic prefix while a voice channel is only previewed
pub const TOPIC_PREFIX_PREVIEW: &str = "Preview";

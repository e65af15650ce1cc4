//! Audio settings for voice chat
//!
//! Saved device selection and input volume, plus the store the session reads
//! them from when picking devices.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::{APP_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_INPUT_VOLUME};
use crate::error::ConfigError;
use crate::voice::audio::AudioDevice;

// =============================================================================
// Constants
// =============================================================================

/// System default device identifier
pub const SYSTEM_DEFAULT_DEVICE: &str = "";

// =============================================================================
// Audio Settings
// =============================================================================

/// Audio settings for voice chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Output device id (empty string = system default)
    #[serde(default)]
    pub output_device: String,

    /// Input device id (empty string = system default)
    #[serde(default)]
    pub input_device: String,

    /// Input gain in [0, 1]
    #[serde(default = "default_input_volume")]
    pub input_volume: f32,
}

fn default_input_volume() -> f32 {
    DEFAULT_INPUT_VOLUME
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            output_device: SYSTEM_DEFAULT_DEVICE.to_string(),
            input_device: SYSTEM_DEFAULT_DEVICE.to_string(),
            input_volume: DEFAULT_INPUT_VOLUME,
        }
    }
}

impl AudioSettings {
    /// Saved input volume clamped to [0, 1]; invalid values fall back to the default
    pub fn volume(&self) -> f32 {
        if self.input_volume.is_finite() {
            self.input_volume.clamp(0.0, 1.0)
        } else {
            DEFAULT_INPUT_VOLUME
        }
    }

    /// Saved input id, `None` for the system default
    pub fn input_id(&self) -> Option<&str> {
        non_default(&self.input_device)
    }

    /// Saved output id, `None` for the system default
    pub fn output_id(&self) -> Option<&str> {
        non_default(&self.output_device)
    }
}

fn non_default(id: &str) -> Option<&str> {
    if id == SYSTEM_DEFAULT_DEVICE {
        None
    } else {
        Some(id)
    }
}

/// Pick a device: the saved one if still present, else the default, else the first
pub fn resolve_device(saved: Option<&str>, devices: &[AudioDevice]) -> Option<String> {
    saved
        .and_then(|id| devices.iter().find(|d| d.id == id))
        .or_else(|| devices.iter().find(|d| d.is_default))
        .or_else(|| devices.first())
        .map(|d| d.id.clone())
}

// =============================================================================
// Config Store
// =============================================================================

/// Where the session reads and saves device selection and input volume
pub trait ConfigStore: Send + Sync {
    /// Saved `(input, output)` device ids
    fn saved_device_ids(&self) -> (Option<String>, Option<String>);

    /// Save the selected device ids
    fn save_device_ids(&self, input: Option<&str>, output: Option<&str>)
    -> Result<(), ConfigError>;

    /// Saved input fader position in [0, 1]
    fn saved_input_volume(&self) -> f32;

    /// Save the input fader position
    fn save_input_volume(&self, volume: f32) -> Result<(), ConfigError>;
}

/// On-disk config file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    audio: AudioSettings,
}

/// [`ConfigStore`] backed by a pretty-printed JSON file
#[derive(Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl JsonConfigStore {
    /// Store at an explicit path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at the platform config location
    pub fn open_default() -> Result<Self, ConfigError> {
        Self::default_path()
            .map(Self::new)
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the platform-specific config file path
    ///
    /// Returns None if the config directory cannot be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load audio settings, or defaults if the file is missing or invalid
    pub fn load(&self) -> AudioSettings {
        self.load_file().audio
    }

    /// Save audio settings, creating the config directory if needed
    pub fn save(&self, settings: &AudioSettings) -> Result<(), ConfigError> {
        let _guard = self.lock.lock();
        let mut file = self.load_file();
        file.audio = settings.clone();
        self.write_file(&file)
    }

    fn load_file(&self) -> ConfigFile {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(_) => return ConfigFile::default(),
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), "Ignoring invalid config: {}", e);
            ConfigFile::default()
        })
    }

    fn write_file(&self, file: &ConfigFile) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(file)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

impl ConfigStore for JsonConfigStore {
    fn saved_device_ids(&self) -> (Option<String>, Option<String>) {
        let settings = self.load();
        (
            settings.input_id().map(str::to_string),
            settings.output_id().map(str::to_string),
        )
    }

    fn save_device_ids(
        &self,
        input: Option<&str>,
        output: Option<&str>,
    ) -> Result<(), ConfigError> {
        let _guard = self.lock.lock();
        let mut file = self.load_file();
        file.audio.input_device = input.unwrap_or(SYSTEM_DEFAULT_DEVICE).to_string();
        file.audio.output_device = output.unwrap_or(SYSTEM_DEFAULT_DEVICE).to_string();
        self.write_file(&file)
    }

    fn saved_input_volume(&self) -> f32 {
        self.load().volume()
    }

    fn save_input_volume(&self, volume: f32) -> Result<(), ConfigError> {
        let _guard = self.lock.lock();
        let mut file = self.load_file();
        file.audio.input_volume = volume;
        self.write_file(&file)
    }
}

// =============================================================================
// Tests
// =============================================================================

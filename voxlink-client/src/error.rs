//! Error types for the voice client

use std::time::Duration;

use thiserror::Error;

/// Errors from audio devices and the threads that drive them
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VoiceError {
    /// Opening or starting a device stream failed
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A running stream reported an error
    #[error("audio stream error: {0}")]
    StreamRuntime(String),

    /// The OS refused to spawn an audio thread
    #[error("failed to spawn audio thread: {0}")]
    ThreadSpawn(String),

    /// An audio thread did not exit within the stop bound
    #[error("audio thread did not stop within {0:?}")]
    ThreadJoinTimeout(Duration),

    /// An operation needs an input device but none is selected
    #[error("no input device selected")]
    NoInputDevice,
}

/// Errors from the network transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Not connected
    #[error("transport unavailable")]
    Unavailable,

    /// The transport rejected the event
    #[error("failed to send: {0}")]
    Send(String),
}

/// Errors loading or saving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined
    #[error("could not determine config directory")]
    NoConfigDir,

    /// Reading or writing the config file failed
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The config could not be (de)serialized
    #[error("config serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

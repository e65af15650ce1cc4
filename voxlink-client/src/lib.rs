//! Voxlink voice client core
//!
//! Captures microphone audio, gates it with an RMS voice activity detector,
//! streams raw float chunks to a transport, and plays back audio from remote
//! speakers through a single output device. Channel membership, mute state
//! and per-speaker activity indicators are coordinated by
//! [`session::SessionCoordinator`].

pub mod config;
pub mod constants;
pub mod error;
pub mod session;
pub mod transport;
pub mod voice;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ConfigError, TransportError, VoiceError};
pub use session::{SessionCoordinator, SessionEvent, SessionPorts};

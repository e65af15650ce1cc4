//! Configuration persistence
//!
//! Settings live in `config.json` under the platform config directory.

pub mod audio;

pub use audio::{AudioSettings, ConfigStore, JsonConfigStore, resolve_device};

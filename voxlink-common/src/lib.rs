//! Voxlink Common Library
//!
//! Shared audio format constants and voice-channel value types used by the
//! Voxlink voice client and the network layer that feeds it.

pub mod voice;

/// Identifier of a user on the voice server
pub type UserId = u64;

/// Identifier of a voice channel
pub type ChannelId = u64;

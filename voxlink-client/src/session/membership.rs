//! Voice channel membership and mute state

use voxlink_common::ChannelId;

use crate::constants::DEFAULT_INPUT_VOLUME;

// =============================================================================
// Membership
// =============================================================================

/// Which voice channel the user is looking at or talking in
///
/// Active always implies the same channel is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceChannelMembership {
    /// No voice channel shown
    #[default]
    NoChannel,
    /// Roster shown, no audio flowing
    Previewing(ChannelId),
    /// Joined; audio flowing both ways
    Active(ChannelId),
}

impl VoiceChannelMembership {
    /// The shown channel, previewed or joined
    pub fn channel_id(self) -> Option<ChannelId> {
        match self {
            Self::NoChannel => None,
            Self::Previewing(id) | Self::Active(id) => Some(id),
        }
    }

    /// The joined channel, if any
    pub fn active_channel(self) -> Option<ChannelId> {
        match self {
            Self::Active(id) => Some(id),
            _ => None,
        }
    }

    /// Whether audio is flowing
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// Whether `channel` is the shown channel
    pub fn shows(self, channel: ChannelId) -> bool {
        self.channel_id() == Some(channel)
    }
}

// =============================================================================
// Mute State
// =============================================================================

/// Inputs to the logical mute
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MuteState {
    /// Mute button
    pub manual_muted: bool,
    /// Input fader in [0, 1]
    pub input_volume: f32,
}

impl MuteState {
    /// Manual mute OR the fader at zero
    pub fn is_logically_muted(&self) -> bool {
        self.manual_muted || self.input_volume <= 0.0
    }
}

impl Default for MuteState {
    fn default() -> Self {
        Self {
            manual_muted: false,
            input_volume: DEFAULT_INPUT_VOLUME,
        }
    }
}

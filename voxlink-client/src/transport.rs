//! Ports to the collaborators around the voice core
//!
//! The network client, the UI and the error toast layer are external. The
//! core talks to them only through these traits.

use async_trait::async_trait;

use voxlink_common::ChannelId;
use voxlink_common::voice::VoiceChunk;

use crate::error::TransportError;
use crate::voice::activity::RemoteSpeakerState;

// =============================================================================
// Transport
// =============================================================================

/// Outbound side of the persistent event channel to the voice server
///
/// Every call is best-effort. Callers log failures and move on; nothing is
/// queued for retry.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Join a voice channel on the server
    async fn join_voice_channel(&self, channel: ChannelId) -> Result<(), TransportError>;

    /// Leave a voice channel on the server
    async fn leave_voice_channel(&self, channel: ChannelId) -> Result<(), TransportError>;

    /// Report the local VAD state (true = unmuted and speaking)
    async fn send_speaking_status(
        &self,
        channel: ChannelId,
        speaking: bool,
    ) -> Result<(), TransportError>;

    /// Report the local microphone state (true = unmuted)
    async fn send_mic_status(
        &self,
        channel: ChannelId,
        is_unmuted: bool,
    ) -> Result<(), TransportError>;

    /// Send one block of raw voice samples
    async fn send_voice_chunk(
        &self,
        channel: ChannelId,
        chunk: VoiceChunk,
    ) -> Result<(), TransportError>;
}

// =============================================================================
// Observer
// =============================================================================

/// UI-facing notifications from the session coordinator
///
/// All methods default to doing nothing.
pub trait SessionObserver: Send + Sync {
    /// The displayed roster changed (membership or speaking highlights)
    fn roster_changed(&self, _roster: &[RemoteSpeakerState]) {}

    /// The channel topic label changed; `None` when no voice channel is shown
    fn topic_changed(&self, _topic: Option<&str>) {}

    /// A short status line for the user
    fn status_message(&self, _message: &str) {}

    /// The logical mute state changed
    fn mute_changed(&self, _muted: bool) {}

    /// The voice view closed; the UI should fall back to a text channel
    fn voice_view_closed(&self) {}
}

// =============================================================================
// Error Reporter
// =============================================================================

/// Fire-and-forget sink for user-visible errors
pub trait ErrorReporter: Send + Sync {
    /// Show an error; `context` names the subsystem that failed
    fn report_error(&self, context: &str, message: &str);
}

/// Reporter that writes errors to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report_error(&self, context: &str, message: &str) {
        tracing::error!(context, "{}", message);
    }
}

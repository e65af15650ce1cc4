//! Voice session coordinator
//!
//! Orchestrates channel preview/join/leave, mute logic, and the lifecycles of
//! the capture and playback engines. All state is owned by one
//! [`SessionCoordinator`] and mutated from a single async context; the audio
//! threads only talk to it through channels.

pub mod membership;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use voxlink_common::voice::{RosterEntry, VoiceChunk};
use voxlink_common::{ChannelId, UserId};

use crate::config::{ConfigStore, resolve_device};
use crate::constants::{DEFAULT_UNMUTE_VOLUME, TOPIC_PREFIX_PREVIEW, TOPIC_PREFIX_VOICE};
use crate::error::TransportError;
use crate::transport::{ErrorReporter, SessionObserver, VoiceTransport};
use crate::voice::activity::{
    ActivityExpiry, RemoteSpeakerState, VOICE_ACTIVITY_TIMEOUT, VoiceActivityTracker,
};
use crate::voice::audio::AudioBackend;
use crate::voice::capture::{CaptureEngine, CaptureEvent, CaptureState};
use crate::voice::playback::{PlaybackEngine, PlaybackState};

pub use membership::{MuteState, VoiceChannelMembership};

/// Error reporter context for voice session failures
const VOICE_ERROR_CONTEXT: &str = "voice";

// =============================================================================
// Collaborators
// =============================================================================

/// External collaborators the coordinator talks to
#[derive(Clone)]
pub struct SessionPorts {
    /// Outbound network events
    pub transport: Arc<dyn VoiceTransport>,
    /// UI notifications
    pub observer: Arc<dyn SessionObserver>,
    /// User-visible errors
    pub reporter: Arc<dyn ErrorReporter>,
    /// Saved device selection
    pub config: Arc<dyn ConfigStore>,
}

/// Devices used when joining a channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelection {
    /// Input device id; `None` means voice-receive-only
    pub input: Option<String>,
    /// Output device id; `None` means the system default
    pub output: Option<String>,
}

impl DeviceSelection {
    /// Apply saved ids against the devices currently present
    pub fn resolve(backend: &dyn AudioBackend, config: &dyn ConfigStore) -> Self {
        let (saved_input, saved_output) = config.saved_device_ids();
        Self {
            input: resolve_device(saved_input.as_deref(), &backend.list_input_devices()),
            output: resolve_device(saved_output.as_deref(), &backend.list_output_devices()),
        }
    }
}

// =============================================================================
// Session Events
// =============================================================================

/// Inputs to [`SessionCoordinator::run`] from the UI and network client
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// User selected a voice channel
    SelectChannel { channel: ChannelId, name: String },
    /// User confirmed joining the previewed channel
    ConfirmJoin,
    /// User left voice but keeps viewing the channel
    LeaveVoice,
    /// User closed the voice view
    LeavePreview,
    /// Set the mute button
    SetManualMute(bool),
    /// Flip the mute button
    ToggleMute,
    /// Move the input fader
    SetInputVolume(f32),
    /// Pick new devices
    SelectDevices {
        input: Option<String>,
        output: Option<String>,
    },
    /// Full roster of a channel
    RosterSnapshot {
        channel: ChannelId,
        entries: Vec<RosterEntry>,
    },
    /// A user joined a channel
    UserJoined {
        channel: ChannelId,
        entry: RosterEntry,
    },
    /// A user left a channel
    UserLeft { channel: ChannelId, user_id: UserId },
    /// A user's microphone state changed
    MicStatus {
        channel: ChannelId,
        user_id: UserId,
        is_unmuted: bool,
    },
    /// A user's speaking state changed
    VoiceActivity { user_id: UserId, active: bool },
    /// Audio from a user
    VoiceChunk { from: UserId, chunk: VoiceChunk },
    /// Logout or app exit
    Shutdown,
}

/// What woke the run loop
enum Wakeup {
    External(SessionEvent),
    Capture(CaptureEvent),
    Expiry(ActivityExpiry),
    Closed,
}

// =============================================================================
// Session Coordinator
// =============================================================================

/// Owns all voice session state
pub struct SessionCoordinator {
    local_user_id: UserId,
    membership: VoiceChannelMembership,
    /// Display name of the shown channel
    channel_name: String,
    mute: MuteState,
    devices: DeviceSelection,
    backend: Arc<dyn AudioBackend>,
    capture: CaptureEngine,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    playback: PlaybackEngine,
    activity: VoiceActivityTracker,
    expiry_rx: mpsc::UnboundedReceiver<ActivityExpiry>,
    ports: SessionPorts,
}

impl SessionCoordinator {
    /// Create a coordinator with no channel shown
    ///
    /// Devices are resolved from the config store and the backend's current
    /// device lists. Must be called inside a tokio runtime.
    pub fn new(local_user_id: UserId, backend: Arc<dyn AudioBackend>, ports: SessionPorts) -> Self {
        Self::with_activity_timeout(local_user_id, backend, ports, VOICE_ACTIVITY_TIMEOUT)
    }

    /// Create a coordinator with a custom speaking-indicator timeout
    pub fn with_activity_timeout(
        local_user_id: UserId,
        backend: Arc<dyn AudioBackend>,
        ports: SessionPorts,
        activity_timeout: Duration,
    ) -> Self {
        let devices = DeviceSelection::resolve(backend.as_ref(), ports.config.as_ref());
        let mute = MuteState {
            input_volume: clamp_volume(ports.config.saved_input_volume()),
            ..MuteState::default()
        };
        let (capture, capture_rx) = CaptureEngine::new(backend.clone());
        capture.controls().set_volume(mute.input_volume);
        let playback = PlaybackEngine::new(backend.clone(), ports.reporter.clone());
        let (activity, expiry_rx) = VoiceActivityTracker::new(activity_timeout);

        Self {
            local_user_id,
            membership: VoiceChannelMembership::NoChannel,
            channel_name: String::new(),
            mute,
            devices,
            backend,
            capture,
            capture_rx,
            playback,
            activity,
            expiry_rx,
            ports,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Current membership
    pub fn membership(&self) -> VoiceChannelMembership {
        self.membership
    }

    /// Mute inputs
    pub fn mute_state(&self) -> MuteState {
        self.mute
    }

    /// Manual mute OR fader at zero
    pub fn is_logically_muted(&self) -> bool {
        self.mute.is_logically_muted()
    }

    /// Devices used on join
    pub fn devices(&self) -> &DeviceSelection {
        &self.devices
    }

    /// Capture engine state
    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    /// Playback engine state
    pub fn playback_state(&self) -> PlaybackState {
        self.playback.state()
    }

    /// Displayed roster, sorted by name
    pub fn roster(&self) -> Vec<RemoteSpeakerState> {
        self.activity.snapshot()
    }

    /// State of one roster member
    pub fn speaker(&self, user_id: UserId) -> Option<&RemoteSpeakerState> {
        self.activity.get(user_id)
    }

    /// Topic label for the shown channel
    pub fn topic(&self) -> Option<String> {
        let prefix = match self.membership {
            VoiceChannelMembership::NoChannel => return None,
            VoiceChannelMembership::Previewing(_) => TOPIC_PREFIX_PREVIEW,
            VoiceChannelMembership::Active(_) => TOPIC_PREFIX_VOICE,
        };
        Some(format!("{}: {}", prefix, self.channel_name))
    }

    // -------------------------------------------------------------------------
    // Channel Transitions
    // -------------------------------------------------------------------------

    /// Show a voice channel's roster
    ///
    /// Re-selecting the shown channel only refreshes the UI. Selecting another
    /// channel while joined leaves the joined one first.
    pub async fn select_voice_channel(&mut self, channel: ChannelId, name: &str) {
        match self.membership {
            VoiceChannelMembership::Previewing(current) | VoiceChannelMembership::Active(current)
                if current == channel =>
            {
                self.notify_roster();
                return;
            }
            VoiceChannelMembership::Active(_) => self.leave_voice().await,
            _ => {}
        }

        self.activity.clear();
        self.membership = VoiceChannelMembership::Previewing(channel);
        self.channel_name = name.to_string();
        debug!(channel, "previewing voice channel");
        self.notify_topic();
        self.notify_roster();
    }

    /// Join the previewed channel and start audio
    ///
    /// Without an input device the session proceeds receive-only. Device
    /// failures are reported and leave the affected engine Idle.
    pub async fn confirm_join(&mut self) {
        let VoiceChannelMembership::Previewing(channel) = self.membership else {
            debug!(membership = ?self.membership, "confirm join ignored");
            return;
        };

        // Joining starts unmuted unless the fader is at zero
        let was_muted = self.mute.is_logically_muted();
        if self.mute.input_volume > 0.0 {
            self.mute.manual_muted = false;
        }
        self.apply_mute(was_muted).await;

        log_transport(
            "join voice channel",
            self.ports.transport.join_voice_channel(channel).await,
        );
        self.membership = VoiceChannelMembership::Active(channel);
        info!(channel, "Joined voice channel");

        match self.devices.input.clone() {
            Some(input) => {
                if let Err(e) = self.capture.start(&input).await {
                    self.ports
                        .reporter
                        .report_error(VOICE_ERROR_CONTEXT, &e.to_string());
                }
            }
            None => {
                warn!("No input device selected, joining receive-only");
                self.ports
                    .observer
                    .status_message("No input device selected; you can listen but not speak");
            }
        }

        if let Err(e) = self.playback.start(self.devices.output.as_deref()).await {
            self.ports
                .reporter
                .report_error(VOICE_ERROR_CONTEXT, &e.to_string());
        }

        // Peers see the right mic state before the first VAD transition
        let is_unmuted = !self.mute.is_logically_muted();
        self.send_mic_status(channel, is_unmuted).await;

        self.notify_topic();
        self.notify_roster();
    }

    /// Stop audio and drop back to previewing the same channel
    pub async fn leave_voice(&mut self) {
        let VoiceChannelMembership::Active(channel) = self.membership else {
            return;
        };

        self.stop_audio().await;
        log_transport(
            "leave voice channel",
            self.ports.transport.leave_voice_channel(channel).await,
        );
        self.membership = VoiceChannelMembership::Previewing(channel);
        info!(channel, "Left voice channel");

        self.activity.clear_activity(self.local_user_id);
        self.ports.observer.status_message("Left voice channel");
        self.notify_topic();
        self.notify_roster();
    }

    /// Close the voice view, leaving voice first if joined
    pub async fn leave_preview(&mut self) {
        match self.membership {
            VoiceChannelMembership::NoChannel => return,
            VoiceChannelMembership::Active(_) => self.leave_voice().await,
            VoiceChannelMembership::Previewing(_) => {}
        }
        self.close_view();
    }

    /// Stop everything and clear all session state (logout or exit)
    pub async fn shutdown(&mut self) {
        self.stop_audio().await;
        if let VoiceChannelMembership::Active(channel) = self.membership {
            log_transport(
                "leave voice channel",
                self.ports.transport.leave_voice_channel(channel).await,
            );
        }
        if self.membership != VoiceChannelMembership::NoChannel {
            self.close_view();
        }
        self.activity.clear();
        info!("Voice session shut down");
    }

    /// Pick new devices and save them
    ///
    /// While joined, the engines are restarted on the new devices.
    pub async fn select_devices(&mut self, input: Option<String>, output: Option<String>) {
        if let Err(e) = self
            .ports
            .config
            .save_device_ids(input.as_deref(), output.as_deref())
        {
            warn!("Failed to save device selection: {}", e);
        }
        self.devices = DeviceSelection { input, output };

        if !self.membership.is_active() {
            return;
        }

        self.stop_audio().await;
        if let Some(input) = self.devices.input.clone()
            && let Err(e) = self.capture.start(&input).await
        {
            self.ports
                .reporter
                .report_error(VOICE_ERROR_CONTEXT, &e.to_string());
        }
        if let Err(e) = self.playback.start(self.devices.output.as_deref()).await {
            self.ports
                .reporter
                .report_error(VOICE_ERROR_CONTEXT, &e.to_string());
        }
    }

    /// Re-read the device lists and apply saved ids again
    pub fn refresh_devices(&mut self) {
        self.devices = DeviceSelection::resolve(self.backend.as_ref(), self.ports.config.as_ref());
    }

    // -------------------------------------------------------------------------
    // Mute
    // -------------------------------------------------------------------------

    /// Set the mute button
    ///
    /// Unmuting with the fader at zero restores the default volume.
    pub async fn set_manual_mute(&mut self, muted: bool) {
        let was_muted = self.mute.is_logically_muted();
        self.mute.manual_muted = muted;
        if !muted && self.mute.input_volume <= 0.0 {
            self.mute.input_volume = DEFAULT_UNMUTE_VOLUME;
            self.save_volume();
        }
        self.apply_mute(was_muted).await;
    }

    /// Flip the displayed (logical) mute state
    pub async fn toggle_mute(&mut self) {
        let muted = self.mute.is_logically_muted();
        self.set_manual_mute(!muted).await;
    }

    /// Move the input fader; clamped to [0, 1] and saved
    pub async fn set_input_volume(&mut self, volume: f32) {
        let was_muted = self.mute.is_logically_muted();
        let volume = clamp_volume(volume);
        if volume != self.mute.input_volume {
            self.mute.input_volume = volume;
            self.save_volume();
        }
        self.apply_mute(was_muted).await;
    }

    fn save_volume(&self) {
        if let Err(e) = self.ports.config.save_input_volume(self.mute.input_volume) {
            warn!("Failed to save input volume: {}", e);
        }
    }

    /// Push mute inputs to capture and announce a logical change
    async fn apply_mute(&mut self, was_muted: bool) {
        let controls = self.capture.controls();
        controls.set_muted(self.mute.manual_muted);
        controls.set_volume(self.mute.input_volume);

        let muted = self.mute.is_logically_muted();
        if muted == was_muted {
            return;
        }
        debug!(muted, "logical mute changed");
        self.ports.observer.mute_changed(muted);

        // Nobody is listening while only previewing
        if let VoiceChannelMembership::Active(channel) = self.membership {
            self.send_mic_status(channel, !muted).await;
        }
    }

    // -------------------------------------------------------------------------
    // Inbound Events
    // -------------------------------------------------------------------------

    /// Replace the roster of the shown channel
    pub fn on_roster_snapshot(&mut self, channel: ChannelId, entries: Vec<RosterEntry>) {
        if !self.membership.shows(channel) {
            return;
        }
        self.activity.replace_roster(entries);
        self.notify_roster();
    }

    /// Add a user to the shown channel's roster
    pub fn on_user_joined(&mut self, channel: ChannelId, entry: RosterEntry) {
        if self.membership.shows(channel) && self.activity.insert(entry) {
            self.notify_roster();
        }
    }

    /// Remove a user from the shown channel's roster
    pub fn on_user_left(&mut self, channel: ChannelId, user_id: UserId) {
        if self.membership.shows(channel) && self.activity.remove(user_id) {
            self.notify_roster();
        }
    }

    /// A user's microphone state changed
    pub fn on_mic_status(&mut self, channel: ChannelId, user_id: UserId, is_unmuted: bool) {
        if self.membership.shows(channel) && self.activity.set_mic_muted(user_id, !is_unmuted) {
            self.notify_roster();
        }
    }

    /// Explicit speaking signal for a user
    pub fn on_voice_activity(&mut self, user_id: UserId, active: bool) {
        let changed = if active {
            self.activity.record_activity(user_id)
        } else {
            self.activity.clear_activity(user_id)
        };
        if changed {
            self.notify_roster();
        }
    }

    /// Audio from a remote user
    ///
    /// Dropped unless joined, when it is our own audio, or when the sender
    /// isn't in the roster. Returns true if the chunk was played.
    pub fn on_voice_chunk(&mut self, from: UserId, chunk: &VoiceChunk) -> bool {
        if !self.membership.is_active()
            || from == self.local_user_id
            || !self.activity.contains(from)
        {
            return false;
        }

        let queued = self.playback.enqueue(chunk);
        if self.activity.record_activity(from) {
            self.notify_roster();
        }
        queued
    }

    /// Apply one event from the capture thread
    pub async fn handle_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::SpeakingChanged(speaking) => {
                let Some(channel) = self.membership.active_channel() else {
                    return;
                };
                log_transport(
                    "send speaking status",
                    self.ports
                        .transport
                        .send_speaking_status(channel, speaking)
                        .await,
                );
                self.on_voice_activity(self.local_user_id, speaking);
            }
            CaptureEvent::Voice(chunk) => {
                let Some(channel) = self.membership.active_channel() else {
                    return;
                };
                log_transport(
                    "send voice chunk",
                    self.ports.transport.send_voice_chunk(channel, chunk).await,
                );
            }
            CaptureEvent::Failed(err) => {
                self.ports
                    .reporter
                    .report_error(VOICE_ERROR_CONTEXT, &err.to_string());
            }
        }
    }

    /// Apply a speaking-indicator timer expiry
    pub fn handle_expiry(&mut self, expiry: ActivityExpiry) {
        if self.activity.expire(expiry) {
            self.notify_roster();
        }
    }

    /// Apply every capture event and timer expiry that is already waiting
    ///
    /// Returns the number of events applied.
    pub async fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.capture_rx.try_recv() {
            self.handle_capture_event(event).await;
            applied += 1;
        }
        while let Ok(expiry) = self.expiry_rx.try_recv() {
            self.handle_expiry(expiry);
            applied += 1;
        }
        applied
    }

    /// Apply one external event
    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::SelectChannel { channel, name } => {
                self.select_voice_channel(channel, &name).await
            }
            SessionEvent::ConfirmJoin => self.confirm_join().await,
            SessionEvent::LeaveVoice => self.leave_voice().await,
            SessionEvent::LeavePreview => self.leave_preview().await,
            SessionEvent::SetManualMute(muted) => self.set_manual_mute(muted).await,
            SessionEvent::ToggleMute => self.toggle_mute().await,
            SessionEvent::SetInputVolume(volume) => self.set_input_volume(volume).await,
            SessionEvent::SelectDevices { input, output } => {
                self.select_devices(input, output).await
            }
            SessionEvent::RosterSnapshot { channel, entries } => {
                self.on_roster_snapshot(channel, entries)
            }
            SessionEvent::UserJoined { channel, entry } => self.on_user_joined(channel, entry),
            SessionEvent::UserLeft { channel, user_id } => self.on_user_left(channel, user_id),
            SessionEvent::MicStatus {
                channel,
                user_id,
                is_unmuted,
            } => self.on_mic_status(channel, user_id, is_unmuted),
            SessionEvent::VoiceActivity { user_id, active } => {
                self.on_voice_activity(user_id, active)
            }
            SessionEvent::VoiceChunk { from, chunk } => {
                self.on_voice_chunk(from, &chunk);
            }
            SessionEvent::Shutdown => self.shutdown().await,
        }
    }

    /// Drive the session until `Shutdown` or the event channel closes
    ///
    /// Capture events and timer expiries are applied on the same task as
    /// external events, so state is only ever touched from here.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        loop {
            let wakeup = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => Wakeup::External(event),
                    None => Wakeup::Closed,
                },
                Some(event) = self.capture_rx.recv() => Wakeup::Capture(event),
                Some(expiry) = self.expiry_rx.recv() => Wakeup::Expiry(expiry),
                else => Wakeup::Closed,
            };

            match wakeup {
                Wakeup::External(SessionEvent::Shutdown) | Wakeup::Closed => break,
                Wakeup::External(event) => self.handle_event(event).await,
                Wakeup::Capture(event) => self.handle_capture_event(event).await,
                Wakeup::Expiry(expiry) => self.handle_expiry(expiry),
            }
        }

        self.shutdown().await;
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Stop both engines and discard capture events from the old session
    async fn stop_audio(&mut self) {
        self.capture.stop().await;
        self.playback.stop().await;
        while self.capture_rx.try_recv().is_ok() {}
    }

    /// Forget the shown channel and tell the UI to fall back
    fn close_view(&mut self) {
        self.activity.clear();
        self.membership = VoiceChannelMembership::NoChannel;
        self.channel_name.clear();
        self.notify_topic();
        self.ports.observer.voice_view_closed();
    }

    async fn send_mic_status(&self, channel: ChannelId, is_unmuted: bool) {
        log_transport(
            "send mic status",
            self.ports
                .transport
                .send_mic_status(channel, is_unmuted)
                .await,
        );
    }

    fn notify_topic(&self) {
        self.ports.observer.topic_changed(self.topic().as_deref());
    }

    fn notify_roster(&self) {
        self.ports.observer.roster_changed(&self.activity.snapshot());
    }
}

/// Fader positions live in [0, 1]; NaN counts as zero
fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// Best-effort transport calls: failures are logged and dropped
fn log_transport(action: &str, result: Result<(), TransportError>) {
    if let Err(e) = result {
        debug!("Failed to {}: {}", action, e);
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Microphone capture with voice activity gating
//!
//! A dedicated thread polls the input stream for 20ms blocks and runs each
//! through [`VoiceGate`]. Speaking transitions and voice chunks are sent to
//! the session over an unbounded channel, so the audio thread never waits on
//! the network and events keep the order they were decided in.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;

use tokio::sync::mpsc;
use tracing::{error, info};

use voxlink_common::voice::{VAD_RMS_THRESHOLD, VOICE_SAMPLE_RATE, VoiceChunk};

use super::audio::AudioBackend;
use super::resample::{RateConverter, needs_resampling, normalize, rms};
use super::worker::{AudioThread, StartSignal};
use crate::constants::{
    AUDIO_POLL_INTERVAL, AUDIO_THREAD_START_TIMEOUT, AUDIO_THREAD_STOP_TIMEOUT,
    DEFAULT_INPUT_VOLUME,
};
use crate::error::VoiceError;

// =============================================================================
// Types
// =============================================================================

/// Event from the capture thread to the session
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Local VAD state changed
    SpeakingChanged(bool),
    /// A speech block to transmit
    Voice(VoiceChunk),
    /// The input stream reported an error
    Failed(VoiceError),
}

/// Result of gating one block
#[derive(Debug, Default, PartialEq)]
pub struct GateOutcome {
    /// New speaking state, if it changed
    pub status_change: Option<bool>,
    /// Block to transmit, if any
    pub chunk: Option<VoiceChunk>,
}

// =============================================================================
// Voice Gate
// =============================================================================

/// Per-block VAD decision and transmit gating
#[derive(Debug)]
pub struct VoiceGate {
    /// Rate the input device delivers blocks at
    device_rate: u32,
    /// RMS above which a block counts as speech
    threshold: f32,
    /// Last speaking state reported to the session
    last_sent_speaking: bool,
    /// Resampler reused across blocks from an off-rate device
    converter: RateConverter,
}

impl VoiceGate {
    /// Create a gate for blocks recorded at `device_rate`
    pub fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            threshold: VAD_RMS_THRESHOLD,
            last_sent_speaking: false,
            converter: RateConverter::new(),
        }
    }

    /// Last speaking state reported
    pub fn last_sent_speaking(&self) -> bool {
        self.last_sent_speaking
    }

    /// Decide what to do with one captured block
    ///
    /// A status change is emitted whenever the VAD result differs from the
    /// last reported one, including the final "not speaking" when mute kicks
    /// in. Audio is only forwarded while unmuted and speaking.
    ///
    /// # Arguments
    /// * `block` - Mono samples at the device rate
    /// * `muted` - Manual mute flag
    /// * `volume` - Input gain; zero also counts as muted
    pub fn process(&mut self, block: &[f32], muted: bool, volume: f32) -> GateOutcome {
        let logically_muted = muted || !(volume > 0.0);
        let vad_active = rms(block) > self.threshold && !logically_muted;

        let mut outcome = GateOutcome::default();
        if vad_active != self.last_sent_speaking {
            self.last_sent_speaking = vad_active;
            outcome.status_change = Some(vad_active);
        }

        if logically_muted || !vad_active {
            return outcome;
        }

        let samples = if needs_resampling(self.device_rate) {
            self.converter
                .convert(block, self.device_rate, VOICE_SAMPLE_RATE)
        } else {
            block.to_vec()
        };
        outcome.chunk = Some(VoiceChunk::new(normalize(&samples, volume)));
        outcome
    }
}

// =============================================================================
// Capture Controls
// =============================================================================

/// Mute and gain shared between the session and the capture thread
#[derive(Debug)]
pub struct CaptureControls {
    muted: AtomicBool,
    /// f32 bits
    volume: AtomicU32,
}

impl CaptureControls {
    /// Unmuted at unity gain
    pub fn new() -> Self {
        Self {
            muted: AtomicBool::new(false),
            volume: AtomicU32::new(DEFAULT_INPUT_VOLUME.to_bits()),
        }
    }

    /// Set the manual mute flag
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    /// Manual mute flag
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Set the input gain
    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::SeqCst);
    }

    /// Input gain
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::SeqCst))
    }
}

impl Default for CaptureControls {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Capture Thread
// =============================================================================

/// Poll the input stream and gate every block until cancelled
fn run_capture_thread(
    backend: Arc<dyn AudioBackend>,
    device: Option<String>,
    controls: Arc<CaptureControls>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    mut start: StartSignal,
    running: Arc<AtomicBool>,
) {
    let mut stream = match backend.open_input(device.as_deref()) {
        Ok(stream) => stream,
        Err(e) => {
            start.fail(e.to_string());
            return;
        }
    };
    start.ready();

    let mut gate = VoiceGate::new(stream.sample_rate());
    let mut reported = false;

    while running.load(Ordering::SeqCst) {
        if let Some(message) = stream.take_error() {
            let err = VoiceError::StreamRuntime(message);
            error!("Voice capture: {}", err);
            if !reported {
                let _ = events.send(CaptureEvent::Failed(err));
                reported = true;
            }
        }

        while let Some(block) = stream.take_block() {
            let outcome = gate.process(&block, controls.is_muted(), controls.volume());
            if let Some(speaking) = outcome.status_change {
                let _ = events.send(CaptureEvent::SpeakingChanged(speaking));
            }
            if let Some(chunk) = outcome.chunk {
                let _ = events.send(CaptureEvent::Voice(chunk));
            }
            if !running.load(Ordering::SeqCst) {
                break;
            }
        }

        thread::sleep(AUDIO_POLL_INTERVAL);
    }
}

// =============================================================================
// Capture Engine
// =============================================================================

/// Lifecycle of the capture engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No input stream
    Idle,
    /// Input stream open and gating blocks
    Running,
    /// Waiting for the capture thread to exit
    Stopping,
}

/// Owns the input device stream and the VAD loop
pub struct CaptureEngine {
    backend: Arc<dyn AudioBackend>,
    controls: Arc<CaptureControls>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    thread: Option<AudioThread>,
    state: CaptureState,
}

impl CaptureEngine {
    /// Create an idle engine and the receiver for its events
    pub fn new(
        backend: Arc<dyn AudioBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            backend,
            controls: Arc::new(CaptureControls::new()),
            events,
            thread: None,
            state: CaptureState::Idle,
        };
        (engine, events_rx)
    }

    /// Current lifecycle state
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Whether the input stream is open
    pub fn is_running(&self) -> bool {
        self.state == CaptureState::Running
    }

    /// Mute and gain read by the capture thread
    pub fn controls(&self) -> &Arc<CaptureControls> {
        &self.controls
    }

    /// Open the input device and start gating; a no-op if already running
    ///
    /// On failure the engine stays Idle and the error is returned for the
    /// caller to surface.
    pub async fn start(&mut self, device: &str) -> Result<(), VoiceError> {
        if self.state != CaptureState::Idle {
            return Ok(());
        }

        let backend = self.backend.clone();
        let controls = self.controls.clone();
        let events = self.events.clone();
        let device = Some(device.to_string());

        let thread = AudioThread::spawn(
            "voice-capture",
            AUDIO_THREAD_START_TIMEOUT,
            move |start, running| {
                run_capture_thread(backend, device, controls, events, start, running)
            },
        )
        .await?;

        info!("Voice capture started");
        self.thread = Some(thread);
        self.state = CaptureState::Running;
        Ok(())
    }

    /// Cancel the capture thread and wait up to 2s for it
    ///
    /// Always returns; a thread that doesn't exit in time is abandoned.
    pub async fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.state = CaptureState::Stopping;
        thread.stop(AUDIO_THREAD_STOP_TIMEOUT).await;
        self.state = CaptureState::Idle;
        info!("Voice capture stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================

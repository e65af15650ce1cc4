//! In-memory collaborators for unit tests
//!
//! `FakeBackend` stands in for the sound card: input streams hand out
//! scripted blocks and output streams expose the queue they would drain.
//! The recording fakes capture every call made to the ports.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use voxlink_common::ChannelId;
use voxlink_common::voice::{VOICE_SAMPLE_RATE, VoiceChunk};

use crate::config::ConfigStore;
use crate::constants::DEFAULT_INPUT_VOLUME;
use crate::error::{ConfigError, TransportError, VoiceError};
use crate::transport::{ErrorReporter, SessionObserver, VoiceTransport};
use crate::voice::activity::RemoteSpeakerState;
use crate::voice::audio::{AudioBackend, AudioDevice, InputStream, OutputStream};
use crate::voice::capture::CaptureEvent;
use crate::voice::playback::PlaybackQueue;

/// Upper bound for anything a test waits on
pub const WAIT_LIMIT: Duration = Duration::from_secs(2);

// =============================================================================
// Helpers
// =============================================================================

/// A 1kHz sine block at 48kHz (whole cycles, so RMS = amplitude / sqrt 2)
pub fn sine_block(amplitude: f32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let t = i as f32 / VOICE_SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * 1000.0 * t).sin()
        })
        .collect()
}

/// Receive the next capture event or fail the test
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<CaptureEvent>) -> CaptureEvent {
    tokio::time::timeout(WAIT_LIMIT, rx.recv())
        .await
        .expect("timed out waiting for capture event")
        .expect("capture channel closed")
}

/// Poll until `condition` holds or fail the test
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

// =============================================================================
// Fake Backend
// =============================================================================

/// State shared between the backend and the streams it opened
#[derive(Default)]
struct FakeShared {
    blocks: Mutex<VecDeque<Vec<f32>>>,
    input_errors: Mutex<VecDeque<String>>,
    output_errors: Mutex<VecDeque<String>>,
    live_inputs: AtomicUsize,
    live_outputs: AtomicUsize,
}

/// Scripted sound card
pub struct FakeBackend {
    shared: Arc<FakeShared>,
    inputs: Vec<AudioDevice>,
    outputs: Vec<AudioDevice>,
    input_rate: AtomicU32,
    fail_input: AtomicBool,
    fail_output: AtomicBool,
    opened_inputs: Mutex<Vec<Option<String>>>,
    output_queues: Mutex<Vec<Arc<PlaybackQueue>>>,
}

impl FakeBackend {
    /// Backend with one default mic and one default speaker
    pub fn new() -> Self {
        Self::with_devices(
            vec![AudioDevice::new("Mic", true)],
            vec![AudioDevice::new("Speakers", true)],
        )
    }

    /// Backend with explicit device lists
    pub fn with_devices(inputs: Vec<AudioDevice>, outputs: Vec<AudioDevice>) -> Self {
        Self {
            shared: Arc::new(FakeShared::default()),
            inputs,
            outputs,
            input_rate: AtomicU32::new(VOICE_SAMPLE_RATE),
            fail_input: AtomicBool::new(false),
            fail_output: AtomicBool::new(false),
            opened_inputs: Mutex::new(Vec::new()),
            output_queues: Mutex::new(Vec::new()),
        }
    }

    /// Queue blocks for input streams to deliver
    pub fn script_input(&self, blocks: Vec<Vec<f32>>) {
        self.shared.blocks.lock().unwrap().extend(blocks);
    }

    /// Rate reported by input streams opened from now on
    pub fn set_input_rate(&self, rate: u32) {
        self.input_rate.store(rate, Ordering::SeqCst);
    }

    /// Make `open_input` fail
    pub fn fail_input(&self, fail: bool) {
        self.fail_input.store(fail, Ordering::SeqCst);
    }

    /// Make `open_output` fail
    pub fn fail_output(&self, fail: bool) {
        self.fail_output.store(fail, Ordering::SeqCst);
    }

    /// Have the open input stream report an error
    pub fn inject_input_error(&self, message: &str) {
        self.shared
            .input_errors
            .lock()
            .unwrap()
            .push_back(message.to_string());
    }

    /// Have the open output stream report an error
    pub fn inject_output_error(&self, message: &str) {
        self.shared
            .output_errors
            .lock()
            .unwrap()
            .push_back(message.to_string());
    }

    /// Input streams currently open
    pub fn live_inputs(&self) -> usize {
        self.shared.live_inputs.load(Ordering::SeqCst)
    }

    /// Output streams currently open
    pub fn live_outputs(&self) -> usize {
        self.shared.live_outputs.load(Ordering::SeqCst)
    }

    /// Device ids passed to `open_input`, in order
    pub fn opened_inputs(&self) -> Vec<Option<String>> {
        self.opened_inputs.lock().unwrap().clone()
    }

    /// Queue handed to the most recently opened output stream
    pub fn last_output_queue(&self) -> Option<Arc<PlaybackQueue>> {
        self.output_queues.lock().unwrap().last().cloned()
    }

    /// Wait until every scripted block has been taken
    pub async fn wait_input_drained(&self) {
        wait_until(|| self.shared.blocks.lock().unwrap().is_empty()).await;
    }
}

impl AudioBackend for FakeBackend {
    fn list_input_devices(&self) -> Vec<AudioDevice> {
        self.inputs.clone()
    }

    fn list_output_devices(&self) -> Vec<AudioDevice> {
        self.outputs.clone()
    }

    fn open_input(&self, device: Option<&str>) -> Result<Box<dyn InputStream>, VoiceError> {
        self.opened_inputs
            .lock()
            .unwrap()
            .push(device.map(str::to_string));
        if self.fail_input.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceUnavailable(
                "Input device not found".to_string(),
            ));
        }
        self.shared.live_inputs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeInput {
            shared: self.shared.clone(),
            rate: self.input_rate.load(Ordering::SeqCst),
        }))
    }

    fn open_output(
        &self,
        _device: Option<&str>,
        source: Arc<PlaybackQueue>,
    ) -> Result<Box<dyn OutputStream>, VoiceError> {
        if self.fail_output.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceUnavailable(
                "Output device not found".to_string(),
            ));
        }
        self.output_queues.lock().unwrap().push(source);
        self.shared.live_outputs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeOutput {
            shared: self.shared.clone(),
        }))
    }
}

struct FakeInput {
    shared: Arc<FakeShared>,
    rate: u32,
}

impl InputStream for FakeInput {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn take_block(&mut self) -> Option<Vec<f32>> {
        self.shared.blocks.lock().unwrap().pop_front()
    }

    fn take_error(&mut self) -> Option<String> {
        self.shared.input_errors.lock().unwrap().pop_front()
    }
}

impl Drop for FakeInput {
    fn drop(&mut self) {
        self.shared.live_inputs.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeOutput {
    shared: Arc<FakeShared>,
}

impl OutputStream for FakeOutput {
    fn take_error(&mut self) -> Option<String> {
        self.shared.output_errors.lock().unwrap().pop_front()
    }
}

impl Drop for FakeOutput {
    fn drop(&mut self) {
        self.shared.live_outputs.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Recording Ports
// =============================================================================

/// One call made to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Join(ChannelId),
    Leave(ChannelId),
    Speaking(ChannelId, bool),
    MicStatus(ChannelId, bool),
    Chunk(ChannelId, VoiceChunk),
}

/// Transport that records calls; can simulate being disconnected
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
    disconnected: AtomicBool,
}

impl RecordingTransport {
    /// Every call so far
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls other than voice chunks
    pub fn control_calls(&self) -> Vec<TransportCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, TransportCall::Chunk(..)))
            .collect()
    }

    /// Voice chunks sent so far
    pub fn chunks(&self) -> Vec<VoiceChunk> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::Chunk(_, chunk) => Some(chunk),
                _ => None,
            })
            .collect()
    }

    /// Fail every call with `TransportError::Unavailable`
    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    fn record(&self, call: TransportCall) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(call);
        if self.disconnected.load(Ordering::SeqCst) {
            Err(TransportError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VoiceTransport for RecordingTransport {
    async fn join_voice_channel(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.record(TransportCall::Join(channel))
    }

    async fn leave_voice_channel(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.record(TransportCall::Leave(channel))
    }

    async fn send_speaking_status(
        &self,
        channel: ChannelId,
        speaking: bool,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Speaking(channel, speaking))
    }

    async fn send_mic_status(
        &self,
        channel: ChannelId,
        is_unmuted: bool,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::MicStatus(channel, is_unmuted))
    }

    async fn send_voice_chunk(
        &self,
        channel: ChannelId,
        chunk: VoiceChunk,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Chunk(channel, chunk))
    }
}

/// Observer that records notifications
#[derive(Default)]
pub struct RecordingObserver {
    pub rosters: Mutex<Vec<Vec<RemoteSpeakerState>>>,
    pub topics: Mutex<Vec<Option<String>>>,
    pub statuses: Mutex<Vec<String>>,
    pub mutes: Mutex<Vec<bool>>,
    pub closed: AtomicUsize,
}

impl RecordingObserver {
    /// Most recent roster
    pub fn last_roster(&self) -> Option<Vec<RemoteSpeakerState>> {
        self.rosters.lock().unwrap().last().cloned()
    }

    /// Most recent topic
    pub fn last_topic(&self) -> Option<Option<String>> {
        self.topics.lock().unwrap().last().cloned()
    }

    /// Number of roster notifications
    pub fn roster_updates(&self) -> usize {
        self.rosters.lock().unwrap().len()
    }
}

impl SessionObserver for RecordingObserver {
    fn roster_changed(&self, roster: &[RemoteSpeakerState]) {
        self.rosters.lock().unwrap().push(roster.to_vec());
    }

    fn topic_changed(&self, topic: Option<&str>) {
        self.topics.lock().unwrap().push(topic.map(str::to_string));
    }

    fn status_message(&self, message: &str) {
        self.statuses.lock().unwrap().push(message.to_string());
    }

    fn mute_changed(&self, muted: bool) {
        self.mutes.lock().unwrap().push(muted);
    }

    fn voice_view_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reporter that records `(context, message)` pairs
#[derive(Default)]
pub struct RecordingReporter {
    errors: Mutex<Vec<(String, String)>>,
}

impl RecordingReporter {
    /// Every reported error
    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().unwrap().clone()
    }

    /// Wait until at least `count` errors were reported
    pub async fn wait_for(&self, count: usize) {
        wait_until(|| self.errors.lock().unwrap().len() >= count).await;
    }
}

impl ErrorReporter for RecordingReporter {
    fn report_error(&self, context: &str, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .push((context.to_string(), message.to_string()));
    }
}

/// Config store kept in memory
#[derive(Default)]
pub struct MemoryConfigStore {
    ids: Mutex<(Option<String>, Option<String>)>,
    volume: Mutex<Option<f32>>,
}

impl MemoryConfigStore {
    /// Store with saved ids
    pub fn with_ids(input: Option<&str>, output: Option<&str>) -> Self {
        Self {
            ids: Mutex::new((input.map(str::to_string), output.map(str::to_string))),
            volume: Mutex::new(None),
        }
    }

    /// Store with a saved input volume
    pub fn with_volume(volume: f32) -> Self {
        Self {
            volume: Mutex::new(Some(volume)),
            ..Self::default()
        }
    }

    /// Last volume saved, if any
    pub fn stored_volume(&self) -> Option<f32> {
        *self.volume.lock().unwrap()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn saved_device_ids(&self) -> (Option<String>, Option<String>) {
        self.ids.lock().unwrap().clone()
    }

    fn save_device_ids(
        &self,
        input: Option<&str>,
        output: Option<&str>,
    ) -> Result<(), ConfigError> {
        *self.ids.lock().unwrap() = (input.map(str::to_string), output.map(str::to_string));
        Ok(())
    }

    fn saved_input_volume(&self) -> f32 {
        self.stored_volume().unwrap_or(DEFAULT_INPUT_VOLUME)
    }

    fn save_input_volume(&self, volume: f32) -> Result<(), ConfigError> {
        *self.volume.lock().unwrap() = Some(volume);
        Ok(())
    }
}

//! Speaker playback
//!
//! Remote chunks are conformed to 48kHz, clip-guarded, and pushed onto a
//! bounded FIFO. The output device callback pulls one chunk per 20ms block.
//! When the FIFO is full the oldest chunk is dropped so latency stays bounded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error, info};

use voxlink_common::voice::{VOICE_SAMPLE_RATE, VoiceChunk};

use super::audio::AudioBackend;
use super::resample::{RateConverter, normalize};
use super::worker::{AudioThread, StartSignal};
use crate::constants::{
    AUDIO_POLL_INTERVAL, AUDIO_THREAD_START_TIMEOUT, AUDIO_THREAD_STOP_TIMEOUT,
    PLAYBACK_QUEUE_CAPACITY,
};
use crate::error::VoiceError;
use crate::transport::ErrorReporter;

/// Error reporter context for playback failures
const PLAYBACK_ERROR_CONTEXT: &str = "playback";

// =============================================================================
// Playback Queue
// =============================================================================

/// Bounded FIFO of pending chunks shared with the output device callback
///
/// Many producers (one per inbound chunk), one consumer (the callback).
#[derive(Debug)]
pub struct PlaybackQueue {
    /// Pending chunks, oldest first
    chunks: Mutex<VecDeque<Vec<f32>>>,
    /// Maximum number of pending chunks
    capacity: usize,
}

impl PlaybackQueue {
    /// Create a queue holding at most `capacity` chunks
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Maximum number of pending chunks
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of pending chunks
    pub fn len(&self) -> usize {
        self.chunks.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Whether no chunks are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a chunk, evicting the oldest ones if the queue is full
    ///
    /// Returns the number of chunks evicted.
    pub fn push(&self, chunk: Vec<f32>) -> usize {
        let Ok(mut chunks) = self.chunks.lock() else {
            return 0;
        };
        let mut evicted = 0;
        while chunks.len() >= self.capacity {
            chunks.pop_front();
            evicted += 1;
        }
        chunks.push_back(chunk);
        evicted
    }

    /// Fill one output block from the next pending chunk
    ///
    /// Longer chunks are truncated, shorter ones zero-padded, and an empty
    /// queue yields silence.
    pub fn fill(&self, out: &mut [f32]) {
        let chunk = self.chunks.lock().ok().and_then(|mut c| c.pop_front());
        match chunk {
            Some(chunk) => {
                let n = chunk.len().min(out.len());
                out[..n].copy_from_slice(&chunk[..n]);
                out[n..].fill(0.0);
            }
            None => out.fill(0.0),
        }
    }

    /// Drop all pending chunks
    pub fn clear(&self) {
        if let Ok(mut chunks) = self.chunks.lock() {
            chunks.clear();
        }
    }
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new(PLAYBACK_QUEUE_CAPACITY)
    }
}

/// Conform a chunk to the pipeline rate and guard against clipping
pub fn prepare_chunk(chunk: &VoiceChunk, converter: &mut RateConverter) -> Vec<f32> {
    let samples = if chunk.sample_rate_hz != VOICE_SAMPLE_RATE {
        converter.convert(&chunk.samples, chunk.sample_rate_hz, VOICE_SAMPLE_RATE)
    } else {
        chunk.samples.clone()
    };
    normalize(&samples, 1.0)
}

// =============================================================================
// Playback Thread
// =============================================================================

/// Keep an output stream open until cancelled
fn run_playback_thread(
    backend: Arc<dyn AudioBackend>,
    device: Option<String>,
    queue: Arc<PlaybackQueue>,
    reporter: Arc<dyn ErrorReporter>,
    mut start: StartSignal,
    running: Arc<AtomicBool>,
) {
    let mut stream = match backend.open_output(device.as_deref(), queue) {
        Ok(stream) => stream,
        Err(e) => {
            start.fail(e.to_string());
            return;
        }
    };
    start.ready();

    let mut reported = false;
    while running.load(Ordering::SeqCst) {
        if let Some(message) = stream.take_error() {
            let err = VoiceError::StreamRuntime(message);
            error!("Voice playback: {}", err);
            if !reported {
                reporter.report_error(PLAYBACK_ERROR_CONTEXT, &err.to_string());
                reported = true;
            }
        }
        thread::sleep(AUDIO_POLL_INTERVAL);
    }

    // Stream closes when dropped
}

// =============================================================================
// Playback Engine
// =============================================================================

/// Lifecycle of the playback engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No output stream
    Idle,
    /// Output stream open and pulling from the queue
    Running,
}

/// Owns the output device stream and its FIFO
pub struct PlaybackEngine {
    backend: Arc<dyn AudioBackend>,
    reporter: Arc<dyn ErrorReporter>,
    queue: Arc<PlaybackQueue>,
    thread: Option<AudioThread>,
    /// Resampler for off-rate senders, kept across chunks
    converter: RateConverter,
}

impl PlaybackEngine {
    /// Create an idle engine
    pub fn new(backend: Arc<dyn AudioBackend>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self::with_capacity(backend, reporter, PLAYBACK_QUEUE_CAPACITY)
    }

    /// Create an idle engine with a custom FIFO capacity
    pub fn with_capacity(
        backend: Arc<dyn AudioBackend>,
        reporter: Arc<dyn ErrorReporter>,
        capacity: usize,
    ) -> Self {
        Self {
            backend,
            reporter,
            queue: Arc::new(PlaybackQueue::new(capacity)),
            thread: None,
            converter: RateConverter::new(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> PlaybackState {
        match self.thread {
            Some(_) => PlaybackState::Running,
            None => PlaybackState::Idle,
        }
    }

    /// Whether the output stream is open
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// The FIFO the device callback pulls from
    pub fn queue(&self) -> &Arc<PlaybackQueue> {
        &self.queue
    }

    /// Open the output device; a no-op if already running
    ///
    /// On failure the engine stays Idle and the error is returned for the
    /// caller to surface.
    pub async fn start(&mut self, device: Option<&str>) -> Result<(), VoiceError> {
        if self.thread.is_some() {
            return Ok(());
        }

        self.queue.clear();
        let backend = self.backend.clone();
        let queue = self.queue.clone();
        let reporter = self.reporter.clone();
        let device = device.map(str::to_string);

        let thread = AudioThread::spawn(
            "voice-playback",
            AUDIO_THREAD_START_TIMEOUT,
            move |start, running| {
                run_playback_thread(backend, device, queue, reporter, start, running)
            },
        )
        .await?;

        info!("Voice playback started");
        self.thread = Some(thread);
        Ok(())
    }

    /// Close the output device and discard pending audio
    pub async fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.stop(AUDIO_THREAD_STOP_TIMEOUT).await;
            info!("Voice playback stopped");
        }
        self.queue.clear();
    }

    /// Queue a remote chunk for playback
    ///
    /// Dropped while Idle. Returns true if the chunk was queued.
    pub fn enqueue(&mut self, chunk: &VoiceChunk) -> bool {
        if self.thread.is_none() {
            return false;
        }
        let evicted = self.queue.push(prepare_chunk(chunk, &mut self.converter));
        if evicted > 0 {
            debug!(evicted, "playback queue full, dropped oldest audio");
        }
        true
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, RecordingReporter};

    fn engine(backend: &Arc<FakeBackend>) -> (PlaybackEngine, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());
        let engine = PlaybackEngine::new(backend.clone(), reporter.clone());
        (engine, reporter)
    }

    #[test]
    fn test_fill_exact_chunk() {
        let queue = PlaybackQueue::new(4);
        queue.push(vec![0.5; 960]);
        let mut out = vec![1.0; 960];
        queue.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_fill_truncates_long_chunk() {
        let queue = PlaybackQueue::new(4);
        let chunk: Vec<f32> = (0..1500).map(|i| i as f32 / 1500.0).collect();
        queue.push(chunk.clone());

        let mut out = vec![0.0; 960];
        queue.fill(&mut out);
        assert_eq!(out, chunk[..960]);
        // Remainder is discarded, not carried over
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fill_pads_short_chunk() {
        let queue = PlaybackQueue::new(4);
        queue.push(vec![0.25; 100]);

        let mut out = vec![1.0; 960];
        queue.fill(&mut out);
        assert!(out[..100].iter().all(|&s| s == 0.25));
        assert!(out[100..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_fill_empty_queue_is_silence() {
        let queue = PlaybackQueue::new(4);
        let mut out = vec![0.7; 960];
        queue.fill(&mut out);
        assert_eq!(out.len(), 960);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let capacity = 5;
        let queue = PlaybackQueue::new(capacity);
        let mut evicted = 0;
        for i in 0..=capacity {
            evicted += queue.push(vec![i as f32; 4]);
        }
        assert_eq!(evicted, 1);
        assert_eq!(queue.len(), capacity);

        // Newest N remain in arrival order
        let mut out = vec![0.0; 4];
        for expected in 1..=capacity {
            queue.fill(&mut out);
            assert_eq!(out[0], expected as f32);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let queue = PlaybackQueue::new(3);
        queue.push(vec![0.1]);
        queue.push(vec![0.2]);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_prepare_chunk_resamples_and_guards() {
        let chunk = VoiceChunk::with_rate(vec![2.0; 441], 22050);
        let mut converter = RateConverter::new();
        let prepared = prepare_chunk(&chunk, &mut converter);
        assert_eq!(prepared.len(), 960);
        assert!(prepared.iter().all(|s| s.abs() <= 1.0 + 1e-6));
        assert_eq!(converter.cached_rates(), Some((22050, 48000)));

        let chunk = VoiceChunk::new(vec![0.3; 960]);
        assert_eq!(prepare_chunk(&chunk, &mut converter), vec![0.3; 960]);
    }

    #[tokio::test]
    async fn test_enqueue_while_idle_is_dropped() {
        let backend = Arc::new(FakeBackend::new());
        let (mut engine, _) = engine(&backend);
        assert!(!engine.enqueue(&VoiceChunk::new(vec![0.1; 960])));
        assert!(engine.queue().is_empty());
    }

    #[tokio::test]
    async fn test_start_enqueue_pull() {
        let backend = Arc::new(FakeBackend::new());
        let (mut engine, _) = engine(&backend);
        engine.start(None).await.unwrap();
        assert_eq!(engine.state(), PlaybackState::Running);
        assert_eq!(backend.live_outputs(), 1);

        let chunk: Vec<f32> = (0..1200).map(|i| (i % 7) as f32 * 0.1).collect();
        assert!(engine.enqueue(&VoiceChunk::new(chunk.clone())));

        // The device pulls from the same queue the engine fills
        let source = backend.last_output_queue().unwrap();
        let mut block = vec![0.0; 960];
        source.fill(&mut block);
        assert_eq!(block, chunk[..960]);

        engine.stop().await;
        assert_eq!(backend.live_outputs(), 0);
    }

    #[tokio::test]
    async fn test_stop_clears_queue() {
        let backend = Arc::new(FakeBackend::new());
        let (mut engine, _) = engine(&backend);
        engine.start(None).await.unwrap();
        engine.enqueue(&VoiceChunk::new(vec![0.1; 960]));
        engine.enqueue(&VoiceChunk::new(vec![0.2; 960]));

        engine.stop().await;
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert!(engine.queue().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_leaves_idle() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_output(true);
        let (mut engine, _) = engine(&backend);

        let result = engine.start(Some("Speakers")).await;
        assert!(matches!(result, Err(VoiceError::DeviceUnavailable(_))));
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let backend = Arc::new(FakeBackend::new());
        let (mut engine, _) = engine(&backend);
        engine.start(None).await.unwrap();
        engine.start(None).await.unwrap();
        assert_eq!(backend.live_outputs(), 1);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stream_error_reported_once() {
        let backend = Arc::new(FakeBackend::new());
        let (mut engine, reporter) = engine(&backend);
        engine.start(None).await.unwrap();

        backend.inject_output_error("underrun");
        backend.inject_output_error("underrun again");
        reporter.wait_for(1).await;
        engine.stop().await;

        let errors = reporter.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, PLAYBACK_ERROR_CONTEXT);
        assert_eq!(errors[0].1, "audio stream error: underrun");
    }
}

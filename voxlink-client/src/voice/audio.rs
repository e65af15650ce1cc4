//! Audio device management and streaming
//!
//! Device I/O sits behind the [`AudioBackend`] trait so the engines can run
//! against scripted devices in tests. [`CpalBackend`] is the real
//! implementation: it enumerates devices and opens cpal streams, converting
//! whatever sample format and channel count the device offers to mono f32.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, Host, Sample, SampleFormat, Stream, StreamConfig,
    SupportedStreamConfigRange,
};
use tracing::{debug, warn};

use voxlink_common::voice::{AudioFormat, VOICE_SAMPLE_RATE, VOICE_SAMPLES_PER_FRAME};

use super::playback::PlaybackQueue;
use crate::error::VoiceError;

// =============================================================================
// Constants
// =============================================================================

/// Maximum capture buffer size in blocks (prevents unbounded growth if polling stalls)
const MAX_CAPTURE_BUFFER_BLOCKS: usize = 10;

/// Sample formats the stream builders can convert
const SUPPORTED_FORMATS: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

// =============================================================================
// Audio Device
// =============================================================================

/// An audio device (input or output) as shown in device pickers
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Stable identifier passed back to `open_input`/`open_output`
    pub id: String,
    /// Device name for display
    pub name: String,
    /// Whether this is the host's default device
    pub is_default: bool,
}

impl AudioDevice {
    /// Create a device entry; the id is the device name
    pub fn new(name: impl Into<String>, is_default: bool) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            is_default,
        }
    }
}

impl std::fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for AudioDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AudioDevice {}

/// Build a device list from raw names: duplicates removed, default first
pub fn order_devices(names: Vec<String>, default_name: Option<&str>) -> Vec<AudioDevice> {
    let mut devices: Vec<AudioDevice> = Vec::with_capacity(names.len());
    for name in names {
        if devices.iter().any(|d| d.name == name) {
            continue;
        }
        let is_default = default_name == Some(name.as_str());
        devices.push(AudioDevice::new(name, is_default));
    }
    if let Some(pos) = devices.iter().position(|d| d.is_default) {
        let default = devices.remove(pos);
        devices.insert(0, default);
    }
    devices
}

// =============================================================================
// Backend Traits
// =============================================================================

/// An open input stream delivering mono blocks at the device rate
///
/// Lives on the audio thread that opened it.
pub trait InputStream {
    /// Rate the device is actually running at
    fn sample_rate(&self) -> u32;

    /// Take the next 20ms block if one has been captured
    fn take_block(&mut self) -> Option<Vec<f32>>;

    /// Take a pending stream error, if any
    fn take_error(&mut self) -> Option<String>;
}

/// An open output stream pulling blocks from a [`PlaybackQueue`]
pub trait OutputStream {
    /// Take a pending stream error, if any
    fn take_error(&mut self) -> Option<String>;
}

/// Device enumeration and stream creation
pub trait AudioBackend: Send + Sync {
    /// List input devices, default first; empty if enumeration fails
    fn list_input_devices(&self) -> Vec<AudioDevice>;

    /// List output devices, default first; empty if enumeration fails
    fn list_output_devices(&self) -> Vec<AudioDevice>;

    /// Open and start an input stream (`None` = host default device)
    fn open_input(&self, device: Option<&str>) -> Result<Box<dyn InputStream>, VoiceError>;

    /// Open and start an output stream fed by `source` (`None` = host default device)
    fn open_output(
        &self,
        device: Option<&str>,
        source: Arc<PlaybackQueue>,
    ) -> Result<Box<dyn OutputStream>, VoiceError>;
}

// =============================================================================
// Cpal Backend
// =============================================================================

/// [`AudioBackend`] over the platform's default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    /// Create the backend
    pub fn new() -> Self {
        Self
    }
}

/// Get the default audio host for the platform
fn get_host() -> Host {
    cpal::default_host()
}

/// Display name of a cpal device
fn device_name(device: &Device) -> Option<String> {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
}

/// Find an input device by id, or the default for `None`/empty
fn find_input_device(host: &Host, id: Option<&str>) -> Option<Device> {
    match id {
        None | Some("") => host.default_input_device(),
        Some(id) => host
            .input_devices()
            .ok()?
            .find(|d| device_name(d).as_deref() == Some(id)),
    }
}

/// Find an output device by id, or the default for `None`/empty
fn find_output_device(host: &Host, id: Option<&str>) -> Option<Device> {
    match id {
        None | Some("") => host.default_output_device(),
        Some(id) => host
            .output_devices()
            .ok()?
            .find(|d| device_name(d).as_deref() == Some(id)),
    }
}

/// Pick a 48kHz config, preferring mono, then stereo, then anything
fn pick_voice_config(configs: &[SupportedStreamConfigRange]) -> Option<(u16, SampleFormat)> {
    let usable = |c: &&SupportedStreamConfigRange| {
        c.min_sample_rate() <= VOICE_SAMPLE_RATE
            && c.max_sample_rate() >= VOICE_SAMPLE_RATE
            && SUPPORTED_FORMATS.contains(&c.sample_format())
    };

    [Some(1u16), Some(2u16), None].into_iter().find_map(|channels| {
        configs
            .iter()
            .filter(usable)
            .find(|c| channels.is_none_or(|n| c.channels() == n))
            .map(|c| (c.channels(), c.sample_format()))
    })
}

/// Describe a device's supported rates for error messages
fn describe_rates(configs: &[SupportedStreamConfigRange]) -> String {
    let rates: Vec<String> = configs
        .iter()
        .map(|c| {
            if c.min_sample_rate() == c.max_sample_rate() {
                format!("{}Hz", c.min_sample_rate())
            } else {
                format!("{}-{}Hz", c.min_sample_rate(), c.max_sample_rate())
            }
        })
        .collect();
    if rates.is_empty() {
        "unknown".to_string()
    } else {
        rates.join(", ")
    }
}

impl AudioBackend for CpalBackend {
    fn list_input_devices(&self) -> Vec<AudioDevice> {
        let host = get_host();
        let default_name = host.default_input_device().and_then(|d| device_name(&d));
        match host.input_devices() {
            Ok(devices) => order_devices(
                devices.filter_map(|d| device_name(&d)).collect(),
                default_name.as_deref(),
            ),
            Err(e) => {
                warn!("Failed to enumerate input devices: {}", e);
                Vec::new()
            }
        }
    }

    fn list_output_devices(&self) -> Vec<AudioDevice> {
        let host = get_host();
        let default_name = host.default_output_device().and_then(|d| device_name(&d));
        match host.output_devices() {
            Ok(devices) => order_devices(
                devices.filter_map(|d| device_name(&d)).collect(),
                default_name.as_deref(),
            ),
            Err(e) => {
                warn!("Failed to enumerate output devices: {}", e);
                Vec::new()
            }
        }
    }

    fn open_input(&self, device: Option<&str>) -> Result<Box<dyn InputStream>, VoiceError> {
        let capture = AudioCapture::new(device)?;
        Ok(Box::new(capture))
    }

    fn open_output(
        &self,
        device: Option<&str>,
        source: Arc<PlaybackQueue>,
    ) -> Result<Box<dyn OutputStream>, VoiceError> {
        let playback = AudioPlayback::new(device, source)?;
        Ok(Box::new(playback))
    }
}

// =============================================================================
// Audio Capture
// =============================================================================

/// Microphone stream downmixed to mono f32
///
/// Prefers 48kHz; if the device can't run at 48kHz it is opened at its
/// default rate and the capture engine resamples each block.
pub struct AudioCapture {
    /// The cpal input stream
    _stream: Stream,
    /// Captured mono samples waiting to be taken as blocks
    buffer: Arc<Mutex<Vec<f32>>>,
    /// Rate the stream runs at
    sample_rate: u32,
    /// Frames in one 20ms block at `sample_rate`
    block_frames: usize,
    /// Receiver for audio stream errors
    error_rx: std_mpsc::Receiver<String>,
}

impl AudioCapture {
    /// Open and start capture on the given device
    ///
    /// # Arguments
    /// * `device_id` - Device id, or `None` for the system default
    ///
    /// # Returns
    /// * `Ok(AudioCapture)` - Capture is running
    /// * `Err(VoiceError::DeviceUnavailable)` - Device not found or couldn't be opened
    pub fn new(device_id: Option<&str>) -> Result<Self, VoiceError> {
        let host = get_host();
        let device = find_input_device(&host, device_id).ok_or_else(|| {
            VoiceError::DeviceUnavailable(format!(
                "Input device not found: {}",
                device_id.unwrap_or("default")
            ))
        })?;

        let configs: Vec<SupportedStreamConfigRange> = device
            .supported_input_configs()
            .map_err(|e| {
                VoiceError::DeviceUnavailable(format!("Failed to get supported configs: {}", e))
            })?
            .collect();

        let (channels, sample_format, sample_rate) = match pick_voice_config(&configs) {
            Some((channels, format)) => (channels, format, VOICE_SAMPLE_RATE),
            None => {
                let fallback = device.default_input_config().map_err(|e| {
                    VoiceError::DeviceUnavailable(format!(
                        "Input device has no usable config (supports {}): {}",
                        describe_rates(&configs),
                        e
                    ))
                })?;
                warn!(
                    rate = fallback.sample_rate(),
                    "Input device doesn't support 48kHz, capturing at native rate"
                );
                (
                    fallback.channels(),
                    fallback.sample_format(),
                    fallback.sample_rate(),
                )
            }
        };

        let config = StreamConfig {
            channels,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let block_frames = AudioFormat::STANDARD.block_frames_at(sample_rate).max(1);
        let max_samples = block_frames * MAX_CAPTURE_BUFFER_BLOCKS;
        let buffer = Arc::new(Mutex::new(Vec::with_capacity(block_frames * 4)));
        let (error_tx, error_rx) = std_mpsc::channel();

        let stream = match sample_format {
            SampleFormat::F32 => {
                build_input_stream::<f32>(&device, &config, buffer.clone(), max_samples, error_tx)
            }
            SampleFormat::I16 => {
                build_input_stream::<i16>(&device, &config, buffer.clone(), max_samples, error_tx)
            }
            SampleFormat::U16 => {
                build_input_stream::<u16>(&device, &config, buffer.clone(), max_samples, error_tx)
            }
            other => {
                return Err(VoiceError::DeviceUnavailable(format!(
                    "Unsupported sample format: {:?}",
                    other
                )));
            }
        }?;

        stream
            .play()
            .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to start capture: {}", e)))?;

        debug!(channels, sample_rate, ?sample_format, "input stream started");

        Ok(Self {
            _stream: stream,
            buffer,
            sample_rate,
            block_frames,
            error_rx,
        })
    }
}

impl InputStream for AudioCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn take_block(&mut self) -> Option<Vec<f32>> {
        let mut buffer = self.buffer.lock().ok()?;
        if buffer.len() >= self.block_frames {
            Some(buffer.drain(..self.block_frames).collect())
        } else {
            None
        }
    }

    fn take_error(&mut self) -> Option<String> {
        self.error_rx.try_recv().ok()
    }
}

/// Build an input stream that averages all channels down to mono
fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<Vec<f32>>>,
    max_samples: usize,
    error_tx: std_mpsc::Sender<String>,
) -> Result<Stream, VoiceError>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    for frame in data.chunks_exact(channels) {
                        let sum: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
                        buf.push(sum / channels as f32);
                    }
                    if buf.len() > max_samples {
                        let drain_count = buf.len() - max_samples;
                        buf.drain(..drain_count);
                    }
                }
            },
            move |err| {
                // Ignore if the capture thread already went away
                let _ = error_tx.send(format!("Audio capture error: {}", err));
            },
            None,
        )
        .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to build input stream: {}", e)))
}

// =============================================================================
// Audio Playback
// =============================================================================

/// Speaker stream fed one 20ms block at a time from a [`PlaybackQueue`]
///
/// Requires a 48kHz output config. Mono blocks are copied to every channel.
pub struct AudioPlayback {
    /// The cpal output stream
    _stream: Stream,
    /// Receiver for audio stream errors
    error_rx: std_mpsc::Receiver<String>,
}

impl AudioPlayback {
    /// Open and start playback on the given device
    ///
    /// # Arguments
    /// * `device_id` - Device id, or `None` for the system default
    /// * `source` - FIFO the device callback pulls blocks from
    pub fn new(device_id: Option<&str>, source: Arc<PlaybackQueue>) -> Result<Self, VoiceError> {
        let host = get_host();
        let device = find_output_device(&host, device_id).ok_or_else(|| {
            VoiceError::DeviceUnavailable(format!(
                "Output device not found: {}",
                device_id.unwrap_or("default")
            ))
        })?;

        let configs: Vec<SupportedStreamConfigRange> = device
            .supported_output_configs()
            .map_err(|e| {
                VoiceError::DeviceUnavailable(format!("Failed to get supported configs: {}", e))
            })?
            .collect();

        let (channels, sample_format) = pick_voice_config(&configs).ok_or_else(|| {
            VoiceError::DeviceUnavailable(format!(
                "Output device doesn't support 48kHz. Device supports: {}",
                describe_rates(&configs)
            ))
        })?;

        let config = StreamConfig {
            channels,
            sample_rate: VOICE_SAMPLE_RATE,
            buffer_size: cpal::BufferSize::Default,
        };

        let (error_tx, error_rx) = std_mpsc::channel();

        let stream = match sample_format {
            SampleFormat::F32 => build_output_stream::<f32>(&device, &config, source, error_tx),
            SampleFormat::I16 => build_output_stream::<i16>(&device, &config, source, error_tx),
            SampleFormat::U16 => build_output_stream::<u16>(&device, &config, source, error_tx),
            other => {
                return Err(VoiceError::DeviceUnavailable(format!(
                    "Unsupported sample format: {:?}",
                    other
                )));
            }
        }?;

        stream.play().map_err(|e| {
            VoiceError::DeviceUnavailable(format!("Failed to start playback: {}", e))
        })?;

        debug!(channels, ?sample_format, "output stream started");

        Ok(Self {
            _stream: stream,
            error_rx,
        })
    }
}

impl OutputStream for AudioPlayback {
    fn take_error(&mut self) -> Option<String> {
        self.error_rx.try_recv().ok()
    }
}

/// Build an output stream that serves queue blocks at any device buffer size
fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    source: Arc<PlaybackQueue>,
    error_tx: std_mpsc::Sender<String>,
) -> Result<Stream, VoiceError>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut block = vec![0.0f32; VOICE_SAMPLES_PER_FRAME as usize];
    let mut pos = block.len();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_exact_mut(channels) {
                    if pos >= block.len() {
                        source.fill(&mut block);
                        pos = 0;
                    }
                    let sample = T::from_sample(block[pos]);
                    pos += 1;
                    for dst in frame.iter_mut() {
                        *dst = sample;
                    }
                }
            },
            move |err| {
                let _ = error_tx.send(format!("Audio playback error: {}", err));
            },
            None,
        )
        .map_err(|e| {
            VoiceError::DeviceUnavailable(format!("Failed to build output stream: {}", e))
        })
}

// =============================================================================
// Tests
// =============================================================================

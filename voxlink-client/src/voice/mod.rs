//! Voice chat audio system
//!
//! This module provides client-side audio for voice chat:
//! - Audio device enumeration and selection
//! - Microphone capture with RMS voice activity gating
//! - Speaker playback from a bounded FIFO
//! - Resampling and clip-guarding to the 48kHz mono pipeline format
//! - Per-speaker activity indicators
//! - Microphone testing for settings

pub mod activity;
pub mod audio;
pub mod capture;
pub mod playback;
pub mod resample;
pub mod worker;

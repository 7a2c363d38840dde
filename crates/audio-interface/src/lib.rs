//! Collaborator boundaries for the native audio layer.
//!
//! The core never touches a device directly; it consumes these traits. The
//! host application wires in platform implementations (or test doubles).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const SAMPLE_RATE: u32 = 16_000;

/// Fixed-size PCM16 chunk produced by the microphone.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub buffer: Bytes,
    pub byte_size: usize,
}

impl AudioChunk {
    pub fn new(buffer: Bytes) -> Self {
        let byte_size = buffer.len();
        Self { buffer, byte_size }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("native audio module unavailable")]
    ModuleUnavailable,
    #[error("audio device error: {0}")]
    Device(String),
}

pub trait CaptureObserver: Send + Sync {
    fn on_audio_chunk(&self, chunk: AudioChunk);
    fn on_status_change(&self, is_recording: bool);
    fn on_error(&self, error: AudioError);
}

pub trait CaptureSource: Send + Sync {
    fn start(&mut self, observer: Arc<dyn CaptureObserver>) -> Result<(), AudioError>;
    fn stop(&mut self) -> BoxFuture<'_, Result<(), AudioError>>;
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackStatus {
    pub is_playing: bool,
    pub buffered: usize,
}

/// Gapless playback sink for the downstream audio feed. Chunks arrive
/// base64-encoded, matching the native module's API.
pub trait PlaybackSink: Send + Sync {
    fn initialize(&self, config: PlaybackConfig) -> BoxFuture<'_, Result<(), AudioError>>;
    fn stream_chunk(&self, base64_pcm: String) -> BoxFuture<'_, Result<(), AudioError>>;
    fn start(&self) -> BoxFuture<'_, Result<(), AudioError>>;
    fn stop(&self) -> BoxFuture<'_, Result<(), AudioError>>;
    fn flush(&self) -> BoxFuture<'_, Result<(), AudioError>>;
    fn status(&self) -> PlaybackStatus;
}

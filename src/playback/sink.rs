//! Injected audio-sink seam.
//!
//! The voice-channel transport lives behind this trait; the pipeline only
//! needs "accept bytes, signal when done."

use async_trait::async_trait;
use thiserror::Error;

/// Error returned by the audio sink for one segment.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SinkError {
    pub message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// An audio output.
///
/// `play` resolves once the audio has finished playing (or the sink gave
/// up). Exactly one call is in flight at a time; the playback worker waits
/// for it before advancing.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, audio: &[u8]) -> Result<(), SinkError>;
}

//! Injected speech-synthesis provider seam.
//!
//! Transport, auth, and codec details live behind this trait; the pipeline
//! only consumes the request/response contract.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::VoiceParams;

/// Error returned by a synthesis provider call.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SynthesisError {
    pub message: String,
}

impl SynthesisError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// A speech-synthesis backend.
///
/// Calls may block on network I/O; the queue manager runs them on bounded
/// background workers and applies its own timeout around every call.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` into opaque encoded audio bytes.
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>, SynthesisError>;
}

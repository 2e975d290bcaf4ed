//! Pipeline error taxonomy.
//!
//! Synthesis and playback errors are absorbed inside their components
//! (failure policy / skip-to-next) and reported through events; they never
//! abort a session. `Cancelled` is a control signal, not a failure.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The parser accumulated unterminated text past its safety valve.
    /// Fatal for the session: the upstream is producing pathological input.
    #[error("parse buffer overflow: {buffered} chars buffered, limit {limit}")]
    ParseBufferOverflow { buffered: usize, limit: usize },

    /// A synthesis call exceeded the configured timeout.
    #[error("synthesis timed out after {timeout:?} for sequence {sequence}")]
    SynthesisTimeout { sequence: u64, timeout: Duration },

    /// The synthesis provider returned an error.
    #[error("synthesis provider error for sequence {sequence}: {message}")]
    SynthesisProvider { sequence: u64, message: String },

    /// The audio sink failed while playing one segment.
    #[error("playback sink error for sequence {sequence}: {message}")]
    PlaybackSink { sequence: u64, message: String },

    /// Work was discarded because the session was cancelled or interrupted.
    #[error("cancellation requested")]
    Cancelled,

    /// Session construction was given an unusable configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    /// Whether this value is a cancellation control signal rather than a
    /// genuine failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

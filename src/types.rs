//! Core data model shared across the pipeline stages.
//!
//! Sequence numbers are assigned once, at parser-emit time, and are the only
//! ordering authority in the pipeline: synthesis may complete out of order,
//! but playback restores sequence order before anything reaches the sink.

use std::time::{Duration, Instant};

/// One semantic unit of text (normally a sentence) emitted by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Strictly increasing per session, assigned at emission
    pub sequence: u64,
    /// Trimmed sentence text
    pub text: String,
}

impl TextChunk {
    pub fn new(sequence: u64, text: impl Into<String>) -> Self {
        Self { sequence, text: text.into() }
    }
}

/// Voice parameters forwarded verbatim to the synthesis provider.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceParams {
    /// Provider-specific voice identifier (e.g., "af_bella")
    pub voice_id: String,
    /// Speech speed multiplier (1.0 = normal)
    pub speed: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self { voice_id: "default".to_string(), speed: 1.0 }
    }
}

/// Lifecycle of a synthesis task inside the queue manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A unit of synthesis work. Owned exclusively by the queue manager until it
/// hands off an [`AudioSegment`] (or gives up on the chunk).
#[derive(Debug, Clone)]
pub struct SynthesisTask {
    pub sequence: u64,             // Matches the source TextChunk
    pub text: String,              // Text to synthesize
    pub voice: VoiceParams,        // Voice parameters for the provider
    pub status: TaskStatus,        // Current lifecycle state
    pub retry_count: u32,          // Failed attempts so far (not shared across chunks)
}

impl SynthesisTask {
    pub fn new(chunk: TextChunk, voice: VoiceParams) -> Self {
        Self { sequence: chunk.sequence, text: chunk.text, voice, status: TaskStatus::Queued, retry_count: 0 }
    }

    /// Recover the original chunk, e.g. when a cancelled task's text is
    /// re-submitted as part of a fallback request.
    pub fn into_chunk(self) -> TextChunk {
        TextChunk { sequence: self.sequence, text: self.text }
    }
}

/// Synthesized audio for one chunk. Ownership transfers to the playback
/// queue on enqueue.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    pub sequence: u64,          // Matches the source chunk
    pub audio: Vec<u8>,         // Opaque encoded audio bytes for the sink
    pub source_text: String,    // Text this audio speaks (for logging/events)
    pub synth_latency: Duration, // Wall-clock time the successful attempt took
}

/// An audio segment waiting in the playback reorder buffer.
#[derive(Debug)]
pub struct PlaybackItem {
    pub segment: AudioSegment,
    /// When the segment entered the playback queue (drives the queue-wait metric)
    pub enqueued_at: Instant,
}

impl PlaybackItem {
    pub fn new(segment: AudioSegment) -> Self {
        Self { segment, enqueued_at: Instant::now() }
    }
}

//! Metrics recording hooks and built-in session counters.
//!
//! The embedding application injects a [`PipelineMetrics`] implementation to
//! forward measurements to its own sink; every hook defaults to a no-op so
//! tests and simple callers can ignore the whole surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Recording hooks fired at the pipeline's observable moments.
///
/// Implementations must be cheap and non-blocking; hooks fire on the hot
/// paths of the synthesis workers and the playback worker.
pub trait PipelineMetrics: Send + Sync {
    /// A sentence boundary was detected and a chunk emitted.
    fn chunk_detected(&self, _sequence: u64, _chars: usize) {}

    /// A synthesis attempt started for a task.
    fn synthesis_started(&self, _sequence: u64) {}

    /// A synthesis task produced audio.
    fn synthesis_completed(&self, _sequence: u64, _latency: Duration) {}

    /// A synthesis task was given up on (after its failure policy ran).
    fn synthesis_failed(&self, _sequence: u64) {}

    /// A failed attempt is being re-run.
    fn retry_attempted(&self, _sequence: u64, _attempt: u32) {}

    /// Time a segment spent in the playback queue before reaching the sink.
    fn playback_queue_wait(&self, _sequence: u64, _waited: Duration) {}

    /// A segment finished playing.
    fn playback_completed(&self, _sequence: u64) {}

    /// The caller interrupted the response.
    fn interruption_triggered(&self) {}
}

/// Metrics sink that records nothing.
#[derive(Debug, Default)]
pub struct NullMetrics;

impl PipelineMetrics for NullMetrics {}

/// Built-in counting recorder, one per session.
///
/// Cheap atomic counters; useful for tests and for the partial-response
/// accounting the failure policies need (`sentences_failed`).
#[derive(Debug, Default)]
pub struct SessionStats {
    chunks_emitted: AtomicU64,
    sentences_synthesized: AtomicU64,
    sentences_failed: AtomicU64,
    retries: AtomicU64,
    segments_played: AtomicU64,
    interruptions: AtomicU64,
}

impl SessionStats {
    pub fn chunks_emitted(&self) -> u64 {
        self.chunks_emitted.load(Ordering::Relaxed)
    }

    pub fn sentences_synthesized(&self) -> u64 {
        self.sentences_synthesized.load(Ordering::Relaxed)
    }

    pub fn sentences_failed(&self) -> u64 {
        self.sentences_failed.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn segments_played(&self) -> u64 {
        self.segments_played.load(Ordering::Relaxed)
    }

    pub fn interruptions(&self) -> u64 {
        self.interruptions.load(Ordering::Relaxed)
    }
}

impl PipelineMetrics for SessionStats {
    fn chunk_detected(&self, _sequence: u64, _chars: usize) {
        self.chunks_emitted.fetch_add(1, Ordering::Relaxed);
    }

    fn synthesis_completed(&self, _sequence: u64, _latency: Duration) {
        self.sentences_synthesized.fetch_add(1, Ordering::Relaxed);
    }

    fn synthesis_failed(&self, _sequence: u64) {
        self.sentences_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn retry_attempted(&self, _sequence: u64, _attempt: u32) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn playback_completed(&self, _sequence: u64) {
        self.segments_played.fetch_add(1, Ordering::Relaxed);
    }

    fn interruption_triggered(&self) {
        self.interruptions.fetch_add(1, Ordering::Relaxed);
    }
}

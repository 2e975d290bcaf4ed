//! Strict-order, interruptible audio playback.
//!
//! A reorder buffer restores sequence order over the synthesis stage's
//! unordered completions; a single worker serializes output to the sink.

mod queue;
mod sink;

pub use queue::{PlaybackEvent, PlaybackQueue};
pub use sink::{AudioSink, SinkError};

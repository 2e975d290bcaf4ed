//! Real-time spoken-response pipeline.
//!
//! Turns a token-by-token text stream into audible speech with low latency:
//! an incremental [`parser::SentenceParser`] detects sentence boundaries as
//! text arrives, a [`synth::SynthesisQueueManager`] synthesizes sentences on
//! a bounded worker pool (completions may arrive out of order), and a
//! [`playback::PlaybackQueue`] restores sequence order before handing audio
//! to the sink, one segment at a time, with support for interrupting
//! mid-response.
//!
//! The synthesis provider and the audio sink are injected behind traits;
//! everything here is per-session and in-memory.

pub mod config;
pub mod error;
pub mod metrics;
pub mod parser;
pub mod playback;
pub mod session;
pub mod synth;
pub mod types;

pub use config::{ErrorStrategy, InterruptionStrategy, PipelineConfig};
pub use error::PipelineError;
pub use metrics::{NullMetrics, PipelineMetrics, SessionStats};
pub use parser::SentenceParser;
pub use playback::{AudioSink, PlaybackEvent, PlaybackQueue, SinkError};
pub use session::{ResponseSession, SessionEvent};
pub use synth::{SpeechSynthesizer, SynthEvent, SynthesisError, SynthesisQueueManager, TaskHandle};
pub use types::{AudioSegment, TextChunk, VoiceParams};

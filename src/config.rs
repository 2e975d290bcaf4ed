//! Pipeline configuration consumed at session construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::VoiceParams;

/// What to do when a synthesis task fails after its attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    /// Drop the failed chunk and keep going (default)
    #[default]
    Skip,
    /// Re-run the same task up to `max_retries` times, then skip
    Retry,
    /// First failure cancels all remaining synthesis for the response;
    /// the dropped remainder may be re-synthesized as one plain request
    Fallback,
}

impl std::fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorStrategy::Skip => write!(f, "skip"),
            ErrorStrategy::Retry => write!(f, "retry"),
            ErrorStrategy::Fallback => write!(f, "fallback"),
        }
    }
}

/// How playback is truncated when the caller interrupts the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterruptionStrategy {
    /// Stop the current segment mid-play; discard everything else (default)
    #[default]
    Immediate,
    /// Let the current segment finish; discard everything else
    Graceful,
    /// Let the current segment plus up to `drain_limit` further eligible
    /// segments play in order, then discard the rest
    Drain,
}

impl std::fmt::Display for InterruptionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterruptionStrategy::Immediate => write!(f, "immediate"),
            InterruptionStrategy::Graceful => write!(f, "graceful"),
            InterruptionStrategy::Drain => write!(f, "drain"),
        }
    }
}

/// Abbreviations whose trailing period never ends a sentence.
/// Stored lowercase without the trailing period.
fn default_abbreviations() -> Vec<String> {
    ["mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e", "approx", "no", "fig"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Per-session pipeline configuration.
///
/// One instance is consumed per [`crate::session::ResponseSession`]; there is
/// no process-wide configuration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Minimum chunk length in characters; shorter fragments are merged
    /// into the following chunk
    pub min_chunk_length: usize,

    /// Safety valve for unterminated text accumulating in the parser
    pub max_buffered_chars: usize,

    /// Abbreviation list for the parser (lowercase, no trailing period)
    #[serde(default = "default_abbreviations")]
    pub abbreviations: Vec<String>,

    /// Maximum simultaneous in-flight synthesis calls
    pub max_concurrent: usize,

    /// Failure policy for synthesis tasks
    pub error_strategy: ErrorStrategy,

    /// Retry attempts per task under the retry strategy
    pub max_retries: u32,

    /// Timeout applied to every synthesis call
    #[serde(with = "duration_millis")]
    pub synthesis_timeout: Duration,

    /// Truncation policy applied by `interrupt()`
    pub interruption_strategy: InterruptionStrategy,

    /// Extra eligible segments allowed to play under the drain strategy
    pub drain_limit: usize,

    /// Voice parameters forwarded to the synthesis provider
    #[serde(skip)]
    pub voice: VoiceParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_chunk_length: 0,
            max_buffered_chars: 8192,
            abbreviations: default_abbreviations(),
            max_concurrent: 3,
            error_strategy: ErrorStrategy::default(),
            max_retries: 2,
            synthesis_timeout: Duration::from_secs(10),
            interruption_strategy: InterruptionStrategy::default(),
            drain_limit: 2,
            voice: VoiceParams::default(),
        }
    }
}

impl PipelineConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be at least 1".to_string());
        }
        if self.max_buffered_chars == 0 {
            return Err("max_buffered_chars must be at least 1".to_string());
        }
        if self.min_chunk_length > self.max_buffered_chars {
            return Err("min_chunk_length cannot exceed max_buffered_chars".to_string());
        }
        if self.synthesis_timeout.is_zero() {
            return Err("synthesis_timeout must be non-zero".to_string());
        }
        Ok(())
    }

    /// Log the effective configuration at session start.
    pub fn log_config(&self) {
        info!("Pipeline config: min_chunk_length={}, max_concurrent={}, timeout={:?}", self.min_chunk_length, self.max_concurrent, self.synthesis_timeout);
        info!("Failure policy: {} (max_retries={}), interruption: {} (drain_limit={})", self.error_strategy, self.max_retries, self.interruption_strategy, self.drain_limit);
    }
}

/// Serde helper: serialize `Duration` as integer milliseconds.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

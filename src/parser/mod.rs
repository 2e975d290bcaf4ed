//! Incremental sentence segmentation.
//!
//! Turns a token-by-token text stream into sentence-sized chunks suitable
//! for streaming speech synthesis.

mod sentence;

pub use sentence::SentenceParser;

//! Speech synthesis scheduling.
//!
//! A bounded-concurrency queue manager drives an injected provider; results
//! are delivered as events and may complete out of submission order.

mod provider;
mod queue;

pub use provider::{SpeechSynthesizer, SynthesisError};
pub use queue::{CancelOutcome, SynthEvent, SynthesisQueueManager, TaskHandle};

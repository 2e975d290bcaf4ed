//! Per-session pipeline orchestration.
//!
//! One [`ResponseSession`] per conversation turn: it owns one parser, one
//! synthesis queue manager, and one playback queue, plus the routing task
//! that moves unordered synthesis completions into the ordered playback
//! queue. Nothing here is shared between sessions; a new response means a
//! new session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ErrorStrategy, InterruptionStrategy, PipelineConfig};
use crate::error::PipelineError;
use crate::metrics::{NullMetrics, PipelineMetrics, SessionStats};
use crate::parser::SentenceParser;
use crate::playback::{AudioSink, PlaybackEvent, PlaybackQueue};
use crate::synth::{SpeechSynthesizer, SynthEvent, SynthesisQueueManager};
use crate::types::{AudioSegment, TextChunk, VoiceParams};

/// User-facing notifications for the embedding application.
#[derive(Debug)]
pub enum SessionEvent {
    /// A sentence finished playing through the sink
    SentenceSpoken { sequence: u64, text: String },
    /// A sentence was dropped after its synthesis failure policy ran
    SentenceFailed { sequence: u64, error: PipelineError },
    /// The sink failed on one segment; playback continued past it
    PlaybackError { sequence: u64, error: PipelineError },
}

/// Forwards every metric to the caller's sink and to the session's own
/// counters.
struct FanoutMetrics {
    user: Arc<dyn PipelineMetrics>,
    stats: Arc<SessionStats>,
}

impl PipelineMetrics for FanoutMetrics {
    fn chunk_detected(&self, sequence: u64, chars: usize) {
        self.user.chunk_detected(sequence, chars);
        self.stats.chunk_detected(sequence, chars);
    }

    fn synthesis_started(&self, sequence: u64) {
        self.user.synthesis_started(sequence);
        self.stats.synthesis_started(sequence);
    }

    fn synthesis_completed(&self, sequence: u64, latency: Duration) {
        self.user.synthesis_completed(sequence, latency);
        self.stats.synthesis_completed(sequence, latency);
    }

    fn synthesis_failed(&self, sequence: u64) {
        self.user.synthesis_failed(sequence);
        self.stats.synthesis_failed(sequence);
    }

    fn retry_attempted(&self, sequence: u64, attempt: u32) {
        self.user.retry_attempted(sequence, attempt);
        self.stats.retry_attempted(sequence, attempt);
    }

    fn playback_queue_wait(&self, sequence: u64, waited: Duration) {
        self.user.playback_queue_wait(sequence, waited);
        self.stats.playback_queue_wait(sequence, waited);
    }

    fn playback_completed(&self, sequence: u64) {
        self.user.playback_completed(sequence);
        self.stats.playback_completed(sequence);
    }

    fn interruption_triggered(&self) {
        self.user.interruption_triggered();
        self.stats.interruption_triggered();
    }
}

/// Everything the routing task needs besides its two event receivers.
struct RouterCtx {
    manager: Arc<SynthesisQueueManager>,
    playback: Arc<PlaybackQueue>,
    provider: Arc<dyn SpeechSynthesizer>,
    out: mpsc::UnboundedSender<SessionEvent>,
    strategy: ErrorStrategy,
    voice: VoiceParams,
    timeout: Duration,
}

/// One spoken response: streaming text in, ordered speech out.
pub struct ResponseSession {
    parser: SentenceParser,
    manager: Arc<SynthesisQueueManager>,
    playback: Arc<PlaybackQueue>,
    metrics: Arc<dyn PipelineMetrics>,
    stats: Arc<SessionStats>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    router: Option<JoinHandle<()>>,
    interruption_strategy: InterruptionStrategy,
    drain_limit: usize,
    finished: bool,
}

impl ResponseSession {
    /// Create a session with no external metrics sink.
    ///
    /// # Errors
    /// `InvalidConfig` if the configuration fails validation.
    pub fn new(provider: Arc<dyn SpeechSynthesizer>, sink: Arc<dyn AudioSink>, config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::with_metrics(provider, sink, config, Arc::new(NullMetrics))
    }

    /// Create a session forwarding metrics to the given sink.
    ///
    /// # Errors
    /// `InvalidConfig` if the configuration fails validation.
    pub fn with_metrics(
        provider: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn AudioSink>,
        config: PipelineConfig,
        metrics: Arc<dyn PipelineMetrics>,
    ) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::InvalidConfig)?;
        config.log_config();

        let stats = Arc::new(SessionStats::default());
        let fanout: Arc<dyn PipelineMetrics> = Arc::new(FanoutMetrics { user: metrics, stats: stats.clone() });

        let (synth_tx, synth_rx) = mpsc::channel(64);
        let (play_tx, play_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(SynthesisQueueManager::new(provider.clone(), &config, fanout.clone(), synth_tx));
        let playback = Arc::new(PlaybackQueue::new(sink, fanout.clone(), play_tx));

        let ctx = RouterCtx {
            manager: manager.clone(),
            playback: playback.clone(),
            provider,
            out: out_tx,
            strategy: config.error_strategy,
            voice: config.voice.clone(),
            timeout: config.synthesis_timeout,
        };
        let router = tokio::spawn(route_events(synth_rx, play_rx, ctx));

        Ok(Self {
            parser: SentenceParser::new(&config),
            manager,
            playback,
            metrics: fanout,
            stats,
            events: out_rx,
            router: Some(router),
            interruption_strategy: config.interruption_strategy,
            drain_limit: config.drain_limit,
            finished: false,
        })
    }

    /// Feed a token delta from the upstream text source. Any completed
    /// sentences are admitted to synthesis immediately.
    ///
    /// # Errors
    /// `ParseBufferOverflow` if unterminated text exceeds the buffer limit.
    pub fn push_text(&mut self, delta: &str) -> Result<(), PipelineError> {
        for chunk in self.parser.add_chunk(delta)? {
            self.metrics.chunk_detected(chunk.sequence, chunk.text.chars().count());
            debug!("Chunk #{} admitted for synthesis: \"{}\"", chunk.sequence, chunk.text);
            self.manager.enqueue(chunk);
        }
        Ok(())
    }

    /// The upstream stream ended: flush the parser remainder and stop
    /// accepting work.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let Some(chunk) = self.parser.finalize() {
            self.metrics.chunk_detected(chunk.sequence, chunk.text.chars().count());
            debug!("Final chunk #{} admitted for synthesis: \"{}\"", chunk.sequence, chunk.text);
            self.manager.enqueue(chunk);
        }
        self.manager.close();
    }

    /// Truncate the response with the configured interruption strategy
    /// (e.g. because new user speech was detected). Terminal for this
    /// session: remaining synthesis is cancelled, playback is truncated.
    pub fn interrupt(&self) {
        info!("⏸️  Response interrupted ({})", self.interruption_strategy);
        self.metrics.interruption_triggered();
        self.manager.cancel_all();
        self.playback.interrupt(self.interruption_strategy, self.drain_limit);
    }

    /// Receive the next user-facing event; `None` once the session has
    /// fully drained after `shutdown` began.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Non-blocking variant of [`next_event`](Self::next_event).
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    /// The session's counters (chunks emitted, failures, retries, ...).
    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// Cooperative teardown: wait for synthesis and playback to drain, then
    /// for the routing task to exit. Returns the final counters.
    pub async fn shutdown(mut self) -> Arc<SessionStats> {
        if !self.finished {
            self.finish();
        }
        self.manager.join().await;
        if let Some(router) = self.router.take()
            && router.await.is_err()
        {
            warn!("Session router panicked");
        }
        self.playback.join().await;
        info!("✅ Session finished: {} spoken, {} failed", self.stats.segments_played(), self.stats.sentences_failed());
        self.stats.clone()
    }
}

impl Drop for ResponseSession {
    fn drop(&mut self) {
        // Dropped without shutdown: stop the background tasks so they do
        // not idle forever on open channels
        if self.router.is_some() {
            self.manager.cancel_all();
            self.playback.interrupt(InterruptionStrategy::Immediate, 0);
            self.playback.close();
        }
    }
}

/// Routing task: moves synthesis completions into the playback queue,
/// applies the fallback policy, and forwards per-sentence notifications to
/// the session's event stream.
async fn route_events(mut synth_rx: mpsc::Receiver<SynthEvent>, mut play_rx: mpsc::Receiver<PlaybackEvent>, ctx: RouterCtx) {
    let mut synth_open = true;
    let mut play_open = true;

    while synth_open || play_open {
        tokio::select! {
            event = synth_rx.recv(), if synth_open => match event {
                Some(SynthEvent::Completed { segment }) => ctx.playback.enqueue(segment),
                Some(SynthEvent::Failed { sequence, text, error }) => handle_synthesis_failure(&ctx, sequence, text, error).await,
                None => {
                    // All synthesis senders gone: nothing more will arrive
                    synth_open = false;
                    ctx.playback.close();
                }
            },
            event = play_rx.recv(), if play_open => match event {
                Some(PlaybackEvent::Finished { sequence, source_text }) => {
                    let _ = ctx.out.send(SessionEvent::SentenceSpoken { sequence, text: source_text });
                }
                Some(PlaybackEvent::SinkError { sequence, error }) => {
                    let _ = ctx.out.send(SessionEvent::PlaybackError { sequence, error });
                }
                None => play_open = false,
            },
        }
    }
    debug!("Session router finished");
}

/// A task was given up on. Under skip/retry the sequence becomes a playback
/// gap; under fallback all remaining synthesis is cancelled and every
/// unspoken sentence (the failed one, discarded in-flight ones, and the
/// still-queued remainder) is re-synthesized as one plain request under the
/// smallest unspoken sequence number (keeps the playback cursor contiguous).
async fn handle_synthesis_failure(ctx: &RouterCtx, sequence: u64, text: String, error: PipelineError) {
    let _ = ctx.out.send(SessionEvent::SentenceFailed { sequence, error });

    if ctx.strategy != ErrorStrategy::Fallback {
        ctx.playback.mark_unplayable(sequence);
        return;
    }

    let outcome = ctx.manager.cancel_all();

    let mut pieces = vec![TextChunk::new(sequence, text)];
    pieces.extend(outcome.discarded_inflight);
    pieces.extend(outcome.dropped);
    pieces.sort_unstable_by_key(|c| c.sequence);

    let fallback_sequence = pieces[0].sequence;
    let remainder = pieces.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join(" ");
    for chunk in &pieces[1..] {
        ctx.playback.mark_unplayable(chunk.sequence);
    }

    info!("Fallback: synthesizing remaining {} chars as one request", remainder.chars().count());
    let started = Instant::now();
    match tokio::time::timeout(ctx.timeout, ctx.provider.synthesize(&remainder, &ctx.voice)).await {
        Ok(Ok(audio)) => {
            ctx.playback.enqueue(AudioSegment { sequence: fallback_sequence, audio, source_text: remainder, synth_latency: started.elapsed() });
        }
        Ok(Err(e)) => {
            warn!("❌ Fallback synthesis failed: {}", e);
            ctx.playback.mark_unplayable(fallback_sequence);
            let _ = ctx.out.send(SessionEvent::SentenceFailed {
                sequence: fallback_sequence,
                error: PipelineError::SynthesisProvider { sequence: fallback_sequence, message: e.message },
            });
        }
        Err(_) => {
            warn!("❌ Fallback synthesis timed out");
            ctx.playback.mark_unplayable(fallback_sequence);
            let _ = ctx.out.send(SessionEvent::SentenceFailed {
                sequence: fallback_sequence,
                error: PipelineError::SynthesisTimeout { sequence: fallback_sequence, timeout: ctx.timeout },
            });
        }
    }
}

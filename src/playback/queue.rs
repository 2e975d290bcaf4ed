//! Strict-order playback queue with a sequence-indexed reorder buffer.
//!
//! Segments may be enqueued in any order; nothing reaches the sink out of
//! sequence order. A sequence number that will never produce audio (failed
//! synthesis) must be tombstoned via `mark_unplayable` or the cursor would
//! stall on the gap forever.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::InterruptionStrategy;
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::playback::sink::AudioSink;
use crate::types::{AudioSegment, PlaybackItem};

/// Per-segment playback notification.
#[derive(Debug)]
pub enum PlaybackEvent {
    /// A segment finished playing
    Finished { sequence: u64, source_text: String },
    /// The sink failed for one segment; playback proceeds to the next
    SinkError { sequence: u64, error: PipelineError },
}

enum Slot {
    Item(PlaybackItem),
    /// This sequence number will never produce audio
    Gap,
}

struct Reorder {
    next_expected: u64,
    buffer: BTreeMap<u64, Slot>,
}

struct State {
    reorder: Mutex<Reorder>,
    stopped: AtomicBool,       // Interrupted: no new segments become eligible
    allowance: AtomicI64,      // Eligible segments still allowed to play after an interrupt
    hard_stop: CancellationToken, // Immediate interrupt: abandon the in-flight play
}

/// Strict-order, interruptible audio emitter for one session.
pub struct PlaybackQueue {
    state: Arc<State>,
    ready_tx: Mutex<Option<mpsc::UnboundedSender<PlaybackItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackQueue {
    /// Create the queue and start its single playback worker. Completion
    /// and sink-error notifications are sent on `events`.
    pub fn new(sink: Arc<dyn AudioSink>, metrics: Arc<dyn PipelineMetrics>, events: mpsc::Sender<PlaybackEvent>) -> Self {
        let state = Arc::new(State {
            reorder: Mutex::new(Reorder { next_expected: 0, buffer: BTreeMap::new() }),
            stopped: AtomicBool::new(false),
            allowance: AtomicI64::new(0),
            hard_stop: CancellationToken::new(),
        });

        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(state.clone(), ready_rx, sink, metrics, events));

        Self { state, ready_tx: Mutex::new(Some(ready_tx)), worker: Mutex::new(Some(worker)) }
    }

    /// Hand a synthesized segment to the queue. If it is the next expected
    /// sequence it (and any buffered successors now in line) goes straight
    /// to the worker; otherwise it waits in the reorder buffer.
    pub fn enqueue(&self, segment: AudioSegment) {
        if self.state.stopped.load(Ordering::Relaxed) {
            debug!("Dropping segment #{}: playback stopped", segment.sequence);
            return;
        }
        let sequence = segment.sequence;
        let mut reorder = self.state.reorder.lock();
        if sequence < reorder.next_expected {
            warn!("Stale segment #{} (next expected {}), dropping", sequence, reorder.next_expected);
            return;
        }
        reorder.buffer.insert(sequence, Slot::Item(PlaybackItem::new(segment)));
        self.drain_eligible(&mut reorder);
    }

    /// Tombstone a sequence number that will never produce audio, so the
    /// cursor can advance past the gap.
    pub fn mark_unplayable(&self, sequence: u64) {
        if self.state.stopped.load(Ordering::Relaxed) {
            return;
        }
        let mut reorder = self.state.reorder.lock();
        if sequence < reorder.next_expected {
            return;
        }
        debug!("Sequence #{} marked unplayable", sequence);
        reorder.buffer.insert(sequence, Slot::Gap);
        self.drain_eligible(&mut reorder);
    }

    /// Forward every contiguous buffered slot starting at `next_expected`.
    /// Sends happen under the lock so the worker sees strict order.
    fn drain_eligible(&self, reorder: &mut Reorder) {
        let tx = self.ready_tx.lock();
        let Some(tx) = tx.as_ref() else { return };
        while let Some(slot) = reorder.buffer.remove(&reorder.next_expected) {
            reorder.next_expected += 1;
            match slot {
                Slot::Item(item) => {
                    if tx.send(item).is_err() {
                        debug!("Playback worker gone, dropping eligible segment");
                        return;
                    }
                }
                Slot::Gap => {}
            }
        }
    }

    /// Apply an interruption strategy. `drain_limit` only matters for
    /// [`InterruptionStrategy::Drain`].
    pub fn interrupt(&self, strategy: InterruptionStrategy, drain_limit: usize) {
        self.state.stopped.store(true, Ordering::SeqCst);
        let discarded = {
            let mut reorder = self.state.reorder.lock();
            let n = reorder.buffer.len();
            reorder.buffer.clear();
            n
        };

        match strategy {
            InterruptionStrategy::Immediate => {
                self.state.allowance.store(0, Ordering::SeqCst);
                self.state.hard_stop.cancel();
                info!("⏸️  Playback interrupted immediately ({} buffered segment(s) discarded)", discarded);
            }
            InterruptionStrategy::Graceful => {
                self.state.allowance.store(0, Ordering::SeqCst);
                info!("⏸️  Playback interrupted gracefully ({} buffered segment(s) discarded)", discarded);
            }
            InterruptionStrategy::Drain => {
                self.state.allowance.store(drain_limit as i64, Ordering::SeqCst);
                info!("⏸️  Playback draining up to {} segment(s) ({} buffered discarded)", drain_limit, discarded);
            }
        }
    }

    /// The sequence number the queue is currently waiting for.
    pub fn next_expected(&self) -> u64 {
        self.state.reorder.lock().next_expected
    }

    /// No further segments will arrive; the worker exits once drained.
    pub fn close(&self) {
        self.ready_tx.lock().take();
    }

    /// Wait for the playback worker to finish. Call after `close` (or an
    /// interruption).
    pub async fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && handle.await.is_err()
        {
            warn!("Playback worker panicked");
        }
    }
}

/// The single playback worker: one segment at a time, suspended on the sink
/// until it signals completion. A sink failure skips to the next eligible
/// segment; it never aborts the session.
async fn run_worker(
    state: Arc<State>,
    mut ready_rx: mpsc::UnboundedReceiver<PlaybackItem>,
    sink: Arc<dyn AudioSink>,
    metrics: Arc<dyn PipelineMetrics>,
    events: mpsc::Sender<PlaybackEvent>,
) {
    loop {
        let item = tokio::select! {
            _ = state.hard_stop.cancelled() => break,
            item = ready_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        // After an interrupt, each further eligible segment consumes the
        // drain allowance; immediate/graceful start with none
        if state.stopped.load(Ordering::Relaxed) && state.allowance.fetch_sub(1, Ordering::SeqCst) <= 0 {
            debug!("Drain allowance exhausted, discarding segment #{}", item.segment.sequence);
            break;
        }

        let sequence = item.segment.sequence;
        metrics.playback_queue_wait(sequence, item.enqueued_at.elapsed());
        info!("🔊 Playing segment #{} ({} bytes)", sequence, item.segment.audio.len());

        let result = tokio::select! {
            _ = state.hard_stop.cancelled() => {
                info!("⏸️  Segment #{} stopped mid-play", sequence);
                break;
            }
            result = sink.play(&item.segment.audio) => result,
        };

        match result {
            Ok(()) => {
                metrics.playback_completed(sequence);
                debug!("Segment #{} finished (\"{}\")", sequence, item.segment.source_text);
                if events.send(PlaybackEvent::Finished { sequence, source_text: item.segment.source_text }).await.is_err() {
                    debug!("Playback event channel closed");
                }
            }
            Err(e) => {
                warn!("❌ Sink error for segment #{}: {}", sequence, e);
                let error = PipelineError::PlaybackSink { sequence, message: e.message };
                if events.send(PlaybackEvent::SinkError { sequence, error }).await.is_err() {
                    debug!("Playback event channel closed");
                }
            }
        }
    }

    // Discard whatever is left after a stop
    let mut discarded = 0;
    while ready_rx.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        info!("🗑️  Discarded {} undelivered segment(s)", discarded);
    }
    debug!("Playback worker finished");
}

//! Bounded-concurrency synthesis scheduler.
//!
//! Tasks are admitted to a FIFO queue and dispatched to background workers
//! gated by a counting semaphore, so at most `max_concurrent` provider calls
//! are in flight. Completion order is NOT submission order; downstream
//! restores order by sequence number. Cancellation is cooperative: an
//! in-flight provider call is never aborted, its result is discarded on
//! arrival.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ErrorStrategy, PipelineConfig};
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::synth::provider::SpeechSynthesizer;
use crate::types::{AudioSegment, SynthesisTask, TaskStatus, TextChunk, VoiceParams};

/// Completion/error notification, delivered over the event channel instead
/// of direct callbacks.
#[derive(Debug)]
pub enum SynthEvent {
    /// A task produced audio (fires at most once per sequence number)
    Completed { segment: AudioSegment },
    /// A task was given up on after its failure policy ran. Carries the
    /// unprocessed text so a fallback caller can re-submit it.
    Failed { sequence: u64, text: String, error: PipelineError },
}

/// Handle returned by `enqueue`, reporting the task's lifecycle state.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    sequence: u64,
    status: Arc<Mutex<TaskStatus>>,
}

impl TaskHandle {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock()
    }
}

/// What `cancel_all` dropped: queued chunks (never started) and the chunks
/// of in-flight tasks whose results will be discarded on arrival. Both carry
/// their text so a fallback caller can re-submit everything unspoken.
#[derive(Debug, Default)]
pub struct CancelOutcome {
    pub dropped: Vec<TextChunk>,
    pub discarded_inflight: Vec<TextChunk>,
}

struct QueuedTask {
    task: SynthesisTask,
    status: Arc<Mutex<TaskStatus>>,
}

struct Shared {
    pending: Mutex<VecDeque<QueuedTask>>,
    wakeup: Notify,              // Single waiter: the dispatcher
    closed: AtomicBool,          // No further admissions
    hard_cancel: CancellationToken, // cancel_all: drop queued, discard in-flight
    inflight: Mutex<HashMap<u64, String>>, // Sequence -> text of dispatched tasks
    semaphore: Arc<Semaphore>,
    provider: Arc<dyn SpeechSynthesizer>,
    metrics: Arc<dyn PipelineMetrics>,
    voice: VoiceParams,
    timeout: Duration,
    strategy: ErrorStrategy,
    max_retries: u32,
    max_concurrent: usize,
}

/// Bounded-concurrency scheduler for one session's synthesis tasks.
pub struct SynthesisQueueManager {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SynthesisQueueManager {
    /// Create the manager and start its dispatcher task. Completion and
    /// failure events are sent on `events`.
    pub fn new(
        provider: Arc<dyn SpeechSynthesizer>,
        config: &PipelineConfig,
        metrics: Arc<dyn PipelineMetrics>,
        events: mpsc::Sender<SynthEvent>,
    ) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            closed: AtomicBool::new(false),
            hard_cancel: CancellationToken::new(),
            inflight: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            provider,
            metrics,
            voice: config.voice.clone(),
            timeout: config.synthesis_timeout,
            strategy: config.error_strategy,
            max_retries: config.max_retries,
            max_concurrent: config.max_concurrent,
        });

        let dispatcher = tokio::spawn(dispatch(shared.clone(), events));

        Self { shared, dispatcher: Mutex::new(Some(dispatcher)) }
    }

    /// Admit a chunk for synthesis. Non-blocking; FIFO by submission.
    pub fn enqueue(&self, chunk: TextChunk) -> TaskHandle {
        let task = SynthesisTask::new(chunk, self.shared.voice.clone());
        let sequence = task.sequence;
        let status = Arc::new(Mutex::new(TaskStatus::Queued));
        let handle = TaskHandle { sequence, status: status.clone() };

        if self.shared.hard_cancel.is_cancelled() || self.shared.closed.load(Ordering::Relaxed) {
            debug!("Dropping chunk #{}: synthesis queue no longer accepting work", sequence);
            *status.lock() = TaskStatus::Cancelled;
            return handle;
        }

        self.shared.pending.lock().push_back(QueuedTask { task, status });
        self.shared.wakeup.notify_one();
        handle
    }

    /// No further chunks will be enqueued; the dispatcher exits once the
    /// queue drains.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_one();
    }

    /// Drop all queued tasks and discard in-flight results when they arrive.
    /// Terminal for this session's synthesis.
    pub fn cancel_all(&self) -> CancelOutcome {
        let dropped = drain_pending_after(&self.shared, 0);
        self.shared.hard_cancel.cancel();
        let mut discarded_inflight: Vec<TextChunk> = self
            .shared
            .inflight
            .lock()
            .iter()
            .map(|(sequence, text)| TextChunk::new(*sequence, text.clone()))
            .collect();
        discarded_inflight.sort_unstable_by_key(|c| c.sequence);
        info!("🗑️  Cancelled synthesis: {} queued dropped, {} in-flight discarded", dropped.len(), discarded_inflight.len());
        CancelOutcome { dropped, discarded_inflight }
    }

    /// Drop everything still queued; in-flight tasks finish and deliver.
    pub fn cancel_pending(&self) -> Vec<TextChunk> {
        let dropped = drain_pending_after(&self.shared, 0);
        info!("🗑️  Cancelled {} queued synthesis task(s), in-flight continue", dropped.len());
        dropped
    }

    /// Keep the next `n` queued tasks (plus anything in flight); drop the
    /// rest.
    pub fn cancel_after(&self, n: usize) -> Vec<TextChunk> {
        let dropped = drain_pending_after(&self.shared, n);
        info!("🗑️  Kept {} queued synthesis task(s), dropped {}", n, dropped.len());
        dropped
    }

    /// Number of tasks admitted but not yet dispatched.
    pub fn queued(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Wait for the dispatcher (and thereby every worker) to finish.
    /// Call after `close` or `cancel_all`.
    pub async fn join(&self) {
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle
            && handle.await.is_err()
        {
            warn!("Synthesis dispatcher panicked");
        }
    }
}

/// Drop every queued task past the first `keep`, marking them cancelled.
fn drain_pending_after(shared: &Shared, keep: usize) -> Vec<TextChunk> {
    let mut pending = shared.pending.lock();
    let keep = keep.min(pending.len());
    pending
        .split_off(keep)
        .into_iter()
        .map(|q| {
            *q.status.lock() = TaskStatus::Cancelled;
            q.task.into_chunk()
        })
        .collect()
}

/// Dispatcher: pulls tasks in FIFO order, gated by the semaphore, and spawns
/// one worker per task. Exits when cancelled, or when closed and drained;
/// in the latter case it waits for every outstanding worker by acquiring the
/// full permit count.
async fn dispatch(shared: Arc<Shared>, events: mpsc::Sender<SynthEvent>) {
    loop {
        let permit = tokio::select! {
            _ = shared.hard_cancel.cancelled() => return,
            permit = shared.semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };

        let queued = loop {
            if let Some(q) = shared.pending.lock().pop_front() {
                break q;
            }
            if shared.closed.load(Ordering::SeqCst) {
                // Queue drained for good; wait for in-flight workers to finish
                drop(permit);
                let _ = shared.semaphore.acquire_many(shared.max_concurrent as u32).await;
                debug!("Synthesis dispatcher finished");
                return;
            }
            tokio::select! {
                _ = shared.hard_cancel.cancelled() => return,
                _ = shared.wakeup.notified() => {}
            }
        };

        shared.inflight.lock().insert(queued.task.sequence, queued.task.text.clone());
        tokio::spawn(run_task(shared.clone(), queued, permit, events.clone()));
    }
}

/// One worker: run the provider call under the timeout, apply the failure
/// policy, deliver exactly one Completed or Failed event (or nothing when
/// cancelled).
async fn run_task(shared: Arc<Shared>, queued: QueuedTask, permit: OwnedSemaphorePermit, events: mpsc::Sender<SynthEvent>) {
    let _permit = permit;
    let QueuedTask { mut task, status } = queued;
    let sequence = task.sequence;
    *status.lock() = TaskStatus::Running;
    task.status = TaskStatus::Running;

    let max_attempts = match shared.strategy {
        ErrorStrategy::Retry => shared.max_retries + 1,
        _ => 1,
    };

    let outcome = loop {
        shared.metrics.synthesis_started(sequence);
        let started = Instant::now();

        let result = tokio::select! {
            _ = shared.hard_cancel.cancelled() => {
                debug!("Discarding in-flight synthesis for chunk #{}", sequence);
                break None;
            }
            result = tokio::time::timeout(shared.timeout, shared.provider.synthesize(&task.text, &task.voice)) => result,
        };

        let error = match result {
            Ok(Ok(audio)) => {
                let synth_latency = started.elapsed();
                debug!("🎵 Synthesized chunk #{} ({} bytes, {:?})", sequence, audio.len(), synth_latency);
                shared.metrics.synthesis_completed(sequence, synth_latency);
                break Some(Ok(AudioSegment { sequence, audio, source_text: task.text.clone(), synth_latency }));
            }
            Ok(Err(e)) => PipelineError::SynthesisProvider { sequence, message: e.message },
            Err(_) => PipelineError::SynthesisTimeout { sequence, timeout: shared.timeout },
        };

        task.retry_count += 1;
        if task.retry_count < max_attempts {
            shared.metrics.retry_attempted(sequence, task.retry_count);
            warn!("Synthesis attempt {} failed for chunk #{}: {} - retrying", task.retry_count, sequence, error);
            continue;
        }

        shared.metrics.synthesis_failed(sequence);
        break Some(Err(error));
    };

    shared.inflight.lock().remove(&sequence);

    match outcome {
        Some(Ok(segment)) => {
            // Results completed during cancel_all are discarded, not delivered
            if shared.hard_cancel.is_cancelled() {
                *status.lock() = TaskStatus::Cancelled;
                debug!("Discarding completed synthesis for chunk #{}", sequence);
                return;
            }
            *status.lock() = TaskStatus::Completed;
            if events.send(SynthEvent::Completed { segment }).await.is_err() {
                debug!("Synthesis event channel closed");
            }
        }
        Some(Err(error)) => {
            // Failures completed during cancel_all are discarded too; a
            // spurious Failed event would trigger a pointless fallback
            if shared.hard_cancel.is_cancelled() {
                *status.lock() = TaskStatus::Cancelled;
                debug!("Discarding failed synthesis for chunk #{}", sequence);
                return;
            }
            *status.lock() = TaskStatus::Failed;
            warn!("❌ Synthesis gave up on chunk #{}: {}", sequence, error);
            if events.send(SynthEvent::Failed { sequence, text: task.text, error }).await.is_err() {
                debug!("Synthesis event channel closed");
            }
        }
        None => {
            *status.lock() = TaskStatus::Cancelled;
        }
    }
}

//! Cross-component pipeline tests with stub provider and sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use voice_pipeline::metrics::NullMetrics;
use voice_pipeline::synth::SynthEvent;
use voice_pipeline::{
    AudioSink, ErrorStrategy, PipelineConfig, ResponseSession, SessionEvent, SinkError, SpeechSynthesizer, SynthesisError,
    SynthesisQueueManager, TextChunk, VoiceParams,
};

/// Synthesis stub: fixed delay, concurrency instrumentation, and scripted
/// failures keyed on the text.
struct StubProvider {
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicU32,
    /// Fail any call whose text contains this marker
    fail_marker: Option<String>,
    /// Fail the first N calls regardless of text
    fail_first_calls: u32,
}

impl StubProvider {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicU32::new(0),
            fail_marker: None,
            fail_first_calls: 0,
        }
    }

    fn failing_on(delay: Duration, marker: &str) -> Self {
        Self { fail_marker: Some(marker.to_string()), ..Self::new(delay) }
    }

    fn failing_first(delay: Duration, n: u32) -> Self {
        Self { fail_first_calls: n, ..Self::new(delay) }
    }

    fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for StubProvider {
    async fn synthesize(&self, text: &str, _voice: &VoiceParams) -> Result<Vec<u8>, SynthesisError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        if call < self.fail_first_calls {
            return Err(SynthesisError::new("scripted failure (call count)"));
        }
        if let Some(marker) = &self.fail_marker
            && text.contains(marker)
        {
            return Err(SynthesisError::new("scripted failure (marker)"));
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// Sink stub recording what it was asked to speak, and when.
#[derive(Default)]
struct RecordingSink {
    played: Mutex<Vec<(String, Instant)>>,
}

impl RecordingSink {
    fn texts(&self) -> Vec<String> {
        self.played.lock().iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, audio: &[u8]) -> Result<(), SinkError> {
        let text = String::from_utf8_lossy(audio).into_owned();
        self.played.lock().push((text, Instant::now()));
        Ok(())
    }
}

fn make_session(provider: Arc<StubProvider>, sink: Arc<RecordingSink>, config: PipelineConfig) -> ResponseSession {
    ResponseSession::new(provider, sink, config).expect("valid config")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn bounded_concurrency_never_exceeds_limit() {
    let provider = Arc::new(StubProvider::new(Duration::from_millis(20)));
    let (tx, mut rx) = mpsc::channel(64);
    let config = PipelineConfig { max_concurrent: 3, ..Default::default() };
    let manager = SynthesisQueueManager::new(provider.clone(), &config, Arc::new(NullMetrics), tx);

    for i in 0..10 {
        manager.enqueue(TextChunk::new(i, format!("Sentence number {i}.")));
    }
    manager.close();
    manager.join().await;

    let mut completed = 0;
    while let Ok(event) = rx.try_recv() {
        assert!(matches!(event, SynthEvent::Completed { .. }));
        completed += 1;
    }
    assert_eq!(completed, 10);
    assert!(provider.peak_concurrency() <= 3, "peak in-flight was {}", provider.peak_concurrency());
    assert!(provider.peak_concurrency() >= 2, "expected real parallelism, peak was {}", provider.peak_concurrency());
}

#[tokio::test]
async fn out_of_order_completion_plays_in_order() {
    // Later sentences are much shorter, so they synthesize faster and
    // complete before their predecessors
    struct SkewedProvider;

    #[async_trait]
    impl SpeechSynthesizer for SkewedProvider {
        async fn synthesize(&self, text: &str, _voice: &VoiceParams) -> Result<Vec<u8>, SynthesisError> {
            tokio::time::sleep(Duration::from_millis(text.len() as u64)).await;
            Ok(text.as_bytes().to_vec())
        }
    }

    let sink = Arc::new(RecordingSink::default());
    let config = PipelineConfig { max_concurrent: 4, ..Default::default() };
    let mut session = ResponseSession::new(Arc::new(SkewedProvider), sink.clone(), config).expect("valid config");

    session.push_text("A very long opening sentence with many words. Medium sentence here. Short one. Hi. ").unwrap();
    session.finish();
    session.shutdown().await;

    assert_eq!(
        sink.texts(),
        vec!["A very long opening sentence with many words.", "Medium sentence here.", "Short one.", "Hi."]
    );
}

#[tokio::test]
async fn end_to_end_streaming_latency_is_serialized() -> anyhow::Result<()> {
    init_tracing();
    let provider = Arc::new(StubProvider::new(Duration::from_millis(10)));
    let sink = Arc::new(RecordingSink::default());
    let config = PipelineConfig { min_chunk_length: 5, max_concurrent: 1, ..Default::default() };
    let mut session = make_session(provider, sink.clone(), config);

    // Deliver token-by-token like a streaming LLM would
    for token in ["Hel", "lo the", "re. Thi", "s is", " a test."] {
        session.push_text(token)?;
    }
    session.finish();
    let stats = session.shutdown().await;

    let played = sink.played.lock().clone();
    let texts: Vec<&str> = played.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(texts, vec!["Hello there.", "This is a test."]);

    // With a single synthesis worker the second segment cannot be ready
    // before a second ~10ms provider call has run
    let gap = played[1].1.duration_since(played[0].1);
    assert!(gap >= Duration::from_millis(5), "segments arrived {gap:?} apart");
    assert_eq!(stats.chunks_emitted(), 2);
    assert_eq!(stats.segments_played(), 2);
    Ok(())
}

#[tokio::test]
async fn retry_is_transparent_to_the_listener() {
    // First two calls fail, third succeeds; with max_retries=2 the sentence
    // is spoken exactly once and no failure is reported
    let provider = Arc::new(StubProvider::failing_first(Duration::from_millis(1), 2));
    let sink = Arc::new(RecordingSink::default());
    let config = PipelineConfig { error_strategy: ErrorStrategy::Retry, max_retries: 2, max_concurrent: 1, ..Default::default() };
    let mut session = make_session(provider, sink.clone(), config);

    session.push_text("Flaky sentence here. ").unwrap();
    session.finish();

    let mut spoken = 0;
    let mut failed = 0;
    while let Some(event) = session.next_event().await {
        match event {
            SessionEvent::SentenceSpoken { .. } => spoken += 1,
            SessionEvent::SentenceFailed { .. } => failed += 1,
            SessionEvent::PlaybackError { .. } => panic!("no sink errors expected"),
        }
    }
    let stats = session.shutdown().await;

    assert_eq!(spoken, 1);
    assert_eq!(failed, 0);
    assert_eq!(stats.retries(), 2);
    assert_eq!(sink.texts(), vec!["Flaky sentence here."]);
}

#[tokio::test]
async fn skipped_failure_does_not_stall_playback() {
    let provider = Arc::new(StubProvider::failing_on(Duration::from_millis(2), "unlucky"));
    let sink = Arc::new(RecordingSink::default());
    let config = PipelineConfig { error_strategy: ErrorStrategy::Skip, max_concurrent: 1, ..Default::default() };
    let mut session = make_session(provider, sink.clone(), config);

    session.push_text("First sentence. An unlucky sentence. Third sentence. ").unwrap();
    session.finish();

    let mut failed_sequences = Vec::new();
    while let Some(event) = session.next_event().await {
        if let SessionEvent::SentenceFailed { sequence, .. } = event {
            failed_sequences.push(sequence);
        }
    }
    let stats = session.shutdown().await;

    // The gap left by sequence 1 must not block sequence 2
    assert_eq!(sink.texts(), vec!["First sentence.", "Third sentence."]);
    assert_eq!(failed_sequences, vec![1]);
    assert_eq!(stats.sentences_failed(), 1);
    assert_eq!(stats.segments_played(), 2);
}

#[tokio::test]
async fn fallback_speaks_remainder_as_one_request() {
    // The first provider call fails; the fallback policy cancels the rest
    // and re-synthesizes the unspoken remainder as a single plain request
    let provider = Arc::new(StubProvider::failing_first(Duration::from_millis(5), 1));
    let sink = Arc::new(RecordingSink::default());
    let config = PipelineConfig { error_strategy: ErrorStrategy::Fallback, max_concurrent: 1, ..Default::default() };
    let mut session = make_session(provider, sink.clone(), config);

    session.push_text("First part. Second part. Third part. ").unwrap();
    session.finish();

    let mut spoken = Vec::new();
    let mut failed = Vec::new();
    while let Some(event) = session.next_event().await {
        match event {
            SessionEvent::SentenceSpoken { sequence, text } => spoken.push((sequence, text)),
            SessionEvent::SentenceFailed { sequence, .. } => failed.push(sequence),
            SessionEvent::PlaybackError { .. } => panic!("no sink errors expected"),
        }
    }
    session.shutdown().await;

    // Exactly one failure report for the triggering sentence, and exactly
    // one combined segment spoken in its place
    assert_eq!(failed, vec![0]);
    assert_eq!(spoken.len(), 1);
    assert_eq!(spoken[0].0, 0);
    assert!(spoken[0].1.starts_with("First part."), "combined text was {:?}", spoken[0].1);

    let texts = sink.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("First part."));
}

#[tokio::test]
async fn fallback_remainder_includes_discarded_inflight_text() {
    // With two workers the failure cancels a sentence that is mid-synthesis;
    // its text must still be spoken as part of the combined remainder
    struct ScriptedProvider;

    #[async_trait]
    impl SpeechSynthesizer for ScriptedProvider {
        async fn synthesize(&self, text: &str, _voice: &VoiceParams) -> Result<Vec<u8>, SynthesisError> {
            match text {
                "Boom." => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Err(SynthesisError::new("scripted failure"))
                }
                "Slow one." => {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok(text.as_bytes().to_vec())
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(text.as_bytes().to_vec())
                }
            }
        }
    }

    let sink = Arc::new(RecordingSink::default());
    let config = PipelineConfig { error_strategy: ErrorStrategy::Fallback, max_concurrent: 2, ..Default::default() };
    let mut session = ResponseSession::new(Arc::new(ScriptedProvider), sink.clone(), config).expect("valid config");

    session.push_text("Boom. Slow one. Last words. ").unwrap();
    session.finish();
    while session.next_event().await.is_some() {}
    session.shutdown().await;

    // "Slow one." was in flight when the fallback kicked in; the combined
    // request still speaks it, in its original position
    assert_eq!(sink.texts(), vec!["Boom. Slow one. Last words."]);
}

#[tokio::test]
async fn immediate_interrupt_truncates_response() {
    /// Sink slow enough that the interrupt lands mid-first-segment.
    struct SlowSink {
        played: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AudioSink for SlowSink {
        async fn play(&self, audio: &[u8]) -> Result<(), SinkError> {
            self.played.lock().push(String::from_utf8_lossy(audio).into_owned());
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
    }

    let provider = Arc::new(StubProvider::new(Duration::from_millis(1)));
    let sink = Arc::new(SlowSink { played: Mutex::new(Vec::new()) });
    let mut session = ResponseSession::new(provider, sink.clone(), PipelineConfig::default()).expect("valid config");

    session.push_text("One sentence. Two sentence. Three sentence. Four sentence. ").unwrap();
    session.finish();

    // Let the first segment start playing, then barge in
    tokio::time::sleep(Duration::from_millis(30)).await;
    session.interrupt();
    let stats = session.shutdown().await;

    let played = sink.played.lock().clone();
    assert!(played.len() <= 1, "immediate interrupt played {played:?}");
    assert_eq!(stats.interruptions(), 1);
    // The interrupted segment never completed
    assert_eq!(stats.segments_played(), 0);
}

#[tokio::test]
async fn session_stats_track_the_whole_turn() {
    let provider = Arc::new(StubProvider::new(Duration::from_millis(1)));
    let sink = Arc::new(RecordingSink::default());
    let mut session = make_session(provider, sink.clone(), PipelineConfig::default());

    session.push_text("Alpha beta. Gamma delta. ").unwrap();
    session.push_text("Epsilon zeta").unwrap();
    session.finish();
    let stats = session.shutdown().await;

    assert_eq!(stats.chunks_emitted(), 3);
    assert_eq!(stats.sentences_synthesized(), 3);
    assert_eq!(stats.segments_played(), 3);
    assert_eq!(stats.sentences_failed(), 0);
    assert_eq!(sink.texts(), vec!["Alpha beta.", "Gamma delta.", "Epsilon zeta"]);
}

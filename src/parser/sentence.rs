//! Stateful incremental sentence parser.
//!
//! Text arrives in arbitrary deltas (often single tokens); the parser emits a
//! chunk as soon as a sentence boundary is certain and defers any decision
//! that still depends on unseen input. Because every decision is a pure
//! function of the buffered text, feeding one character at a time produces
//! the same chunk sequence as feeding the whole string at once.

use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::types::TextChunk;

/// Result of scanning the buffer for the next sentence boundary.
enum Scan {
    /// Certain boundary; `end` is the byte offset just past the punctuation
    Boundary { end: usize },
    /// A candidate at `at` cannot be resolved without more input
    NeedMore { at: usize },
    /// No candidate anywhere in the unscanned region
    Exhausted,
}

/// Incremental sentence segmenter. One instance per session; not resumable
/// across sessions.
pub struct SentenceParser {
    buf: String,            // Unemitted text, always a suffix of the input
    search_from: usize,     // Byte offset where boundary search resumes
    next_sequence: u64,     // Sequence number for the next emitted chunk
    min_chunk_length: usize,
    max_buffered_chars: usize,
    abbreviations: Vec<String>, // Lowercase, no trailing period
    finalized: bool,
}

impl SentenceParser {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            buf: String::new(),
            search_from: 0,
            next_sequence: 0,
            min_chunk_length: config.min_chunk_length,
            max_buffered_chars: config.max_buffered_chars,
            abbreviations: config.abbreviations.iter().map(|a| a.to_lowercase()).collect(),
            finalized: false,
        }
    }

    /// Feed a text delta and collect every chunk whose boundary is now
    /// certain. Pure synchronous text processing; never blocks.
    ///
    /// # Errors
    /// `ParseBufferOverflow` when unterminated text exceeds the configured
    /// buffer limit. Fatal for the session.
    pub fn add_chunk(&mut self, delta: &str) -> Result<Vec<TextChunk>, PipelineError> {
        debug_assert!(!self.finalized, "add_chunk after finalize");
        self.buf.push_str(delta);

        let chunks = self.drain_ready();

        let buffered = self.buf.chars().count();
        if buffered > self.max_buffered_chars {
            return Err(PipelineError::ParseBufferOverflow { buffered, limit: self.max_buffered_chars });
        }
        Ok(chunks)
    }

    /// Flush whatever remains buffered, terminal punctuation or not.
    /// Must be called exactly once, when the upstream stream ends.
    pub fn finalize(&mut self) -> Option<TextChunk> {
        debug_assert!(!self.finalized, "finalize called twice");
        self.finalized = true;

        let text = self.buf.trim().to_string();
        self.buf.clear();
        self.search_from = 0;
        if text.is_empty() {
            return None;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!("Flushed final chunk #{} ({} chars)", sequence, text.chars().count());
        Some(TextChunk::new(sequence, text))
    }

    /// Number of chunks emitted so far (also the next sequence number).
    pub fn emitted(&self) -> u64 {
        self.next_sequence
    }

    /// Emit chunks for every boundary that is certain, deferring the rest.
    fn drain_ready(&mut self) -> Vec<TextChunk> {
        let mut out = Vec::new();
        loop {
            match self.scan() {
                Scan::Boundary { end } => {
                    let candidate = self.buf[..end].trim();
                    if candidate.chars().count() < self.min_chunk_length {
                        // Too short to synthesize on its own: retain the text
                        // and merge it into the following chunk
                        self.search_from = end;
                        continue;
                    }
                    let text = candidate.to_string();
                    self.buf.drain(..end);
                    self.search_from = 0;

                    let sequence = self.next_sequence;
                    self.next_sequence += 1;
                    debug!("Sentence boundary: chunk #{} ({} chars)", sequence, text.chars().count());
                    out.push(TextChunk::new(sequence, text));
                }
                Scan::NeedMore { at } => {
                    self.search_from = at;
                    break;
                }
                Scan::Exhausted => {
                    self.search_from = self.buf.len();
                    break;
                }
            }
        }
        out
    }

    /// Scan for the next certain sentence boundary at or after `search_from`.
    fn scan(&self) -> Scan {
        let buf = &self.buf;
        let len = buf.len();
        let mut pos = self.search_from;

        while pos < len {
            let c = match buf[pos..].chars().next() {
                Some(c) => c,
                None => break,
            };
            match c {
                '.' => {
                    // Measure the whole period run starting here
                    let mut run_end = pos + 1;
                    while run_end < len && buf.as_bytes()[run_end] == b'.' {
                        run_end += 1;
                    }
                    if run_end == len {
                        // The run (or the lookahead char) may still grow
                        return Scan::NeedMore { at: pos };
                    }
                    if run_end - pos >= 2 {
                        // Ellipsis-style continuation marker, never a boundary
                        pos = run_end;
                        continue;
                    }

                    let next = match buf[run_end..].chars().next() {
                        Some(n) => n,
                        None => return Scan::NeedMore { at: pos },
                    };
                    let prev = buf[..pos].chars().next_back();

                    // Decimal number: digit on both sides
                    if prev.is_some_and(|p| p.is_ascii_digit()) && next.is_ascii_digit() {
                        pos = run_end;
                        continue;
                    }
                    // Terminal punctuation must be followed by whitespace
                    if !next.is_whitespace() {
                        pos = run_end;
                        continue;
                    }

                    let token = preceding_token(buf, pos);
                    if token.is_empty() || self.is_abbreviation(token) || is_initial(token) {
                        pos = run_end;
                        continue;
                    }
                    return Scan::Boundary { end: run_end };
                }
                '!' | '?' => {
                    let mut run_end = pos + 1;
                    while run_end < len && matches!(buf.as_bytes()[run_end], b'!' | b'?') {
                        run_end += 1;
                    }
                    if run_end == len {
                        return Scan::NeedMore { at: pos };
                    }
                    let next = match buf[run_end..].chars().next() {
                        Some(n) => n,
                        None => return Scan::NeedMore { at: pos },
                    };
                    if !next.is_whitespace() {
                        pos = run_end;
                        continue;
                    }
                    return Scan::Boundary { end: run_end };
                }
                _ => pos += c.len_utf8(),
            }
        }
        Scan::Exhausted
    }

    fn is_abbreviation(&self, token: &str) -> bool {
        let stripped = token.trim_start_matches(|c: char| !c.is_alphanumeric());
        if stripped.is_empty() {
            return false;
        }
        let lowered = stripped.to_lowercase();
        self.abbreviations.iter().any(|a| *a == lowered)
    }
}

/// The whitespace-delimited token immediately before byte offset `end`.
fn preceding_token(buf: &str, end: usize) -> &str {
    let head = &buf[..end];
    match head.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
        Some((i, c)) => &head[i + c.len_utf8()..],
        None => head,
    }
}

/// Whether the token before a period looks like a name initial: its last
/// period-delimited segment is a single uppercase letter ("J", "J.K").
fn is_initial(token: &str) -> bool {
    let last = token.rsplit('.').next().unwrap_or(token);
    let mut chars = last.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_alphabetic() && c.is_uppercase())
}

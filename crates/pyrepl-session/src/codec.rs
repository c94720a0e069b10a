//! Request framing over the interpreter's unstructured stdio
//!
//! A request is two lines on stdin:
//!
//! ```text
//! __pyrepl_dispatch("<base64 payload>")
//! print("<sentinel>")
//! ```
//!
//! The response is every stdout byte up to the sentinel. Stderr is
//! line-filtered to drop prompt and banner chrome. Both streams are capped.
//!
//! After a timeout the interpreter may still be flushing the interrupted
//! command. A barrier line echoes a fresh sentinel on both streams; the
//! supervisor discards everything up to it before the next request.

use crate::bootstrap::{BARRIER_FN, DISPATCH_FN};
use crate::config::SessionConfig;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use std::fmt;
use tracing::warn;

/// Completion sentinel prefix
pub const DONE_PREFIX: &str = "__PYREPL_DONE_";

const SENTINEL_SUFFIX_LEN: usize = 16;

/// A unique end-of-response marker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sentinel(String);

impl Sentinel {
    /// Fresh completion sentinel
    #[must_use]
    pub fn new() -> Self {
        Self::with_prefix(DONE_PREFIX)
    }

    /// Fresh sentinel with a custom prefix
    #[must_use]
    pub fn with_prefix(prefix: &str) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SENTINEL_SUFFIX_LEN)
            .map(char::from)
            .collect();
        Self(format!("{prefix}{suffix}__"))
    }

    /// Marker text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Base64-encode a submission for single-line transport
#[must_use]
pub fn encode_payload(code: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(code.as_bytes())
}

/// Quote `s` as a double-quoted Python string literal
#[must_use]
pub fn python_str_literal(s: &str) -> String {
    // JSON string escapes are a subset of Python's.
    serde_json::Value::String(s.to_string()).to_string()
}

/// The stdin bytes for one request
#[must_use]
pub fn frame_request(code: &str, sentinel: &Sentinel) -> String {
    format!(
        "{DISPATCH_FN}(\"{}\")\nprint({})\n",
        encode_payload(code),
        python_str_literal(sentinel.as_str())
    )
}

/// The stdin line that echoes `sentinel` on stderr, then stdout
#[must_use]
pub fn frame_barrier(sentinel: &Sentinel) -> String {
    format!("{BARRIER_FN}({})\n", python_str_literal(sentinel.as_str()))
}

/// Grow-only byte accumulator with a hard cap
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    /// Empty buffer holding at most `limit` bytes
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Append, dropping whatever exceeds the cap
    pub fn push(&mut self, data: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if data.len() > room {
            self.bytes.extend_from_slice(&data[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(data);
        }
    }

    /// Discard everything accumulated so far
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.truncated = false;
    }

    /// Bytes held
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether any bytes were dropped
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Trimmed text, with a truncation notice if bytes were dropped
    #[must_use]
    pub fn finish(self) -> String {
        let text = String::from_utf8_lossy(&self.bytes);
        let mut out = text.trim().to_string();
        if self.truncated {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&truncation_notice(self.limit));
        }
        out
    }
}

/// Marker appended to a stream that hit its cap
#[must_use]
pub fn truncation_notice(limit: usize) -> String {
    format!("[output truncated at {limit} bytes]")
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Accumulates a stream until the request's sentinel appears
///
/// Sentinels split across chunk boundaries are recognised: the decoder
/// withholds a tail shorter than the longest marker before committing bytes.
/// Output preceding an abandoned sentinel belongs to a timed-out command
/// and is discarded.
#[derive(Debug)]
pub struct SentinelDecoder {
    sentinel: Sentinel,
    abandoned: Vec<Sentinel>,
    reclaimed: Vec<Sentinel>,
    pending: Vec<u8>,
    out: OutputBuffer,
    done: bool,
}

impl SentinelDecoder {
    /// Decoder for `sentinel`, capped at `limit` bytes
    #[must_use]
    pub fn new(sentinel: Sentinel, limit: usize) -> Self {
        Self::with_abandoned(sentinel, Vec::new(), limit)
    }

    /// Decoder that also swallows output of the `abandoned` requests
    #[must_use]
    pub fn with_abandoned(sentinel: Sentinel, abandoned: Vec<Sentinel>, limit: usize) -> Self {
        Self {
            sentinel,
            abandoned,
            reclaimed: Vec::new(),
            pending: Vec::new(),
            out: OutputBuffer::new(limit),
            done: false,
        }
    }

    /// Feed a chunk; returns true once the sentinel has been seen
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        if self.done {
            return true;
        }
        self.pending.extend_from_slice(chunk);

        while let Some((index, end)) = self.find_abandoned() {
            self.pending.drain(..end);
            self.out.clear();
            let stale = self.abandoned.remove(index);
            self.reclaimed.push(stale);
        }

        if let Some(pos) = find_subslice(&self.pending, self.sentinel.as_bytes()) {
            self.out.push(&self.pending[..pos]);
            self.pending.clear();
            self.done = true;
            return true;
        }

        let carry = self.longest_marker().saturating_sub(1);
        if self.pending.len() > carry {
            let commit = self.pending.len() - carry;
            self.out.push(&self.pending[..commit]);
            self.pending.drain(..commit);
        }
        false
    }

    fn find_abandoned(&self) -> Option<(usize, usize)> {
        self.abandoned
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                find_subslice(&self.pending, s.as_bytes()).map(|pos| (i, pos + s.as_bytes().len()))
            })
            .min_by_key(|(_, end)| *end)
    }

    fn longest_marker(&self) -> usize {
        self.abandoned
            .iter()
            .map(|s| s.as_bytes().len())
            .chain(std::iter::once(self.sentinel.as_bytes().len()))
            .max()
            .unwrap_or(0)
    }

    /// Whether the sentinel has been seen
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Abandoned sentinels observed (and consumed) by this decoder
    #[must_use]
    pub fn reclaimed(&self) -> &[Sentinel] {
        &self.reclaimed
    }

    /// Decoded stdout
    #[must_use]
    pub fn finish(mut self) -> String {
        if !self.done && !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.out.push(&rest);
        }
        self.out.finish()
    }
}

/// Recognises interpreter chrome on stderr
#[derive(Debug, Clone)]
pub struct ChromeFilter {
    prompts: Vec<String>,
    banners: Vec<Regex>,
}

impl ChromeFilter {
    /// Build from prompt markers and banner regexes; invalid regexes are skipped
    #[must_use]
    pub fn new(prompts: &[String], banner_patterns: &[String]) -> Self {
        let banners = banner_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Ignoring invalid banner pattern");
                    None
                }
            })
            .collect();
        Self {
            prompts: prompts.iter().filter(|p| !p.is_empty()).cloned().collect(),
            banners,
        }
    }

    /// Filter configured by a [`SessionConfig`]
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(&config.prompt_markers, &config.banner_patterns)
    }

    /// Strip leading prompts; `None` if nothing meaningful remains
    #[must_use]
    pub fn clean_line<'a>(&self, line: &'a str) -> Option<&'a str> {
        let mut rest = line.strip_suffix('\r').unwrap_or(line);
        'strip: loop {
            for prompt in &self.prompts {
                if let Some(after) = rest.strip_prefix(prompt.as_str()) {
                    if after.is_empty() {
                        return None;
                    }
                    if let Some(after) = after.strip_prefix(' ') {
                        rest = after;
                        continue 'strip;
                    }
                }
            }
            break;
        }

        let trimmed = rest.trim();
        if trimmed.is_empty() || self.banners.iter().any(|re| re.is_match(trimmed)) {
            return None;
        }
        Some(rest)
    }
}

impl Default for ChromeFilter {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Line-buffered, chrome-filtered, capped stderr accumulator
#[derive(Debug)]
pub struct StderrDecoder {
    filter: ChromeFilter,
    partial: Vec<u8>,
    out: OutputBuffer,
}

impl StderrDecoder {
    /// Decoder capped at `limit` bytes
    #[must_use]
    pub fn new(filter: ChromeFilter, limit: usize) -> Self {
        Self {
            filter,
            partial: Vec::new(),
            out: OutputBuffer::new(limit),
        }
    }

    /// Feed a chunk; complete lines are filtered immediately
    pub fn push(&mut self, chunk: &[u8]) {
        self.partial.extend_from_slice(chunk);
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            self.accept(&line[..line.len() - 1]);
        }
        // A line that never ends must not grow without bound.
        if self.partial.len() > self.out.limit {
            let line = std::mem::take(&mut self.partial);
            self.accept(&line);
        }
    }

    fn accept(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        if let Some(kept) = self.filter.clean_line(&text) {
            self.out.push(kept.as_bytes());
            self.out.push(b"\n");
        }
    }

    /// Decoded stderr; an unterminated final line is filtered too
    #[must_use]
    pub fn finish(mut self) -> String {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.accept(&line);
        }
        self.out.finish()
    }
}

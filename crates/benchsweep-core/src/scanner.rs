//! Incremental marker scanner.
//!
//! Output arrives in arbitrary chunks. The scanner splits it on the marker
//! exactly like splitting the whole output at once would, but only keeps the
//! bytes after the last marker plus the trailing tokens of the most recent
//! fragments, so memory stays bounded on long runs.

use std::collections::VecDeque;

use crate::error::{Result, SweepError};
use crate::models::Sample;

/// Unterminated tail length that triggers trimming.
const MAX_TAIL_BYTES: usize = 64 * 1024;
/// Bytes kept after trimming; far more than two tokens need.
const TRIMMED_TAIL_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone)]
pub struct MarkerScanner {
    marker: Vec<u8>,
    keep: usize,
    tail: Vec<u8>,
    fragments: VecDeque<String>,
    markers_seen: usize,
}

impl MarkerScanner {
    /// `keep` is how many of the most recent fragments to retain for parsing.
    pub fn new(marker: &str, keep: usize) -> Result<Self> {
        if marker.is_empty() {
            return Err(SweepError::Config("marker must not be empty".to_string()));
        }
        Ok(Self {
            marker: marker.as_bytes().to_vec(),
            keep: keep.max(1),
            tail: Vec::new(),
            fragments: VecDeque::with_capacity(keep.max(1)),
            markers_seen: 0,
        })
    }

    /// Append newly read output. Returns how many markers it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> usize {
        self.tail.extend_from_slice(chunk);

        let before = self.markers_seen;
        let mut consumed = 0;
        while let Some(pos) = find(&self.tail[consumed..], &self.marker) {
            let fragment = trailing_tokens(&self.tail[consumed..consumed + pos]);
            if self.fragments.len() == self.keep {
                self.fragments.pop_front();
            }
            self.fragments.push_back(fragment);
            self.markers_seen += 1;
            consumed += pos + self.marker.len();
        }
        self.tail.drain(..consumed);

        if self.tail.len() > MAX_TAIL_BYTES {
            self.trim_tail();
        }
        self.markers_seen - before
    }

    /// Total number of markers seen so far.
    pub fn markers_seen(&self) -> usize {
        self.markers_seen
    }

    /// Bytes currently held after the last marker.
    pub fn pending_bytes(&self) -> usize {
        self.tail.len()
    }

    /// Parse the retained fragments, oldest first.
    ///
    /// Each fragment's last two whitespace-separated tokens are the
    /// magnitude and the unit.
    pub fn samples(&self) -> Result<Vec<Sample>> {
        self.fragments.iter().map(|f| parse_fragment(f)).collect()
    }

    fn trim_tail(&mut self) {
        let mut cut = self.tail.len() - TRIMMED_TAIL_BYTES;
        // Start on a token boundary so no token is cut in half.
        while cut < self.tail.len() && !self.tail[cut].is_ascii_whitespace() {
            cut += 1;
        }
        // A marker prefix at the very end may still be completed by the next chunk.
        let cut = cut.min(self.tail.len().saturating_sub(self.marker.len() - 1));
        self.tail.drain(..cut);
    }
}

/// Which pipe a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One [`MarkerScanner`] per output stream.
///
/// Writes on stdout and stderr interleave arbitrarily, so each stream is
/// split on its own. The marker count is the sum over both streams and
/// [`StreamScanner::samples`] returns the most recent fragments in the order
/// their markers were seen.
#[derive(Debug, Clone)]
pub struct StreamScanner {
    stdout: MarkerScanner,
    stderr: MarkerScanner,
    keep: usize,
    /// Stream of each of the last `keep` markers, oldest first.
    recent: VecDeque<Stream>,
}

impl StreamScanner {
    pub fn new(marker: &str, keep: usize) -> Result<Self> {
        let keep = keep.max(1);
        Ok(Self {
            stdout: MarkerScanner::new(marker, keep)?,
            stderr: MarkerScanner::new(marker, keep)?,
            keep,
            recent: VecDeque::with_capacity(keep),
        })
    }

    pub fn feed(&mut self, stream: Stream, chunk: &[u8]) {
        let found = match stream {
            Stream::Stdout => self.stdout.feed(chunk),
            Stream::Stderr => self.stderr.feed(chunk),
        };
        for _ in 0..found {
            if self.recent.len() == self.keep {
                self.recent.pop_front();
            }
            self.recent.push_back(stream);
        }
    }

    /// Markers seen on both streams together.
    pub fn markers_seen(&self) -> usize {
        self.stdout.markers_seen() + self.stderr.markers_seen()
    }

    /// The most recent fragments across both streams, oldest first.
    pub fn samples(&self) -> Result<Vec<Sample>> {
        let from_stdout = self.recent.iter().filter(|s| **s == Stream::Stdout).count();
        let from_stderr = self.recent.len() - from_stdout;

        let mut stdout = last_n(self.stdout.samples()?, from_stdout).into_iter();
        let mut stderr = last_n(self.stderr.samples()?, from_stderr).into_iter();
        Ok(self
            .recent
            .iter()
            .filter_map(|stream| match stream {
                Stream::Stdout => stdout.next(),
                Stream::Stderr => stderr.next(),
            })
            .collect())
    }
}

fn last_n(mut samples: Vec<Sample>, n: usize) -> Vec<Sample> {
    let start = samples.len().saturating_sub(n);
    samples.drain(..start);
    samples
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn trailing_tokens(fragment: &[u8]) -> String {
    let text = String::from_utf8_lossy(fragment);
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let start = tokens.len().saturating_sub(2);
    tokens[start..].join(" ")
}

fn parse_fragment(fragment: &str) -> Result<Sample> {
    let malformed = || SweepError::Parse {
        fragment: fragment.to_string(),
    };
    let mut tokens = fragment.split_whitespace();
    let (Some(magnitude), Some(unit), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(malformed());
    };
    let magnitude: f64 = magnitude.parse().map_err(|_| malformed())?;
    Ok(Sample::new(magnitude, unit))
}

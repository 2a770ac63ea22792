//! Transcript ingestion
//!
//! Reads the assistant's append-only JSONL transcript into [`TranscriptEntry`]
//! values. Each line is one record and its 1-based line number becomes the
//! entry's `sequence_index`.
//!
//! ## Error Handling
//!
//! - **Malformed JSON lines**: Logged as warning, line skipped, parsing continues.
//!   The line is counted in [`Transcript::skipped_lines`] and described in
//!   [`Transcript::warnings`].
//! - **Blank lines**: Skipped silently; they still consume a sequence index so
//!   positions stay aligned with the file.
//! - **Missing file**: Returned as [`Error::Io`](crate::Error::Io) from
//!   [`Transcript::load`].

mod entry;

pub use entry::{ContentBlock, MessageContent, Role, ToolInvocation, TranscriptEntry};

use crate::error::Result;
use entry::RawRecord;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// A parsed snapshot of a transcript file.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    /// Parsed entries in file order
    pub entries: Vec<TranscriptEntry>,
    /// Number of non-blank lines that could not be parsed
    pub skipped_lines: usize,
    /// Human-readable description of every skipped line
    pub warnings: Vec<String>,
    /// Total lines read, blank lines included
    pub line_count: usize,
}

impl Transcript {
    /// Load and parse a transcript file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let transcript = Self::from_reader(file)?;
        tracing::debug!(
            path = %path.display(),
            entries = transcript.entries.len(),
            skipped = transcript.skipped_lines,
            "Loaded transcript"
        );
        Ok(transcript)
    }

    /// Parse transcript content already held in memory.
    pub fn parse_str(content: &str) -> Self {
        let mut transcript = Transcript::default();
        for line in content.lines() {
            transcript.push_line(line);
        }
        transcript
    }

    /// Parse transcript content from any reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let reader = BufReader::new(reader);
        let mut transcript = Transcript::default();

        for line_result in reader.lines() {
            match line_result {
                Ok(line) => transcript.push_line(&line),
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    // Non UTF-8 line: count it and keep going.
                    transcript.line_count += 1;
                    transcript.skip(format!(
                        "Line {}: read error: {}",
                        transcript.line_count, e
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(transcript)
    }

    fn push_line(&mut self, line: &str) {
        self.line_count += 1;
        let line_number = self.line_count;

        if line.trim().is_empty() {
            return;
        }

        let raw_json: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                self.skip(format!("Line {}: JSON parse error: {}", line_number, e));
                return;
            }
        };

        let record: RawRecord = match serde_json::from_value(raw_json) {
            Ok(r) => r,
            Err(e) => {
                self.skip(format!(
                    "Line {}: deserialization error: {}",
                    line_number, e
                ));
                return;
            }
        };

        self.entries
            .push(TranscriptEntry::from_raw(line_number, record));
    }

    fn skip(&mut self, warning: String) {
        tracing::warn!("{}", warning);
        self.skipped_lines += 1;
        self.warnings.push(warning);
    }

    /// Entry by 1-based sequence index.
    pub fn entry_at(&self, sequence_index: usize) -> Option<&TranscriptEntry> {
        self.entries
            .binary_search_by_key(&sequence_index, |e| e.sequence_index)
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Count the lines of a transcript without parsing them.
///
/// Used as the approximate position of a spawn at hook time.
pub fn line_count(path: &Path) -> Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0u64;
    for line in reader.split(b'\n') {
        line?;
        count += 1;
    }
    Ok(count)
}

//! Lazy envelope iteration over backend rows
//!
//! Backends expose a [`RowSource`] that returns filtered rows in descending key
//! order. [`ArchiveIterator`] pulls them in chunks, moving its upper bound below
//! the last key it has seen, so each chunk resumes exactly where the previous
//! one stopped and no row is produced twice.

use std::collections::VecDeque;

use crate::error::{ArchiveError, Result};
use crate::key::ArchiveKey;
use crate::models::{Envelope, EnvelopeCodec};
use crate::query::{CursorQuery, UpperBound};

/// Largest number of rows requested from a backend at once
pub const SCAN_CHUNK: usize = 256;

/// A stored row: key plus the encoded envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRow {
    pub key: ArchiveKey,
    pub data: Vec<u8>,
}

/// Backend side of a scan
pub trait RowSource {
    /// Return at most `max` rows with keys in `[query.lower(), upper]` that pass
    /// `query.filter()`, highest key first
    fn fetch(&mut self, query: &CursorQuery, upper: &UpperBound, max: usize) -> Result<Vec<ArchiveRow>>;
}

/// Uniform, forward-only sequence of archived envelopes
pub trait EnvelopeIterator {
    /// Next envelope, or `None` at the end of the range or after an error
    fn next_envelope(&mut self) -> Option<Envelope>;

    /// Key of the envelope most recently returned
    fn current_key(&self) -> Option<&ArchiveKey>;

    /// Error that ended the scan early, if any
    fn last_error(&self) -> Option<&ArchiveError>;

    /// Move the error that ended the scan out of the iterator
    fn take_error(&mut self) -> Option<ArchiveError>;

    /// Free backend resources; safe to call more than once
    fn release(&mut self);
}

/// Chunked iterator shared by every backend
pub struct ArchiveIterator<S: RowSource> {
    source: Option<S>,
    query: CursorQuery,
    codec: EnvelopeCodec,
    upper: UpperBound,
    buffered: VecDeque<ArchiveRow>,
    remaining: usize,
    exhausted: bool,
    current: Option<ArchiveKey>,
    error: Option<ArchiveError>,
}

impl<S: RowSource> ArchiveIterator<S> {
    pub fn new(source: S, query: CursorQuery, codec: EnvelopeCodec) -> Self {
        Self {
            upper: *query.upper(),
            remaining: query.limit(),
            source: Some(source),
            query,
            codec,
            buffered: VecDeque::new(),
            exhausted: false,
            current: None,
            error: None,
        }
    }

    fn fill(&mut self) {
        let Some(source) = self.source.as_mut() else {
            self.exhausted = true;
            return;
        };

        let want = self.remaining.min(SCAN_CHUNK);
        match source.fetch(&self.query, &self.upper, want) {
            Ok(rows) => {
                if rows.len() < want {
                    self.exhausted = true;
                }
                if let Some(last) = rows.last() {
                    self.upper = UpperBound::Exclusive(last.key);
                }
                self.buffered.extend(rows);
            }
            Err(err) => self.fail(err),
        }
    }

    fn fail(&mut self, err: ArchiveError) {
        log::warn!("Archive scan aborted: {}", err);
        self.error = Some(err);
        self.release();
    }
}

impl<S: RowSource> EnvelopeIterator for ArchiveIterator<S> {
    fn next_envelope(&mut self) -> Option<Envelope> {
        if self.error.is_some() || self.remaining == 0 {
            return None;
        }
        if self.buffered.is_empty() && !self.exhausted {
            self.fill();
        }

        let row = self.buffered.pop_front()?;
        self.remaining -= 1;
        self.current = Some(row.key);

        match self.codec.decode(&row.data) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    fn current_key(&self) -> Option<&ArchiveKey> {
        self.current.as_ref()
    }

    fn last_error(&self) -> Option<&ArchiveError> {
        self.error.as_ref()
    }

    fn take_error(&mut self) -> Option<ArchiveError> {
        self.error.take()
    }

    fn release(&mut self) {
        self.source = None;
        self.buffered.clear();
        self.exhausted = true;
    }
}

impl<S: RowSource> Drop for ArchiveIterator<S> {
    fn drop(&mut self) {
        self.release();
    }
}

//! Storage trait definitions

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::iterator::EnvelopeIterator;
use crate::key::ArchiveKey;
use crate::models::Envelope;
use crate::query::CursorQuery;

/// Result of an insert-if-absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// A new row was written
    Inserted,
    /// A row with the same key already existed; nothing changed
    Duplicate,
}

/// Trait for envelope archive backends
///
/// Every backend stores one logical `envelopes` keyspace ordered by
/// [`ArchiveKey`]. Implementations must be safe to share between threads and
/// must leave concurrent readers unaffected by in-flight writes.
pub trait ArchiveStore: Send + Sync {
    /// Insert the envelope unless its key is already present
    fn save(&self, envelope: &Envelope) -> Result<SaveOutcome>;

    /// Point lookup; `NotFound` when the key is absent
    fn get(&self, key: &ArchiveKey) -> Result<Envelope>;

    /// Open a descending scan for a planned query
    fn build_iterator(&self, query: &CursorQuery) -> Result<Box<dyn EnvelopeIterator + '_>>;

    /// Delete every row sent before `before`, at most `batch_size` rows per
    /// write. Stops between batches once `cancel` fires; completed batches
    /// stay deleted. Returns the number of rows removed.
    fn prune(&self, before: u32, batch_size: usize, cancel: &CancellationToken) -> Result<usize>;

    /// Number of archived envelopes
    fn len(&self) -> Result<usize>;

    /// Whether the archive is empty
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Release backend resources; later calls fail with `Closed`
    fn close(&self) -> Result<()>;
}

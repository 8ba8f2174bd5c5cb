//! Embedded ordered archive backend using redb
//!
//! One table maps the 40-byte archive key to `bloom (64 bytes) | encoded
//! envelope`. Keys sort byte-wise, so range scans walk envelopes in sent
//! order; topic and bloom filters are evaluated row by row while scanning.

use redb::{
    Database, ReadOnlyTable, ReadTransaction, ReadableDatabase, ReadableTable,
    ReadableTableMetadata, TableDefinition,
};
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

use super::traits::{ArchiveStore, SaveOutcome};
use crate::bloom::BLOOM_FILTER_SIZE;
use crate::error::{ArchiveError, Result};
use crate::iterator::{ArchiveIterator, ArchiveRow, EnvelopeIterator, RowSource};
use crate::key::ArchiveKey;
use crate::models::{Envelope, EnvelopeCodec};
use crate::query::{CursorQuery, UpperBound};

// envelopes: archive key -> bloom || encoded envelope
const ENVELOPES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("envelopes");

/// Archive backend on an embedded redb database
pub struct RedbArchiveStore {
    db: RwLock<Option<Arc<Database>>>,
    codec: EnvelopeCodec,
}

impl RedbArchiveStore {
    /// Create or open a store at the given path
    ///
    /// If the database already exists, opens it without re-initializing tables.
    pub fn new(path: impl AsRef<Path>, codec: EnvelopeCodec) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            return Self::open(path, codec);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let store = Self::with_database(db, codec);
        store.init_tables()?;

        log::info!("Created redb archive at {:?}", path);
        Ok(store)
    }

    /// Open an existing store (fails if it doesn't exist)
    pub fn open(path: impl AsRef<Path>, codec: EnvelopeCodec) -> Result<Self> {
        let db = Database::open(path.as_ref())?;
        let store = Self::with_database(db, codec);
        // Tolerate files created before the table existed
        store.init_tables()?;

        log::info!("Opened redb archive at {:?}", path.as_ref());
        Ok(store)
    }

    fn with_database(db: Database, codec: EnvelopeCodec) -> Self {
        Self {
            db: RwLock::new(Some(Arc::new(db))),
            codec,
        }
    }

    fn init_tables(&self) -> Result<()> {
        let db = self.db()?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ENVELOPES)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn db(&self) -> Result<Arc<Database>> {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ArchiveError::Closed)
    }

    fn decode_value(&self, value: &[u8]) -> Result<Envelope> {
        let (_, data) = split_value(value)?;
        self.codec.decode(data)
    }
}

/// Split a stored value into its bloom prefix and encoded envelope
fn split_value(value: &[u8]) -> Result<(&[u8; BLOOM_FILTER_SIZE], &[u8])> {
    if value.len() < BLOOM_FILTER_SIZE {
        return Err(ArchiveError::Corrupt(format!(
            "stored value is {} bytes, shorter than the bloom prefix",
            value.len()
        )));
    }
    let (bloom, data) = value.split_at(BLOOM_FILTER_SIZE);
    let bloom = <&[u8; BLOOM_FILTER_SIZE]>::try_from(bloom)
        .map_err(|_| ArchiveError::Corrupt("bloom prefix".into()))?;
    Ok((bloom, data))
}

impl ArchiveStore for RedbArchiveStore {
    fn save(&self, envelope: &Envelope) -> Result<SaveOutcome> {
        // Encode before touching the database so failures leave no trace
        let raw = self.codec.encode(envelope)?;
        let key = envelope.archive_key();

        let db = self.db()?;
        let write_txn = db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(ENVELOPES)?;
            if table.get(key.as_bytes())?.is_some() {
                SaveOutcome::Duplicate
            } else {
                let mut value = Vec::with_capacity(BLOOM_FILTER_SIZE + raw.len());
                value.extend_from_slice(envelope.bloom().as_bytes());
                value.extend_from_slice(&raw);
                table.insert(key.as_bytes(), value.as_slice())?;
                SaveOutcome::Inserted
            }
        };
        write_txn.commit()?;

        if outcome == SaveOutcome::Duplicate {
            log::debug!("Envelope {} already archived", key);
        }
        Ok(outcome)
    }

    fn get(&self, key: &ArchiveKey) -> Result<Envelope> {
        let db = self.db()?;
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ENVELOPES)?;

        match table.get(key.as_bytes())? {
            Some(value) => self.decode_value(value.value()),
            None => Err(ArchiveError::NotFound(*key)),
        }
    }

    fn build_iterator(&self, query: &CursorQuery) -> Result<Box<dyn EnvelopeIterator + '_>> {
        query.validate()?;

        let db = self.db()?;
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ENVELOPES)?;
        let source = RedbRowSource {
            table,
            _snapshot: read_txn,
        };

        Ok(Box::new(ArchiveIterator::new(source, query.clone(), self.codec)))
    }

    fn prune(&self, before: u32, batch_size: usize, cancel: &CancellationToken) -> Result<usize> {
        if batch_size == 0 {
            return Err(ArchiveError::InvalidQuery("batch size must be positive".into()));
        }

        let lower = ArchiveKey::lower_bound(0);
        let upper = ArchiveKey::lower_bound(before);
        let db = self.db()?;
        let mut removed = 0;

        loop {
            if cancel.is_cancelled() {
                log::info!("Prune cancelled after removing {} envelopes", removed);
                break;
            }

            let write_txn = db.begin_write()?;
            let batch = {
                let mut table = write_txn.open_table(ENVELOPES)?;
                let keys = table
                    .range(lower.as_bytes()..upper.as_bytes())?
                    .take(batch_size)
                    .map(|entry| entry.map(|(k, _)| k.value().to_vec()))
                    .collect::<Result<Vec<_>, _>>()?;
                for key in &keys {
                    table.remove(key.as_slice())?;
                }
                keys.len()
            };
            write_txn.commit()?;

            removed += batch;
            log::debug!("Pruned batch of {} envelopes ({} total)", batch, removed);

            if batch < batch_size {
                break;
            }
        }

        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        let db = self.db()?;
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ENVELOPES)?;
        Ok(table.len()? as usize)
    }

    fn close(&self) -> Result<()> {
        let db = self
            .db
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if db.is_some() {
            log::info!("Closed redb archive");
        }
        Ok(())
    }
}

/// Scan source reading from one read snapshot for the iterator's lifetime
struct RedbRowSource {
    table: ReadOnlyTable<&'static [u8], &'static [u8]>,
    _snapshot: ReadTransaction,
}

impl RowSource for RedbRowSource {
    fn fetch(&mut self, query: &CursorQuery, upper: &UpperBound, max: usize) -> Result<Vec<ArchiveRow>> {
        let lower = query.lower();
        let empty = match upper {
            UpperBound::Inclusive(key) => key < lower,
            UpperBound::Exclusive(key) => key <= lower,
        };
        if empty || max == 0 {
            return Ok(Vec::new());
        }

        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (
            Bound::Included(lower.as_bytes()),
            match upper {
                UpperBound::Inclusive(key) => Bound::Included(key.as_bytes()),
                UpperBound::Exclusive(key) => Bound::Excluded(key.as_bytes()),
            },
        );

        let mut rows = Vec::new();
        for entry in self.table.range::<&[u8]>(bounds)?.rev() {
            let (k, v) = entry?;
            let key = ArchiveKey::decode(k.value())?;
            let (bloom, data) = split_value(v.value())?;
            if !query.filter().accepts(&key, bloom) {
                continue;
            }
            rows.push(ArchiveRow {
                key,
                data: data.to_vec(),
            });
            if rows.len() >= max {
                break;
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::BloomFilter;
    use crate::models::Topic;
    use crate::query::{QueryPlanner, QueryRequest};
    use tempfile::tempdir;

    const AAAA: Topic = Topic(*b"AAAA");
    const BBBB: Topic = Topic(*b"BBBB");

    fn create_test_store() -> (RedbArchiveStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.test.redb");
        let store = RedbArchiveStore::new(&path, EnvelopeCodec::default()).unwrap();
        (store, dir)
    }

    fn make_envelope(topic: Topic, sent: u32, body: &str) -> Envelope {
        Envelope::builder(topic)
            .sent_at(sent, 30)
            .data(body.as_bytes().to_vec())
            .build()
    }

    fn collect(store: &RedbArchiveStore, request: QueryRequest) -> Vec<Envelope> {
        let query = QueryPlanner::default().plan(&request).unwrap();
        let mut iter = store.build_iterator(&query).unwrap();
        let mut out = Vec::new();
        while let Some(env) = iter.next_envelope() {
            out.push(env);
        }
        assert!(iter.last_error().is_none());
        iter.release();
        out
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.test.redb");

        let store = RedbArchiveStore::new(&path, EnvelopeCodec::default()).unwrap();
        store.save(&make_envelope(AAAA, 100, "persisted")).unwrap();
        store.close().unwrap();
        drop(store);

        let store = RedbArchiveStore::new(&path, EnvelopeCodec::default()).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_save_and_get() {
        let (store, _dir) = create_test_store();
        let env = make_envelope(AAAA, 100, "hello");

        assert_eq!(store.save(&env).unwrap(), SaveOutcome::Inserted);
        let fetched = store.get(&env.archive_key()).unwrap();
        assert_eq!(fetched, env);
        assert_eq!(fetched.data(), b"hello");
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (store, _dir) = create_test_store();
        let key = make_envelope(AAAA, 1, "x").archive_key();
        assert!(matches!(store.get(&key), Err(ArchiveError::NotFound(k)) if k == key));
    }

    #[test]
    fn test_duplicate_save_is_noop() {
        let (store, _dir) = create_test_store();
        let env = make_envelope(AAAA, 100, "dup");

        assert_eq!(store.save(&env).unwrap(), SaveOutcome::Inserted);
        assert_eq!(store.save(&env).unwrap(), SaveOutcome::Duplicate);
        assert_eq!(store.save(&env).unwrap(), SaveOutcome::Duplicate);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_encode_failure_writes_nothing() {
        let dir = tempdir().unwrap();
        let store =
            RedbArchiveStore::new(dir.path().join("small.redb"), EnvelopeCodec::new(16)).unwrap();
        let env = make_envelope(AAAA, 100, "this payload is far too large for the cap");

        assert!(matches!(store.save(&env), Err(ArchiveError::Encode(_))));
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn test_scan_descending_with_topic_filter() {
        let (store, _dir) = create_test_store();
        for (i, topic) in [AAAA, BBBB, AAAA, BBBB, AAAA].iter().enumerate() {
            store
                .save(&make_envelope(*topic, 100 + i as u32, &format!("m{}", i)))
                .unwrap();
        }

        let found = collect(&store, QueryRequest::new(0, 200, 10).with_topics([AAAA]));
        let sent: Vec<u32> = found.iter().map(|e| e.sent_time()).collect();
        assert_eq!(sent, vec![104, 102, 100]);
    }

    #[test]
    fn test_scan_with_bloom_filter() {
        let (store, _dir) = create_test_store();
        store.save(&make_envelope(AAAA, 100, "a")).unwrap();
        store.save(&make_envelope(BBBB, 101, "b")).unwrap();

        let bloom = BloomFilter::combine(&[BBBB]);
        let found = collect(&store, QueryRequest::new(0, 200, 10).with_bloom(bloom));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].topic(), BBBB);
    }

    #[test]
    fn test_scan_respects_time_range() {
        let (store, _dir) = create_test_store();
        for sent in [50, 100, 150, 200, 250] {
            store.save(&make_envelope(AAAA, sent, "r")).unwrap();
        }

        let found = collect(&store, QueryRequest::new(100, 200, 10));
        let sent: Vec<u32> = found.iter().map(|e| e.sent_time()).collect();
        assert_eq!(sent, vec![200, 150, 100]);
    }

    #[test]
    fn test_prune_in_batches() {
        let (store, _dir) = create_test_store();
        for sent in 0..25 {
            store.save(&make_envelope(AAAA, 1_000 + sent, "p")).unwrap();
        }

        let cancel = CancellationToken::new();
        let removed = store.prune(1_020, 7, &cancel).unwrap();
        assert_eq!(removed, 20);
        assert_eq!(store.len().unwrap(), 5);

        // Same cutoff again removes nothing
        assert_eq!(store.prune(1_020, 7, &cancel).unwrap(), 0);
    }

    #[test]
    fn test_prune_stops_when_cancelled() {
        let (store, _dir) = create_test_store();
        for sent in 0..5 {
            store.save(&make_envelope(AAAA, 10 + sent, "c")).unwrap();
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(store.prune(100, 2, &cancel).unwrap(), 0);
        assert_eq!(store.len().unwrap(), 5);
    }

    #[test]
    fn test_prune_cancelled_midway_keeps_deleted_batches() {
        let (store, _dir) = create_test_store();
        let total = 200;
        for sent in 0..total {
            store.save(&make_envelope(AAAA, 10 + sent, "m")).unwrap();
        }

        let cancel = CancellationToken::new();
        let removed = std::thread::scope(|s| {
            let pruner = s.spawn(|| store.prune(1_000, 1, &cancel).unwrap());
            // Cancel once the first batch is visible to readers
            while store.len().unwrap() == total as usize && !pruner.is_finished() {
                std::thread::yield_now();
            }
            cancel.cancel();
            pruner.join().unwrap()
        });

        assert!(removed >= 1);
        let remaining = store.len().unwrap();
        assert_eq!(removed + remaining, total as usize);

        // Resuming with the same cutoff finishes the job
        let resumed = store.prune(1_000, 7, &CancellationToken::new()).unwrap();
        assert_eq!(resumed, remaining);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_prune_rejects_zero_batch() {
        let (store, _dir) = create_test_store();
        let cancel = CancellationToken::new();
        assert!(matches!(
            store.prune(100, 0, &cancel),
            Err(ArchiveError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_closed_store_rejects_calls() {
        let (store, _dir) = create_test_store();
        let env = make_envelope(AAAA, 1, "closed");
        store.close().unwrap();
        store.close().unwrap();

        assert!(matches!(store.save(&env), Err(ArchiveError::Closed)));
        assert!(matches!(store.get(&env.archive_key()), Err(ArchiveError::Closed)));
        assert!(matches!(store.len(), Err(ArchiveError::Closed)));
    }

    #[test]
    fn test_iterator_sees_snapshot() {
        let (store, _dir) = create_test_store();
        store.save(&make_envelope(AAAA, 100, "before")).unwrap();

        let query = QueryPlanner::default()
            .plan(&QueryRequest::new(0, None, 10))
            .unwrap();
        let mut iter = store.build_iterator(&query).unwrap();
        store.save(&make_envelope(AAAA, 200, "after")).unwrap();

        let env = iter.next_envelope().unwrap();
        assert_eq!(env.data(), b"before");
        assert!(iter.next_envelope().is_none());
    }
}

//! Archive service
//!
//! The entry point used by the transport layer (`save_envelope` for every
//! validated broadcast) and by RPC/admin handlers (`query_page`,
//! `get_envelope`, `prune_before`).

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ArchiveConfig;
use crate::error::Result;
use crate::iterator::SCAN_CHUNK;
use crate::key::ArchiveKey;
use crate::metrics::ArchiveMetrics;
use crate::models::Envelope;
use crate::query::{QueryPlanner, QueryRequest};
use crate::storage::{ArchiveStore, SaveOutcome};

/// Default rows per prune write
pub const DEFAULT_PRUNE_BATCH_SIZE: usize = 1000;

/// One page of a range query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPage {
    /// Matching envelopes, most recently sent first
    pub envelopes: Vec<Envelope>,
    /// Cursor for the next page; `None` once the range is exhausted
    pub next_cursor: Option<ArchiveKey>,
}

/// Façade over a storage backend that owns the archive metrics
pub struct ArchiveService {
    store: Box<dyn ArchiveStore>,
    planner: QueryPlanner,
    metrics: Arc<ArchiveMetrics>,
    prune_batch_size: usize,
    retention: Duration,
}

impl ArchiveService {
    /// Wrap an already opened backend
    pub fn new(store: Box<dyn ArchiveStore>, metrics: Arc<ArchiveMetrics>) -> Self {
        Self {
            store,
            planner: QueryPlanner::default(),
            metrics,
            prune_batch_size: DEFAULT_PRUNE_BATCH_SIZE,
            retention: Duration::days(1),
        }
    }

    /// Open the configured backend and apply the configured limits
    pub fn open(config: &ArchiveConfig, metrics: Arc<ArchiveMetrics>) -> anyhow::Result<Self> {
        let store = config.backend.open(config.codec())?;
        log::info!(
            "Archive service ready (backend at {:?}, retention {} days)",
            config.backend.path(),
            config.data_retention_days
        );

        Ok(Self::new(store, metrics)
            .with_planner(QueryPlanner::new(config.max_query_limit))
            .with_prune_batch_size(config.prune_batch_size)
            .with_retention(Duration::days(i64::from(config.data_retention_days))))
    }

    pub fn with_planner(mut self, planner: QueryPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_prune_batch_size(mut self, batch_size: usize) -> Self {
        self.prune_batch_size = batch_size;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn metrics(&self) -> &Arc<ArchiveMetrics> {
        &self.metrics
    }

    pub fn store(&self) -> &dyn ArchiveStore {
        self.store.as_ref()
    }

    /// Archive an envelope; saving the same envelope again is a no-op
    pub fn save_envelope(&self, envelope: &Envelope) -> Result<SaveOutcome> {
        match self.store.save(envelope) {
            Ok(outcome) => {
                let size = envelope.size() as u64;
                self.metrics.archived_envelopes.inc();
                self.metrics.envelope_size.observe(size);
                if outcome == SaveOutcome::Inserted {
                    self.metrics.archived_bytes.inc_by(size);
                }
                Ok(outcome)
            }
            Err(err) => {
                self.metrics.archive_errors.inc();
                log::error!(
                    "Failed to archive envelope {}: {}",
                    envelope.archive_key(),
                    err
                );
                Err(err)
            }
        }
    }

    /// Fetch one envelope by key
    pub fn get_envelope(&self, key: &ArchiveKey) -> Result<Envelope> {
        self.store.get(key)
    }

    /// Run one page of a range query
    ///
    /// The returned cursor is the key of the last envelope in the page when
    /// the page is full; feed it back as `request.cursor` to continue.
    pub fn query_page(&self, request: &QueryRequest) -> Result<QueryPage> {
        let query = self.planner.plan(request)?;
        let mut iter = self.store.build_iterator(&query)?;

        let mut envelopes = Vec::with_capacity(query.limit().min(SCAN_CHUNK));
        let mut last_key = None;
        while let Some(envelope) = iter.next_envelope() {
            last_key = iter.current_key().copied();
            envelopes.push(envelope);
        }
        let error = iter.take_error();
        iter.release();

        if let Some(err) = error {
            return Err(err);
        }

        let next_cursor = if envelopes.len() == query.limit() {
            last_key
        } else {
            None
        };
        log::debug!(
            "Query page returned {} envelopes (more: {})",
            envelopes.len(),
            next_cursor.is_some()
        );

        Ok(QueryPage {
            envelopes,
            next_cursor,
        })
    }

    /// Delete every envelope sent before `before`
    pub fn prune_before(&self, before: DateTime<Utc>, batch_size: usize) -> Result<usize> {
        self.prune_before_with_cancel(before, batch_size, &CancellationToken::new())
    }

    /// Like [`prune_before`](Self::prune_before), stopping between batches once
    /// `cancel` fires. Batches already deleted stay deleted; call again with the
    /// same cutoff to finish.
    pub fn prune_before_with_cancel(
        &self,
        before: DateTime<Utc>,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let cutoff = to_unix_seconds(before);
        let removed = self.store.prune(cutoff, batch_size, cancel)?;
        log::info!("Pruned {} envelopes sent before {}", removed, before);
        Ok(removed)
    }

    /// Prune everything older than the configured retention period
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.prune_before(now - self.retention, self.prune_batch_size)
    }

    /// Close the backend; later calls fail with `Closed`
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }
}

/// Seconds since the epoch, clamped into the key's u32 range
fn to_unix_seconds(time: DateTime<Utc>) -> u32 {
    u32::try_from(time.timestamp().max(0)).unwrap_or(u32::MAX)
}

impl std::fmt::Debug for ArchiveService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveService")
            .field("planner", &self.planner)
            .field("metrics", &self.metrics)
            .field("prune_batch_size", &self.prune_batch_size)
            .finish()
    }
}

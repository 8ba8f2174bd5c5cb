//! Mailserver crate - Envelope archive for offline message delivery
//!
//! This crate provides the storage side of a mailserver node:
//! - Key codec ordering envelopes by send time, topic and hash
//! - Bloom filter and topic matching for query filtering
//! - Two interchangeable backends (redb and SQLite) behind [`ArchiveStore`]
//! - Cursor-based query planning and a uniform chunked iterator
//! - An archive service with metrics, paging and retention pruning
//!
//! Transport, peer authentication and request throttling live elsewhere; this
//! crate only sees already validated envelopes and query requests.

pub mod bloom;
pub mod config;
pub mod error;
pub mod iterator;
pub mod key;
pub mod metrics;
pub mod models;
pub mod query;
pub mod service;
pub mod storage;

pub use bloom::{BLOOM_FILTER_SIZE, BloomFilter};
pub use config::{ArchiveConfig, BackendConfig};
pub use error::{ArchiveError, Result};
pub use iterator::{ArchiveIterator, EnvelopeIterator};
pub use key::ArchiveKey;
pub use metrics::{ArchiveMetrics, MetricsSnapshot};
pub use models::{Envelope, EnvelopeBuilder, EnvelopeCodec, EnvelopeHash, Topic};
pub use query::{CursorQuery, QueryPlanner, QueryRequest, ScanFilter};
pub use service::{ArchiveService, QueryPage};
pub use storage::{ArchiveStore, RedbArchiveStore, SaveOutcome, SqliteArchiveStore};

//! SQLite-based envelope archive
//!
//! Range, topic and bloom predicates are all evaluated by SQLite. Bloom
//! containment uses the `bloom_contains(stored, query)` scalar function
//! registered on every connection.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use rusqlite_migration::{M, Migrations};
use tokio_util::sync::CancellationToken;

use super::traits::{ArchiveStore, SaveOutcome};
use crate::bloom::{self, BLOOM_FILTER_SIZE};
use crate::error::{ArchiveError, Result};
use crate::iterator::{ArchiveIterator, ArchiveRow, EnvelopeIterator, RowSource};
use crate::key::ArchiveKey;
use crate::models::{Envelope, EnvelopeCodec};
use crate::query::{CursorQuery, ScanFilter, UpperBound};

/// Database migrations
///
/// Applied in order at startup; the user_version pragma tracks progress.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: envelope table keyed by archive key
        M::up(
            r#"
            CREATE TABLE envelopes (
                id BLOB PRIMARY KEY,    -- 40-byte archive key
                data BLOB NOT NULL,     -- encoded envelope
                topic BLOB NOT NULL,    -- 4-byte topic
                bloom BLOB NOT NULL     -- 64-byte bloom filter
            ) WITHOUT ROWID;
            "#,
        ),
        // Migration 2: topic lookups
        M::up("CREATE INDEX idx_envelopes_topic ON envelopes(topic);"),
    ])
}

/// Register SQL functions used by archive queries
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "bloom_contains",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let stored = ctx
                .get_raw(0)
                .as_blob()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            let query = ctx
                .get_raw(1)
                .as_blob()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;

            let (Ok(stored), Ok(query)) = (
                <&[u8; BLOOM_FILTER_SIZE]>::try_from(stored),
                <&[u8; BLOOM_FILTER_SIZE]>::try_from(query),
            ) else {
                return Ok(false);
            };
            Ok(bloom::matches(stored, query))
        },
    )
}

/// Incrementally built SELECT with numbered placeholders
///
/// Every value goes through `bind`, which returns the placeholder to splice
/// into a clause; only column names and operators are ever formatted into SQL.
struct SelectBuilder {
    columns: &'static str,
    table: &'static str,
    conditions: Vec<String>,
    order_by: Option<&'static str>,
    limit: Option<String>,
    params: Vec<Value>,
}

impl SelectBuilder {
    fn new(columns: &'static str, table: &'static str) -> Self {
        Self {
            columns,
            table,
            conditions: Vec::new(),
            order_by: None,
            limit: None,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: impl Into<Value>) -> String {
        self.params.push(value.into());
        format!("?{}", self.params.len())
    }

    fn and_where(&mut self, condition: String) -> &mut Self {
        self.conditions.push(condition);
        self
    }

    fn order_by(&mut self, order: &'static str) -> &mut Self {
        self.order_by = Some(order);
        self
    }

    fn limit(&mut self, limit: usize) -> &mut Self {
        let placeholder = self.bind(limit as i64);
        self.limit = Some(placeholder);
        self
    }

    fn build(self) -> (String, Vec<Value>) {
        let mut sql = format!("SELECT {} FROM {}", self.columns, self.table);
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.conditions.join(" AND "));
        }
        if let Some(order) = self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ");
            sql.push_str(&limit);
        }
        (sql, self.params)
    }
}

/// Build the scan statement for one chunk of a cursor query
fn scan_statement(query: &CursorQuery, upper: &UpperBound, max: usize) -> (String, Vec<Value>) {
    let mut select = SelectBuilder::new("id, data", "envelopes");

    let lower = select.bind(query.lower().to_vec());
    select.and_where(format!("id >= {}", lower));
    let (op, upper_key) = match upper {
        UpperBound::Inclusive(key) => ("<=", key),
        UpperBound::Exclusive(key) => ("<", key),
    };
    let upper = select.bind(upper_key.to_vec());
    select.and_where(format!("id {} {}", op, upper));

    match query.filter() {
        ScanFilter::All => {}
        ScanFilter::Topics(topics) => {
            let placeholders: Vec<String> = topics
                .iter()
                .map(|topic| select.bind(topic.as_bytes().to_vec()))
                .collect();
            select.and_where(format!("topic IN ({})", placeholders.join(", ")));
        }
        ScanFilter::Bloom(filter) => {
            let bloom = select.bind(filter.as_bytes().to_vec());
            select.and_where(format!("bloom_contains(bloom, {})", bloom));
        }
    }

    select.order_by("id DESC").limit(max);
    select.build()
}

/// SQLite-based envelope archive
pub struct SqliteArchiveStore {
    conn: Mutex<Option<Connection>>,
    codec: EnvelopeCodec,
}

impl SqliteArchiveStore {
    /// Open (or create) an archive database file and bring its schema up to date
    pub fn new(db_path: impl AsRef<Path>, codec: EnvelopeCodec) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;

        // WAL lets readers proceed while a prune batch or insert is writing
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;

        let store = Self::with_connection(conn, codec)?;
        log::info!("Opened SQLite archive at {:?}", db_path);
        Ok(store)
    }

    /// Open a private in-memory archive
    pub fn in_memory(codec: EnvelopeCodec) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, codec)
    }

    fn with_connection(mut conn: Connection, codec: EnvelopeCodec) -> Result<Self> {
        migrations().to_latest(&mut conn)?;
        register_functions(&conn)?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            codec,
        })
    }

    /// Run `f` against the open connection
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_ref().ok_or(ArchiveError::Closed)?;
        f(conn)
    }
}

impl ArchiveStore for SqliteArchiveStore {
    fn save(&self, envelope: &Envelope) -> Result<SaveOutcome> {
        let raw = self.codec.encode(envelope)?;
        let key = envelope.archive_key();

        let changed = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO envelopes (id, data, topic, bloom)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO NOTHING",
            )?;
            Ok(stmt.execute(params![
                key.as_bytes(),
                raw,
                envelope.topic().as_bytes().as_slice(),
                envelope.bloom().as_bytes().as_slice(),
            ])?)
        })?;

        if changed == 0 {
            log::debug!("Envelope {} already archived", key);
            return Ok(SaveOutcome::Duplicate);
        }
        Ok(SaveOutcome::Inserted)
    }

    fn get(&self, key: &ArchiveKey) -> Result<Envelope> {
        let data: Option<Vec<u8>> = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT data FROM envelopes WHERE id = ?1")?;
            Ok(stmt
                .query_row([key.as_bytes()], |row| row.get(0))
                .optional()?)
        })?;

        match data {
            Some(data) => self.codec.decode(&data),
            None => Err(ArchiveError::NotFound(*key)),
        }
    }

    fn build_iterator(&self, query: &CursorQuery) -> Result<Box<dyn EnvelopeIterator + '_>> {
        query.validate()?;
        // Fail fast on a closed store rather than on the first fetch
        self.with_conn(|_| Ok(()))?;

        let source = SqliteRowSource { store: self };
        Ok(Box::new(ArchiveIterator::new(source, query.clone(), self.codec)))
    }

    fn prune(&self, before: u32, batch_size: usize, cancel: &CancellationToken) -> Result<usize> {
        if batch_size == 0 {
            return Err(ArchiveError::InvalidQuery("batch size must be positive".into()));
        }

        let lower = ArchiveKey::lower_bound(0);
        let upper = ArchiveKey::lower_bound(before);
        let mut removed = 0;

        loop {
            if cancel.is_cancelled() {
                log::info!("Prune cancelled after removing {} envelopes", removed);
                break;
            }

            // One statement per batch; the lock is released in between so
            // inserts and scans interleave with a long prune
            let batch = self.with_conn(|conn| {
                let mut stmt = conn.prepare_cached(
                    "DELETE FROM envelopes WHERE id IN (
                         SELECT id FROM envelopes
                         WHERE id >= ?1 AND id < ?2
                         ORDER BY id
                         LIMIT ?3
                     )",
                )?;
                Ok(stmt.execute(params![lower.as_bytes(), upper.as_bytes(), batch_size as i64])?)
            })?;

            removed += batch;
            log::debug!("Pruned batch of {} envelopes ({} total)", batch, removed);

            if batch < batch_size {
                break;
            }
        }

        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM envelopes", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    fn close(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, err)| ArchiveError::from(err))?;
            log::info!("Closed SQLite archive");
        }
        Ok(())
    }
}

/// Scan source issuing one bounded SELECT per chunk
struct SqliteRowSource<'a> {
    store: &'a SqliteArchiveStore,
}

impl RowSource for SqliteRowSource<'_> {
    fn fetch(&mut self, query: &CursorQuery, upper: &UpperBound, max: usize) -> Result<Vec<ArchiveRow>> {
        let (sql, values) = scan_statement(query, upper, max);

        let raw_rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        raw_rows
            .into_iter()
            .map(|(id, data)| {
                Ok(ArchiveRow {
                    key: ArchiveKey::decode(&id)?,
                    data,
                })
            })
            .collect()
    }
}

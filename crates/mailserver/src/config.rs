//! Archive configuration
//!
//! Loaded from `archive.json` in the mailserver config directory. Every field
//! has a default, so a missing file or a partial file is fine:
//!
//! ```json
//! {
//!   "backend": { "kind": "sqlite", "path": "/var/lib/mailserver/archive.sqlite" },
//!   "max_query_limit": 500,
//!   "data_retention_days": 7
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::{DEFAULT_MAX_ENVELOPE_SIZE, EnvelopeCodec};
use crate::query::DEFAULT_MAX_QUERY_LIMIT;
use crate::storage::{ArchiveStore, RedbArchiveStore, SqliteArchiveStore};

/// Config filename in the mailserver config directory
pub const CONFIG_FILE: &str = "archive.json";

/// Which storage backend to use, and where
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Embedded ordered key-value store
    Redb { path: PathBuf },
    /// Relational store
    Sqlite { path: PathBuf },
}

impl BackendConfig {
    /// Open the configured backend
    pub fn open(&self, codec: EnvelopeCodec) -> Result<Box<dyn ArchiveStore>> {
        Ok(match self {
            Self::Redb { path } => Box::new(
                RedbArchiveStore::new(path, codec)
                    .with_context(|| format!("Failed to open redb archive at {:?}", path))?,
            ),
            Self::Sqlite { path } => Box::new(
                SqliteArchiveStore::new(path, codec)
                    .with_context(|| format!("Failed to open SQLite archive at {:?}", path))?,
            ),
        })
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Redb { path } | Self::Sqlite { path } => path,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        let dir = config::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::Redb {
            path: dir.join("archive.redb"),
        }
    }
}

/// Archive service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub backend: BackendConfig,
    /// Largest encoded envelope accepted for archiving, in bytes
    pub max_envelope_size: usize,
    /// Rows per page ceiling; larger requested limits are clamped
    pub max_query_limit: u32,
    /// Rows deleted per prune write
    pub prune_batch_size: usize,
    /// Envelopes older than this many days are pruned by `prune_expired`
    pub data_retention_days: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
            max_query_limit: DEFAULT_MAX_QUERY_LIMIT,
            prune_batch_size: 1000,
            data_retention_days: 1,
        }
    }
}

impl ArchiveConfig {
    /// Load `archive.json` from the config directory, or defaults when absent
    pub fn load() -> Result<Self> {
        config::load_json_or_default(CONFIG_FILE)
    }

    /// Load from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }

    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse archive config JSON")
    }

    /// Whether `archive.json` exists in the config directory
    pub fn exists() -> bool {
        config::config_exists(CONFIG_FILE)
    }

    /// Write to `archive.json` in the config directory
    pub fn save(&self) -> Result<()> {
        config::save_json(CONFIG_FILE, self)
    }

    /// Write to a specific JSON file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        config::save_json_file(path, self)
    }

    pub fn codec(&self) -> EnvelopeCodec {
        EnvelopeCodec::new(self.max_envelope_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sqlite_backend() {
        let json = r#"{
            "backend": { "kind": "sqlite", "path": "/tmp/archive.sqlite" },
            "max_query_limit": 50
        }"#;

        let config = ArchiveConfig::from_json(json).unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Sqlite {
                path: PathBuf::from("/tmp/archive.sqlite")
            }
        );
        assert_eq!(config.max_query_limit, 50);
        assert_eq!(config.max_envelope_size, DEFAULT_MAX_ENVELOPE_SIZE);
        assert_eq!(config.prune_batch_size, 1000);
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = ArchiveConfig::from_json("{}").unwrap();
        assert_eq!(config, ArchiveConfig::default());
        assert!(matches!(config.backend, BackendConfig::Redb { .. }));
    }

    #[test]
    fn test_unknown_backend_kind_fails() {
        let json = r#"{ "backend": { "kind": "postgres", "path": "x" } }"#;
        assert!(ArchiveConfig::from_json(json).is_err());
    }

    #[test]
    fn test_save_then_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join(CONFIG_FILE);
        let config = ArchiveConfig {
            backend: BackendConfig::Sqlite {
                path: dir.path().join("archive.sqlite"),
            },
            data_retention_days: 14,
            ..ArchiveConfig::default()
        };

        config.save_to(&path).unwrap();
        assert_eq!(ArchiveConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_open_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = BackendConfig::Sqlite {
            path: dir.path().join("archive.sqlite"),
        };
        let store = backend.open(EnvelopeCodec::default()).unwrap();
        assert!(store.is_empty().unwrap());
    }
}

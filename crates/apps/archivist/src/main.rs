//! Archivist - Administrative CLI for the mailserver envelope archive
//!
//! Opens the archive named by `archive.json` (or `--config`) and runs a single
//! operation against it: save, get, query, prune or count. `init` writes a
//! default config file.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use log::info;
use mailserver::{
    ArchiveConfig, ArchiveKey, ArchiveMetrics, ArchiveService, BloomFilter, Envelope, QueryRequest,
    Topic,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "archivist", about = "Inspect and maintain a mailserver envelope archive")]
struct Cli {
    /// Archive config file (defaults to archive.json in the config directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Archive one envelope.
    Save {
        /// Topic as 8 hex digits.
        #[arg(long)]
        topic: Topic,
        /// Time to live in seconds.
        #[arg(long, default_value = "60")]
        ttl: u32,
        /// Send time (unix seconds). Defaults to now.
        #[arg(long)]
        sent: Option<u32>,
        /// Proof-of-work nonce.
        #[arg(long, default_value = "0")]
        nonce: u64,
        /// Payload given inline.
        #[arg(long, conflicts_with = "file")]
        payload: Option<String>,
        /// Payload read from a file.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Print one envelope by archive key.
    Get {
        /// Archive key (80 hex digits).
        key: ArchiveKey,
    },

    /// Print one page of envelopes.
    Query {
        /// Lower bound on send time (unix seconds, inclusive).
        #[arg(long, default_value = "0")]
        start: u32,
        /// Upper bound on send time (unix seconds, inclusive).
        #[arg(long)]
        end: Option<u32>,
        /// Exact topic match; repeat or comma-separate for several.
        #[arg(long, value_delimiter = ',')]
        topic: Vec<Topic>,
        /// 64-byte bloom filter as hex.
        #[arg(long, conflicts_with = "topic")]
        bloom: Option<String>,
        /// Page size.
        #[arg(long, default_value = "100")]
        limit: u32,
        /// Cursor returned by a previous page.
        #[arg(long)]
        cursor: Option<ArchiveKey>,
    },

    /// Delete old envelopes.
    Prune {
        /// Delete envelopes sent before this time (unix seconds). Defaults to
        /// the configured retention period.
        #[arg(long)]
        before: Option<i64>,
        /// Rows per delete batch.
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Print the number of archived envelopes.
    Count,

    /// Write a default archive config file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    if let Command::Init { force } = cli.command {
        return init(cli.config.as_deref(), force);
    }

    let config = match &cli.config {
        Some(path) => ArchiveConfig::from_file(path)?,
        None => ArchiveConfig::load()?,
    };

    let service = ArchiveService::open(&config, Arc::new(ArchiveMetrics::new()))?;
    let result = run(&service, &config, cli.command);
    service.close()?;
    result
}

fn run(service: &ArchiveService, config: &ArchiveConfig, command: Command) -> Result<()> {
    match command {
        Command::Save {
            topic,
            ttl,
            sent,
            nonce,
            payload,
            file,
        } => {
            let data = match (payload, file) {
                (Some(payload), _) => payload.into_bytes(),
                (None, Some(path)) => std::fs::read(&path)
                    .with_context(|| format!("Failed to read payload from {:?}", path))?,
                (None, None) => bail!("either --payload or --file is required"),
            };
            let sent = match sent {
                Some(sent) => sent,
                None => u32::try_from(Utc::now().timestamp()).context("clock out of range")?,
            };

            let envelope = Envelope::builder(topic)
                .sent_at(sent, ttl)
                .nonce(nonce)
                .data(data)
                .build();
            let outcome = service.save_envelope(&envelope)?;
            info!("Saved {} ({:?})", envelope.archive_key(), outcome);
            println!("{}", envelope.archive_key());
        }

        Command::Get { key } => {
            let envelope = service.get_envelope(&key)?;
            println!("{}", serde_json::to_string_pretty(&envelope_json(&envelope))?);
        }

        Command::Query {
            start,
            end,
            topic,
            bloom,
            limit,
            cursor,
        } => {
            let mut request = QueryRequest::new(start, end, limit).with_topics(topic);
            if let Some(bloom) = bloom {
                request = request.with_bloom(parse_bloom(&bloom)?);
            }
            if let Some(cursor) = cursor {
                request = request.with_cursor(cursor);
            }

            let page = service.query_page(&request)?;
            let output = json!({
                "envelopes": page.envelopes.iter().map(envelope_json).collect::<Vec<_>>(),
                "next_cursor": page.next_cursor.map(|k| k.to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Command::Prune { before, batch_size } => {
            let removed = match (before, batch_size) {
                (None, None) => service.prune_expired(Utc::now())?,
                (before, batch_size) => {
                    let before = match before {
                        Some(secs) => DateTime::<Utc>::from_timestamp(secs, 0)
                            .with_context(|| format!("invalid timestamp {}", secs))?,
                        None => Utc::now() - Duration::days(i64::from(config.data_retention_days)),
                    };
                    service.prune_before(before, batch_size.unwrap_or(config.prune_batch_size))?
                }
            };
            println!("{}", removed);
        }

        Command::Count => {
            println!("{}", service.store().len()?);
        }

        Command::Init { .. } => bail!("init runs without opening the archive"),
    }
    Ok(())
}

fn init(path: Option<&Path>, force: bool) -> Result<()> {
    let exists = match path {
        Some(path) => path.exists(),
        None => ArchiveConfig::exists(),
    };
    if exists && !force {
        bail!("archive config already exists; pass --force to overwrite");
    }

    let config = ArchiveConfig::default();
    match path {
        Some(path) => config.save_to(path)?,
        None => config.save()?,
    }
    info!("Wrote default archive config (backend at {:?})", config.backend.path());
    Ok(())
}

fn parse_bloom(s: &str) -> Result<BloomFilter> {
    let bytes = hex::decode(s.trim_start_matches("0x")).context("bloom is not valid hex")?;
    BloomFilter::try_from(bytes.as_slice())
        .map_err(|len| anyhow::anyhow!("bloom must be 64 bytes, got {}", len))
}

fn envelope_json(envelope: &Envelope) -> serde_json::Value {
    json!({
        "key": envelope.archive_key().to_string(),
        "topic": envelope.topic().to_string(),
        "sent": envelope.sent_time(),
        "expiry": envelope.expiry(),
        "ttl": envelope.ttl(),
        "nonce": envelope.nonce(),
        "hash": envelope.hash().to_string(),
        "data": hex::encode(envelope.data()),
    })
}

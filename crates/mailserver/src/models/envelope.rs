//! Envelope model and its archived encoding

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{EnvelopeHash, Topic};
use crate::bloom::BloomFilter;
use crate::error::{ArchiveError, Result};
use crate::key::ArchiveKey;

/// Fixed per-envelope protocol overhead added to the payload length when
/// reporting envelope sizes
pub const ENVELOPE_HEADER_LENGTH: usize = 20;

/// Default cap on an encoded envelope (1 MiB)
pub const DEFAULT_MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// A broadcast envelope as handed over by the transport layer
///
/// The payload is opaque (already encrypted upstream). Routing metadata
/// (topic, expiry, ttl, bloom) travels in the clear. Envelopes are immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    expiry: u32,
    ttl: u32,
    topic: Topic,
    nonce: u64,
    hash: EnvelopeHash,
    bloom: BloomFilter,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

impl Envelope {
    /// Start building an envelope for a topic
    pub fn builder(topic: Topic) -> EnvelopeBuilder {
        EnvelopeBuilder::new(topic)
    }

    /// Assemble an envelope from upstream-provided metadata, trusting its hash and bloom
    pub fn from_parts(
        expiry: u32,
        ttl: u32,
        topic: Topic,
        nonce: u64,
        hash: EnvelopeHash,
        bloom: BloomFilter,
        data: Vec<u8>,
    ) -> Self {
        Self {
            expiry,
            ttl,
            topic,
            nonce,
            hash,
            bloom,
            data,
        }
    }

    pub fn expiry(&self) -> u32 {
        self.expiry
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// Second the envelope was sent (`expiry - ttl`)
    pub fn sent_time(&self) -> u32 {
        self.expiry.saturating_sub(self.ttl)
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn hash(&self) -> EnvelopeHash {
        self.hash
    }

    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Wire size: payload plus the fixed protocol header
    pub fn size(&self) -> usize {
        ENVELOPE_HEADER_LENGTH + self.data.len()
    }

    /// Key under which this envelope is archived
    pub fn archive_key(&self) -> ArchiveKey {
        ArchiveKey::new(self.sent_time(), self.topic, self.hash)
    }

    /// Content hash over the header fields and payload
    fn compute_hash(expiry: u32, ttl: u32, topic: &Topic, nonce: u64, data: &[u8]) -> EnvelopeHash {
        let mut hasher = Sha256::new();
        hasher.update(expiry.to_be_bytes());
        hasher.update(ttl.to_be_bytes());
        hasher.update(topic.as_bytes());
        hasher.update(nonce.to_be_bytes());
        hasher.update(data);
        EnvelopeHash(hasher.finalize().into())
    }
}

/// Builder for creating Envelope instances
pub struct EnvelopeBuilder {
    topic: Topic,
    expiry: u32,
    ttl: u32,
    nonce: u64,
    bloom: Option<BloomFilter>,
    data: Vec<u8>,
}

impl EnvelopeBuilder {
    fn new(topic: Topic) -> Self {
        Self {
            topic,
            expiry: 0,
            ttl: 0,
            nonce: 0,
            bloom: None,
            data: Vec::new(),
        }
    }

    pub fn expiry(mut self, expiry: u32) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set expiry and ttl so that the envelope reports `sent_time`
    pub fn sent_at(mut self, sent_time: u32, ttl: u32) -> Self {
        self.expiry = sent_time.saturating_add(ttl);
        self.ttl = ttl;
        self
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    /// Override the bloom derived from the topic
    pub fn bloom(mut self, bloom: BloomFilter) -> Self {
        self.bloom = Some(bloom);
        self
    }

    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn build(self) -> Envelope {
        let hash = Envelope::compute_hash(self.expiry, self.ttl, &self.topic, self.nonce, &self.data);
        Envelope {
            expiry: self.expiry,
            ttl: self.ttl,
            topic: self.topic,
            nonce: self.nonce,
            hash,
            bloom: self
                .bloom
                .unwrap_or_else(|| BloomFilter::from_topic(&self.topic)),
            data: self.data,
        }
    }
}

/// Serializes envelopes for storage (MessagePack) and enforces a size cap
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_size: usize,
}

impl EnvelopeCodec {
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Encode an envelope; fails with [`ArchiveError::Encode`] without side effects
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let raw = rmp_serde::to_vec(envelope).map_err(|e| ArchiveError::Encode(e.to_string()))?;
        if raw.is_empty() {
            return Err(ArchiveError::Encode("envelope encoded to zero bytes".into()));
        }
        if raw.len() > self.max_size {
            return Err(ArchiveError::Encode(format!(
                "encoded envelope is {} bytes, limit is {}",
                raw.len(),
                self.max_size
            )));
        }
        Ok(raw)
    }

    /// Decode a stored envelope
    pub fn decode(&self, raw: &[u8]) -> Result<Envelope> {
        rmp_serde::from_slice(raw).map_err(|e| ArchiveError::Corrupt(e.to_string()))
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENVELOPE_SIZE)
    }
}

//! Archive key codec
//!
//! Layout (40 bytes): `sent_time (u32 BE) | topic (4) | hash (32)`.
//! Comparing keys byte-wise orders envelopes by the second they were sent,
//! then by topic, then by hash, so the key doubles as the scan order.

use std::fmt;
use std::str::FromStr;

use crate::error::{ArchiveError, Result};
use crate::models::{EnvelopeHash, Topic};

/// Ordered primary key of an archived envelope
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveKey([u8; ArchiveKey::LEN]);

impl ArchiveKey {
    pub const LEN: usize = 40;

    const TOPIC_OFFSET: usize = 4;
    const HASH_OFFSET: usize = 8;

    /// Encode a key from its parts
    pub fn new(sent_time: u32, topic: Topic, hash: EnvelopeHash) -> Self {
        let mut raw = [0u8; Self::LEN];
        raw[..Self::TOPIC_OFFSET].copy_from_slice(&sent_time.to_be_bytes());
        raw[Self::TOPIC_OFFSET..Self::HASH_OFFSET].copy_from_slice(topic.as_bytes());
        raw[Self::HASH_OFFSET..].copy_from_slice(hash.as_bytes());
        Self(raw)
    }

    /// Decode a key from raw bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw = <[u8; Self::LEN]>::try_from(bytes)
            .map_err(|_| ArchiveError::MalformedKey { len: bytes.len() })?;
        Ok(Self(raw))
    }

    /// Smallest key for a given second
    pub fn lower_bound(sent_time: u32) -> Self {
        Self::new(sent_time, Topic([0; 4]), EnvelopeHash([0; 32]))
    }

    /// Largest key for a given second
    pub fn upper_bound(sent_time: u32) -> Self {
        Self::new(sent_time, Topic([0xff; 4]), EnvelopeHash([0xff; 32]))
    }

    pub fn sent_time(&self) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.0[..Self::TOPIC_OFFSET]);
        u32::from_be_bytes(buf)
    }

    pub fn topic(&self) -> Topic {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.topic_bytes());
        Topic(buf)
    }

    pub fn hash(&self) -> EnvelopeHash {
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&self.0[Self::HASH_OFFSET..]);
        EnvelopeHash(buf)
    }

    /// Split back into `(sent_time, topic, hash)`
    pub fn into_parts(self) -> (u32, Topic, EnvelopeHash) {
        (self.sent_time(), self.topic(), self.hash())
    }

    /// Topic bytes of a raw key, without copying
    pub(crate) fn topic_bytes(&self) -> &[u8] {
        &self.0[Self::TOPIC_OFFSET..Self::HASH_OFFSET]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl TryFrom<&[u8]> for ArchiveKey {
    type Error = ArchiveError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Self::decode(bytes)
    }
}

impl AsRef<[u8]> for ArchiveKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveKey({})", self)
    }
}

impl FromStr for ArchiveKey {
    type Err = ArchiveError;

    /// Parse a hex-encoded key, with or without a `0x` prefix
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim_start_matches("0x");
        let bytes = hex::decode(s).map_err(|_| ArchiveError::MalformedKey { len: s.len() / 2 })?;
        Self::decode(&bytes)
    }
}

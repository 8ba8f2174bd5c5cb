//! Topic bloom filters
//!
//! Each topic sets three bits of a 512-bit filter. A query filter is the OR of
//! the filters of every topic the caller cares about, and an envelope matches
//! when every bit of its own filter is also set in the query filter. This can
//! over-match (two topics may share bits) but never under-match.

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::models::Topic;

/// Size of a bloom filter in bytes
pub const BLOOM_FILTER_SIZE: usize = 64;

/// Fixed 512-bit topic filter
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BloomFilter([u8; BLOOM_FILTER_SIZE]);

impl BloomFilter {
    /// The all-zero filter
    pub const fn empty() -> Self {
        Self([0; BLOOM_FILTER_SIZE])
    }

    /// The all-ones filter, matching every envelope
    pub const fn full() -> Self {
        Self([0xff; BLOOM_FILTER_SIZE])
    }

    pub const fn from_bytes(bytes: [u8; BLOOM_FILTER_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derive the filter for a single topic
    ///
    /// Bytes 0..3 of the topic select a bit index each; bit `j` of topic byte 3
    /// extends index `j` into the upper 256 bits.
    pub fn from_topic(topic: &Topic) -> Self {
        let t = topic.as_bytes();
        let mut bits = [0u8; BLOOM_FILTER_SIZE];
        for j in 0..3 {
            let mut index = t[j] as usize;
            if t[3] & (1 << j) != 0 {
                index += 256;
            }
            bits[index / 8] |= 1 << (index % 8);
        }
        Self(bits)
    }

    /// OR together the filters of every topic
    pub fn combine<'a>(topics: impl IntoIterator<Item = &'a Topic>) -> Self {
        topics.into_iter().fold(Self::empty(), |mut acc, topic| {
            acc.merge(&Self::from_topic(topic));
            acc
        })
    }

    /// OR another filter into this one
    pub fn merge(&mut self, other: &BloomFilter) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a |= b;
        }
    }

    /// Containment test: every bit of `self` is set in `query`
    pub fn matched_by(&self, query: &BloomFilter) -> bool {
        matches(&self.0, &query.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; BLOOM_FILTER_SIZE] {
        &self.0
    }
}

/// Returns true when `envelope & query == envelope`
///
/// Runs once per candidate row on backends without filter pushdown, so it
/// works on borrowed fixed-size arrays and never allocates.
pub fn matches(envelope: &[u8; BLOOM_FILTER_SIZE], query: &[u8; BLOOM_FILTER_SIZE]) -> bool {
    envelope
        .iter()
        .zip(query.iter())
        .all(|(e, q)| e & q == *e)
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BloomFilter({})", hex::encode(self.0))
    }
}

impl TryFrom<&[u8]> for BloomFilter {
    type Error = usize;

    /// Fails with the offending length unless exactly 64 bytes
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        <[u8; BLOOM_FILTER_SIZE]>::try_from(bytes)
            .map(Self)
            .map_err(|_| bytes.len())
    }
}

impl Serialize for BloomFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for BloomFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(BloomVisitor)
    }
}

struct BloomVisitor;

impl<'de> Visitor<'de> for BloomVisitor {
    type Value = BloomFilter;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bloom filter bytes", BLOOM_FILTER_SIZE)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        BloomFilter::try_from(v).map_err(|len| E::invalid_length(len, &self))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut bits = [0u8; BLOOM_FILTER_SIZE];
        for (i, byte) in bits.iter_mut().enumerate() {
            *byte = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        if seq.next_element::<u8>()?.is_some() {
            return Err(de::Error::invalid_length(BLOOM_FILTER_SIZE + 1, &self));
        }
        Ok(BloomFilter(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_bits(filter: &BloomFilter) -> u32 {
        filter.as_bytes().iter().map(|b| b.count_ones()).sum()
    }

    #[test]
    fn test_topic_sets_at_most_three_bits() {
        let filter = BloomFilter::from_topic(&Topic([1, 2, 3, 0]));
        assert_eq!(count_bits(&filter), 3);
        // Indices 1, 2, 3 all land in byte 0
        assert_eq!(filter.as_bytes()[0], 0b0000_1110);

        // Colliding indices collapse onto one bit
        let filter = BloomFilter::from_topic(&Topic([7, 7, 7, 0]));
        assert_eq!(count_bits(&filter), 1);
    }

    #[test]
    fn test_topic_high_bits_use_upper_half() {
        let filter = BloomFilter::from_topic(&Topic([0, 0, 0, 0b111]));
        // All three indices become 256 -> byte 32, bit 0
        assert_eq!(filter.as_bytes()[32], 1);
        assert_eq!(count_bits(&filter), 1);
    }

    #[test]
    fn test_combined_filter_matches_each_topic() {
        let topics = [Topic([0xaa; 4]), Topic([1, 2, 3, 4]), Topic([9, 8, 7, 6])];
        let query = BloomFilter::combine(&topics);
        for topic in &topics {
            assert!(BloomFilter::from_topic(topic).matched_by(&query));
        }
    }

    #[test]
    fn test_unrelated_topic_does_not_match() {
        let query = BloomFilter::combine(&[Topic([1, 2, 3, 0])]);
        let other = BloomFilter::from_topic(&Topic([100, 101, 102, 0]));
        assert!(!other.matched_by(&query));
    }

    #[test]
    fn test_full_and_empty_filters() {
        let envelope = BloomFilter::from_topic(&Topic([5, 6, 7, 8]));
        assert!(envelope.matched_by(&BloomFilter::full()));
        assert!(!envelope.matched_by(&BloomFilter::empty()));
        // An envelope with no bits is contained in anything
        assert!(BloomFilter::empty().matched_by(&BloomFilter::empty()));
        assert!(BloomFilter::empty().is_empty());
        assert!(!BloomFilter::full().is_empty());
    }

    #[test]
    fn test_try_from_rejects_wrong_length() {
        assert_eq!(BloomFilter::try_from(&[0u8; 10][..]), Err(10));
        assert!(BloomFilter::try_from(&[0u8; 64][..]).is_ok());
    }

    #[test]
    fn test_serde_json_roundtrip() {
        let filter = BloomFilter::from_topic(&Topic([1, 2, 3, 4]));
        let json = serde_json::to_string(&filter).unwrap();
        let back: BloomFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, filter);
    }
}

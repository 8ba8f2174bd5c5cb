//! Cursor query planning
//!
//! Turns a logical page request into a validated [`CursorQuery`]: key range
//! bounds, a row filter and a limit. Backends only ever see validated queries,
//! so they implement the raw descending scan and nothing else.

use serde::{Deserialize, Serialize};

use crate::bloom::{self, BLOOM_FILTER_SIZE, BloomFilter};
use crate::error::{ArchiveError, Result};
use crate::key::ArchiveKey;
use crate::models::Topic;

/// Default cap on rows per page
pub const DEFAULT_MAX_QUERY_LIMIT: u32 = 1000;

/// A page request as issued by RPC callers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Lower bound on sent time (inclusive)
    pub start: u32,
    /// Upper bound on sent time (inclusive); `None` means no upper bound
    pub end: Option<u32>,
    /// Exact topics to match
    #[serde(default)]
    pub topics: Vec<Topic>,
    /// Bloom filter to match when no topics are given
    #[serde(default)]
    pub bloom: Option<BloomFilter>,
    /// Maximum rows in the page
    pub limit: u32,
    /// Key of the last row of the previous page
    #[serde(default)]
    pub cursor: Option<Vec<u8>>,
}

impl QueryRequest {
    pub fn new(start: u32, end: impl Into<Option<u32>>, limit: u32) -> Self {
        Self {
            start,
            end: end.into(),
            limit,
            ..Default::default()
        }
    }

    pub fn with_topics(mut self, topics: impl IntoIterator<Item = Topic>) -> Self {
        self.topics = topics.into_iter().collect();
        self
    }

    pub fn with_bloom(mut self, bloom: BloomFilter) -> Self {
        self.bloom = Some(bloom);
        self
    }

    pub fn with_cursor(mut self, cursor: impl AsRef<[u8]>) -> Self {
        self.cursor = Some(cursor.as_ref().to_vec());
        self
    }
}

/// Row predicate applied on top of the key range
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    /// Time range only
    All,
    /// Topic is one of these (sorted, deduplicated)
    Topics(Vec<Topic>),
    /// Stored bloom is contained in this filter
    Bloom(BloomFilter),
}

impl ScanFilter {
    /// Evaluate the predicate against a row's key and stored bloom
    pub fn accepts(&self, key: &ArchiveKey, stored_bloom: &[u8; BLOOM_FILTER_SIZE]) -> bool {
        match self {
            Self::All => true,
            Self::Topics(topics) => topics
                .binary_search_by(|t| t.as_bytes().as_slice().cmp(key.topic_bytes()))
                .is_ok(),
            Self::Bloom(query) => bloom::matches(stored_bloom, query.as_bytes()),
        }
    }
}

/// Upper end of a descending scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpperBound {
    Inclusive(ArchiveKey),
    Exclusive(ArchiveKey),
}

impl UpperBound {
    pub fn key(&self) -> &ArchiveKey {
        match self {
            Self::Inclusive(key) | Self::Exclusive(key) => key,
        }
    }

    pub fn admits(&self, key: &ArchiveKey) -> bool {
        match self {
            Self::Inclusive(bound) => key <= bound,
            Self::Exclusive(bound) => key < bound,
        }
    }
}

/// Validated, backend-facing scan request
///
/// Rows come back in descending key order from `upper` down to `lower`
/// (inclusive), filtered, cut at `limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorQuery {
    lower: ArchiveKey,
    upper: UpperBound,
    filter: ScanFilter,
    limit: usize,
}

impl CursorQuery {
    pub fn lower(&self) -> &ArchiveKey {
        &self.lower
    }

    pub fn upper(&self) -> &UpperBound {
        &self.upper
    }

    pub fn filter(&self) -> &ScanFilter {
        &self.filter
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether this query continues a previous page
    pub fn is_continuation(&self) -> bool {
        matches!(self.upper, UpperBound::Exclusive(_))
    }

    /// Cheap structural check backends run before opening a scan
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(ArchiveError::InvalidQuery("limit must be positive".into()));
        }
        if let ScanFilter::Topics(topics) = &self.filter
            && topics.is_empty()
        {
            return Err(ArchiveError::InvalidQuery("empty topic filter".into()));
        }
        Ok(())
    }
}

/// Validates page requests and resolves first-page vs continuation bounds
#[derive(Debug, Clone, Copy)]
pub struct QueryPlanner {
    max_limit: u32,
}

impl QueryPlanner {
    pub fn new(max_limit: u32) -> Self {
        Self { max_limit }
    }

    pub fn plan(&self, request: &QueryRequest) -> Result<CursorQuery> {
        if request.limit == 0 {
            return Err(ArchiveError::InvalidQuery("limit must be positive".into()));
        }

        // An all-zero bloom means "no bloom", not strict containment (which
        // would only admit envelopes whose own bloom is zero)
        let bloom = request.bloom.filter(|b| !b.is_empty());
        let filter = match (request.topics.is_empty(), bloom) {
            (false, Some(_)) => {
                return Err(ArchiveError::InvalidQuery(
                    "topics and bloom filter are mutually exclusive".into(),
                ));
            }
            (false, None) => {
                let mut topics = request.topics.clone();
                topics.sort();
                topics.dedup();
                ScanFilter::Topics(topics)
            }
            (true, Some(bloom)) => ScanFilter::Bloom(bloom),
            (true, None) => ScanFilter::All,
        };

        let lower = ArchiveKey::lower_bound(request.start);
        let upper = match &request.cursor {
            Some(raw) => UpperBound::Exclusive(ArchiveKey::decode(raw)?),
            None => {
                let end = request.end.unwrap_or(u32::MAX);
                if request.start > end {
                    return Err(ArchiveError::InvalidQuery(format!(
                        "start {} is after end {}",
                        request.start, end
                    )));
                }
                UpperBound::Inclusive(ArchiveKey::upper_bound(end))
            }
        };

        let limit = request.limit.min(self.max_limit);
        if limit < request.limit {
            log::debug!("Clamping query limit {} to {}", request.limit, limit);
        }

        Ok(CursorQuery {
            lower,
            upper,
            filter,
            limit: limit as usize,
        })
    }
}

impl Default for QueryPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUERY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EnvelopeHash;

    const AAAA: Topic = Topic(*b"AAAA");
    const BBBB: Topic = Topic(*b"BBBB");

    fn key(sent: u32, topic: Topic) -> ArchiveKey {
        ArchiveKey::new(sent, topic, EnvelopeHash([1; 32]))
    }

    #[test]
    fn test_first_page_uses_inclusive_end() {
        let query = QueryPlanner::default()
            .plan(&QueryRequest::new(100, 300, 10))
            .unwrap();
        assert_eq!(query.lower(), &ArchiveKey::lower_bound(100));
        assert_eq!(
            query.upper(),
            &UpperBound::Inclusive(ArchiveKey::upper_bound(300))
        );
        assert_eq!(query.filter(), &ScanFilter::All);
        assert!(!query.is_continuation());
        assert!(query.upper().admits(&key(300, AAAA)));
        assert!(!query.upper().admits(&key(301, AAAA)));
    }

    #[test]
    fn test_missing_end_means_unbounded() {
        let query = QueryPlanner::default()
            .plan(&QueryRequest::new(0, None, 1))
            .unwrap();
        assert_eq!(query.upper().key(), &ArchiveKey::upper_bound(u32::MAX));
    }

    #[test]
    fn test_cursor_is_exclusive_and_ignores_end() {
        let cursor = key(200, AAAA);
        let query = QueryPlanner::default()
            .plan(&QueryRequest::new(0, 300, 2).with_cursor(cursor))
            .unwrap();
        assert_eq!(query.upper(), &UpperBound::Exclusive(cursor));
        assert!(query.is_continuation());
        assert!(!query.upper().admits(&cursor));
        assert!(query.upper().admits(&key(199, BBBB)));
    }

    #[test]
    fn test_rejects_zero_limit() {
        let err = QueryPlanner::default()
            .plan(&QueryRequest::new(0, 10, 0))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidQuery(_)));
    }

    #[test]
    fn test_rejects_inverted_range() {
        let err = QueryPlanner::default()
            .plan(&QueryRequest::new(10, 5, 1))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidQuery(_)));
    }

    #[test]
    fn test_rejects_topics_with_bloom() {
        let request = QueryRequest::new(0, 10, 1)
            .with_topics([AAAA])
            .with_bloom(BloomFilter::full());
        let err = QueryPlanner::default().plan(&request).unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidQuery(_)));
    }

    #[test]
    fn test_topics_with_empty_bloom_uses_topics() {
        let request = QueryRequest::new(0, 10, 1)
            .with_topics([BBBB, AAAA, BBBB])
            .with_bloom(BloomFilter::empty());
        let query = QueryPlanner::default().plan(&request).unwrap();
        assert_eq!(query.filter(), &ScanFilter::Topics(vec![AAAA, BBBB]));
    }

    #[test]
    fn test_zero_bloom_alone_scans_everything() {
        let request = QueryRequest::new(0, 10, 1).with_bloom(BloomFilter::empty());
        let query = QueryPlanner::default().plan(&request).unwrap();
        assert_eq!(query.filter(), &ScanFilter::All);
    }

    #[test]
    fn test_rejects_malformed_cursor() {
        let request = QueryRequest::new(0, 10, 1).with_cursor([1u8, 2, 3]);
        let err = QueryPlanner::default().plan(&request).unwrap_err();
        assert!(matches!(err, ArchiveError::MalformedKey { len: 3 }));
    }

    #[test]
    fn test_limit_is_clamped() {
        let query = QueryPlanner::new(50)
            .plan(&QueryRequest::new(0, 10, 5000))
            .unwrap();
        assert_eq!(query.limit(), 50);
    }

    #[test]
    fn test_filter_accepts() {
        let stored = *BloomFilter::from_topic(&AAAA).as_bytes();

        let topics = ScanFilter::Topics(vec![AAAA]);
        assert!(topics.accepts(&key(1, AAAA), &stored));
        assert!(!topics.accepts(&key(1, BBBB), &stored));

        let bloom = ScanFilter::Bloom(BloomFilter::from_topic(&AAAA));
        assert!(bloom.accepts(&key(1, AAAA), &stored));
        let other = ScanFilter::Bloom(BloomFilter::from_topic(&BBBB));
        assert!(!other.accepts(&key(1, AAAA), &stored));

        assert!(ScanFilter::All.accepts(&key(1, BBBB), &stored));
    }
}

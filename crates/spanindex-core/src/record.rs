use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Upper bound on trace id length, keeps index keys well inside engine key limits.
pub const MAX_TRACE_ID_LEN: usize = 4096;

/// Kind of span a payload belongs to. Persisted as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SpanType {
    AckSpan,
    RequestSpan,
}

impl SpanType {
    pub const fn code(self) -> u8 {
        match self {
            Self::AckSpan => 0,
            Self::RequestSpan => 1,
        }
    }
}

impl From<SpanType> for u8 {
    fn from(span_type: SpanType) -> Self {
        span_type.code()
    }
}

impl TryFrom<u8> for SpanType {
    type Error = UnknownSpanType;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::AckSpan),
            1 => Ok(Self::RequestSpan),
            other => Err(UnknownSpanType(other)),
        }
    }
}

/// A span-type code with no matching variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownSpanType(pub u8);

impl fmt::Display for UnknownSpanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown span type code {}", self.0)
    }
}

impl std::error::Error for UnknownSpanType {}

/// Location of one span payload inside the external flat-file store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub trace_id: String,
    /// Segment discriminator within the trace.
    pub level_id: String,
    pub span_type: SpanType,

    // -- Location coordinates --
    pub file_name: String,
    pub offset: u64,
    pub length: u32,
}

impl IndexRecord {
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.trace_id.is_empty() {
            return Err(StorageError::InvalidRecord("empty trace id".into()));
        }
        if self.trace_id.len() > MAX_TRACE_ID_LEN {
            return Err(StorageError::InvalidRecord(format!(
                "trace id longer than {MAX_TRACE_ID_LEN} bytes"
            )));
        }
        if self.length == 0 {
            return Err(StorageError::InvalidRecord(format!(
                "zero-length payload for trace {}",
                self.trace_id
            )));
        }
        Ok(())
    }
}

/// Records submitted together in one write call.
///
/// Order carries no meaning to the store; the batch only bounds how many
/// records travel through one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    records: Vec<IndexRecord>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: IndexRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl From<Vec<IndexRecord>> for WriteBatch {
    fn from(records: Vec<IndexRecord>) -> Self {
        Self { records }
    }
}

impl FromIterator<IndexRecord> for WriteBatch {
    fn from_iter<I: IntoIterator<Item = IndexRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// Records found for one trace id, in no particular order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupResult {
    records: Vec<IndexRecord>,
}

impl LookupResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, IndexRecord> {
        self.records.iter()
    }
}

impl From<Vec<IndexRecord>> for LookupResult {
    fn from(records: Vec<IndexRecord>) -> Self {
        Self { records }
    }
}

impl IntoIterator for LookupResult {
    type Item = IndexRecord;
    type IntoIter = std::vec::IntoIter<IndexRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a LookupResult {
    type Item = &'a IndexRecord;
    type IntoIter = std::slice::Iter<'a, IndexRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

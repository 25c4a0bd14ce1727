use crate::error::StorageError;
use crate::location::StoreLocation;
use crate::record::{LookupResult, WriteBatch};

/// Counters describing what a store has done since it was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Engine flushes committed by the write path.
    pub flushes: u64,
    pub records_written: u64,
    /// Lookups that hit an engine or decode error and returned an empty result.
    pub lookup_failures: u64,
}

/// One time bucket's index store.
///
/// Writes take `&mut self`: a store has exactly one writer. Share it across
/// threads behind a `Mutex`.
pub trait IndexStore: Send + Sync {
    /// Bucket key this store was opened for.
    fn timestamp(&self) -> u64;

    fn location(&self) -> &StoreLocation;

    /// Persist every record in `batch`.
    ///
    /// Records are flushed to the engine in chunks. On error the call fails as
    /// a whole, but chunks flushed before the failure remain committed.
    fn write(&mut self, batch: &WriteBatch) -> Result<(), StorageError>;

    /// All records indexed under `trace_id`.
    ///
    /// Read failures are not returned: they produce an empty result and are
    /// counted in [`StoreStats::lookup_failures`]. Callers cannot tell an
    /// unreadable store from a missing trace through this call alone.
    fn lookup_by_trace_id(&self, trace_id: &str) -> LookupResult;

    /// Exact number of rows in the bucket, computed on every call.
    fn size(&self) -> Result<u64, StorageError>;

    fn stats(&self) -> StoreStats;

    /// Release the engine. Failures are logged, not returned. Later calls are
    /// rejected with [`StorageError::Closed`] (lookups return empty).
    fn close(&mut self);
}

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use spanindex_core::error::StorageError;
use spanindex_core::record::IndexRecord;
use tracing::{debug, warn};

/// Row table: `{row_id_be (8B)}` -> JSON-encoded [`IndexRecord`].
pub(crate) const TABLE_PARTITION: &str = "span_index";
/// Secondary index: `{trace_id_len_be (2B)}{trace_id}{row_id_be (8B)}` -> `{row_id_be (8B)}`.
pub(crate) const TRACE_ID_INDEX_PARTITION: &str = "span_index_by_trace_id";

/// What schema bootstrap found when a store was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootstrap {
    /// Empty address; table and index were created.
    Created,
    /// Table and index were already present and left untouched.
    Existing,
    /// The table existed without its index. The index was created and
    /// backfilled from `rows` table rows.
    Repaired { rows: u64 },
}

pub(crate) struct Schema {
    pub(crate) table: PartitionHandle,
    pub(crate) by_trace_id: PartitionHandle,
}

pub(crate) fn row_key(row_id: u64) -> [u8; 8] {
    row_id.to_be_bytes()
}

pub(crate) fn decode_row_id(bytes: &[u8]) -> Result<u64, StorageError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Read("invalid row id in index".into()))?;
    Ok(u64::from_be_bytes(raw))
}

/// Length-prefixed so one trace id is never a prefix match for another.
/// `None` if the id cannot be represented in the key layout.
pub(crate) fn trace_id_prefix(trace_id: &str) -> Option<Vec<u8>> {
    let len = u16::try_from(trace_id.len()).ok()?;
    let mut key = Vec::with_capacity(2 + trace_id.len() + 8);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(trace_id.as_bytes());
    Some(key)
}

pub(crate) fn trace_id_key(trace_id: &str, row_id: u64) -> Option<Vec<u8>> {
    let mut key = trace_id_prefix(trace_id)?;
    key.extend_from_slice(&row_key(row_id));
    Some(key)
}

/// Bring the keyspace to a usable schema. Never recreates a table that exists.
pub(crate) fn bootstrap(keyspace: &Keyspace) -> Result<(Schema, Bootstrap), StorageError> {
    let table_exists = keyspace.partition_exists(TABLE_PARTITION);
    let index_exists = keyspace.partition_exists(TRACE_ID_INDEX_PARTITION);
    debug!(table_exists, index_exists, "checked index store catalog");

    let table = open(keyspace, TABLE_PARTITION)?;
    let by_trace_id = open(keyspace, TRACE_ID_INDEX_PARTITION)?;
    let schema = Schema { table, by_trace_id };

    let outcome = match (table_exists, index_exists) {
        (true, true) => Bootstrap::Existing,
        (true, false) => {
            warn!("index store table has no trace id index, rebuilding");
            let rows = backfill_index(keyspace, &schema)?;
            Bootstrap::Repaired { rows }
        }
        (false, true) => {
            let stale = clear_index(keyspace, &schema)?;
            if stale > 0 {
                warn!(stale, "trace id index existed without its table, cleared it");
            }
            Bootstrap::Created
        }
        (false, false) => Bootstrap::Created,
    };
    Ok((schema, outcome))
}

fn open(keyspace: &Keyspace, name: &str) -> Result<PartitionHandle, StorageError> {
    keyspace
        .open_partition(name, PartitionCreateOptions::default())
        .map_err(|e| StorageError::Init(format!("failed to open partition {name}: {e}")))
}

/// Drop index entries left behind without a table; they would point at row
/// ids the new table is about to reuse.
fn clear_index(keyspace: &Keyspace, schema: &Schema) -> Result<u64, StorageError> {
    let mut batch = keyspace.batch();
    let mut stale = 0u64;
    for entry in schema.by_trace_id.iter() {
        let (key, _) =
            entry.map_err(|e| StorageError::Init(format!("failed to scan index: {e}")))?;
        batch.remove(&schema.by_trace_id, key);
        stale += 1;
    }
    batch
        .commit()
        .map_err(|e| StorageError::Init(format!("failed to clear stale index: {e}")))?;
    Ok(stale)
}

fn backfill_index(keyspace: &Keyspace, schema: &Schema) -> Result<u64, StorageError> {
    let mut batch = keyspace.batch();
    let mut rows = 0u64;
    for entry in schema.table.iter() {
        let (key, value) =
            entry.map_err(|e| StorageError::Init(format!("failed to scan table: {e}")))?;
        let row_id =
            decode_row_id(&key).map_err(|e| StorageError::Init(e.to_string()))?;
        let record: IndexRecord = serde_json::from_slice(&value)
            .map_err(|e| StorageError::Init(format!("undecodable row {row_id}: {e}")))?;
        let index_key = trace_id_key(&record.trace_id, row_id).ok_or_else(|| {
            StorageError::Init(format!("row {row_id} has an unindexable trace id"))
        })?;
        batch.insert(&schema.by_trace_id, index_key, row_key(row_id));
        rows += 1;
    }
    batch
        .commit()
        .map_err(|e| StorageError::Init(format!("failed to build trace id index: {e}")))?;
    Ok(rows)
}

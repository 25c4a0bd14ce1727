use std::sync::atomic::{AtomicU64, Ordering};

use fjall::{Config, Keyspace, PersistMode};
use spanindex_core::config::IndexConfig;
use spanindex_core::error::StorageError;
use spanindex_core::location::StoreLocation;
use spanindex_core::record::{IndexRecord, LookupResult, WriteBatch};
use spanindex_core::storage::{IndexStore, StoreStats};
use tracing::{debug, error, info, warn};

use crate::schema::{self, Bootstrap, Schema};

/// Write step a test can force to fail.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultStep {
    Commit,
    Persist,
}

struct Engine {
    keyspace: Keyspace,
    schema: Schema,
}

/// Index store for a single time bucket, backed by one fjall keyspace.
pub struct FjallBucketStore {
    timestamp: u64,
    location: StoreLocation,
    flush_threshold: usize,
    persist_mode: PersistMode,
    bootstrap: Bootstrap,
    /// `None` once closed.
    engine: Option<Engine>,
    next_row_id: u64,
    flushes: u64,
    records_written: u64,
    lookup_failures: AtomicU64,
    /// Fail at the given step once `flushes` reaches the count.
    #[cfg(test)]
    fault: Option<(FaultStep, u64)>,
}

impl FjallBucketStore {
    /// Open (or create) the store for the bucket `timestamp` under `config.base_path`.
    pub fn open(config: &IndexConfig, timestamp: u64) -> Result<Self, StorageError> {
        config
            .validate()
            .map_err(|e| StorageError::Init(e.to_string()))?;

        let location = config.location_generator().generate(timestamp);
        std::fs::create_dir_all(&location.directory).map_err(|e| {
            StorageError::Init(format!(
                "failed to create {}: {e}",
                location.directory.display()
            ))
        })?;

        let keyspace = Config::new(&location.path).open().map_err(|e| {
            StorageError::Init(format!("failed to open {}: {e}", location.path.display()))
        })?;
        let (schema, bootstrap) = schema::bootstrap(&keyspace)?;

        let next_row_id = match schema
            .table
            .last_key_value()
            .map_err(|e| StorageError::Init(format!("failed to read last row: {e}")))?
        {
            Some((key, _)) => {
                schema::decode_row_id(&key).map_err(|e| StorageError::Init(e.to_string()))? + 1
            }
            None => 0,
        };

        info!(
            timestamp,
            path = %location.path.display(),
            ?bootstrap,
            next_row_id,
            "opened index store"
        );

        Ok(Self {
            timestamp,
            location,
            flush_threshold: config.flush_threshold,
            persist_mode: if config.sync_on_flush {
                PersistMode::SyncAll
            } else {
                PersistMode::Buffer
            },
            bootstrap,
            engine: Some(Engine { keyspace, schema }),
            next_row_id,
            flushes: 0,
            records_written: 0,
            lookup_failures: AtomicU64::new(0),
            #[cfg(test)]
            fault: None,
        })
    }

    /// How the schema was brought up when this store was opened.
    pub fn bootstrap(&self) -> Bootstrap {
        self.bootstrap
    }

    #[cfg(test)]
    fn injected_fault(&self, step: FaultStep) -> Result<(), StorageError> {
        match self.fault {
            Some((at, after_flushes)) if at == step && self.flushes >= after_flushes => Err(
                StorageError::Write(format!("injected {step:?} failure")),
            ),
            _ => Ok(()),
        }
    }

    fn engine(&self) -> Result<&Engine, StorageError> {
        self.engine.as_ref().ok_or(StorageError::Closed)
    }

    fn try_lookup(&self, trace_id: &str) -> Result<Vec<IndexRecord>, StorageError> {
        let engine = self.engine()?;
        let Some(prefix) = schema::trace_id_prefix(trace_id) else {
            return Ok(Vec::new());
        };

        let mut results = Vec::new();
        for entry in engine.schema.by_trace_id.prefix(&prefix) {
            let (_key, value) = entry.map_err(|e| StorageError::Read(e.to_string()))?;
            let row_id = schema::decode_row_id(&value)?;
            let Some(row) = engine
                .schema
                .table
                .get(schema::row_key(row_id))
                .map_err(|e| StorageError::Read(e.to_string()))?
            else {
                continue;
            };
            let record: IndexRecord = serde_json::from_slice(&row)
                .map_err(|e| StorageError::Serialization(format!("row {row_id}: {e}")))?;
            if record.trace_id != trace_id {
                return Err(StorageError::Read(format!(
                    "row {row_id} is indexed under the wrong trace id"
                )));
            }
            results.push(record);
        }
        Ok(results)
    }
}

impl IndexStore for FjallBucketStore {
    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn location(&self) -> &StoreLocation {
        &self.location
    }

    fn write(&mut self, batch: &WriteBatch) -> Result<(), StorageError> {
        let engine = self.engine.as_ref().ok_or(StorageError::Closed)?;
        for record in batch.records() {
            record.validate()?;
        }

        // Each chunk commits on its own; a failure leaves earlier chunks in place.
        for chunk in batch.records().chunks(self.flush_threshold) {
            let mut flush = engine.keyspace.batch();
            let mut row_id = self.next_row_id;
            for record in chunk {
                let row = serde_json::to_vec(record)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                let index_key =
                    schema::trace_id_key(&record.trace_id, row_id).ok_or_else(|| {
                        StorageError::InvalidRecord(format!(
                            "unindexable trace id {}",
                            record.trace_id
                        ))
                    })?;
                flush.insert(&engine.schema.table, schema::row_key(row_id), row);
                flush.insert(&engine.schema.by_trace_id, index_key, schema::row_key(row_id));
                row_id += 1;
            }
            #[cfg(test)]
            self.injected_fault(FaultStep::Commit)?;
            flush.commit().map_err(|e| StorageError::Write(e.to_string()))?;

            // Committed rows are visible: their ids must never be handed out again,
            // even if persisting the journal fails below.
            self.next_row_id = row_id;
            self.flushes += 1;
            self.records_written += chunk.len() as u64;

            #[cfg(test)]
            self.injected_fault(FaultStep::Persist)?;
            engine
                .keyspace
                .persist(self.persist_mode)
                .map_err(|e| StorageError::Write(e.to_string()))?;
            debug!(
                timestamp = self.timestamp,
                records = chunk.len(),
                "flushed index records"
            );
        }
        Ok(())
    }

    /// Read errors are swallowed here on purpose: the caller gets an empty
    /// result, the failure is logged and counted in `lookup_failures`.
    fn lookup_by_trace_id(&self, trace_id: &str) -> LookupResult {
        match self.try_lookup(trace_id) {
            Ok(records) => records.into(),
            Err(e) => {
                self.lookup_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    timestamp = self.timestamp,
                    trace_id,
                    error = %e,
                    "index lookup failed, returning no records"
                );
                LookupResult::empty()
            }
        }
    }

    fn size(&self) -> Result<u64, StorageError> {
        let engine = self.engine()?;
        let len = engine
            .schema
            .table
            .len()
            .map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(len as u64)
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            flushes: self.flushes,
            records_written: self.records_written,
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
        }
    }

    fn close(&mut self) {
        let Some(engine) = self.engine.take() else {
            warn!(timestamp = self.timestamp, "index store already closed");
            return;
        };
        if let Err(e) = engine.keyspace.persist(PersistMode::SyncAll) {
            error!(
                timestamp = self.timestamp,
                error = %e,
                "failed to close index store"
            );
        }
        info!(timestamp = self.timestamp, "closed index store");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use super::*;
    use spanindex_core::record::SpanType;

    const BUCKET: u64 = 1_478_217_600_000;

    fn config(base: &Path) -> IndexConfig {
        IndexConfig::new(base)
    }

    fn make_record(trace_id: &str, offset: u64) -> IndexRecord {
        IndexRecord {
            trace_id: trace_id.to_string(),
            level_id: format!("0.{offset}"),
            span_type: SpanType::RequestSpan,
            file_name: "spans-0001.dat".to_string(),
            offset,
            length: 256,
        }
    }

    fn rand_trace_id() -> String {
        format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
    }

    fn batch_of(n: usize) -> WriteBatch {
        (0..n)
            .map(|i| make_record(&rand_trace_id(), i as u64 * 256))
            .collect()
    }

    #[test]
    fn test_write_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();
        assert_eq!(store.bootstrap(), Bootstrap::Created);

        let written = IndexRecord {
            trace_id: "trace-a".to_string(),
            level_id: "0.0.1".to_string(),
            span_type: SpanType::RequestSpan,
            file_name: "spans-0042.dat".to_string(),
            offset: 9_000_000_000,
            length: 512,
        };
        store.write(&vec![written.clone()].into()).unwrap();

        let found = store.lookup_by_trace_id("trace-a");
        assert_eq!(found.len(), 1);
        let record = &found.records()[0];
        assert_eq!(record.file_name, "spans-0042.dat");
        assert_eq!(record.offset, 9_000_000_000);
        assert_eq!(record.length, 512);
        assert_eq!(record.span_type, SpanType::RequestSpan);
        assert_eq!(record, &written);
    }

    #[test]
    fn test_lookup_groups_by_trace_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();

        let mut batch = WriteBatch::new();
        for i in 0..3 {
            batch.push(make_record("shared", i * 100));
        }
        let mut ack = make_record("shared", 999);
        ack.span_type = SpanType::AckSpan;
        batch.push(ack);
        batch.push(make_record("shared-suffix", 5));
        batch.push(make_record("other", 7));
        store.write(&batch).unwrap();

        let found = store.lookup_by_trace_id("shared");
        assert_eq!(found.len(), 4);
        assert!(found.iter().all(|r| r.trace_id == "shared"));
        assert_eq!(
            found
                .iter()
                .filter(|r| r.span_type == SpanType::AckSpan)
                .count(),
            1
        );
    }

    #[test]
    fn test_lookup_unknown_trace_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();
        store.write(&batch_of(3)).unwrap();

        assert!(store.lookup_by_trace_id("missing").is_empty());
        assert!(store.lookup_by_trace_id("").is_empty());
        assert_eq!(store.stats().lookup_failures, 0);
    }

    #[test]
    fn test_flush_boundaries() {
        for (n, expected_flushes) in [(1, 1), (20, 1), (21, 2), (40, 2), (41, 3), (45, 3)] {
            let dir = tempfile::tempdir().unwrap();
            let mut store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();
            store.write(&batch_of(n)).unwrap();

            let stats = store.stats();
            assert_eq!(stats.flushes, expected_flushes, "n = {n}");
            assert_eq!(stats.flushes, (n as u64 - 1) / 20 + 1, "n = {n}");
            assert_eq!(stats.records_written, n as u64);
            assert_eq!(store.size().unwrap(), n as u64);
        }
    }

    #[test]
    fn test_custom_flush_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.flush_threshold = 5;
        let mut store = FjallBucketStore::open(&cfg, BUCKET).unwrap();

        store.write(&batch_of(12)).unwrap();
        assert_eq!(store.stats().flushes, 3);
    }

    #[test]
    fn test_empty_batch_does_not_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();

        store.write(&WriteBatch::new()).unwrap();
        assert_eq!(store.stats().flushes, 0);
        assert_eq!(store.size().unwrap(), 0);
    }

    #[test]
    fn test_size_grows_by_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();

        store.write(&batch_of(7)).unwrap();
        let before = store.size().unwrap();
        store.write(&batch_of(13)).unwrap();
        assert_eq!(store.size().unwrap(), before + 13);
    }

    #[test]
    fn test_invalid_record_rejects_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();

        let mut batch = batch_of(30);
        batch.push(make_record("", 0));
        assert!(matches!(
            store.write(&batch),
            Err(StorageError::InvalidRecord(_))
        ));
        assert_eq!(store.size().unwrap(), 0);
        assert_eq!(store.stats().flushes, 0);
    }

    #[test]
    fn test_failed_flush_keeps_earlier_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();
        store.fault = Some((FaultStep::Commit, 1));

        assert!(matches!(
            store.write(&batch_of(45)),
            Err(StorageError::Write(_))
        ));
        assert_eq!(store.size().unwrap(), 20);
        assert_eq!(store.stats().flushes, 1);
        assert_eq!(store.stats().records_written, 20);

        store.fault = None;
        store.write(&batch_of(5)).unwrap();
        assert_eq!(store.size().unwrap(), 25);
    }

    #[test]
    fn test_persist_failure_does_not_reuse_row_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();
        store.fault = Some((FaultStep::Persist, 1));

        assert!(matches!(
            store.write(&vec![make_record("first", 0)].into()),
            Err(StorageError::Write(_))
        ));
        assert_eq!(store.stats().flushes, 1);
        assert_eq!(store.lookup_by_trace_id("first").len(), 1);

        store.fault = None;
        store.write(&vec![make_record("second", 0)].into()).unwrap();
        assert_eq!(store.size().unwrap(), 2);
        assert_eq!(store.lookup_by_trace_id("first").len(), 1);
        assert_eq!(store.lookup_by_trace_id("second").len(), 1);
        assert_eq!(store.stats().lookup_failures, 0);
    }

    #[test]
    fn test_reopen_keeps_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        let mut store = FjallBucketStore::open(&cfg, BUCKET).unwrap();
        store.write(&vec![make_record("kept", 1)].into()).unwrap();
        store.write(&batch_of(24)).unwrap();
        store.close();

        let mut reopened = FjallBucketStore::open(&cfg, BUCKET).unwrap();
        assert_eq!(reopened.bootstrap(), Bootstrap::Existing);
        assert_eq!(reopened.size().unwrap(), 25);
        assert_eq!(reopened.lookup_by_trace_id("kept").len(), 1);

        // Row ids continue after the existing rows instead of overwriting them.
        reopened.write(&vec![make_record("kept", 2)].into()).unwrap();
        assert_eq!(reopened.size().unwrap(), 26);
        assert_eq!(reopened.lookup_by_trace_id("kept").len(), 2);
    }

    #[test]
    fn test_missing_index_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let location = cfg.location_generator().generate(BUCKET);

        std::fs::create_dir_all(&location.directory).unwrap();
        {
            let keyspace = Config::new(&location.path).open().unwrap();
            let table = keyspace
                .open_partition(schema::TABLE_PARTITION, Default::default())
                .unwrap();
            for (row_id, trace_id) in ["t-1", "t-2", "t-1"].into_iter().enumerate() {
                let row = serde_json::to_vec(&make_record(trace_id, row_id as u64)).unwrap();
                table.insert(schema::row_key(row_id as u64), row).unwrap();
            }
            keyspace.persist(PersistMode::SyncAll).unwrap();
        }

        let store = FjallBucketStore::open(&cfg, BUCKET).unwrap();
        assert_eq!(store.bootstrap(), Bootstrap::Repaired { rows: 3 });
        assert_eq!(store.size().unwrap(), 3);
        assert_eq!(store.lookup_by_trace_id("t-1").len(), 2);
        assert_eq!(store.lookup_by_trace_id("t-2").len(), 1);
    }

    #[test]
    fn test_buckets_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        let mut first = FjallBucketStore::open(&cfg, BUCKET).unwrap();
        let mut second = FjallBucketStore::open(&cfg, BUCKET + 3_600_000).unwrap();
        assert_ne!(first.location().path, second.location().path);

        first.write(&vec![make_record("only-first", 0)].into()).unwrap();
        second.write(&vec![make_record("only-second", 0)].into()).unwrap();

        assert_eq!(first.lookup_by_trace_id("only-first").len(), 1);
        assert!(first.lookup_by_trace_id("only-second").is_empty());
        assert!(second.lookup_by_trace_id("only-first").is_empty());
        assert_eq!(first.size().unwrap(), 1);
        assert_eq!(second.size().unwrap(), 1);
    }

    #[test]
    fn test_corrupted_row_yields_empty_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();
        store.write(&vec![make_record("damaged", 0)].into()).unwrap();

        let table = &store.engine.as_ref().unwrap().schema.table;
        table.insert(schema::row_key(0), "not json").unwrap();

        assert!(store.lookup_by_trace_id("damaged").is_empty());
        assert_eq!(store.stats().lookup_failures, 1);
    }

    #[test]
    fn test_unknown_span_type_code_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();
        store.write(&vec![make_record("odd", 0)].into()).unwrap();

        let table = &store.engine.as_ref().unwrap().schema.table;
        let row = r#"{"trace_id":"odd","level_id":"0","span_type":7,"file_name":"f","offset":0,"length":1}"#;
        table.insert(schema::row_key(0), row).unwrap();

        assert!(store.lookup_by_trace_id("odd").is_empty());
        assert_eq!(store.stats().lookup_failures, 1);
    }

    #[test]
    fn test_operations_after_close_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();
        store.write(&batch_of(2)).unwrap();

        store.close();
        assert!(matches!(store.write(&batch_of(1)), Err(StorageError::Closed)));
        assert!(matches!(store.size(), Err(StorageError::Closed)));
        assert!(store.lookup_by_trace_id("anything").is_empty());
        assert_eq!(store.stats().lookup_failures, 1);

        // Second close is a no-op.
        store.close();
    }

    #[test]
    fn test_open_fails_when_base_path_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("occupied");
        std::fs::write(&base, b"not a directory").unwrap();

        assert!(matches!(
            FjallBucketStore::open(&config(&base), BUCKET),
            Err(StorageError::Init(_))
        ));
    }

    #[test]
    fn test_shared_writer_behind_mutex() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallBucketStore::open(&config(dir.path()), BUCKET).unwrap();
        let store = Arc::new(Mutex::new(store));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.lock().unwrap().write(&batch_of(10)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = store.lock().unwrap();
        assert_eq!(store.size().unwrap(), 40);
        assert_eq!(store.stats().records_written, 40);
    }
}

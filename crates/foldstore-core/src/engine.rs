//! Storage engine: RAM operand logs behind a crash-safe WAL.
//!
//! **Write path**: WAL first, then RAM, then mark the key for folding.
//! Sequence numbers are assigned under the WAL mutex, so WAL order and
//! log order always agree.
//! **Read path**: snapshot the key's log under the read lock, then run the
//! merge operator with no lock held.
//! **Compaction**: manual passes via `compact_range`/`compact_all`, and the
//! optional background fold worker.
//!
//! Lock order is WAL mutex, then table lock. Compaction passes also take
//! the compaction mutex first.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use log::info;
use parking_lot::{Mutex, RwLock};

use crate::batch::WriteBatch;
use crate::compaction::{compact_keys, CancelToken, CompactionReport};
use crate::config::Options;
use crate::error::{FoldError, FoldResult};
use crate::filter::FilterContext;
use crate::format::{LoggedOp, OpKind};
use crate::oplog::{KeyLog, LogSnapshot, Record, RecordKind};
use crate::operator::AssociativeMergeOperator;
use crate::resolve::resolve;
use crate::wal::{truncate_torn_tail, WalReader, WalWriter};
use crate::worker::{fold_marked, start_fold_worker, FoldTracker, FoldWorkerHandle};

/// The WAL writer and the sequence counter it stamps records with.
pub(crate) struct WalState {
    pub(crate) writer: WalWriter,
    pub(crate) next_seq: u64,
}

/// State shared between the store handle and the fold worker.
pub(crate) struct StoreCore {
    pub(crate) table: RwLock<HashMap<Vec<u8>, KeyLog>>,
    pub(crate) wal: Mutex<WalState>,
    pub(crate) compaction_lock: Mutex<()>,
    pub(crate) options: Options,
    pub(crate) tracker: FoldTracker,
}

impl StoreCore {
    pub(crate) fn operator(&self) -> Option<&dyn AssociativeMergeOperator> {
        self.options.merge_operator.as_deref()
    }
}

/// Point-in-time counters for a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Keys with a non-empty operand log (deleted keys count until purged)
    pub keys: usize,
    /// Merge operands waiting to be folded, across all keys
    pub pending_operands: usize,
    /// Keys queued for the background fold worker
    pub marked_keys: usize,
    /// Compaction passes completed since open
    pub compaction_passes: u64,
    /// Keys rewritten by compaction since open
    pub keys_folded: u64,
    /// Operands consumed by compaction since open
    pub operands_folded: u64,
    /// Keys compaction could not fold since open
    pub fold_failures: u64,
    /// Next sequence number to be assigned
    pub next_seq: u64,
    /// Bytes in the current WAL file
    pub wal_size: u64,
}

/// Merge-aware key-value store.
///
/// All public methods take `&self` for concurrent access. Readers share
/// the table lock; writers serialize through the WAL mutex and then hold
/// the table write lock only long enough to append to the key logs.
pub struct FoldStore {
    core: Arc<StoreCore>,
    worker: Mutex<Option<FoldWorkerHandle>>,
    path: PathBuf,
}

impl FoldStore {
    /// Open or create a store at `path`, replaying its WAL.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> FoldResult<Self> {
        options.config.validate()?;
        let path = path.as_ref().to_path_buf();
        let wal_dir = path.join("wal");

        let recovered = WalReader::new(&wal_dir).recover()?;
        if let Some((torn_path, offset)) = &recovered.torn_tail {
            truncate_torn_tail(torn_path, *offset)?;
        }
        let replayed = recovered.ops.len();
        let (table, next_seq) = replay(recovered.ops);

        if replayed > 0 {
            info!(
                "Recovered {} keys from {} WAL ops at {} (next seq {})",
                table.len(),
                replayed,
                wal_dir.display(),
                next_seq
            );
        }

        let writer = WalWriter::new(&wal_dir, options.config.wal_rotation_size_bytes)?;
        let core = StoreCore {
            table: RwLock::new(table),
            wal: Mutex::new(WalState { writer, next_seq }),
            compaction_lock: Mutex::new(()),
            options,
            tracker: FoldTracker::new(),
        };

        Ok(Self { core: Arc::new(core), worker: Mutex::new(None), path })
    }

    /// Store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &Options {
        &self.core.options
    }

    /// Replace the key's value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> FoldResult<()> {
        self.apply(vec![(key.to_vec(), RecordKind::Put(value.to_vec()))])
    }

    /// Append a merge operand to the key's log.
    ///
    /// Fails with `MissingMergeOperator` if no operator is configured. The
    /// operand is not checked against the operator here; a rejected operand
    /// surfaces on the next read of the key.
    pub fn merge(&self, key: &[u8], operand: &[u8]) -> FoldResult<()> {
        self.apply(vec![(key.to_vec(), RecordKind::Merge(operand.to_vec()))])
    }

    /// Write a tombstone for the key.
    pub fn delete(&self, key: &[u8]) -> FoldResult<()> {
        self.apply(vec![(key.to_vec(), RecordKind::Delete)])
    }

    /// Apply every write in `batch` atomically. The batch is left empty.
    pub fn write(&self, batch: &mut WriteBatch) -> FoldResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.validate_writes(batch.ops())?;
        let ops = batch.take_ops();
        self.apply_validated(ops)
    }

    /// Sync the WAL to persistent storage.
    ///
    /// With `Config::sync_writes` off, writes reach the OS but not the
    /// media; one call here makes everything written so far durable.
    pub fn sync_wal(&self) -> FoldResult<()> {
        self.core.wal.lock().writer.sync()
    }

    fn validate_writes(&self, ops: &[(Vec<u8>, RecordKind)]) -> FoldResult<()> {
        let config = &self.core.options.config;
        for (key, kind) in ops {
            if key.len() > config.max_key_size {
                return Err(FoldError::OversizedEntry {
                    entry_size: key.len() as u64,
                    max_size: config.max_key_size as u64,
                    component: "key".to_string(),
                });
            }
            match kind {
                RecordKind::Put(value) | RecordKind::Merge(value) if value.len() > config.max_value_size => {
                    return Err(FoldError::OversizedEntry {
                        entry_size: value.len() as u64,
                        max_size: config.max_value_size as u64,
                        component: "value".to_string(),
                    });
                }
                RecordKind::Merge(_) if self.core.operator().is_none() => {
                    return Err(FoldError::MissingMergeOperator { key: key.clone() });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn apply(&self, ops: Vec<(Vec<u8>, RecordKind)>) -> FoldResult<()> {
        self.validate_writes(&ops)?;
        self.apply_validated(ops)
    }

    /// WAL append, then RAM, then mark keys whose chains got long.
    ///
    /// If the WAL append fails, RAM is never modified.
    fn apply_validated(&self, ops: Vec<(Vec<u8>, RecordKind)>) -> FoldResult<()> {
        let config = &self.core.options.config;
        let mut to_mark = Vec::new();

        {
            let mut wal = self.core.wal.lock();
            let first_seq = wal.next_seq;
            let logged: Vec<LoggedOp> = ops
                .iter()
                .enumerate()
                .map(|(i, (key, kind))| {
                    let (kind, value) = match kind {
                        RecordKind::Put(v) => (OpKind::Put, v.clone()),
                        RecordKind::Delete => (OpKind::Delete, Vec::new()),
                        RecordKind::Merge(v) => (OpKind::Merge, v.clone()),
                    };
                    LoggedOp { kind, seq: first_seq + i as u64, key: key.clone(), value }
                })
                .collect();
            wal.writer.append(&logged, config.sync_writes)?;
            wal.next_seq += ops.len() as u64;

            let mut table = self.core.table.write();
            for (i, (key, kind)) in ops.into_iter().enumerate() {
                let log = table.entry(key.clone()).or_default();
                log.push(Record { seq: first_seq + i as u64, kind });
                if log.pending_operands() >= config.fold_trigger_operands {
                    to_mark.push(key);
                }
            }
        }

        for key in &to_mark {
            self.core.tracker.mark(key);
        }
        Ok(())
    }

    fn snapshot(&self, key: &[u8]) -> Option<LogSnapshot> {
        self.core.table.read().get(key).map(KeyLog::snapshot)
    }

    /// Resolve the key's current value.
    ///
    /// Returns `Ok(None)` for deleted or unknown keys. A merge operator
    /// failure on this key's chain is returned as `CombinatorFailure`;
    /// other keys are unaffected.
    pub fn get(&self, key: &[u8]) -> FoldResult<Option<Vec<u8>>> {
        match self.snapshot(key) {
            Some(snapshot) => Ok(resolve(self.core.operator(), key, &snapshot.records)?.value),
            None => Ok(None),
        }
    }

    /// True if the key resolves to a value.
    pub fn contains_key(&self, key: &[u8]) -> FoldResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Snapshots of every key matching `prefix`, sorted by key.
    fn sorted_snapshots(&self, prefix: &[u8]) -> Vec<(Vec<u8>, LogSnapshot)> {
        let table = self.core.table.read();
        let mut snapshots: Vec<(Vec<u8>, LogSnapshot)> = table
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, log)| (k.clone(), log.snapshot()))
            .collect();
        drop(table);
        snapshots.sort_by(|(a, _), (b, _)| a.cmp(b));
        snapshots
    }

    fn resolve_all(&self, prefix: &[u8]) -> FoldResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut results = Vec::new();
        for (key, snapshot) in self.sorted_snapshots(prefix) {
            if let Some(value) = resolve(self.core.operator(), &key, &snapshot.records)?.value {
                results.push((key, value));
            }
        }
        Ok(results)
    }

    /// Every live key-value pair, sorted by key.
    ///
    /// Stops at the first key whose chain fails to resolve.
    pub fn scan(&self) -> FoldResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.resolve_all(&[])
    }

    /// Live pairs whose key starts with `prefix`, sorted by key. Keys are
    /// returned whole.
    pub fn prefix_scan(&self, prefix: &[u8]) -> FoldResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.resolve_all(prefix)
    }

    /// Number of keys that resolve to a value.
    pub fn count_live(&self) -> FoldResult<usize> {
        let mut live = 0;
        for (key, snapshot) in self.sorted_snapshots(&[]) {
            if resolve(self.core.operator(), &key, &snapshot.records)?.value.is_some() {
                live += 1;
            }
        }
        Ok(live)
    }

    /// Number of keys with a log in RAM, including unpurged tombstones.
    pub fn key_count(&self) -> usize {
        self.core.table.read().len()
    }

    /// Merge operands written after the key's newest `Put` or `Delete`.
    pub fn pending_operands(&self, key: &[u8]) -> usize {
        self.core.table.read().get(key).map_or(0, KeyLog::pending_operands)
    }

    /// Fold every key in `[start, end)`. `None` leaves that side open.
    pub fn compact_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> FoldResult<CompactionReport> {
        self.compact_range_cancellable(start, end, &CancelToken::new())
    }

    /// Fold every key in the store.
    pub fn compact_all(&self) -> FoldResult<CompactionReport> {
        self.compact_range(None, None)
    }

    /// `compact_range`, stopping early once `cancel` fires.
    pub fn compact_range_cancellable(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        cancel: &CancelToken,
    ) -> FoldResult<CompactionReport> {
        let mut keys: Vec<Vec<u8>> = self
            .core
            .table
            .read()
            .keys()
            .filter(|k| start.map_or(true, |s| k.as_slice() >= s) && end.map_or(true, |e| k.as_slice() < e))
            .cloned()
            .collect();
        keys.sort();

        let ctx = FilterContext { full_compaction: start.is_none() && end.is_none(), manual_compaction: true };
        let mut report = compact_keys(&self.core, keys, ctx, cancel)?;
        self.core.tracker.record_pass(&report);
        if ctx.full_compaction && !report.cancelled {
            report.wal_files_reclaimed = self.checkpoint()?;
        }
        Ok(report)
    }

    /// Rewrite the WAL as a single checkpoint of the current key logs and
    /// delete the files it supersedes. Returns the number of files deleted.
    ///
    /// Runs after every full manual compaction; writes wait until it is done.
    pub fn checkpoint(&self) -> FoldResult<usize> {
        let _pass = self.core.compaction_lock.lock();
        let mut wal = self.core.wal.lock();
        let table = self.core.table.read();

        let mut logs: Vec<(&Vec<u8>, &KeyLog)> = table.iter().collect();
        logs.sort_by(|a, b| a.0.cmp(b.0));
        let mut ops = Vec::new();
        for (key, log) in logs {
            for record in log.records() {
                let (kind, value) = match &record.kind {
                    RecordKind::Put(v) => (OpKind::Put, v.clone()),
                    RecordKind::Delete => (OpKind::Delete, Vec::new()),
                    RecordKind::Merge(v) => (OpKind::Merge, v.clone()),
                };
                ops.push(LoggedOp { kind, seq: record.seq, key: key.clone(), value });
            }
        }
        drop(table);

        let marker_seq = wal.next_seq - 1;
        let removed = wal.writer.checkpoint(marker_seq, &ops)?;
        info!("Checkpointed {} WAL ops at {}, removed {} older files", ops.len(), self.path.display(), removed);
        Ok(removed)
    }

    /// Fold the keys marked for background folding on the calling thread.
    pub fn fold_marked(&self) -> FoldResult<CompactionReport> {
        fold_marked(&self.core, &CancelToken::new())
    }

    /// Start the background fold worker. No-op if it is already running.
    pub fn start_fold_worker(&self) -> FoldResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = Some(start_fold_worker(Arc::clone(&self.core))?);
        }
        Ok(())
    }

    /// Stop the background fold worker after one last pass.
    pub fn stop_fold_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.shutdown();
        }
    }

    pub fn is_fold_worker_running(&self) -> bool {
        self.worker.lock().as_ref().map_or(false, FoldWorkerHandle::is_running)
    }

    pub fn stats(&self) -> StoreStats {
        let (next_seq, wal_size) = {
            let wal = self.core.wal.lock();
            (wal.next_seq, wal.writer.current_size())
        };
        let (keys, pending_operands) = {
            let table = self.core.table.read();
            (table.len(), table.values().map(KeyLog::pending_operands).sum::<usize>())
        };
        let tracker = &self.core.tracker;
        StoreStats {
            keys,
            pending_operands,
            marked_keys: tracker.marked_count(),
            compaction_passes: tracker.passes(),
            keys_folded: tracker.keys_rewritten(),
            operands_folded: tracker.operands_folded(),
            fold_failures: tracker.fold_failures(),
            next_seq,
            wal_size,
        }
    }
}

impl Drop for FoldStore {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

/// Rebuild the key table from recovered ops, returning it with the next
/// sequence number to assign.
fn replay(ops: Vec<LoggedOp>) -> (HashMap<Vec<u8>, KeyLog>, u64) {
    let mut table: HashMap<Vec<u8>, KeyLog> = HashMap::new();
    let mut max_seq = 0;

    for op in ops {
        max_seq = max_seq.max(op.seq);
        match op.kind {
            OpKind::Put => table.entry(op.key).or_default().push(Record { seq: op.seq, kind: RecordKind::Put(op.value) }),
            OpKind::Delete => table.entry(op.key).or_default().push(Record { seq: op.seq, kind: RecordKind::Delete }),
            OpKind::Merge => table.entry(op.key).or_default().push(Record { seq: op.seq, kind: RecordKind::Merge(op.value) }),
            OpKind::Fold => table.entry(op.key).or_default().rewrite_prefix(op.seq, Some(op.value)),
            OpKind::Checkpoint => {}
            OpKind::Evict => {
                let now_empty = match table.get_mut(&op.key) {
                    Some(log) => {
                        log.rewrite_prefix(op.seq, None);
                        log.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    table.remove(&op.key);
                }
            }
        }
    }

    (table, max_seq + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::operator::{CounterOperator, StringConcatOperator, XorOperator};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn concat_options() -> Options {
        Options::new(Config::embedded()).with_merge_operator(StringConcatOperator::default())
    }

    fn test_store() -> (FoldStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FoldStore::open(dir.path(), concat_options()).unwrap();
        (store, dir)
    }

    #[test]
    fn test_open_empty() {
        let (store, _dir) = test_store();
        assert_eq!(store.key_count(), 0);
        assert_eq!(store.count_live().unwrap(), 0);
        assert_eq!(store.stats().next_seq, 1);
        assert_eq!(store.get(b"nothing").unwrap(), None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::embedded();
        config.fold_trigger_operands = 0;
        let err = FoldStore::open(dir.path(), Options::new(config)).err().unwrap();
        assert!(matches!(err, FoldError::InvalidConfig(_)));
    }

    #[test]
    fn test_put_get_delete() {
        let (store, _dir) = test_store();
        store.put(b"hello", b"world").unwrap();
        assert_eq!(store.get(b"hello").unwrap(), Some(b"world".to_vec()));
        store.put(b"hello", b"again").unwrap();
        assert_eq!(store.get(b"hello").unwrap(), Some(b"again".to_vec()));
        store.delete(b"hello").unwrap();
        assert_eq!(store.get(b"hello").unwrap(), None);
        assert!(!store.contains_key(b"hello").unwrap());
    }

    #[test]
    fn test_merges_resolve_lazily() {
        let (store, _dir) = test_store();
        store.merge(b"k", b"a").unwrap();
        store.merge(b"k", b"b").unwrap();
        assert_eq!(store.pending_operands(b"k"), 2);
        assert_eq!(store.get(b"k").unwrap(), Some(b"a,b".to_vec()));
        // Reads never fold
        assert_eq!(store.pending_operands(b"k"), 2);

        store.delete(b"k").unwrap();
        store.merge(b"k", b"c").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"c".to_vec()));
    }

    #[test]
    fn test_merge_without_operator_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FoldStore::open(dir.path(), Options::new(Config::embedded())).unwrap();
        let err = store.merge(b"k", b"v").unwrap_err();
        assert!(matches!(err, FoldError::MissingMergeOperator { .. }));
        assert_eq!(store.key_count(), 0);
        assert_eq!(store.stats().next_seq, 1);
    }

    #[test]
    fn test_oversized_entries_rejected() {
        let (store, _dir) = test_store();
        let big_key = vec![0u8; Config::embedded().max_key_size + 1];
        let err = store.put(&big_key, b"v").unwrap_err();
        assert!(matches!(err, FoldError::OversizedEntry { ref component, .. } if component == "key"));

        let big_value = vec![0u8; Config::embedded().max_value_size + 1];
        let err = store.merge(b"k", &big_value).unwrap_err();
        assert!(matches!(err, FoldError::OversizedEntry { ref component, .. } if component == "value"));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let (store, _dir) = test_store();
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1").merge(b"a", b"2").put(&vec![0u8; 4096], b"too big");
        assert!(store.write(&mut batch).is_err());
        assert_eq!(store.key_count(), 0);
        assert_eq!(batch.len(), 3);

        batch.clear();
        batch.put(b"a", b"1").merge(b"a", b"2").delete(b"b");
        store.write(&mut batch).unwrap();
        assert!(batch.is_empty());
        assert_eq!(store.get(b"a").unwrap(), Some(b"1,2".to_vec()));
        assert_eq!(store.stats().next_seq, 4);
    }

    #[test]
    fn test_crash_recovery() {
        let dir = TempDir::new().unwrap();
        {
            let store = FoldStore::open(dir.path(), concat_options()).unwrap();
            store.put(b"survive", b"yes").unwrap();
            store.merge(b"chain", b"a").unwrap();
            store.merge(b"chain", b"b").unwrap();
            store.put(b"doomed", b"temp").unwrap();
            store.delete(b"doomed").unwrap();
        }
        {
            let store = FoldStore::open(dir.path(), concat_options()).unwrap();
            assert_eq!(store.get(b"survive").unwrap(), Some(b"yes".to_vec()));
            assert_eq!(store.get(b"chain").unwrap(), Some(b"a,b".to_vec()));
            assert_eq!(store.pending_operands(b"chain"), 2);
            assert_eq!(store.get(b"doomed").unwrap(), None);
            assert_eq!(store.stats().next_seq, 6);
        }
    }

    #[test]
    fn test_recovery_replays_compaction() {
        let dir = TempDir::new().unwrap();
        {
            let store = FoldStore::open(dir.path(), concat_options()).unwrap();
            store.merge(b"k", b"a").unwrap();
            store.merge(b"k", b"b").unwrap();
            store.put(b"gone", b"v").unwrap();
            store.delete(b"gone").unwrap();
            store.compact_all().unwrap();
            store.merge(b"k", b"c").unwrap();
        }
        {
            let store = FoldStore::open(dir.path(), concat_options()).unwrap();
            assert_eq!(store.get(b"k").unwrap(), Some(b"a,b,c".to_vec()));
            assert_eq!(store.pending_operands(b"k"), 1);
            assert_eq!(store.key_count(), 1);

            // Writes after reopen keep ordering with the folded base
            store.merge(b"k", b"d").unwrap();
            store.compact_all().unwrap();
            assert_eq!(store.get(b"k").unwrap(), Some(b"a,b,c,d".to_vec()));
        }
    }

    #[test]
    fn test_torn_tail_loses_only_last_write() {
        let dir = TempDir::new().unwrap();
        let wal_path = {
            let store = FoldStore::open(dir.path(), concat_options()).unwrap();
            store.merge(b"k", b"a").unwrap();
            store.merge(b"k", b"b").unwrap();
            let path = store.core.wal.lock().writer.current_path().to_path_buf();
            path
        };

        let mut data = std::fs::read(&wal_path).unwrap();
        data.truncate(data.len() - 3);
        std::fs::write(&wal_path, data).unwrap();

        {
            let store = FoldStore::open(dir.path(), concat_options()).unwrap();
            assert_eq!(store.get(b"k").unwrap(), Some(b"a".to_vec()));
            store.merge(b"k", b"c").unwrap();
        }
        let store = FoldStore::open(dir.path(), concat_options()).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"a,c".to_vec()));
    }

    #[test]
    fn test_damaged_length_keeps_later_writes() {
        let dir = TempDir::new().unwrap();
        let (wal_path, second) = {
            let store = FoldStore::open(dir.path(), concat_options()).unwrap();
            store.put(b"k1", b"v1").unwrap();
            let second = store.stats().wal_size as usize;
            store.put(b"k2", b"v2").unwrap();
            store.put(b"k3", b"v3").unwrap();
            let path = store.core.wal.lock().writer.current_path().to_path_buf();
            (path, second)
        };

        let mut data = std::fs::read(&wal_path).unwrap();
        let len = data.len();
        data[second + 7] ^= 0x80;
        std::fs::write(&wal_path, data).unwrap();

        let store = FoldStore::open(dir.path(), concat_options()).unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.get(b"k2").unwrap(), None);
        assert_eq!(store.get(b"k3").unwrap(), Some(b"v3".to_vec()));
        assert_eq!(store.stats().next_seq, 4);
        assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), len as u64);
    }

    fn wal_files(dir: &Path) -> Vec<(PathBuf, u64)> {
        std::fs::read_dir(dir.join("wal"))
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path();
                let len = std::fs::metadata(&path).unwrap().len();
                (path, len)
            })
            .collect()
    }

    #[test]
    fn test_full_compaction_reclaims_wal() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::embedded();
        config.wal_rotation_size_bytes = 1024 * 1024;
        let options = || Options::new(config.clone()).with_merge_operator(StringConcatOperator::default());
        {
            let store = FoldStore::open(dir.path(), options()).unwrap();
            for i in 0..1000u32 {
                store.put(&i.to_be_bytes(), &[7u8; 2048]).unwrap();
            }
            for i in 0..1000u32 {
                store.delete(&i.to_be_bytes()).unwrap();
            }
            let before: u64 = wal_files(dir.path()).iter().map(|(_, len)| len).sum();
            assert!(wal_files(dir.path()).len() > 1);

            let report = store.compact_all().unwrap();
            assert_eq!(report.tombstones_purged, 1000);
            assert!(report.wal_files_reclaimed > 1);

            let after = wal_files(dir.path());
            assert_eq!(after.len(), 1);
            assert!(after[0].1 < before);
            assert_eq!(store.key_count(), 0);
        }
        let store = FoldStore::open(dir.path(), options()).unwrap();
        assert_eq!(store.key_count(), 0);
        assert_eq!(store.stats().next_seq, 2001);
    }

    #[test]
    fn test_checkpoint_reopen_keeps_chains() {
        let dir = TempDir::new().unwrap();
        {
            let store = FoldStore::open(dir.path(), concat_options()).unwrap();
            store.merge(b"folded", b"a").unwrap();
            store.merge(b"folded", b"b").unwrap();
            store.put(b"plain", b"p").unwrap();
            store.compact_all().unwrap();
            store.merge(b"folded", b"c").unwrap();
            store.merge(b"fresh", b"x").unwrap();
            store.delete(b"plain").unwrap();

            // A range pass does not checkpoint
            let report = store.compact_range(Some(&b"g"[..]), None).unwrap();
            assert_eq!(report.wal_files_reclaimed, 0);
        }
        {
            let store = FoldStore::open(dir.path(), concat_options()).unwrap();
            assert_eq!(store.get(b"folded").unwrap(), Some(b"a,b,c".to_vec()));
            assert_eq!(store.pending_operands(b"folded"), 1);
            assert_eq!(store.get(b"fresh").unwrap(), Some(b"x".to_vec()));
            assert_eq!(store.get(b"plain").unwrap(), None);
            assert_eq!(store.stats().next_seq, 7);

            store.checkpoint().unwrap();
            store.merge(b"fresh", b"y").unwrap();
        }
        let store = FoldStore::open(dir.path(), concat_options()).unwrap();
        assert_eq!(store.get(b"folded").unwrap(), Some(b"a,b,c".to_vec()));
        assert_eq!(store.get(b"fresh").unwrap(), Some(b"x,y".to_vec()));
        assert_eq!(store.pending_operands(b"fresh"), 2);
        assert_eq!(store.stats().next_seq, 8);
    }

    #[test]
    fn test_resolution_failure_is_per_key() {
        let dir = TempDir::new().unwrap();
        let store = FoldStore::open(dir.path(), Options::new(Config::embedded()).with_merge_operator(XorOperator)).unwrap();
        store.merge(b"bad", &[1, 2, 3]).unwrap();
        store.merge(b"bad", &[1]).unwrap();
        store.merge(b"ok", &[0xF0]).unwrap();
        store.merge(b"ok", &[0x0F]).unwrap();

        assert!(store.get(b"bad").unwrap_err().is_resolution_error());
        assert_eq!(store.get(b"ok").unwrap(), Some(vec![0xFF]));
        assert!(store.scan().is_err());
        assert_eq!(store.prefix_scan(b"o").unwrap(), vec![(b"ok".to_vec(), vec![0xFF])]);
    }

    #[test]
    fn test_prefix_scan_sorted_with_full_keys() {
        let (store, _dir) = test_store();
        store.put(&[0x01, b'c'], b"val_c").unwrap();
        store.merge(&[0x01, b'a'], b"val_a").unwrap();
        store.put(&[0x01, b'b'], b"val_b").unwrap();
        store.put(&[0x02, b'x'], b"val_x").unwrap();
        store.put(&[0x01, b'd'], b"dead").unwrap();
        store.delete(&[0x01, b'd']).unwrap();

        let results = store.prefix_scan(&[0x01]).unwrap();
        assert_eq!(results, vec![
            (vec![0x01, b'a'], b"val_a".to_vec()),
            (vec![0x01, b'b'], b"val_b".to_vec()),
            (vec![0x01, b'c'], b"val_c".to_vec()),
        ]);
        assert_eq!(store.scan().unwrap().len(), 4);
        assert_eq!(store.count_live().unwrap(), 4);
        assert_eq!(store.key_count(), 5);
    }

    #[test]
    fn test_concurrent_counter_merges() {
        let dir = TempDir::new().unwrap();
        let options = Options::new(Config::embedded()).with_merge_operator(CounterOperator);
        let store = Arc::new(FoldStore::open(dir.path(), options).unwrap());

        let mut handles = vec![];
        for t in 0..8u64 {
            let s = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..250u64 {
                    s.merge(b"hits", &CounterOperator::encode(1)).unwrap();
                    if i % 50 == 0 {
                        s.merge(format!("t{}", t).as_bytes(), &CounterOperator::encode(i)).unwrap();
                    }
                }
            }));
        }
        let compactor = {
            let s = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..10 {
                    s.compact_all().unwrap();
                }
            })
        };
        for h in handles { h.join().unwrap(); }
        compactor.join().unwrap();

        let hits = store.get(b"hits").unwrap().unwrap();
        assert_eq!(CounterOperator::decode(&hits), Some(2000));
        let t3 = store.get(b"t3").unwrap().unwrap();
        assert_eq!(CounterOperator::decode(&t3), Some(500));
    }

    #[test]
    fn test_long_chains_marked_and_folded() {
        let (store, _dir) = test_store();
        for v in ["a", "b", "c", "d"] {
            store.merge(b"hot", v.as_bytes()).unwrap();
        }
        store.merge(b"cold", b"x").unwrap();
        assert_eq!(store.stats().marked_keys, 1);

        let report = store.fold_marked().unwrap();
        assert_eq!(report.keys_visited, 1);
        assert_eq!(report.operands_folded, 4);
        assert_eq!(store.pending_operands(b"hot"), 0);
        assert_eq!(store.pending_operands(b"cold"), 1);

        let stats = store.stats();
        assert_eq!(stats.marked_keys, 0);
        assert_eq!(stats.compaction_passes, 1);
        assert_eq!(stats.operands_folded, 4);
        assert_eq!(stats.pending_operands, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_pass_keeps_keys_marked() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::embedded();
        config.fold_trigger_operands = 2;
        let store = FoldStore::open(
            dir.path(),
            Options::new(config).with_merge_operator(StringConcatOperator::default()),
        )
        .unwrap();
        store.merge(b"hot", b"1").unwrap();
        store.merge(b"hot", b"2").unwrap();
        assert_eq!(store.stats().marked_keys, 1);

        // Point the WAL at a directory that disappears, so the next
        // append has to rotate into it and fails
        let doomed = TempDir::new().unwrap();
        let doomed_wal = doomed.path().join("wal");
        store.core.wal.lock().writer = WalWriter::new(&doomed_wal, 1).unwrap();
        store.put(b"filler", b"x").unwrap();
        std::fs::remove_dir_all(&doomed_wal).unwrap();

        assert!(store.fold_marked().is_err());
        assert_eq!(store.stats().marked_keys, 1);
        assert_eq!(store.pending_operands(b"hot"), 2);
    }

    #[test]
    fn test_fold_worker_integration() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::embedded();
        config.fold_cadence = Duration::from_millis(20);
        config.fold_trigger_operands = 2;
        let store = FoldStore::open(
            dir.path(),
            Options::new(config).with_merge_operator(StringConcatOperator::default()),
        )
        .unwrap();

        store.start_fold_worker().unwrap();
        assert!(store.is_fold_worker_running());
        store.merge(b"w", b"1").unwrap();
        store.merge(b"w", b"2").unwrap();
        store.merge(b"w", b"3").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.pending_operands(b"w") > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(store.pending_operands(b"w"), 0);
        assert_eq!(store.get(b"w").unwrap(), Some(b"1,2,3".to_vec()));

        store.stop_fold_worker();
        assert!(!store.is_fold_worker_running());
    }

    #[test]
    fn test_unsynced_writes_made_durable() {
        let dir = TempDir::new().unwrap();
        {
            let store = FoldStore::open(dir.path(), concat_options()).unwrap();
            for i in 0..100 {
                store.merge(b"log", format!("{}", i).as_bytes()).unwrap();
            }
            store.sync_wal().unwrap();
            assert!(store.stats().wal_size > 0);
        }
        let store = FoldStore::open(dir.path(), concat_options()).unwrap();
        assert_eq!(store.pending_operands(b"log"), 100);
    }
}

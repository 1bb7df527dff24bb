//! Compaction: folding operand chains into base values
//!
//! A compaction pass visits keys in lexicographic order. For each key it
//! takes a snapshot of the operand log and decides an outcome without
//! holding any lock:
//!
//! - pending operands (or shadowed history) are fully folded into a new
//!   base value;
//! - a fold the operator rejects, or one too large to log, leaves the key
//!   untouched, so the operands stay pending for a later attempt;
//! - the compaction filter, if any, sees the resolved value and may remove
//!   the key outright;
//! - a key that resolves to nothing (a lone tombstone) is purged.
//!
//! Outcomes are committed a chunk at a time: one WAL record holding a
//! `Fold` or `Evict` op per changed key, then the matching prefix rewrite of
//! each key log under the table lock. Only records covered by the snapshot
//! are replaced; writes that landed while the fold ran stay pending on top
//! of the new base. A key is either fully rewritten or not at all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::engine::StoreCore;
use crate::error::FoldResult;
use crate::filter::{CompactionFilter, Decision, FilterContext};
use crate::format::{check_sizes, LoggedOp, OpKind};
use crate::oplog::{LogSnapshot, RecordKind};
use crate::resolve::resolve;

/// Keys whose outcomes are committed together.
const COMMIT_CHUNK: usize = 4096;

/// Folded bytes that close a chunk early.
const COMMIT_BYTES: usize = 64 * 1024 * 1024;

/// Stops a compaction pass at the next key boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What one compaction pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Keys that existed when the pass reached them.
    pub keys_visited: usize,
    /// Keys whose log was replaced by a single folded base value.
    pub keys_rewritten: usize,
    /// Merge operands consumed by those rewrites.
    pub operands_folded: usize,
    /// Keys removed because the filter said so.
    pub keys_removed: usize,
    /// Keys purged because they resolved to a tombstone.
    pub tombstones_purged: usize,
    /// Keys left untouched because the merge operator failed or the folded
    /// value is too large to log.
    pub fold_failures: usize,
    /// Keys kept because the filter failed.
    pub filter_failures: usize,
    /// Keys whose fold failed; their operands are still pending.
    pub failed_keys: Vec<Vec<u8>>,
    /// Keys the pass never reached because it was cancelled.
    pub unvisited: Vec<Vec<u8>>,
    pub cancelled: bool,
    /// WAL files deleted by the checkpoint that follows a full manual pass.
    pub wal_files_reclaimed: usize,
}

impl CompactionReport {
    /// Keys whose stored state changed.
    pub fn keys_changed(&self) -> usize {
        self.keys_rewritten + self.keys_removed + self.tombstones_purged
    }
}

enum Outcome {
    Unchanged,
    Rewrite { value: Vec<u8>, operands: usize },
    Remove,
    Purge,
}

/// Decide what compaction does with one key.
fn plan_key(
    core: &StoreCore,
    filter: Option<&dyn CompactionFilter>,
    ctx: &FilterContext,
    key: &[u8],
    snapshot: &LogSnapshot,
    report: &mut CompactionReport,
) -> Outcome {
    let already_compact = snapshot.log_len == 1 && snapshot.pending_operands() == 0;

    let (value, operands) = if already_compact {
        match &snapshot.records[0].kind {
            RecordKind::Put(v) => (Some(v.clone()), 0),
            _ => (None, 0),
        }
    } else {
        match resolve(core.operator(), key, &snapshot.records) {
            Ok(res) => (res.value, res.operands_folded),
            Err(e) => {
                warn!("Compaction: leaving key {:02x?} unfolded: {}", key, e);
                report.fold_failures += 1;
                report.failed_keys.push(key.to_vec());
                return Outcome::Unchanged;
            }
        }
    };

    let Some(value) = value else {
        return Outcome::Purge;
    };

    if let Some(filter) = filter {
        match filter.filter(ctx, key, &value) {
            Decision::Remove => return Outcome::Remove,
            Decision::Keep => {}
            Decision::Failed(reason) => {
                warn!("Compaction: filter '{}' failed on key {:02x?}, keeping it: {}", filter.name(), key, reason);
                report.filter_failures += 1;
            }
        }
    }

    if already_compact {
        return Outcome::Unchanged;
    }
    if let Err(e) = check_sizes(key, &value) {
        warn!("Compaction: leaving key {:02x?} unfolded: {}", key, e);
        report.fold_failures += 1;
        report.failed_keys.push(key.to_vec());
        return Outcome::Unchanged;
    }
    Outcome::Rewrite { value, operands }
}

/// Durably log and then apply a chunk of outcomes.
fn commit(core: &StoreCore, pending: Vec<(Vec<u8>, u64, Option<Vec<u8>>)>) -> FoldResult<()> {
    if pending.is_empty() {
        return Ok(());
    }

    let ops: Vec<LoggedOp> = pending
        .iter()
        .map(|(key, seq, base)| LoggedOp {
            kind: if base.is_some() { OpKind::Fold } else { OpKind::Evict },
            seq: *seq,
            key: key.clone(),
            value: base.clone().unwrap_or_default(),
        })
        .collect();

    let mut wal = core.wal.lock();
    wal.writer.append(&ops, core.options.config.sync_writes)?;

    let mut table = core.table.write();
    for (key, seq, base) in pending {
        let now_empty = match table.get_mut(&key) {
            Some(log) => {
                log.rewrite_prefix(seq, base);
                log.is_empty()
            }
            None => false,
        };
        if now_empty {
            table.remove(&key);
        }
    }
    Ok(())
}

/// Run one compaction pass over `keys`, which must be sorted.
///
/// Only one pass runs at a time; concurrent callers wait their turn.
pub(crate) fn compact_keys(
    core: &StoreCore,
    keys: Vec<Vec<u8>>,
    ctx: FilterContext,
    cancel: &CancelToken,
) -> FoldResult<CompactionReport> {
    let _pass = core.compaction_lock.lock();
    let filter = core.options.filter_factory.as_ref().map(|f| f.create(&ctx));
    let mut report = CompactionReport::default();
    let mut pending = Vec::new();
    let mut pending_bytes = 0;

    let mut keys = keys.into_iter();
    while let Some(key) = keys.next() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            report.unvisited.push(key);
            report.unvisited.extend(keys.by_ref());
            break;
        }

        let snapshot = match core.table.read().get(&key) {
            Some(log) => log.snapshot(),
            None => continue,
        };
        report.keys_visited += 1;

        match plan_key(core, filter.as_deref(), &ctx, &key, &snapshot, &mut report) {
            Outcome::Unchanged => {}
            Outcome::Rewrite { value, operands } => {
                report.keys_rewritten += 1;
                report.operands_folded += operands;
                pending_bytes += key.len() + value.len();
                pending.push((key, snapshot.upto_seq, Some(value)));
            }
            Outcome::Remove => {
                report.keys_removed += 1;
                pending.push((key, snapshot.upto_seq, None));
            }
            Outcome::Purge => {
                report.tombstones_purged += 1;
                pending.push((key, snapshot.upto_seq, None));
            }
        }

        if pending.len() >= COMMIT_CHUNK || pending_bytes >= COMMIT_BYTES {
            commit(core, std::mem::take(&mut pending))?;
            pending_bytes = 0;
        }
    }
    commit(core, pending)?;

    debug!(
        "Compaction pass (full={}, manual={}): visited {}, rewrote {} ({} operands), removed {}, purged {}, failed {}",
        ctx.full_compaction,
        ctx.manual_compaction,
        report.keys_visited,
        report.keys_rewritten,
        report.operands_folded,
        report.keys_removed,
        report.tombstones_purged,
        report.fold_failures,
    );
    Ok(report)
}

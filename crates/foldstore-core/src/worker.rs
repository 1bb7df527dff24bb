//! Background fold worker
//!
//! Reads fold pending operands lazily, so a hot key accumulates a long
//! chain that every read replays. The write path marks a key once its
//! chain reaches `Config::fold_trigger_operands`; this worker wakes on
//! `Config::fold_cadence` and runs an automatic (non-manual, partial)
//! compaction pass over the marked keys.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use log::{info, warn};
use parking_lot::Mutex;

use crate::compaction::{compact_keys, CancelToken, CompactionReport};
use crate::engine::StoreCore;
use crate::error::{FoldError, FoldResult};
use crate::filter::FilterContext;

/// Keys waiting for a background fold, plus cumulative counters.
pub struct FoldTracker {
    marked: Mutex<HashSet<Vec<u8>>>,
    passes: AtomicU64,
    keys_rewritten: AtomicU64,
    operands_folded: AtomicU64,
    fold_failures: AtomicU64,
}

impl FoldTracker {
    pub fn new() -> Self {
        Self {
            marked: Mutex::new(HashSet::new()),
            passes: AtomicU64::new(0),
            keys_rewritten: AtomicU64::new(0),
            operands_folded: AtomicU64::new(0),
            fold_failures: AtomicU64::new(0),
        }
    }

    /// Queue a key for the next background pass.
    pub fn mark(&self, key: &[u8]) {
        self.marked.lock().insert(key.to_vec());
    }

    /// Take every marked key, sorted, leaving the set empty.
    pub fn take_sorted(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = std::mem::take(&mut *self.marked.lock()).into_iter().collect();
        keys.sort();
        keys
    }

    pub fn marked_count(&self) -> usize {
        self.marked.lock().len()
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn keys_rewritten(&self) -> u64 {
        self.keys_rewritten.load(Ordering::Relaxed)
    }

    pub fn operands_folded(&self) -> u64 {
        self.operands_folded.load(Ordering::Relaxed)
    }

    pub fn fold_failures(&self) -> u64 {
        self.fold_failures.load(Ordering::Relaxed)
    }

    /// Add a finished pass (manual or background) to the totals.
    pub fn record_pass(&self, report: &CompactionReport) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.keys_rewritten.fetch_add(report.keys_rewritten as u64, Ordering::Relaxed);
        self.operands_folded.fetch_add(report.operands_folded as u64, Ordering::Relaxed);
        self.fold_failures.fetch_add(report.fold_failures as u64, Ordering::Relaxed);
    }
}

impl Default for FoldTracker {
    fn default() -> Self { Self::new() }
}

/// Fold every marked key once.
///
/// Keys a cancelled pass did not reach are marked again, and so is every
/// key of a pass that returns an error. Keys whose fold failed are not:
/// the next merge on the key marks it anew.
pub(crate) fn fold_marked(core: &StoreCore, cancel: &CancelToken) -> FoldResult<CompactionReport> {
    let keys = core.tracker.take_sorted();
    let ctx = FilterContext { full_compaction: false, manual_compaction: false };
    let report = match compact_keys(core, keys.clone(), ctx, cancel) {
        Ok(report) => report,
        Err(e) => {
            for key in &keys {
                core.tracker.mark(key);
            }
            return Err(e);
        }
    };
    for key in &report.unvisited {
        core.tracker.mark(key);
    }
    core.tracker.record_pass(&report);
    Ok(report)
}

/// Handle to the running worker thread. Dropping it stops the thread.
pub struct FoldWorkerHandle {
    shutdown: Arc<AtomicBool>,
    cancel: CancelToken,
    thread: Option<thread::JoinHandle<()>>,
}

impl FoldWorkerHandle {
    /// Stop after one last pass over the marked keys.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.join();
    }

    /// Stop as soon as the current key is done; marked keys stay marked.
    pub fn abort(mut self) {
        self.cancel.cancel();
        self.shutdown.store(true, Ordering::Release);
        self.join();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FoldWorkerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.join();
    }
}

/// Spawn the worker thread.
pub(crate) fn start_fold_worker(core: Arc<StoreCore>) -> FoldResult<FoldWorkerHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let cancel = CancelToken::new();
    let cadence = core.options.config.fold_cadence;

    let thread = {
        let shutdown = Arc::clone(&shutdown);
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("foldstore-fold".to_string())
            .spawn(move || worker_loop(&core, cadence, &shutdown, &cancel))
            .map_err(|e| FoldError::Io {
                path: None,
                kind: e.kind(),
                message: format!("Failed to spawn fold worker: {}", e),
            })?
    };

    Ok(FoldWorkerHandle { shutdown, cancel, thread: Some(thread) })
}

fn worker_loop(core: &StoreCore, cadence: Duration, shutdown: &AtomicBool, cancel: &CancelToken) {
    loop {
        let wake_time = Instant::now() + cadence;
        while Instant::now() < wake_time && !shutdown.load(Ordering::Acquire) {
            thread::sleep(cadence.min(Duration::from_millis(50)));
        }

        run_pass(core, cancel);
        if shutdown.load(Ordering::Acquire) {
            return;
        }
    }
}

fn run_pass(core: &StoreCore, cancel: &CancelToken) {
    if core.tracker.marked_count() == 0 {
        return;
    }
    match fold_marked(core, cancel) {
        Ok(report) if report.keys_rewritten > 0 => {
            info!("Fold worker: folded {} operands across {} keys", report.operands_folded, report.keys_rewritten);
        }
        Ok(_) => {}
        Err(e) => warn!("Fold worker pass failed, keys stay marked: {}", e),
    }
}

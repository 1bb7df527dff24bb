//! FoldStore Core: merge-aware key-value storage
//!
//! A RAM-first key-value store where, besides `put` and `delete`, a key can
//! take `merge` operands: small deltas folded into the value by a
//! user-supplied associative merge operator.
//!
//! # Architecture
//!
//! - **Operand log**: each key holds its writes in sequence order; the
//!   newest `Put`/`Delete` is the base and later merges are pending
//! - **Read path**: resolve lazily by folding pending operands onto the base
//! - **Write path**: WAL first (one checksummed record per batch), then RAM
//! - **Compaction**: folds chains into a single base value, runs the
//!   compaction filter on it, and logs the rewrite so recovery replays it
//! - **Fold worker**: background thread that folds keys with long chains

pub mod batch;
pub mod compaction;
pub mod config;
pub mod durability;
pub mod engine;
pub mod error;
pub mod filter;
pub mod format;
pub mod operator;
pub mod oplog;
pub mod resolve;
pub mod wal;
pub mod worker;
pub mod xor;

// Re-export key types for convenience
pub use batch::WriteBatch;
pub use compaction::{CancelToken, CompactionReport};
pub use config::{Config, Options};
pub use engine::{FoldStore, StoreStats};
pub use error::{FoldError, FoldResult};
pub use filter::{
    CompactionFilter, CompactionFilterFactory, Decision, FilterContext, FnCompactionFilter,
    RemoveEmptyValueFilter, RemoveEmptyValueFilterFactory, SharedFilterFactory,
};
pub use operator::{AssociativeMergeOperator, CounterOperator, FnMergeOperator, MergeResult, StringConcatOperator, XorOperator};
pub use resolve::{resolve, Base, Resolution, ResolveState, Resolver};
pub use worker::{FoldTracker, FoldWorkerHandle};
pub use xor::{xor_bytes, xor_to_vec, xor_words};

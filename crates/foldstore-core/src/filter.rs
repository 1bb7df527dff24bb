//! Compaction filters
//!
//! A compaction filter is consulted once per live key during a compaction
//! pass, after that key's operands have been folded, and may remove the key
//! from the output of the pass. Removal drops the key outright; no tombstone
//! is written. Filters see one key at a time and must not keep cross-key
//! state: passes visit keys in range order, not write order, and the
//! background worker runs alongside manual compactions.

use std::sync::Arc;

/// Describes the compaction pass a filter runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterContext {
    /// The pass covers every key in the store.
    pub full_compaction: bool,
    /// The pass was requested by the application rather than the worker.
    pub manual_compaction: bool,
}

/// What to do with a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Remove,
    /// The filter could not decide. The key is kept.
    Failed(String),
}

pub trait CompactionFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Decide the fate of `key`, whose resolved value is `value`.
    fn filter(&self, ctx: &FilterContext, key: &[u8], value: &[u8]) -> Decision;
}

/// Builds a filter for each compaction pass.
pub trait CompactionFilterFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, ctx: &FilterContext) -> Box<dyn CompactionFilter>;
}

/// Hands the same filter instance to every pass.
pub struct SharedFilterFactory {
    filter: Arc<dyn CompactionFilter>,
}

impl SharedFilterFactory {
    pub fn new<F: CompactionFilter + 'static>(filter: F) -> Self {
        Self { filter: Arc::new(filter) }
    }
}

struct SharedFilter(Arc<dyn CompactionFilter>);

impl CompactionFilter for SharedFilter {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn filter(&self, ctx: &FilterContext, key: &[u8], value: &[u8]) -> Decision {
        self.0.filter(ctx, key, value)
    }
}

impl CompactionFilterFactory for SharedFilterFactory {
    fn name(&self) -> &str {
        self.filter.name()
    }

    fn create(&self, _ctx: &FilterContext) -> Box<dyn CompactionFilter> {
        Box::new(SharedFilter(Arc::clone(&self.filter)))
    }
}

/// Adapts a closure into a compaction filter.
pub struct FnCompactionFilter<F> {
    name: String,
    f: F,
}

impl<F> FnCompactionFilter<F>
where
    F: Fn(&FilterContext, &[u8], &[u8]) -> Decision + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> CompactionFilter for FnCompactionFilter<F>
where
    F: Fn(&FilterContext, &[u8], &[u8]) -> Decision + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self, ctx: &FilterContext, key: &[u8], value: &[u8]) -> Decision {
        (self.f)(ctx, key, value)
    }
}

/// Removes keys whose value is empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveEmptyValueFilter;

impl CompactionFilter for RemoveEmptyValueFilter {
    fn name(&self) -> &str {
        "RemoveEmptyValueFilter"
    }

    fn filter(&self, _ctx: &FilterContext, _key: &[u8], value: &[u8]) -> Decision {
        if value.is_empty() { Decision::Remove } else { Decision::Keep }
    }
}

/// Builds a fresh [`RemoveEmptyValueFilter`] per pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveEmptyValueFilterFactory;

impl CompactionFilterFactory for RemoveEmptyValueFilterFactory {
    fn name(&self) -> &str {
        "RemoveEmptyValueFilterFactory"
    }

    fn create(&self, _ctx: &FilterContext) -> Box<dyn CompactionFilter> {
        Box::new(RemoveEmptyValueFilter)
    }
}

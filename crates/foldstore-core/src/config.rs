//! Configuration management for FoldStore
//!
//! `Config` carries the tunables (with presets for durable server use and
//! for embedded/test use). `Options` adds the user-supplied extension
//! points: the merge operator and the compaction filter factory.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{FoldError, FoldResult};
use crate::filter::{CompactionFilter, CompactionFilterFactory, SharedFilterFactory};
use crate::format::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::operator::AssociativeMergeOperator;

/// FoldStore tunables
#[derive(Debug, Clone)]
pub struct Config {
    /// WAL file rotation threshold (bytes)
    pub wal_rotation_size_bytes: u64,
    /// Durably sync the WAL on every write (otherwise call `sync_wal`)
    pub sync_writes: bool,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value or operand size in bytes
    pub max_value_size: usize,
    /// Pending operands on one key before the background worker folds it
    pub fold_trigger_operands: usize,
    /// Background fold worker cadence
    pub fold_cadence: Duration,
}

impl Config {
    /// Durable writes, large limits, relaxed background folding.
    pub fn server() -> Self {
        Self {
            wal_rotation_size_bytes: 100 * 1024 * 1024,
            sync_writes: true,
            max_key_size: 4096,
            max_value_size: 32 * 1024 * 1024,
            fold_trigger_operands: 16,
            fold_cadence: Duration::from_secs(10),
        }
    }

    /// Unsynced writes and eager folding, for embedded use and tests.
    pub fn embedded() -> Self {
        Self {
            wal_rotation_size_bytes: 16 * 1024 * 1024,
            sync_writes: false,
            max_key_size: 1024,
            max_value_size: 4 * 1024 * 1024,
            fold_trigger_operands: 4,
            fold_cadence: Duration::from_millis(500),
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> FoldResult<()> {
        if self.wal_rotation_size_bytes < 1024 * 1024 {
            return Err(FoldError::InvalidConfig("wal_rotation_size_bytes must be >= 1MB".into()));
        }
        if self.max_key_size == 0 || self.max_key_size > MAX_KEY_SIZE {
            return Err(FoldError::InvalidConfig(format!(
                "max_key_size must be in [1, {}]", MAX_KEY_SIZE
            )));
        }
        if self.max_value_size == 0 || self.max_value_size > MAX_VALUE_SIZE {
            return Err(FoldError::InvalidConfig(format!(
                "max_value_size must be in [1, {}]", MAX_VALUE_SIZE
            )));
        }
        if self.fold_trigger_operands == 0 {
            return Err(FoldError::InvalidConfig("fold_trigger_operands must be > 0".into()));
        }
        if self.fold_cadence.as_millis() == 0 {
            return Err(FoldError::InvalidConfig("fold_cadence must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}

/// Everything `FoldStore::open` needs: tunables plus extension points.
#[derive(Clone, Default)]
pub struct Options {
    pub config: Config,
    pub merge_operator: Option<Arc<dyn AssociativeMergeOperator>>,
    pub filter_factory: Option<Arc<dyn CompactionFilterFactory>>,
}

impl Options {
    pub fn new(config: Config) -> Self {
        Self { config, merge_operator: None, filter_factory: None }
    }

    /// Install the operator used to fold merge operands.
    pub fn with_merge_operator<M>(mut self, operator: M) -> Self
    where
        M: AssociativeMergeOperator + 'static,
    {
        self.merge_operator = Some(Arc::new(operator));
        self
    }

    /// Install one filter shared by every compaction pass.
    pub fn with_compaction_filter<F>(mut self, filter: F) -> Self
    where
        F: CompactionFilter + 'static,
    {
        self.filter_factory = Some(Arc::new(SharedFilterFactory::new(filter)));
        self
    }

    /// Install a factory that builds a fresh filter for each compaction pass.
    pub fn with_compaction_filter_factory<F>(mut self, factory: F) -> Self
    where
        F: CompactionFilterFactory + 'static,
    {
        self.filter_factory = Some(Arc::new(factory));
        self
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("config", &self.config)
            .field("merge_operator", &self.merge_operator.as_ref().map(|m| m.name().to_string()))
            .field("filter_factory", &self.filter_factory.as_ref().map(|f| f.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RemoveEmptyValueFilter;
    use crate::operator::StringConcatOperator;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::server().validate().is_ok());
        assert!(Config::embedded().validate().is_ok());
    }

    #[test]
    fn test_zero_fold_trigger_rejected() {
        let mut config = Config::embedded();
        config.fold_trigger_operands = 0;
        assert!(matches!(config.validate(), Err(FoldError::InvalidConfig(_))));
    }

    #[test]
    fn test_key_limit_above_codec_rejected() {
        let mut config = Config::server();
        config.max_key_size = MAX_KEY_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_options_builder_debug_names() {
        let options = Options::new(Config::embedded())
            .with_merge_operator(StringConcatOperator::default())
            .with_compaction_filter(RemoveEmptyValueFilter);
        let dbg = format!("{:?}", options);
        assert!(dbg.contains("StringConcatOperator"));
        assert!(dbg.contains("RemoveEmptyValueFilter"));
    }
}

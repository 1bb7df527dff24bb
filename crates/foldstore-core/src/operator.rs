//! Associative merge operators
//!
//! A merge operator combines the value currently stored for a key with one
//! merge operand. FoldStore calls it once per pending operand, oldest first,
//! threading each result into the next call, either when a read needs the
//! value or when compaction folds the chain into a new base value.
//!
//! Implementations must be:
//! - **associative**: folding a chain in one pass or in several partial
//!   passes gives the same value (compaction relies on this);
//! - **order preserving**: operands are never reordered, so commutativity
//!   is not required;
//! - **pure**: the operator runs concurrently for different keys and may be
//!   called again for the same key on every read.
//!
//! # Example
//!
//! ```
//! use foldstore_core::{AssociativeMergeOperator, MergeResult};
//!
//! struct Max;
//!
//! impl AssociativeMergeOperator for Max {
//!     fn name(&self) -> &str {
//!         "Max"
//!     }
//!
//!     fn merge(&self, _key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> MergeResult {
//!         match existing {
//!             Some(current) if current >= operand => MergeResult::Success(current.to_vec()),
//!             _ => MergeResult::Success(operand.to_vec()),
//!         }
//!     }
//! }
//! ```

use crate::xor::xor_to_vec;

/// Outcome of one merge call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// The folded value.
    Success(Vec<u8>),

    /// The operand (or the value it was folded onto) was rejected.
    ///
    /// The whole fold for the key is abandoned: a read returns
    /// `FoldError::CombinatorFailure` and compaction keeps the operands.
    Failure(String),
}

/// User-supplied binary combining function.
pub trait AssociativeMergeOperator: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Fold `operand` onto `existing`.
    ///
    /// `existing` is `None` exactly when the key has no base value and no
    /// earlier operand has been folded yet; the operator decides the seed
    /// (usually the operand itself). `key` is informational.
    fn merge(&self, key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> MergeResult;
}

/// Adapts a closure into a merge operator.
pub struct FnMergeOperator<F> {
    name: String,
    f: F,
}

impl<F> FnMergeOperator<F>
where
    F: Fn(&[u8], Option<&[u8]>, &[u8]) -> MergeResult + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> AssociativeMergeOperator for FnMergeOperator<F>
where
    F: Fn(&[u8], Option<&[u8]>, &[u8]) -> MergeResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn merge(&self, key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> MergeResult {
        (self.f)(key, existing, operand)
    }
}

/// Joins operands with a delimiter: `"a"`, `"b"` fold to `"a,b"`.
#[derive(Debug, Clone)]
pub struct StringConcatOperator {
    delimiter: Vec<u8>,
}

impl StringConcatOperator {
    pub fn with_delimiter(delimiter: impl AsRef<[u8]>) -> Self {
        Self { delimiter: delimiter.as_ref().to_vec() }
    }
}

impl Default for StringConcatOperator {
    fn default() -> Self {
        Self::with_delimiter(",")
    }
}

impl AssociativeMergeOperator for StringConcatOperator {
    fn name(&self) -> &str {
        "StringConcatOperator"
    }

    fn merge(&self, _key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> MergeResult {
        let Some(existing) = existing else {
            return MergeResult::Success(operand.to_vec());
        };
        let mut joined = Vec::with_capacity(existing.len() + self.delimiter.len() + operand.len());
        joined.extend_from_slice(existing);
        joined.extend_from_slice(&self.delimiter);
        joined.extend_from_slice(operand);
        MergeResult::Success(joined)
    }
}

/// Byte-wise XOR of fixed-width values. Mismatched lengths are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct XorOperator;

impl AssociativeMergeOperator for XorOperator {
    fn name(&self) -> &str {
        "XorOperator"
    }

    fn merge(&self, _key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> MergeResult {
        let Some(existing) = existing else {
            return MergeResult::Success(operand.to_vec());
        };
        match xor_to_vec(existing, operand) {
            Some(out) => MergeResult::Success(out),
            None => MergeResult::Failure(format!(
                "existing value has {} bytes, operand has {}",
                existing.len(),
                operand.len()
            )),
        }
    }
}

/// Little-endian `u64` counter; each operand is a wrapping delta.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterOperator;

impl CounterOperator {
    pub fn encode(n: u64) -> [u8; 8] {
        n.to_le_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Option<u64> {
        bytes.try_into().ok().map(u64::from_le_bytes)
    }
}

impl AssociativeMergeOperator for CounterOperator {
    fn name(&self) -> &str {
        "CounterOperator"
    }

    fn merge(&self, _key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> MergeResult {
        let Some(delta) = Self::decode(operand) else {
            return MergeResult::Failure(format!("operand must be 8 bytes, got {}", operand.len()));
        };
        let current = match existing {
            None => 0,
            Some(bytes) => match Self::decode(bytes) {
                Some(n) => n,
                None => return MergeResult::Failure(format!("stored counter must be 8 bytes, got {}", bytes.len())),
            },
        };
        MergeResult::Success(Self::encode(current.wrapping_add(delta)).to_vec())
    }
}

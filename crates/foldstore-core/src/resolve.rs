//! Resolution driver: folds a key's operand log into one value.
//!
//! ```text
//! SeekingBase ──► Folding ──► Resolved
//!      │             │
//!      │             └──────► Failed (operator rejected an operand)
//!      └──► Resolved (no operands: the base is the answer)
//! ```
//!
//! `SeekingBase` walks the log backwards to the newest `Put` or `Delete`.
//! A `Delete`, or reaching the start of the log, means there is no existing
//! value and the first operand is folded onto `None`. `Folding` applies the
//! operator once per operand, oldest first. A failure anywhere discards the
//! partial result.

use std::borrow::Cow;

use crate::error::{FoldError, FoldResult};
use crate::oplog::{Record, RecordKind};
use crate::operator::{AssociativeMergeOperator, MergeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    SeekingBase,
    Folding,
    Resolved,
    Failed,
}

/// Where the fold started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    /// A `Put` value.
    Value,
    /// A `Delete`; older records are shadowed.
    Tombstone,
    /// No base in the log; only operands.
    LogStart,
}

/// A finished resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// `None` when the key is deleted or has never been written.
    pub value: Option<Vec<u8>>,
    pub base: Base,
    pub operands_folded: usize,
}

/// Drives one resolution over a snapshot of a key's records.
pub struct Resolver<'a> {
    operator: Option<&'a dyn AssociativeMergeOperator>,
    key: &'a [u8],
    state: ResolveState,
}

impl<'a> Resolver<'a> {
    pub fn new(operator: Option<&'a dyn AssociativeMergeOperator>, key: &'a [u8]) -> Self {
        Self { operator, key, state: ResolveState::SeekingBase }
    }

    pub fn state(&self) -> ResolveState {
        self.state
    }

    /// Resolve `records` (oldest first). The records are only read.
    pub fn resolve(&mut self, records: &[Record]) -> FoldResult<Resolution> {
        self.state = ResolveState::SeekingBase;
        let base_index = records.iter().rposition(|r| !matches!(r.kind, RecordKind::Merge(_)));
        let (base, existing, rest) = match base_index {
            Some(i) => match &records[i].kind {
                RecordKind::Put(v) => (Base::Value, Some(v.as_slice()), &records[i + 1..]),
                _ => (Base::Tombstone, None, &records[i + 1..]),
            },
            None => (Base::LogStart, None, records),
        };

        if rest.is_empty() {
            self.state = ResolveState::Resolved;
            return Ok(Resolution { value: existing.map(<[u8]>::to_vec), base, operands_folded: 0 });
        }

        let operands = rest.iter().filter_map(|r| match &r.kind {
            RecordKind::Merge(operand) => Some(operand.as_slice()),
            _ => None,
        });
        let value = self.fold(existing, operands)?;
        Ok(Resolution { value, base, operands_folded: rest.len() })
    }

    /// Fold `operands` onto `existing`, oldest first.
    ///
    /// Also used on its own to resume a partially folded chain: because
    /// operators are associative, folding `[o1..ok]` and then `[ok+1..on]`
    /// onto that result equals folding `[o1..on]` in one go.
    pub fn fold<'o, I>(&mut self, existing: Option<&[u8]>, operands: I) -> FoldResult<Option<Vec<u8>>>
    where
        I: IntoIterator<Item = &'o [u8]>,
    {
        self.state = ResolveState::Folding;
        let mut acc: Option<Cow<'_, [u8]>> = existing.map(Cow::Borrowed);

        for (index, operand) in operands.into_iter().enumerate() {
            let Some(operator) = self.operator else {
                self.state = ResolveState::Failed;
                return Err(FoldError::MissingMergeOperator { key: self.key.to_vec() });
            };
            match operator.merge(self.key, acc.as_deref(), operand) {
                MergeResult::Success(folded) => acc = Some(Cow::Owned(folded)),
                MergeResult::Failure(reason) => {
                    self.state = ResolveState::Failed;
                    return Err(FoldError::CombinatorFailure {
                        operator: operator.name().to_string(),
                        key: self.key.to_vec(),
                        operand_index: index,
                        reason,
                    });
                }
            }
        }

        self.state = ResolveState::Resolved;
        Ok(acc.map(Cow::into_owned))
    }
}

/// Resolve `records` for `key` in one call.
pub fn resolve(
    operator: Option<&dyn AssociativeMergeOperator>,
    key: &[u8],
    records: &[Record],
) -> FoldResult<Resolution> {
    Resolver::new(operator, key).resolve(records)
}

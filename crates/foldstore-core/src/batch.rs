//! Atomic groups of writes.

use crate::oplog::RecordKind;

/// Puts, merges and deletes applied together by `FoldStore::write`.
///
/// The whole batch is logged as one WAL record and made visible under one
/// table lock, so readers and crash recovery see all of it or none of it.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<(Vec<u8>, RecordKind)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.ops.push((key.to_vec(), RecordKind::Put(value.to_vec())));
        self
    }

    pub fn merge(&mut self, key: &[u8], operand: &[u8]) -> &mut Self {
        self.ops.push((key.to_vec(), RecordKind::Merge(operand.to_vec())));
        self
    }

    pub fn delete(&mut self, key: &[u8]) -> &mut Self {
        self.ops.push((key.to_vec(), RecordKind::Delete));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub(crate) fn ops(&self) -> &[(Vec<u8>, RecordKind)] {
        &self.ops
    }

    pub(crate) fn take_ops(&mut self) -> Vec<(Vec<u8>, RecordKind)> {
        std::mem::take(&mut self.ops)
    }
}

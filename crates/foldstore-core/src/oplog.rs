//! Operand log: the per-key chain of write records
//!
//! A key's log holds every `Put`, `Delete` and `Merge` written since the
//! key was last rewritten by compaction, in write (sequence) order. The
//! newest `Put`/`Delete` is the base; merges after it are the pending
//! operands. Readers only ever see clones taken under the table lock;
//! compaction replaces a prefix of the log in one step.

/// What a single write did to its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    Put(Vec<u8>),
    Delete,
    Merge(Vec<u8>),
}

impl RecordKind {
    fn is_base(&self) -> bool {
        !matches!(self, RecordKind::Merge(_))
    }
}

/// A write record tagged with its global sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub seq: u64,
    pub kind: RecordKind,
}

/// A consistent copy of the part of a key log that resolution needs:
/// the newest base record (if any) and every operand after it.
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    /// Records from the newest base onward, oldest first.
    pub records: Vec<Record>,
    /// Sequence number of the newest record in the log when the copy was taken.
    pub upto_seq: u64,
    /// Total records in the log, including ones shadowed by the base.
    pub log_len: usize,
}

impl LogSnapshot {
    /// Number of merge records in the snapshot.
    pub fn pending_operands(&self) -> usize {
        self.records.iter().filter(|r| !r.kind.is_base()).count()
    }
}

/// Ordered write records for one key.
#[derive(Debug, Clone, Default)]
pub struct KeyLog {
    records: Vec<Record>,
    /// Merge records after the newest base, kept in step with `records`.
    pending: usize,
}

impl KeyLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Sequence numbers must strictly increase.
    pub fn push(&mut self, record: Record) {
        debug_assert!(
            self.records.last().map_or(true, |last| last.seq < record.seq),
            "operand log sequence must increase"
        );
        if record.kind.is_base() {
            self.pending = 0;
        } else {
            self.pending += 1;
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Sequence number of the newest record.
    pub fn last_seq(&self) -> Option<u64> {
        self.records.last().map(|r| r.seq)
    }

    /// Index of the newest `Put` or `Delete`.
    pub fn base_index(&self) -> Option<usize> {
        self.records.iter().rposition(|r| r.kind.is_base())
    }

    /// Merge records written after the newest base.
    pub fn pending_operands(&self) -> usize {
        self.pending
    }

    /// Clone the records resolution needs.
    pub fn snapshot(&self) -> LogSnapshot {
        let start = self.base_index().unwrap_or(0);
        LogSnapshot {
            records: self.records[start..].to_vec(),
            upto_seq: self.last_seq().unwrap_or(0),
            log_len: self.records.len(),
        }
    }

    /// Replace every record with `seq <= upto_seq` by one base record.
    ///
    /// `Some(value)` becomes a `Put` stamped with `upto_seq`; `None` removes
    /// the prefix outright. Records newer than `upto_seq` keep their order.
    pub fn rewrite_prefix(&mut self, upto_seq: u64, base: Option<Vec<u8>>) {
        let split = self.records.partition_point(|r| r.seq <= upto_seq);
        let newer = self.records.split_off(split);
        self.records.clear();
        if let Some(value) = base {
            self.records.push(Record { seq: upto_seq, kind: RecordKind::Put(value) });
        }
        self.records.extend(newer);
        let start = self.base_index().map_or(0, |i| i + 1);
        self.pending = self.records.len() - start;
    }
}

//! Binary format for FoldStore WAL records
//!
//! One WAL record holds one atomic group of operations (a `WriteBatch`, a
//! single write, or the outcomes of a compaction chunk). The checksum
//! covers the whole payload, so a group is either replayed in full or not
//! at all.
//!
//! Record layout:
//!   RecordHeader (16 bytes) + count x Op
//!
//! Op layout:
//!   kind(u8) + seq(u64 LE) + key_len(u16 LE) + value_len(u32 LE) + key + value

use std::path::PathBuf;

use crate::error::{FoldError, FoldResult};

/// Magic bytes identifying FoldStore WAL records: "FOLD"
pub const MAGIC_ARRAY: [u8; 4] = [0x46, 0x4F, 0x4C, 0x44];

/// Codec limit on key size (key length is stored as u16)
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Codec limit on value size (64MB)
pub const MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;

/// Record header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Fixed per-op overhead: kind + seq + key_len + value_len
const OP_OVERHEAD: usize = 1 + 8 + 2 + 4;

/// Operation kinds stored in the WAL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    /// Full overwrite of a key
    Put = 1,
    /// Tombstone
    Delete = 2,
    /// Merge operand
    Merge = 3,
    /// Compaction replaced every record up to `seq` with `value`
    Fold = 4,
    /// Compaction removed every record up to `seq`
    Evict = 5,
    /// First op of a checkpoint file; older WAL files are superseded
    Checkpoint = 6,
}

impl OpKind {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(OpKind::Put),
            2 => Some(OpKind::Delete),
            3 => Some(OpKind::Merge),
            4 => Some(OpKind::Fold),
            5 => Some(OpKind::Evict),
            6 => Some(OpKind::Checkpoint),
            _ => None,
        }
    }
}

/// A single logged operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedOp {
    pub kind: OpKind,
    pub seq: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Fixed-size header for each WAL record
///
/// Layout:
///   [0..4]   magic:    [u8;4] - "FOLD"
///   [4..8]   length:   u32    - payload length in bytes
///   [8..12]  checksum: u32    - CRC32C of payload bytes
///   [12..16] count:    u32    - number of ops in the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub count: u32,
}

impl RecordHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12..16].copy_from_slice(&self.count.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            count: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }
}

/// Check codec limits before anything is allocated.
pub fn check_sizes(key: &[u8], value: &[u8]) -> FoldResult<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(FoldError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: MAX_KEY_SIZE as u64,
            component: "key".to_string(),
        });
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(FoldError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: MAX_VALUE_SIZE as u64,
            component: "value".to_string(),
        });
    }
    Ok(())
}

/// Encode a group of ops into one checksummed WAL record.
pub fn encode_record(ops: &[LoggedOp]) -> FoldResult<Vec<u8>> {
    let mut payload_size = 0usize;
    for op in ops {
        check_sizes(&op.key, &op.value)?;
        payload_size += OP_OVERHEAD + op.key.len() + op.value.len();
    }
    if payload_size > u32::MAX as usize {
        return Err(FoldError::OversizedEntry {
            entry_size: payload_size as u64,
            max_size: u32::MAX as u64,
            component: "record".to_string(),
        });
    }

    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload_size);
    buffer.resize(HEADER_SIZE, 0);
    for op in ops {
        buffer.push(op.kind as u8);
        buffer.extend_from_slice(&op.seq.to_le_bytes());
        buffer.extend_from_slice(&(op.key.len() as u16).to_le_bytes());
        buffer.extend_from_slice(&(op.value.len() as u32).to_le_bytes());
        buffer.extend_from_slice(&op.key);
        buffer.extend_from_slice(&op.value);
    }

    let header = RecordHeader {
        magic: MAGIC_ARRAY,
        length: payload_size as u32,
        checksum: crc32c::crc32c(&buffer[HEADER_SIZE..]),
        count: ops.len() as u32,
    };
    buffer[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    Ok(buffer)
}

fn corrupted(offset: usize, reason: String) -> FoldError {
    FoldError::WalCorrupted { path: PathBuf::from("<buffer>"), offset: offset as u64, reason }
}

/// Decode one WAL record from the start of `data`.
///
/// Returns the ops and the number of bytes consumed.
pub fn decode_record(data: &[u8]) -> FoldResult<(Vec<LoggedOp>, usize)> {
    let header_bytes: &[u8; HEADER_SIZE] = data
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| corrupted(0, format!("Record too short: {} bytes, need at least {}", data.len(), HEADER_SIZE)))?;
    let header = RecordHeader::from_bytes(header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(FoldError::NoMagicFound {
            path: PathBuf::from("<buffer>"),
            offset: 0,
            found_bytes: header.magic,
        });
    }

    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(FoldError::TornWrite {
            path: PathBuf::from("<buffer>"),
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset: HEADER_SIZE as u64,
        });
    }

    let payload = &data[HEADER_SIZE..payload_end];
    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(FoldError::ChecksumMismatch {
            path: PathBuf::from("<buffer>"),
            expected: header.checksum,
            actual: computed,
            offset: HEADER_SIZE as u64,
        });
    }

    let mut ops = Vec::with_capacity(header.count as usize);
    let mut pos = 0usize;
    for _ in 0..header.count {
        if payload.len() < pos + OP_OVERHEAD {
            return Err(corrupted(HEADER_SIZE + pos, "Payload too short for op fields".to_string()));
        }
        let kind = OpKind::from_u8(payload[pos])
            .ok_or_else(|| corrupted(HEADER_SIZE + pos, format!("Invalid op kind: {}", payload[pos])))?;
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&payload[pos + 1..pos + 9]);
        let key_len = u16::from_le_bytes([payload[pos + 9], payload[pos + 10]]) as usize;
        let value_len = u32::from_le_bytes([
            payload[pos + 11], payload[pos + 12], payload[pos + 13], payload[pos + 14],
        ]) as usize;

        let key_start = pos + OP_OVERHEAD;
        let value_start = key_start + key_len;
        let op_end = value_start + value_len;
        if payload.len() < op_end {
            return Err(corrupted(
                HEADER_SIZE + pos,
                format!("Payload too short: need {} bytes for key({}) + value({})", op_end, key_len, value_len),
            ));
        }

        ops.push(LoggedOp {
            kind,
            seq: u64::from_le_bytes(seq),
            key: payload[key_start..value_start].to_vec(),
            value: payload[value_start..op_end].to_vec(),
        });
        pos = op_end;
    }

    if pos != payload.len() {
        return Err(corrupted(HEADER_SIZE + pos, format!("{} trailing payload bytes", payload.len() - pos)));
    }

    Ok((ops, payload_end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OpKind, seq: u64, key: &[u8], value: &[u8]) -> LoggedOp {
        LoggedOp { kind, seq, key: key.to_vec(), value: value.to_vec() }
    }

    #[test]
    fn test_mixed_group_decodes_in_order() {
        let ops = vec![
            op(OpKind::Put, 1, b"a", b"base"),
            op(OpKind::Merge, 2, b"a", b"x"),
            op(OpKind::Delete, 3, b"b", b""),
            op(OpKind::Evict, 3, b"b", b""),
        ];
        let bytes = encode_record(&ops).unwrap();
        let (decoded, consumed) = decode_record(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, ops);
    }

    #[test]
    fn test_empty_operand_is_preserved() {
        let bytes = encode_record(&[op(OpKind::Merge, 7, b"k", b"")]).unwrap();
        let (decoded, _) = decode_record(&bytes).unwrap();
        assert_eq!(decoded[0].kind, OpKind::Merge);
        assert!(decoded[0].value.is_empty());
    }

    #[test]
    fn test_decode_stops_at_record_boundary() {
        let mut bytes = encode_record(&[op(OpKind::Put, 1, b"k", b"v")]).unwrap();
        let first_len = bytes.len();
        bytes.extend(encode_record(&[op(OpKind::Put, 2, b"k", b"w")]).unwrap());
        let (_, consumed) = decode_record(&bytes).unwrap();
        assert_eq!(consumed, first_len);
    }

    #[test]
    fn test_oversized_key_rejected() {
        let key = vec![0u8; MAX_KEY_SIZE + 1];
        let result = encode_record(&[op(OpKind::Put, 1, &key, b"val")]);
        assert!(matches!(result, Err(FoldError::OversizedEntry { component, .. }) if component == "key"));
    }

    #[test]
    fn test_corrupted_magic_detected() {
        let mut data = encode_record(&[op(OpKind::Put, 1, b"key", b"value")]).unwrap();
        data[0] = 0xFF;
        assert!(matches!(decode_record(&data), Err(FoldError::NoMagicFound { .. })));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = encode_record(&[op(OpKind::Merge, 1, b"key", b"value")]).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(decode_record(&data), Err(FoldError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_record_is_torn_write() {
        let data = encode_record(&[op(OpKind::Put, 1, b"key", b"value")]).unwrap();
        let torn = &data[..data.len() - 2];
        assert!(matches!(decode_record(torn), Err(FoldError::TornWrite { .. })));
    }
}

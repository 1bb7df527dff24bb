//! Write-ahead log for FoldStore
//!
//! Every mutation of the RAM key table, including compaction rewrites, is
//! first appended here as one checksummed record. Replaying the WAL in
//! order rebuilds exactly the operand logs that were visible before a
//! crash: a group whose record was torn or corrupted is skipped as a whole.
//!
//! A checkpoint file starts with a `Checkpoint` op and holds a full copy of
//! the key logs; once it is in place the files before it are deleted.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::durability::{durable_sync, sync_dir};
use crate::error::{FoldError, FoldResult};
use crate::format::{decode_record, encode_record, LoggedOp, OpKind, RecordHeader, HEADER_SIZE, MAGIC_ARRAY};

const WAL_PREFIX: &str = "wal-";
const WAL_SUFFIX: &str = ".fold";
const TMP_SUFFIX: &str = ".tmp";

/// Bytes of key and value data per checkpoint record.
const CHECKPOINT_CHUNK_BYTES: usize = 4 * 1024 * 1024;

fn wal_file_name(sequence: u64) -> String {
    format!("{}{:016x}{}", WAL_PREFIX, sequence, WAL_SUFFIX)
}

fn parse_wal_file_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(WAL_PREFIX)?.strip_suffix(WAL_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// Appends record groups to the current WAL file, rotating by size.
///
/// The caller must not touch the RAM table for a group until `append`
/// for that group has returned `Ok`.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    size: u64,
    wal_dir: PathBuf,
    sequence: u64,
    rotation_size: u64,
}

impl WalWriter {
    /// Open the newest WAL file in `wal_dir` for appending (creating one if needed).
    pub fn new<P: AsRef<Path>>(wal_dir: P, rotation_size: u64) -> FoldResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| FoldError::io_at(&wal_dir, &e, "Failed to create WAL directory"))?;

        remove_stale_checkpoints(&wal_dir)?;
        let sequence = list_wal_files(&wal_dir)?
            .last()
            .and_then(|p| p.file_name().and_then(|n| n.to_str()).and_then(parse_wal_file_name))
            .unwrap_or(0);
        let path = wal_dir.join(wal_file_name(sequence));
        let file = open_append(&path)?;
        let size = file
            .metadata()
            .map_err(|e| FoldError::io_at(&path, &e, "Failed to stat WAL file"))?
            .len();

        Ok(Self { file, path, size, wal_dir, sequence, rotation_size })
    }

    /// Append one atomic group of ops. When `durable` is set the call
    /// returns only after the bytes have reached persistent media.
    pub fn append(&mut self, ops: &[LoggedOp], durable: bool) -> FoldResult<()> {
        let bytes = encode_record(ops)?;

        if self.size > 0 && self.size + bytes.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        self.file
            .write_all(&bytes)
            .map_err(|e| FoldError::io_at(&self.path, &e, "WAL write failed"))?;
        if durable {
            self.sync()?;
        }
        self.size += bytes.len() as u64;
        Ok(())
    }

    /// Flush everything appended so far to persistent media.
    pub fn sync(&self) -> FoldResult<()> {
        durable_sync(&self.file).map_err(|e| FoldError::io_at(&self.path, &e, "WAL sync failed"))
    }

    fn rotate(&mut self) -> FoldResult<()> {
        self.sync()?;
        self.sequence += 1;
        let new_path = self.wal_dir.join(wal_file_name(self.sequence));
        self.file = open_append(&new_path)?;
        sync_dir(&self.wal_dir)
            .map_err(|e| FoldError::io_at(&self.wal_dir, &e, "Failed to sync WAL directory"))?;
        debug!("WAL rotated to {}", new_path.display());
        self.path = new_path;
        self.size = 0;
        Ok(())
    }

    /// Replace every WAL file with one checkpoint file holding `ops`.
    ///
    /// The checkpoint is written under a temporary name, synced, renamed
    /// into place, and only then are the older files deleted. Appends
    /// continue in the checkpoint file. Returns the number of files removed.
    pub fn checkpoint(&mut self, marker_seq: u64, ops: &[LoggedOp]) -> FoldResult<usize> {
        self.sync()?;
        let sequence = self.sequence + 1;
        let final_path = self.wal_dir.join(wal_file_name(sequence));
        let tmp_path = self.wal_dir.join(format!("{}{}", wal_file_name(sequence), TMP_SUFFIX));

        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| FoldError::io_at(&tmp_path, &e, "Failed to create checkpoint file"))?;
        let marker = LoggedOp { kind: OpKind::Checkpoint, seq: marker_seq, key: Vec::new(), value: Vec::new() };
        let mut written = write_chunk(&mut tmp, &tmp_path, &encode_record(std::slice::from_ref(&marker))?)?;

        let mut start = 0;
        let mut chunk_bytes = 0;
        for (i, op) in ops.iter().enumerate() {
            chunk_bytes += op.key.len() + op.value.len();
            if chunk_bytes >= CHECKPOINT_CHUNK_BYTES || i + 1 == ops.len() {
                written += write_chunk(&mut tmp, &tmp_path, &encode_record(&ops[start..=i])?)?;
                start = i + 1;
                chunk_bytes = 0;
            }
        }
        durable_sync(&tmp).map_err(|e| FoldError::io_at(&tmp_path, &e, "Checkpoint sync failed"))?;
        drop(tmp);

        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| FoldError::io_at(&final_path, &e, "Failed to install checkpoint file"))?;
        sync_dir(&self.wal_dir)
            .map_err(|e| FoldError::io_at(&self.wal_dir, &e, "Failed to sync WAL directory"))?;

        self.file = open_append(&final_path)?;
        self.path = final_path;
        self.sequence = sequence;
        self.size = written;

        let mut removed = 0;
        for path in list_wal_files(&self.wal_dir)? {
            if path == self.path {
                continue;
            }
            std::fs::remove_file(&path)
                .map_err(|e| FoldError::io_at(&path, &e, "Failed to remove superseded WAL file"))?;
            removed += 1;
        }
        sync_dir(&self.wal_dir)
            .map_err(|e| FoldError::io_at(&self.wal_dir, &e, "Failed to sync WAL directory"))?;
        debug!("WAL checkpoint {} written ({} ops, {} bytes), {} files removed", self.path.display(), ops.len(), written, removed);
        Ok(removed)
    }

    /// Current WAL file path (for diagnostics)
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Current WAL file size in bytes
    pub fn current_size(&self) -> u64 {
        self.size
    }
}

fn write_chunk(file: &mut File, path: &Path, bytes: &[u8]) -> FoldResult<u64> {
    file.write_all(bytes)
        .map_err(|e| FoldError::io_at(path, &e, "Checkpoint write failed"))?;
    Ok(bytes.len() as u64)
}

fn open_append(path: &Path) -> FoldResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FoldError::io_at(path, &e, "Failed to open WAL file"))
}

/// Delete checkpoint files that were never renamed into place.
fn remove_stale_checkpoints(wal_dir: &Path) -> FoldResult<()> {
    let entries = std::fs::read_dir(wal_dir)
        .map_err(|e| FoldError::io_at(wal_dir, &e, "Failed to read WAL directory"))?;
    for entry in entries {
        let path = entry.map_err(|e| FoldError::io_at(wal_dir, &e, "Failed to read directory entry"))?.path();
        let stale = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with(WAL_PREFIX) && n.ends_with(TMP_SUFFIX));
        if stale {
            std::fs::remove_file(&path).map_err(|e| FoldError::io_at(&path, &e, "Failed to remove stale checkpoint"))?;
            warn!("WAL: removed unfinished checkpoint {}", path.display());
        }
    }
    Ok(())
}

/// WAL files in sequence order.
fn list_wal_files(wal_dir: &Path) -> FoldResult<Vec<PathBuf>> {
    let dir_entries = match std::fs::read_dir(wal_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FoldError::io_at(wal_dir, &e, "Failed to read WAL directory")),
    };

    let mut files: Vec<(u64, PathBuf)> = Vec::new();
    for entry in dir_entries {
        let entry = entry.map_err(|e| FoldError::io_at(wal_dir, &e, "Failed to read directory entry"))?;
        let path = entry.path();
        if let Some(seq) = path.file_name().and_then(|n| n.to_str()).and_then(parse_wal_file_name) {
            files.push((seq, path));
        }
    }
    files.sort_by_key(|(seq, _)| *seq);
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

/// Replays WAL files for crash recovery.
pub struct WalReader {
    wal_dir: PathBuf,
}

/// Everything recovery found in a WAL directory.
#[derive(Debug, Default)]
pub struct Recovered {
    /// Ops from every intact record, oldest first.
    pub ops: Vec<LoggedOp>,
    /// File and offset where a torn write begins, if any.
    pub torn_tail: Option<(PathBuf, u64)>,
}

impl WalReader {
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> Self {
        Self { wal_dir: wal_dir.as_ref().to_path_buf() }
    }

    /// Recover every op from every intact record, oldest first, starting at
    /// the newest checkpoint file.
    ///
    /// A record with bad magic or a bad checksum is skipped by scanning for
    /// the next magic. A record that runs past the end of its file is the
    /// crash point only when no intact record follows it; otherwise its
    /// length field was damaged and it is skipped too.
    pub fn recover(&self) -> FoldResult<Recovered> {
        let mut recovered = Recovered::default();
        let files = list_wal_files(&self.wal_dir)?;
        let mut start = 0;
        for (i, path) in files.iter().enumerate().rev() {
            if starts_with_checkpoint(path)? {
                start = i;
                break;
            }
        }
        if start > 0 {
            debug!("WAL recovery: starting at checkpoint {}, ignoring {} older files", files[start].display(), start);
        }
        for path in files.into_iter().skip(start) {
            let torn_at = recover_file(&path, &mut recovered.ops)?;
            if let Some(offset) = torn_at {
                recovered.torn_tail = Some((path, offset as u64));
            }
        }
        Ok(recovered)
    }

    /// Like [`recover`](Self::recover), keeping only the ops.
    pub fn recover_ops(&self) -> FoldResult<Vec<LoggedOp>> {
        self.recover().map(|r| r.ops)
    }
}

/// True if the file's first record opens with a `Checkpoint` op.
fn starts_with_checkpoint(path: &Path) -> FoldResult<bool> {
    let mut file = File::open(path).map_err(|e| FoldError::io_at(path, &e, "Failed to open WAL file"))?;
    let mut header = [0u8; HEADER_SIZE];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(FoldError::io_at(path, &e, "Failed to read WAL header")),
    }
    let length = RecordHeader::from_bytes(&header).length as u64;
    let file_len = file
        .metadata()
        .map_err(|e| FoldError::io_at(path, &e, "Failed to stat WAL file"))?
        .len();
    if HEADER_SIZE as u64 + length > file_len {
        return Ok(false);
    }
    let length = length as usize;
    let mut record = header.to_vec();
    record.resize(HEADER_SIZE + length, 0);
    match file.read_exact(&mut record[HEADER_SIZE..]) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(FoldError::io_at(path, &e, "Failed to read WAL record")),
    }
    Ok(matches!(decode_record(&record), Ok((ops, _)) if ops.first().map(|op| op.kind) == Some(OpKind::Checkpoint)))
}

/// Cut a torn record off the end of a WAL file so new appends follow the
/// last intact record.
pub fn truncate_torn_tail(path: &Path, offset: u64) -> FoldResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| FoldError::io_at(path, &e, "Failed to open WAL file for truncation"))?;
    file.set_len(offset)
        .map_err(|e| FoldError::io_at(path, &e, "Failed to truncate torn WAL tail"))?;
    durable_sync(&file).map_err(|e| FoldError::io_at(path, &e, "WAL sync failed"))?;
    warn!("WAL recovery: truncated torn tail of {} at offset {}", path.display(), offset);
    Ok(())
}

/// Append the file's intact ops to `ops`. Returns the offset of a torn
/// write, if the file ends in one.
fn recover_file(path: &Path, ops: &mut Vec<LoggedOp>) -> FoldResult<Option<usize>> {
    let mut buffer = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut buffer))
        .map_err(|e| FoldError::io_at(path, &e, "Failed to read WAL file"))?;

    let mut offset = 0;
    while offset < buffer.len() {
        if offset + HEADER_SIZE > buffer.len() {
            warn!("WAL recovery: partial header in {} at offset {}", path.display(), offset);
            return Ok(Some(offset));
        }
        match decode_record(&buffer[offset..]) {
            Ok((group, consumed)) => {
                ops.extend(group);
                offset += consumed;
            }
            Err(FoldError::TornWrite { expected_size, available_bytes, .. }) => {
                // A damaged length also looks torn; only the tail if nothing intact follows
                match next_decodable(&buffer, offset + 1) {
                    Some(next) => {
                        warn!(
                            "WAL recovery: skipping record in {} at offset {} with bad length {}; resyncing at {}",
                            path.display(), offset, expected_size, next
                        );
                        offset = next;
                    }
                    None => {
                        warn!(
                            "WAL recovery: torn write in {} at offset {}: need {} bytes, have {}",
                            path.display(), offset, expected_size, available_bytes
                        );
                        return Ok(Some(offset));
                    }
                }
            }
            Err(e) => {
                warn!("WAL recovery: skipping damaged record in {} at offset {}: {}", path.display(), offset, e);
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => offset = next,
                    None => break,
                }
            }
        }
    }
    Ok(None)
}

/// Offset of the next record at or after `start` that decodes cleanly.
fn next_decodable(buffer: &[u8], start: usize) -> Option<usize> {
    let mut from = start;
    while let Some(candidate) = find_next_magic(buffer, from) {
        if decode_record(&buffer[candidate..]).is_ok() {
            return Some(candidate);
        }
        from = candidate + 1;
    }
    None
}

/// Next occurrence of the record magic at or after `start`.
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    buffer
        .get(start..)?
        .windows(MAGIC_ARRAY.len())
        .position(|w| w == MAGIC_ARRAY)
        .map(|pos| start + pos)
}

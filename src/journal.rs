//! On-disk journal directory and record format (§3, §4.4)
//!
//! One file per committed transaction lives in the journal directory,
//! named by its transaction identifier so that lexicographic order on the
//! fixed-width name equals commit order. Layout of a single record, all
//! integers little-endian:
//!
//! ```text
//! magic:4  version:4  flags:4  txn_id:4  num_ops:4
//! num_ops * { offset:8  length:4 }
//! payload bytes, concatenated in descriptor order
//! checksum:4   (over everything above)
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::checksum::Checksum;
use crate::error::ErrorKind;
use crate::platform;

/// Magic number identifying a libjournal record: ASCII `LJIO`.
pub const MAGIC: u32 = 0x4C4A494F;
/// Current on-disk format version.
pub const VERSION: u32 = 1;
/// Width, in decimal digits, of a journal file's zero-padded name.
pub const ID_WIDTH: usize = 9;
/// Name of the persisted next-identifier file inside the journal directory.
pub const NEXT_ID_FILE: &str = "next-id";
/// Name of the lockfile inside the journal directory's parent context.
pub const LOCK_FILE: &str = "lock";
/// Suffix appended to a data file's name to derive its journal directory.
pub const JOURNAL_DIR_SUFFIX: &str = ".jio";

/// Fixed-size header fields of a journal record, sans descriptors/payload.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    pub txn_id: u32,
    pub num_ops: u32,
}

/// One write operation's descriptor within a record: target offset and
/// payload length. The payload bytes themselves live in
/// [`JournalRecord::payloads`] at the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpDescriptor {
    pub offset: u64,
    pub length: u32,
}

/// A fully parsed, checksum-verified journal record: the write operations
/// of one committed transaction.
#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub header: RecordHeader,
    pub descriptors: Vec<OpDescriptor>,
    pub payloads: Vec<Vec<u8>>,
}

/// Journal storage failures.
#[derive(Error, Debug)]
pub enum JournalError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A journal file already exists for the identifier being allocated.
    #[error("journal file already exists for transaction {0}")]
    AlreadyExists(u32),
    /// The record's magic or version did not match what this crate writes.
    #[error("corrupt journal record at {0:?}: bad magic or version")]
    BadMagicOrVersion(PathBuf),
    /// The record's checksum did not match its contents.
    #[error("corrupt journal record at {0:?}: checksum mismatch")]
    ChecksumMismatch(PathBuf),
    /// The file is shorter than its own descriptors imply.
    #[error("truncated journal record at {0:?}")]
    Truncated(PathBuf),
}

impl JournalError {
    /// Classify into the crate-wide [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            JournalError::Io(e) => crate::error::classify_io_error(e),
            JournalError::AlreadyExists(_) => ErrorKind::Exists,
            JournalError::BadMagicOrVersion(_)
            | JournalError::ChecksumMismatch(_)
            | JournalError::Truncated(_) => ErrorKind::CorruptJournal,
        }
    }
}

/// Outcome of [`read_record`]: either a well-formed record, or a
/// classified reason it could not be used, per spec.md §4.4.
pub enum ReadOutcome {
    /// The record parsed and its checksum verified.
    Ok(JournalRecord),
    /// Structural mismatch: bad magic/version or checksum failure.
    Corrupt(JournalError),
    /// The file is shorter than its descriptors imply.
    Truncated(JournalError),
}

type Result<T> = std::result::Result<T, JournalError>;

/// Render a transaction identifier as the fixed-width decimal name of its
/// journal file.
pub fn id_to_filename(id: u32) -> String {
    format!("{:0width$}", id, width = ID_WIDTH)
}

/// Parse a journal file's name back into its transaction identifier.
/// Returns `None` for anything that is not an `ID_WIDTH`-digit decimal
/// number (e.g. `next-id`, `lock`).
pub fn filename_to_id(name: &str) -> Option<u32> {
    if name.len() != ID_WIDTH || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Create a new journal file named by `id` in a fresh, exclusive state.
/// Fails if a file of that name already exists.
pub fn allocate(journal_dir: &Path, id: u32) -> Result<File> {
    let path = journal_dir.join(id_to_filename(id));
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                JournalError::AlreadyExists(id)
            } else {
                JournalError::Io(e)
            }
        })
}

/// One write operation to be serialized into a record.
pub struct PendingWrite<'a> {
    pub offset: u64,
    pub data: &'a [u8],
}

/// Serialize a record in the layout described at the top of this module,
/// write it to `file`, fsync the file, then fsync `journal_dir` so the
/// directory entry for it is durable. This is the instant (§4.5 step 3)
/// after which the transaction is considered durably committed.
pub fn write_record(
    file: &mut File,
    journal_dir: &Path,
    txn_id: u32,
    writes: &[PendingWrite<'_>],
) -> Result<()> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(MAGIC)?;
    buf.write_u32::<LittleEndian>(VERSION)?;
    buf.write_u32::<LittleEndian>(0)?; // flags, reserved
    buf.write_u32::<LittleEndian>(txn_id)?;
    buf.write_u32::<LittleEndian>(writes.len() as u32)?;
    for w in writes {
        buf.write_u64::<LittleEndian>(w.offset)?;
        buf.write_u32::<LittleEndian>(w.data.len() as u32)?;
    }
    for w in writes {
        buf.extend_from_slice(w.data);
    }

    let checksum = {
        let mut c = Checksum::new();
        c.update(&buf);
        c.finalize()
    };
    buf.write_u32::<LittleEndian>(checksum)?;

    file.write_all(&buf)?;
    platform::fsync_file(file)?;
    platform::fsync_dir(journal_dir)?;
    Ok(())
}

/// Parse and validate the journal record at `path`.
pub fn read_record(path: &Path) -> ReadOutcome {
    match read_record_inner(path) {
        Ok(record) => ReadOutcome::Ok(record),
        Err(e @ JournalError::Truncated(_)) => ReadOutcome::Truncated(e),
        Err(e) => ReadOutcome::Corrupt(e),
    }
}

fn read_record_inner(path: &Path) -> Result<JournalRecord> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    const FIXED_HEADER_LEN: usize = 20; // magic+version+flags+txn_id+num_ops
    if bytes.len() < FIXED_HEADER_LEN + 4 {
        return Err(JournalError::Truncated(path.to_path_buf()));
    }

    let mut cursor = Cursor::new(&bytes[..]);
    let magic = cursor.read_u32::<LittleEndian>()?;
    let version = cursor.read_u32::<LittleEndian>()?;
    let flags = cursor.read_u32::<LittleEndian>()?;
    let txn_id = cursor.read_u32::<LittleEndian>()?;
    let num_ops = cursor.read_u32::<LittleEndian>()?;

    if magic != MAGIC || version != VERSION {
        return Err(JournalError::BadMagicOrVersion(path.to_path_buf()));
    }

    let descriptors_len = num_ops as usize * 12;
    if bytes.len() < FIXED_HEADER_LEN + descriptors_len + 4 {
        return Err(JournalError::Truncated(path.to_path_buf()));
    }

    let mut descriptors = Vec::with_capacity(num_ops as usize);
    for _ in 0..num_ops {
        let offset = cursor.read_u64::<LittleEndian>()?;
        let length = cursor.read_u32::<LittleEndian>()?;
        descriptors.push(OpDescriptor { offset, length });
    }

    let payload_total: usize = descriptors.iter().map(|d| d.length as usize).sum();
    let expected_len = FIXED_HEADER_LEN + descriptors_len + payload_total + 4;
    if bytes.len() != expected_len {
        return Err(JournalError::Truncated(path.to_path_buf()));
    }

    let mut payloads = Vec::with_capacity(descriptors.len());
    for d in &descriptors {
        let mut buf = vec![0u8; d.length as usize];
        cursor.read_exact(&mut buf)?;
        payloads.push(buf);
    }

    let stored_checksum = cursor.read_u32::<LittleEndian>()?;
    let computed = crate::checksum::checksum_bytes(&bytes[..bytes.len() - 4]);
    if stored_checksum != computed {
        return Err(JournalError::ChecksumMismatch(path.to_path_buf()));
    }

    Ok(JournalRecord {
        header: RecordHeader {
            magic,
            version,
            flags,
            txn_id,
            num_ops,
        },
        descriptors,
        payloads,
    })
}

/// Unlink the journal file at `path` and fsync `journal_dir` so the
/// removal is durable.
pub fn remove(path: &Path, journal_dir: &Path) -> Result<()> {
    std::fs::remove_file(path)?;
    platform::fsync_dir(journal_dir)?;
    Ok(())
}

/// Enumerate journal files in `journal_dir`, returned `(id, path)` in
/// identifier order. Entries that do not parse as fixed-width decimal
/// identifiers (`next-id`, `lock`) are skipped.
pub fn scan(journal_dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(journal_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(id) = filename_to_id(&name) {
            entries.push((id, entry.path()));
        }
    }
    entries.sort_by_key(|(id, _)| *id);
    Ok(entries)
}

/// Read the persisted next-identifier counter, if present.
pub fn read_next_id(journal_dir: &Path) -> Result<Option<u32>> {
    let path = journal_dir.join(NEXT_ID_FILE);
    match std::fs::read(&path) {
        Ok(bytes) if bytes.len() >= 4 => {
            let mut cursor = Cursor::new(&bytes[..4]);
            Ok(Some(cursor.read_u32::<LittleEndian>()?))
        }
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(JournalError::Io(e)),
    }
}

/// Persist `next_id` durably: write to a temp file, fsync it, rename over
/// the real next-id file, fsync the directory.
pub fn persist_next_id(journal_dir: &Path, next_id: u32) -> Result<()> {
    let tmp_path = journal_dir.join(format!("{}.tmp", NEXT_ID_FILE));
    let final_path = journal_dir.join(NEXT_ID_FILE);

    let mut buf = Vec::with_capacity(4);
    buf.write_u32::<LittleEndian>(next_id)?;

    {
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&buf)?;
        platform::fsync_file(&tmp)?;
    }
    platform::atomic_rename(&tmp_path, &final_path)?;
    platform::fsync_dir(journal_dir)?;
    Ok(())
}

/// Ensure the lockfile for `journal_dir` exists, and return its opened
/// handle. Content is never read or written; only its inode matters.
pub fn open_lockfile(journal_dir: &Path) -> Result<File> {
    let path = journal_dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)?;
    Ok(file)
}

/// Derive the journal directory path for a data file: sibling directory
/// named `<datafile>.jio`.
pub fn journal_dir_for(data_file_path: &Path) -> PathBuf {
    let mut name = data_file_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(JOURNAL_DIR_SUFFIX);
    data_file_path
        .parent()
        .map(|p| p.join(&name))
        .unwrap_or_else(|| PathBuf::from(&name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_record_roundtrip() {
        let dir = tempdir().unwrap();
        let mut file = allocate(dir.path(), 1).unwrap();
        let writes = vec![
            PendingWrite {
                offset: 100,
                data: b"AAAA",
            },
            PendingWrite {
                offset: 200,
                data: b"BBBBBB",
            },
        ];
        write_record(&mut file, dir.path(), 1, &writes).unwrap();

        let path = dir.path().join(id_to_filename(1));
        match read_record(&path) {
            ReadOutcome::Ok(record) => {
                assert_eq!(record.header.txn_id, 1);
                assert_eq!(record.descriptors.len(), 2);
                assert_eq!(record.payloads[0], b"AAAA");
                assert_eq!(record.payloads[1], b"BBBBBB");
            }
            _ => panic!("expected well-formed record"),
        }
    }

    #[test]
    fn flipped_bit_is_corrupt() {
        let dir = tempdir().unwrap();
        let mut file = allocate(dir.path(), 1).unwrap();
        let writes = vec![PendingWrite {
            offset: 0,
            data: b"hello",
        }];
        write_record(&mut file, dir.path(), 1, &writes).unwrap();
        drop(file);

        let path = dir.path().join(id_to_filename(1));
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        match read_record(&path) {
            ReadOutcome::Corrupt(_) => {}
            _ => panic!("expected corrupt classification"),
        }
    }

    #[test]
    fn truncated_file_is_truncated() {
        let dir = tempdir().unwrap();
        let mut file = allocate(dir.path(), 1).unwrap();
        let writes = vec![PendingWrite {
            offset: 0,
            data: b"hello world this is a longer payload",
        }];
        write_record(&mut file, dir.path(), 1, &writes).unwrap();
        drop(file);

        let path = dir.path().join(id_to_filename(1));
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        match read_record(&path) {
            ReadOutcome::Truncated(_) => {}
            _ => panic!("expected truncated classification"),
        }
    }

    #[test]
    fn scan_returns_identifier_order() {
        let dir = tempdir().unwrap();
        for id in [3u32, 1, 2] {
            let mut f = allocate(dir.path(), id).unwrap();
            write_record(&mut f, dir.path(), id, &[]).unwrap();
        }
        let entries = scan(dir.path()).unwrap();
        let ids: Vec<u32> = entries.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn next_id_persists_across_calls() {
        let dir = tempdir().unwrap();
        assert_eq!(read_next_id(dir.path()).unwrap(), None);
        persist_next_id(dir.path(), 42).unwrap();
        assert_eq!(read_next_id(dir.path()).unwrap(), Some(42));
    }

    #[test]
    fn journal_dir_naming() {
        let path = Path::new("/tmp/foo/data.bin");
        assert_eq!(
            journal_dir_for(path),
            Path::new("/tmp/foo/data.bin.jio")
        );
    }
}

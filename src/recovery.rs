//! Recovery / fsck (§4.7)
//!
//! Scans the journal directory, validates each journal file, and rolls
//! forward every well-formed record in identifier order so that later
//! commits overwrite earlier ones where they overlap — the same ordering
//! property the lock manager preserves at runtime.

use bitflags::bitflags;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use thiserror::Error;

use crate::journal::{self, ReadOutcome};
use crate::platform;

bitflags! {
    /// Flags recognized by [`fsck`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsckFlags: u32 {
        /// Remove broken (corrupt or truncated) records instead of leaving
        /// them in place.
        const CLEANUP = 0b01;
    }
}

/// Recovery failures.
#[derive(Error, Debug)]
pub enum RecoveryError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Journal storage failure while reading or removing a record.
    #[error(transparent)]
    Journal(#[from] crate::journal::JournalError),
}

/// The result of a completed fsck pass (§4.7 step 4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Total journal files examined.
    pub total: u32,
    /// Records successfully rolled forward.
    pub applied: u32,
    /// Records classified corrupt or truncated.
    pub broken: u32,
    /// Of the applied records, how many whose writes were already present
    /// byte-identical in the data file (the idempotence witness).
    pub reapplied_identical: u32,
    /// Broken records removed (only nonzero with [`FsckFlags::CLEANUP`]).
    pub cleaned: u32,
}

impl std::fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} applied={} broken={} reapplied_identical={} cleaned={}",
            self.total, self.applied, self.broken, self.reapplied_identical, self.cleaned
        )
    }
}

/// Distinguishes an ordinary report from the case where the journal
/// directory does not exist at all (spec.md §6.1's "no-journal" status).
pub enum FsckOutcome {
    /// The journal directory existed and was scanned.
    Report(RecoveryReport),
    /// No journal directory exists for this data file.
    NoJournal,
}

/// Public entry point matching spec.md §6.1's `fsck(path, flags)`. Opens
/// the data file and its journal directory itself; does not require a live
/// [`crate::handle::Handle`].
pub fn fsck(data_path: &Path, flags: FsckFlags) -> Result<FsckOutcome, RecoveryError> {
    let journal_dir = journal::journal_dir_for(data_path);
    if !journal_dir.is_dir() {
        return Ok(FsckOutcome::NoJournal);
    }

    let data_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(data_path)?;

    let report = run(&data_file, &journal_dir, flags.contains(FsckFlags::CLEANUP))?;
    Ok(FsckOutcome::Report(report))
}

/// Run the scan/replay pass against an already-open data file and an
/// already-existing journal directory. Used both by the public [`fsck`]
/// entry point and by [`crate::handle::Handle::open`]'s implicit recovery.
pub fn run(
    data_file: &std::fs::File,
    journal_dir: &Path,
    cleanup: bool,
) -> Result<RecoveryReport, RecoveryError> {
    let mut report = RecoveryReport::default();
    let data_fd = data_file.as_raw_fd();

    let mut max_id_seen: u32 = 0;
    let entries = journal::scan(journal_dir)?;

    for (id, path) in entries {
        report.total += 1;
        max_id_seen = max_id_seen.max(id);

        match journal::read_record(&path) {
            ReadOutcome::Ok(record) => {
                let mut all_identical = true;
                for (desc, payload) in record.descriptors.iter().zip(record.payloads.iter()) {
                    let mut current = vec![0u8; desc.length as usize];
                    let n = platform::pread_full(data_fd, &mut current, desc.offset)?;
                    current.truncate(n);
                    if current.as_slice() != payload.as_slice() {
                        all_identical = false;
                    }
                    platform::pwrite_full(data_fd, payload, desc.offset)?;
                }
                platform::fsync_file(data_file)?;
                journal::remove(&path, journal_dir)?;

                report.applied += 1;
                if all_identical {
                    report.reapplied_identical += 1;
                }
            }
            ReadOutcome::Corrupt(_) | ReadOutcome::Truncated(_) => {
                report.broken += 1;
                if cleanup {
                    std::fs::remove_file(&path)?;
                    platform::fsync_dir(journal_dir)?;
                    report.cleaned += 1;
                }
            }
        }
    }

    // Step 3: make sure the persisted counter exceeds every identifier
    // this pass has seen, regardless of whether it came from a still-open
    // file or one just removed.
    let persisted = journal::read_next_id(journal_dir)?.unwrap_or(0);
    let next = persisted.max(max_id_seen.saturating_add(1));
    if next > persisted {
        journal::persist_next_id(journal_dir, next)?;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{self, PendingWrite};
    use std::io::Write as _;
    use tempfile::tempdir;

    fn setup_data_file(dir: &Path, len: u64) -> std::fs::File {
        let path = dir.join("data.bin");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.set_len(len).unwrap();
        file
    }

    #[test]
    fn replays_well_formed_record() {
        let dir = tempdir().unwrap();
        let journal_dir = dir.path().join("j");
        std::fs::create_dir(&journal_dir).unwrap();
        let data_file = setup_data_file(dir.path(), 4096);

        let mut jf = journal::allocate(&journal_dir, 1).unwrap();
        journal::write_record(
            &mut jf,
            &journal_dir,
            1,
            &[PendingWrite {
                offset: 100,
                data: b"AAAA",
            }],
        )
        .unwrap();

        let report = run(&data_file, &journal_dir, false).unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(report.broken, 0);

        let mut buf = [0u8; 4];
        platform::pread_full(data_file.as_raw_fd(), &mut buf, 100).unwrap();
        assert_eq!(&buf, b"AAAA");
        assert!(journal::scan(&journal_dir).unwrap().is_empty());
    }

    #[test]
    fn second_run_is_idempotent_with_zero_applied() {
        let dir = tempdir().unwrap();
        let journal_dir = dir.path().join("j");
        std::fs::create_dir(&journal_dir).unwrap();
        let data_file = setup_data_file(dir.path(), 4096);

        let mut jf = journal::allocate(&journal_dir, 1).unwrap();
        journal::write_record(
            &mut jf,
            &journal_dir,
            1,
            &[PendingWrite {
                offset: 0,
                data: b"hi",
            }],
        )
        .unwrap();

        run(&data_file, &journal_dir, false).unwrap();
        let second = run(&data_file, &journal_dir, false).unwrap();
        assert_eq!(second.total, 0);
        assert_eq!(second.applied, 0);
    }

    #[test]
    fn corrupt_record_is_counted_broken_and_data_file_untouched() {
        let dir = tempdir().unwrap();
        let journal_dir = dir.path().join("j");
        std::fs::create_dir(&journal_dir).unwrap();
        let data_file = setup_data_file(dir.path(), 4096);

        let mut jf = journal::allocate(&journal_dir, 1).unwrap();
        journal::write_record(
            &mut jf,
            &journal_dir,
            1,
            &[PendingWrite {
                offset: 0,
                data: b"AAAA",
            }],
        )
        .unwrap();
        drop(jf);

        let path = journal_dir.join(journal::id_to_filename(1));
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let report = run(&data_file, &journal_dir, false).unwrap();
        assert_eq!(report.broken, 1);
        assert_eq!(report.applied, 0);

        let mut buf = [0u8; 4];
        platform::pread_full(data_file.as_raw_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf, &[0u8; 4]);
    }

    #[test]
    fn cleanup_removes_broken_record() {
        let dir = tempdir().unwrap();
        let journal_dir = dir.path().join("j");
        std::fs::create_dir(&journal_dir).unwrap();
        let data_file = setup_data_file(dir.path(), 4096);

        let mut raw = std::fs::File::create(journal_dir.join(journal::id_to_filename(1))).unwrap();
        raw.write_all(b"not a valid record").unwrap();
        drop(raw);

        let report = run(&data_file, &journal_dir, true).unwrap();
        assert_eq!(report.broken, 1);
        assert_eq!(report.cleaned, 1);
        assert!(journal::scan(&journal_dir).unwrap().is_empty());
    }

    #[test]
    fn fsck_reports_no_journal_when_directory_absent() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("data.bin");
        std::fs::write(&data_path, b"").unwrap();

        match fsck(&data_path, FsckFlags::empty()).unwrap() {
            FsckOutcome::NoJournal => {}
            FsckOutcome::Report(_) => panic!("expected NoJournal"),
        }
    }
}

//! Public API surface (§6.1): the handle, file-level pread/pwrite/truncate,
//! and the transaction builder entry point.

use bitflags::bitflags;
use std::collections::HashSet;
use std::fs::{File, OpenOptions as StdOpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::autosync::{AutosyncConfig, AutosyncWorker};
use crate::error::{Error, Result};
use crate::journal;
use crate::lock::LockManager;
use crate::recovery;
use crate::transaction::Transaction;

bitflags! {
    /// Flags recognized by [`Handle::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HandleFlags: u32 {
        /// Defer data-file fsync and journal removal to the autosync
        /// worker (§4.6).
        const LINGER = 0b01;
    }
}

/// POSIX-style open flags for the data file, kept as a small struct rather
/// than exposing raw `libc::O_*` constants in the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    create: bool,
    truncate: bool,
}

impl OpenFlags {
    /// Open an existing data file for read/write, creating nothing.
    pub fn open_existing() -> Self {
        OpenFlags {
            create: false,
            truncate: false,
        }
    }

    /// Open for read/write, creating the data file if it does not exist.
    pub fn create_rw() -> Self {
        OpenFlags {
            create: true,
            truncate: false,
        }
    }

    /// Truncate the data file to zero length on open.
    pub fn with_truncate(mut self) -> Self {
        self.truncate = true;
        self
    }
}

/// Live introspection of a handle, useful before deciding whether to call
/// `autosync_stop` ahead of `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleStats {
    /// Transactions currently registered as live (between `STAGED` and
    /// `RELEASED`).
    pub live_transactions: usize,
    /// Bytes queued in the autosync worker but not yet flushed.
    pub pending_autosync_bytes: u64,
}

/// Binds a data file to its journal directory. Created by [`Handle::open`],
/// destroyed by [`Handle::close`].
pub struct Handle {
    data_file: File,
    journal_dir: PathBuf,
    lock_manager: Arc<LockManager>,
    _lockfile: File,
    next_id: AtomicU32,
    flags: HandleFlags,
    registry: Mutex<HashSet<u32>>,
    autosync: Mutex<Option<AutosyncWorker>>,
    /// Set when `autosync_stop` observes a flush error the worker could
    /// not surface in time; stays set until cleared by
    /// `take_autosync_error`, blocking `close` until then (§7).
    last_autosync_error: Mutex<Option<Error>>,
}

impl Handle {
    /// Open (and, per `open_flags`, create) `path` as a journaled data
    /// file. Creates/validates the journal directory and runs implicit
    /// recovery (§4.7) if it already existed.
    pub fn open(path: &Path, open_flags: OpenFlags, handle_flags: HandleFlags) -> Result<Handle> {
        let data_file = StdOpenOptions::new()
            .read(true)
            .write(true)
            .create(open_flags.create)
            .truncate(open_flags.truncate)
            .open(path)?;

        let journal_dir = journal::journal_dir_for(path);
        let journal_existed = journal_dir.is_dir();
        if journal_dir.exists() && !journal_existed {
            return Err(Error::Exists(format!(
                "{} exists but is not a directory",
                journal_dir.display()
            )));
        }
        if !journal_existed {
            std::fs::create_dir(&journal_dir)?;
            log::debug!("created journal directory {}", journal_dir.display());
        }

        let lockfile = journal::open_lockfile(&journal_dir)?;
        let lock_manager = Arc::new(LockManager::new(lockfile.as_raw_fd()));

        if journal_existed {
            let report = recovery::run(&data_file, &journal_dir, false)?;
            log::info!("libjournal: recovery at open: {report}");
        }

        let persisted_next = journal::read_next_id(&journal_dir)?.unwrap_or(0);
        let scanned_max = journal::scan(&journal_dir)?
            .iter()
            .map(|(id, _)| *id)
            .max()
            .unwrap_or(0);
        let next_id_start = persisted_next.max(scanned_max.saturating_add(1)).max(1);

        Ok(Handle {
            data_file,
            journal_dir,
            lock_manager,
            _lockfile: lockfile,
            next_id: AtomicU32::new(next_id_start),
            flags: handle_flags,
            registry: Mutex::new(HashSet::new()),
            autosync: Mutex::new(None),
            last_autosync_error: Mutex::new(None),
        })
    }

    /// Close the handle. Fails if autosync is still active (stop it first,
    /// or drain with an explicit flush), if transactions are still live, or
    /// if a past autosync flush failed and the error has not yet been
    /// cleared via [`Handle::take_autosync_error`] (§7).
    pub fn close(self) -> Result<()> {
        if !self.registry.lock().is_empty() {
            return Err(Error::InvalidArgument(
                "cannot close handle: live transactions outstanding".to_string(),
            ));
        }
        if self.autosync.lock().is_some() {
            return Err(Error::Busy);
        }
        if self.last_autosync_error.lock().is_some() {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Positional read, participating in locking: acquires a lock over
    /// `[offset, offset+buf.len())`, performs the read, releases.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let _guard = self.lock_manager.lock(offset, buf.len() as u64)?;
        crate::platform::pread_full(self.data_fd(), buf, offset).map_err(Error::Io)
    }

    /// Positional write, participating in locking: acquires a lock over
    /// `[offset, offset+buf.len())`, performs the write, releases.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let _guard = self.lock_manager.lock(offset, buf.len() as u64)?;
        crate::platform::pwrite_full(self.data_fd(), buf, offset).map_err(Error::Io)
    }

    /// Truncate the data file to `length`, serialized against every
    /// transaction touching any byte at or beyond the new length.
    pub fn truncate(&self, length: u64) -> Result<()> {
        let _guard = self
            .lock_manager
            .lock(length, crate::platform::LEN_TO_EOF)?;
        self.data_file.set_len(length)?;
        Ok(())
    }

    /// Start a new transaction bound to this handle.
    pub fn new_trans(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Start the autosync worker.
    pub fn autosync_start(&self, config: AutosyncConfig) -> Result<()> {
        let mut slot = self.autosync.lock();
        if slot.is_some() {
            return Err(Error::InvalidArgument(
                "autosync is already active".to_string(),
            ));
        }
        let worker = AutosyncWorker::start(self.data_fd(), self.journal_dir.clone(), config)?;
        *slot = Some(worker);
        Ok(())
    }

    /// Stop the autosync worker, synchronously draining its queue first.
    /// A flush error recorded by the worker survives the stop, latched
    /// into this handle's error slot so [`Handle::take_autosync_error`]
    /// can still observe it afterward.
    pub fn autosync_stop(&self) -> Result<()> {
        let worker = self.autosync.lock().take();
        if let Some(w) = worker {
            if let Err(e) = w.stop() {
                *self.last_autosync_error.lock() = Some(e);
            }
        }
        Ok(())
    }

    /// Take and clear the asynchronous error flag set by the autosync
    /// worker, if any (§7's propagation policy). Checks the running
    /// worker first, then the latched slot left behind by a past
    /// [`Handle::autosync_stop`].
    pub fn take_autosync_error(&self) -> Option<Error> {
        if let Some(e) = self.autosync.lock().as_ref().and_then(|w| w.take_error()) {
            return Some(e);
        }
        self.last_autosync_error.lock().take()
    }

    /// Snapshot of live-transaction count and pending autosync bytes.
    pub fn stats(&self) -> HandleStats {
        HandleStats {
            live_transactions: self.registry.lock().len(),
            pending_autosync_bytes: self
                .autosync
                .lock()
                .as_ref()
                .map(|w| w.pending_bytes())
                .unwrap_or(0),
        }
    }

    pub(crate) fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    pub(crate) fn data_fd(&self) -> RawFd {
        self.data_file.as_raw_fd()
    }

    pub(crate) fn journal_dir(&self) -> &Path {
        &self.journal_dir
    }

    pub(crate) fn linger_enabled(&self) -> bool {
        self.flags.contains(HandleFlags::LINGER)
    }

    pub(crate) fn allocate_txn_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register_live(&self, id: u32) {
        self.registry.lock().insert(id);
    }

    pub(crate) fn unregister_live(&self, id: u32) {
        self.registry.lock().remove(&id);
    }

    pub(crate) fn fsync_data_file(&self) -> Result<()> {
        crate::platform::fsync_file(&self.data_file).map_err(Error::Io)
    }

    pub(crate) fn enqueue_autosync(&self, path: PathBuf, bytes: u64) {
        match self.autosync.lock().as_ref() {
            Some(w) => w.enqueue(path, bytes),
            None => log::warn!(
                "linger commit with autosync not started; journal record left pending at {}",
                path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_journal_directory() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("data.bin");
        let _handle = Handle::open(&data_path, OpenFlags::create_rw(), HandleFlags::empty())
            .unwrap();
        assert!(journal::journal_dir_for(&data_path).is_dir());
    }

    #[test]
    fn close_fails_while_transaction_live() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("data.bin");
        let handle = Handle::open(&data_path, OpenFlags::create_rw(), HandleFlags::empty())
            .unwrap();
        handle.register_live(1);
        assert!(handle.close().is_err());
    }

    #[test]
    fn pread_pwrite_roundtrip_through_handle() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("data.bin");
        let handle = Handle::open(
            &data_path,
            OpenFlags::create_rw().with_truncate(),
            HandleFlags::empty(),
        )
        .unwrap();
        handle.truncate(4096).unwrap();
        handle.pwrite(b"hello", 10).unwrap();
        let mut buf = [0u8; 5];
        handle.pread(&mut buf, 10).unwrap();
        assert_eq!(&buf, b"hello");
    }
}

//! Autosync / linger background worker (§4.6)
//!
//! When a handle is opened with [`crate::handle::HandleFlags::LINGER`],
//! commit defers the data-file fsync and journal-file removal to this
//! worker instead of doing them inline. One dedicated thread runs per
//! handle; it wakes on a periodic timer or once enough pending bytes have
//! accumulated, whichever comes first.
//!
//! The worker does not hold a back-reference to the owning
//! [`crate::handle::Handle`] — only a duplicated raw data-file descriptor
//! and the journal directory path — so there is no handle-worker reference
//! cycle to manage.

use parking_lot::{Condvar, Mutex};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::platform;

/// Tuning knobs for the autosync worker (§4.6).
#[derive(Debug, Clone, Copy)]
pub struct AutosyncConfig {
    /// Wake up at least this often even if the byte threshold hasn't been
    /// reached.
    pub interval: Duration,
    /// Wake up as soon as this many pending bytes have accumulated.
    pub threshold_bytes: u64,
}

impl Default for AutosyncConfig {
    fn default() -> Self {
        AutosyncConfig {
            interval: Duration::from_secs(5),
            threshold_bytes: 1024 * 1024,
        }
    }
}

struct SharedState {
    pending: Vec<PathBuf>,
    pending_bytes: u64,
    stop: bool,
    error: Option<Error>,
}

struct Shared {
    state: Mutex<SharedState>,
    cond: Condvar,
    config: AutosyncConfig,
}

/// Handle to the running autosync worker thread.
pub struct AutosyncWorker {
    shared: std::sync::Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl AutosyncWorker {
    /// Spawn the worker thread. `data_fd` is duplicated so the worker owns
    /// an independent descriptor it can fsync without racing the handle's
    /// own use of its data file.
    pub fn start(data_fd: RawFd, journal_dir: PathBuf, config: AutosyncConfig) -> std::io::Result<Self> {
        let dup_fd = unsafe { libc::dup(data_fd) };
        if dup_fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let shared = std::sync::Arc::new(Shared {
            state: Mutex::new(SharedState {
                pending: Vec::new(),
                pending_bytes: 0,
                stop: false,
                error: None,
            }),
            cond: Condvar::new(),
            config,
        });

        let worker_shared = shared.clone();
        let thread = std::thread::spawn(move || {
            run_worker(worker_shared, dup_fd, journal_dir);
            unsafe {
                libc::close(dup_fd);
            }
        });

        Ok(AutosyncWorker {
            shared,
            thread: Some(thread),
        })
    }

    /// Enqueue a just-committed linger transaction's journal path for the
    /// next wake. Only wakes the worker early once the byte threshold is
    /// crossed; otherwise the pending batch grows until the next periodic
    /// wake, per §4.6's amortized-fsync intent.
    pub fn enqueue(&self, path: PathBuf, bytes: u64) {
        let mut state = self.shared.state.lock();
        state.pending.push(path);
        state.pending_bytes += bytes;
        if state.pending_bytes >= self.shared.config.threshold_bytes {
            self.shared.cond.notify_all();
        }
    }

    /// Number of bytes currently queued but not yet flushed.
    pub fn pending_bytes(&self) -> u64 {
        self.shared.state.lock().pending_bytes
    }

    /// Take and clear the asynchronous error flag, if one is set.
    pub fn take_error(&self) -> Option<Error> {
        self.shared.state.lock().error.take()
    }

    /// Stop the worker, draining its queue synchronously (a final fsync +
    /// unlinks) before returning, per spec.md §4.6's shutdown contract.
    /// Surfaces the worker's last recorded flush error, if any, instead of
    /// discarding it.
    pub fn stop(mut self) -> Result<(), Error> {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            self.shared.cond.notify_all();
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        match self.shared.state.lock().error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Drives the wake loop: flush when the periodic interval elapses, when
/// pending bytes cross `threshold_bytes`, or when `stop` is requested with
/// a nonempty queue — never on every single commit, so fsync cost is
/// amortized across a batch (§4.6).
fn run_worker(shared: std::sync::Arc<Shared>, data_fd: RawFd, journal_dir: PathBuf) {
    'outer: loop {
        let (batch, batch_bytes) = {
            let mut state = shared.state.lock();
            let deadline = Instant::now() + shared.config.interval;
            loop {
                if state.stop && state.pending.is_empty() {
                    break 'outer;
                }
                let threshold_crossed = state.pending_bytes >= shared.config.threshold_bytes;
                if !state.pending.is_empty() && (state.stop || threshold_crossed) {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                shared.cond.wait_for(&mut state, deadline - now);
            }
            if state.pending.is_empty() {
                continue 'outer;
            }
            let bytes = state.pending_bytes;
            state.pending_bytes = 0;
            (std::mem::take(&mut state.pending), bytes)
        };

        if let Err(e) = flush_batch(data_fd, &journal_dir, &batch) {
            let mut state = shared.state.lock();
            state.error = Some(e);
            // Leave the batch (and its byte count) for the next wake
            // rather than lose it.
            state.pending.extend(batch);
            state.pending_bytes += batch_bytes;
            continue;
        }
    }
}

/// The fsync of the data file must complete before any unlinks begin
/// (§4.6's ordering requirement).
fn flush_batch(data_fd: RawFd, journal_dir: &Path, batch: &[PathBuf]) -> Result<(), Error> {
    if batch.is_empty() {
        return Ok(());
    }
    sync_fd(data_fd)?;
    for path in batch {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
    }
    platform::fsync_dir(journal_dir)?;
    Ok(())
}

fn sync_fd(fd: RawFd) -> std::io::Result<()> {
    let ret = unsafe { libc::fsync(fd) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

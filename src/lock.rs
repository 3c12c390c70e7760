//! Range-locking manager (§4.3)
//!
//! A process-local ordered interval table gates intra-process callers;
//! once granted locally, the same interval is acquired on the handle's
//! dedicated lockfile via the kernel's byte-range lock primitive, which
//! extends the serialization to every other process that has the same
//! journaled file open.
//!
//! Ordering: within one transaction, callers must pass the full set of
//! intervals touched by the transaction; this manager sorts them by start
//! offset and acquires (and later releases, in reverse order) ascending.

use parking_lot::{Condvar, Mutex};
use std::os::unix::io::RawFd;
use thiserror::Error;

use crate::platform::{self, LockKind};

/// Lock manager failures.
#[derive(Error, Debug)]
pub enum LockError {
    /// The kernel byte-range lock call failed.
    #[error("kernel lock failed: {0}")]
    Kernel(#[from] std::io::Error),
}

/// Half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interval {
    start: u64,
    end: u64,
}

impl Interval {
    /// `length == platform::LEN_TO_EOF` produces an open-ended interval
    /// `[start, EOF)`, represented internally as `end == u64::MAX`.
    fn new(start: u64, length: u64) -> Self {
        let end = if length == platform::LEN_TO_EOF {
            u64::MAX
        } else {
            start.saturating_add(length)
        };
        Interval { start, end }
    }

    fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The `len` argument `platform::lock_range`/`unlock_range` expect:
    /// the real byte count, or `LEN_TO_EOF` for an open-ended interval.
    fn lock_len(&self) -> u64 {
        if self.end == u64::MAX {
            platform::LEN_TO_EOF
        } else {
            self.end - self.start
        }
    }
}

struct State {
    held: Vec<Interval>,
}

/// Coordinates range locks within this process and, via the lockfile,
/// across every process with the journaled file open.
pub struct LockManager {
    state: Mutex<State>,
    free: Condvar,
    lock_fd: RawFd,
}

impl LockManager {
    /// Create a lock manager layered over the kernel byte-range locks of
    /// `lock_fd` (the handle's lockfile descriptor).
    pub fn new(lock_fd: RawFd) -> Self {
        LockManager {
            state: Mutex::new(State { held: Vec::new() }),
            free: Condvar::new(),
            lock_fd,
        }
    }

    /// Acquire a single range lock, blocking until granted.
    pub fn lock(&self, start: u64, length: u64) -> Result<RangeGuard<'_>, LockError> {
        self.lock_many(&[(start, length)])
    }

    /// Acquire every interval in `ranges` as one logical acquisition: sort
    /// ascending by start offset (spec.md §4.3), then acquire each in turn,
    /// blocking intra-process on the condvar and inter-process on the
    /// lockfile. If the kernel lock fails partway through, everything
    /// acquired so far is rolled back before the error is returned.
    pub fn lock_many(&self, ranges: &[(u64, u64)]) -> Result<RangeGuard<'_>, LockError> {
        let mut sorted: Vec<Interval> = ranges.iter().map(|(s, l)| Interval::new(*s, *l)).collect();
        sorted.sort_by_key(|iv| iv.start);

        let mut acquired: Vec<Interval> = Vec::with_capacity(sorted.len());
        for iv in &sorted {
            if let Err(e) = self.acquire_one(*iv) {
                // Roll back everything acquired so far, in reverse order.
                for done in acquired.iter().rev() {
                    self.release_one(*done);
                }
                return Err(e);
            }
            acquired.push(*iv);
        }

        Ok(RangeGuard {
            manager: self,
            intervals: acquired,
        })
    }

    fn acquire_one(&self, iv: Interval) -> Result<(), LockError> {
        // Intra-process: wait until no held interval overlaps, then reserve.
        {
            let mut state = self.state.lock();
            while state.held.iter().any(|h| h.overlaps(&iv)) {
                self.free.wait(&mut state);
            }
            state.held.push(iv);
        }

        // Inter-process: kernel byte-range lock on the lockfile, blocking.
        if let Err(e) = platform::lock_range(
            self.lock_fd,
            iv.start,
            iv.lock_len(),
            LockKind::Exclusive,
        ) {
            // Undo the intra-process reservation before surfacing the error.
            let mut state = self.state.lock();
            if let Some(pos) = state.held.iter().position(|h| *h == iv) {
                state.held.remove(pos);
            }
            self.free.notify_all();
            return Err(LockError::Kernel(e));
        }

        Ok(())
    }

    fn release_one(&self, iv: Interval) {
        let _ = platform::unlock_range(self.lock_fd, iv.start, iv.lock_len());
        let mut state = self.state.lock();
        if let Some(pos) = state.held.iter().position(|h| *h == iv) {
            state.held.remove(pos);
        }
        drop(state);
        self.free.notify_all();
    }
}

/// A scoped hold on every interval requested from [`LockManager::lock`] or
/// [`LockManager::lock_many`]. Releasing happens in reverse acquisition
/// order, either explicitly via [`RangeGuard::release`] or automatically on
/// drop.
pub struct RangeGuard<'a> {
    manager: &'a LockManager,
    intervals: Vec<Interval>,
}

impl<'a> RangeGuard<'a> {
    /// Release every held interval now, in reverse acquisition order.
    pub fn release(mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        for iv in self.intervals.drain(..).rev() {
            self.manager.release_one(iv);
        }
    }
}

impl<'a> Drop for RangeGuard<'a> {
    fn drop(&mut self) {
        self.release_all();
    }
}

//! Transaction state machine (§4.5)
//!
//! ```text
//! BUILDING -> STAGED -> COMMITTING -> APPLIED -> RELEASED
//!                |            |
//!                `-- aborted -'
//! ```
//!
//! A transaction never holds a persistent reference back to its
//! [`crate::handle::Handle`]; `commit` borrows the handle only for the
//! duration of the call, so there is no handle-transaction reference cycle
//! to manage (see `DESIGN.md`).

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::journal::{self, PendingWrite};
use crate::platform;

/// Where a transaction sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting `add_w`/`add_r` calls; no I/O has happened yet.
    Building,
    /// `commit()` has been called; identifier assigned, interval set
    /// gathered.
    Staged,
    /// Locks held; journal record being written and fsynced.
    Committing,
    /// Payload bytes applied to the data file (and fsynced, unless
    /// linger).
    Applied,
    /// Journal file removed, locks released, registry entry gone.
    Released,
    /// Aborted before the durability point; no trace left on disk.
    Aborted,
}

/// One operation added to a transaction in `BUILDING` state.
enum Op {
    Write { offset: u64, data: Vec<u8> },
    Read { offset: u64, length: usize },
}

/// An ordered collection of operations plus commit metadata (§3).
pub struct Transaction<'h> {
    handle: &'h Handle,
    state: TransactionState,
    ops: Vec<Op>,
    read_results: Vec<Option<Vec<u8>>>,
    id: Option<u32>,
}

impl<'h> Transaction<'h> {
    pub(crate) fn new(handle: &'h Handle) -> Self {
        Transaction {
            handle,
            state: TransactionState::Building,
            ops: Vec::new(),
            read_results: Vec::new(),
            id: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Transaction identifier, assigned at commit entry. `None` before
    /// `commit()` has run.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Record a write of `data` at `offset`. O(1); no I/O happens until
    /// `commit()`.
    pub fn add_w(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.require_building()?;
        self.ops.push(Op::Write {
            offset,
            data: data.to_vec(),
        });
        self.read_results.push(None);
        Ok(())
    }

    /// Record a read of `length` bytes at `offset`. Returns a ticket to
    /// retrieve the bytes with [`Transaction::read_result`] after
    /// `commit()` succeeds. Observes the data file's state prior to any of
    /// this transaction's own writes, regardless of where this call falls
    /// among `add_w` calls.
    pub fn add_r(&mut self, offset: u64, length: usize) -> Result<usize> {
        self.require_building()?;
        let ticket = self.ops.len();
        self.ops.push(Op::Read { offset, length });
        self.read_results.push(None);
        Ok(ticket)
    }

    /// Fetch the bytes read at `ticket` (the index returned by
    /// [`Transaction::add_r`]). Only valid after `commit()` has returned
    /// `Ok`.
    pub fn read_result(&self, ticket: usize) -> Result<&[u8]> {
        match self.read_results.get(ticket).and_then(|r| r.as_deref()) {
            Some(bytes) => Ok(bytes),
            None => Err(Error::InvalidArgument(format!(
                "no read result available for ticket {ticket}"
            ))),
        }
    }

    fn require_building(&self) -> Result<()> {
        if self.state != TransactionState::Building {
            return Err(Error::InvalidArgument(
                "transaction is no longer in BUILDING state".to_string(),
            ));
        }
        Ok(())
    }

    /// The full set of byte intervals this transaction touches, covering
    /// both reads and writes — spec.md §4.3 requires the full touched set
    /// be locked, not just the write set, so that a read inside one
    /// transaction cannot race a concurrent writer.
    fn touched_ranges(&self) -> Vec<(u64, u64)> {
        self.ops
            .iter()
            .map(|op| match op {
                Op::Write { offset, data } => (*offset, data.len() as u64),
                Op::Read { offset, length } => (*offset, *length as u64),
            })
            .collect()
    }

    /// Run the commit algorithm (§4.5): acquire locks over every touched
    /// interval, resolve reads, allocate an identifier, write and fsync the
    /// journal record (the durability point), apply writes to the data
    /// file, fsync and remove the record (unless linger), release locks.
    pub fn commit(&mut self) -> Result<()> {
        if self.state != TransactionState::Building {
            return Err(Error::InvalidArgument(
                "commit() called outside BUILDING state".to_string(),
            ));
        }

        let ranges = self.touched_ranges();
        let guard = if ranges.is_empty() {
            None
        } else {
            Some(self.handle.lock_manager().lock_many(&ranges)?)
        };

        self.state = TransactionState::Staged;

        // Step 1: resolve reads under lock, observing pre-write state.
        let data_fd = self.handle.data_fd();
        for (idx, op) in self.ops.iter().enumerate() {
            if let Op::Read { offset, length } = op {
                let mut buf = vec![0u8; *length];
                match platform::pread_full(data_fd, &mut buf, *offset) {
                    Ok(n) => {
                        buf.truncate(n);
                        self.read_results[idx] = Some(buf);
                    }
                    Err(e) => {
                        // Abort: no journal record written, no durable trace.
                        self.state = TransactionState::Aborted;
                        drop(guard);
                        return Err(Error::Io(e));
                    }
                }
            }
        }

        self.state = TransactionState::Committing;

        // Step 2: allocate a monotonic, unique identifier.
        let id = self.handle.allocate_txn_id();
        self.id = Some(id);
        self.handle.register_live(id);

        // Step 3: create, serialize, fsync the journal record. This is the
        // durability point: once the directory fsync below returns, a
        // crash will be rolled forward by recovery rather than lost.
        let writes: Vec<PendingWrite<'_>> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Write { offset, data } => Some(PendingWrite {
                    offset: *offset,
                    data,
                }),
                Op::Read { .. } => None,
            })
            .collect();

        let journal_dir = self.handle.journal_dir().to_path_buf();
        let record_path = journal_dir.join(journal::id_to_filename(id));
        let mut file = match journal::allocate(&journal_dir, id) {
            Ok(f) => f,
            Err(e) => {
                self.handle.unregister_live(id);
                self.state = TransactionState::Aborted;
                drop(guard);
                return Err(e.into());
            }
        };
        if let Err(e) = journal::write_record(&mut file, &journal_dir, id, &writes) {
            self.handle.unregister_live(id);
            self.state = TransactionState::Aborted;
            drop(guard);
            return Err(e.into());
        }
        // Persist the next-identifier counter now that this id is durably
        // on disk, so it survives even if this record is later removed.
        journal::persist_next_id(&journal_dir, id + 1)?;

        // From here on there is no abort: the engine rolls forward.

        // Step 4: apply writes to the data file, in the order added.
        for w in &writes {
            platform::pwrite_full(data_fd, w.data, w.offset)?;
        }

        self.state = TransactionState::Applied;

        if self.handle.linger_enabled() {
            let total_bytes: u64 = writes.iter().map(|w| w.data.len() as u64).sum();
            self.handle.enqueue_autosync(record_path, total_bytes);
        } else {
            // Step 5: fsync the data file, then remove the now-redundant
            // journal record.
            self.handle.fsync_data_file()?;
            journal::remove(&record_path, &journal_dir)?;
        }

        // Step 6: release locks, drop registry entry.
        drop(guard);
        self.handle.unregister_live(id);
        self.state = TransactionState::Released;

        Ok(())
    }
}

impl<'h> std::fmt::Debug for Transaction<'h> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("ops", &self.ops.len())
            .finish()
    }
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Write { offset, data } => f
                .debug_struct("Write")
                .field("offset", offset)
                .field("len", &data.len())
                .finish(),
            Op::Read { offset, length } => f
                .debug_struct("Read")
                .field("offset", offset)
                .field("length", length)
                .finish(),
        }
    }
}

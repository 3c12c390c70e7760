//! libjournal - crash-consistent, atomic, multi-block journaled writes to
//! regular POSIX files
//!
//! A caller writes to a file through a [`Handle`]; the library guarantees
//! that each write-transaction either appears fully applied on the data
//! file after a crash or leaves it unchanged — never a torn mixture — and
//! that recovery replays committed-but-unapplied transactions in commit
//! order.
//!
//! Not a filesystem, not a block layer, not a distributed log: single-file
//! transactions only, no MVCC or snapshot reads, no compression or
//! data-file checksumming.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod autosync;
pub mod checksum;
pub mod error;
pub mod handle;
pub mod journal;
pub mod lock;
pub mod platform;
pub mod recovery;
pub mod transaction;

pub use autosync::AutosyncConfig;
pub use error::{Error, ErrorKind, Result};
pub use handle::{Handle, HandleFlags, HandleStats, OpenFlags};
pub use journal::{JournalRecord, OpDescriptor};
pub use lock::LockManager;
pub use recovery::{fsck, FsckFlags, FsckOutcome, RecoveryReport};
pub use transaction::{Transaction, TransactionState};

/// Re-export of the common types needed to open a handle, run
/// transactions, and call `fsck` — the journaling-library equivalent of
/// the block-device prelude this crate grew out of.
pub mod prelude {
    pub use crate::autosync::AutosyncConfig;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::handle::{Handle, HandleFlags, HandleStats, OpenFlags};
    pub use crate::recovery::{fsck, FsckFlags, FsckOutcome, RecoveryReport};
    pub use crate::transaction::{Transaction, TransactionState};
}

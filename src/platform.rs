//! POSIX file primitives (§4.1)
//!
//! Positional read/write loops that retry short I/O, directory fsync,
//! atomic rename, and byte-range advisory locks. Every blocking syscall
//! here restarts on `EINTR` itself; nothing upstream needs to know it
//! happened.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

/// Read exactly `buf.len()` bytes from `fd` at `offset`, retrying short
/// reads caused by signals or partial transfers.
///
/// Stops early and returns the partial count on EOF, matching spec.md
/// §4.1's "short reads terminate the loop and return the partial count".
pub fn pread_full(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        let n = retry_eintr(|| unsafe {
            libc::pread(
                fd,
                buf[total..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - total,
                (offset + total as u64) as libc::off_t,
            )
        })?;
        if n == 0 {
            break;
        }
        total += n as usize;
    }
    Ok(total)
}

/// Write exactly `buf.len()` bytes to `fd` at `offset`, retrying until the
/// full count is transferred or a non-recoverable error occurs.
///
/// Short writes are always retried (spec.md §4.1); there is no partial
/// success returned to the caller short of an error.
pub fn pwrite_full(fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        let n = retry_eintr(|| unsafe {
            libc::pwrite(
                fd,
                buf[total..].as_ptr() as *const libc::c_void,
                buf.len() - total,
                (offset + total as u64) as libc::off_t,
            )
        })?;
        if n == 0 {
            // Non-recoverable: device stopped accepting writes without an error.
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "pwrite returned 0 before full count was transferred",
            ));
        }
        total += n as usize;
    }
    Ok(total)
}

/// `fsync` a file, retrying on `EINTR`.
pub fn fsync_file(file: &File) -> io::Result<()> {
    retry_eintr(|| unsafe { libc::fsync(file.as_raw_fd()) }).map(|_| ())
}

/// `fsync` a directory so that directory-entry changes (create, rename,
/// unlink) made within it are durable. There is no portable `std` API for
/// this; it requires opening the directory itself and fsyncing its
/// descriptor.
pub fn fsync_dir(path: &Path) -> io::Result<()> {
    let dir = File::open(path)?;
    fsync_file(&dir)
}

/// Atomically rename `from` to `to`. POSIX `rename(2)` is already atomic
/// within the same filesystem; this wrapper exists so every platform
/// primitive in this module shares the same `EINTR`-retrying shape.
pub fn atomic_rename(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::rename(from, to)
}

/// Which kind of byte-range advisory lock to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Exclusive (write) lock.
    Exclusive,
    /// Shared (read) lock. Unused by this crate today but kept for
    /// symmetry with `fcntl`'s `F_RDLCK`/`F_WRLCK`.
    Shared,
}

/// Sentinel passed as `len` to [`lock_range`]/[`unlock_range`] meaning
/// "to the end of the file", encoded on the wire as `fcntl`'s own
/// end-of-file sentinel (`l_len == 0`) rather than a real byte count. A
/// real lock is never this many bytes long, so the sentinel is
/// unambiguous.
pub const LEN_TO_EOF: u64 = u64::MAX;

/// Acquire a blocking byte-range advisory lock on `fd` covering
/// `[start, start+len)`, via `fcntl(F_SETLKW)`. Pass [`LEN_TO_EOF`] for an
/// open-ended `[start, EOF)` range. Blocks until granted. Restarts
/// internally on `EINTR`.
pub fn lock_range(fd: RawFd, start: u64, len: u64, kind: LockKind) -> io::Result<()> {
    let mut flock: libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = match kind {
        LockKind::Exclusive => libc::F_WRLCK as libc::c_short,
        LockKind::Shared => libc::F_RDLCK as libc::c_short,
    };
    flock.l_whence = libc::SEEK_SET as libc::c_short;
    flock.l_start = start as libc::off_t;
    flock.l_len = if len == LEN_TO_EOF { 0 } else { len as libc::off_t };

    retry_eintr(|| unsafe { libc::fcntl(fd, libc::F_SETLKW, &mut flock as *mut libc::flock) })
        .map(|_| ())
}

/// Release a previously acquired byte-range lock on `fd` covering
/// `[start, start+len)`. Pass [`LEN_TO_EOF`] for an open-ended range.
pub fn unlock_range(fd: RawFd, start: u64, len: u64) -> io::Result<()> {
    let mut flock: libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = libc::F_UNLCK as libc::c_short;
    flock.l_whence = libc::SEEK_SET as libc::c_short;
    flock.l_start = start as libc::off_t;
    flock.l_len = if len == LEN_TO_EOF { 0 } else { len as libc::off_t };

    retry_eintr(|| unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock as *mut libc::flock) })
        .map(|_| ())
}

/// Run `f`, retrying as long as it fails with `EINTR`. `f` must return a
/// raw syscall-style result: negative on error (with `errno` set), else the
/// non-negative return value.
fn retry_eintr<F>(mut f: F) -> io::Result<i64>
where
    F: FnMut() -> isize,
{
    loop {
        let ret = f();
        if ret >= 0 {
            return Ok(ret as i64);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;
    use tempfile::tempdir;

    #[test]
    fn pwrite_then_pread_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(4096).unwrap();
        let fd = file.as_raw_fd();

        pwrite_full(fd, b"hello world", 100).unwrap();
        let mut buf = [0u8; 11];
        let n = pread_full(fd, &mut buf, 100).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn pread_stops_at_eof_with_partial_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.set_len(10).unwrap();
        let fd = file.as_raw_fd();

        let mut buf = [0u8; 20];
        let n = pread_full(fd, &mut buf, 5).unwrap();
        assert_eq!(n, 5);
    }

    #[test]
    fn lock_then_unlock_range_does_not_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        let fd = file.as_raw_fd();

        lock_range(fd, 0, 100, LockKind::Exclusive).unwrap();
        unlock_range(fd, 0, 100).unwrap();
    }

    #[test]
    fn open_ended_lock_to_eof_does_not_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        let fd = file.as_raw_fd();

        lock_range(fd, 4096, LEN_TO_EOF, LockKind::Exclusive).unwrap();
        unlock_range(fd, 4096, LEN_TO_EOF).unwrap();
    }

    #[test]
    fn fsync_dir_succeeds_on_real_directory() {
        let dir = tempdir().unwrap();
        fsync_dir(dir.path()).unwrap();
    }
}

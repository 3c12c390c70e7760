//! S6: a transaction that both reads and writes the same region observes
//! the bytes as they stood before its own write, while the data file
//! reflects the write once committed.

use libjournal::{Handle, HandleFlags, OpenFlags};
use tempfile::tempdir;

#[test]
fn read_in_same_transaction_sees_pre_write_state() {
    let dir = tempdir().unwrap();
    let data_path = dir.path().join("data.bin");
    let handle = Handle::open(&data_path, OpenFlags::create_rw(), HandleFlags::empty()).unwrap();
    handle.truncate(4096).unwrap();
    handle.pwrite(b"original", 0).unwrap();

    let mut trans = handle.new_trans();
    let ticket = trans.add_r(0, 8).unwrap();
    trans.add_w(0, b"replaced").unwrap();
    trans.commit().unwrap();

    assert_eq!(trans.read_result(ticket).unwrap(), b"original");

    let mut buf = [0u8; 8];
    handle.pread(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"replaced");
}

#[test]
fn multiple_reads_and_writes_at_disjoint_offsets_all_resolve() {
    let dir = tempdir().unwrap();
    let data_path = dir.path().join("data.bin");
    let handle = Handle::open(&data_path, OpenFlags::create_rw(), HandleFlags::empty()).unwrap();
    handle.truncate(4096).unwrap();
    handle.pwrite(b"AAAA", 0).unwrap();
    handle.pwrite(b"BBBB", 100).unwrap();

    let mut trans = handle.new_trans();
    let r1 = trans.add_r(0, 4).unwrap();
    let r2 = trans.add_r(100, 4).unwrap();
    trans.add_w(200, b"CCCC").unwrap();
    trans.commit().unwrap();

    assert_eq!(trans.read_result(r1).unwrap(), b"AAAA");
    assert_eq!(trans.read_result(r2).unwrap(), b"BBBB");

    let mut buf = [0u8; 4];
    handle.pread(&mut buf, 200).unwrap();
    assert_eq!(&buf, b"CCCC");
}

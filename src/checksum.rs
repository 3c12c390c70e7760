//! Rolling 32-bit checksum over journal records (§4.2)
//!
//! The on-disk format depends on this being stable across releases, so it
//! is pinned to CRC-32 (IEEE) via `crc32fast` rather than anything that
//! might change its internals between versions. `crc32fast::Hasher` already
//! carries incremental state, which is exactly the property spec.md
//! requires: `checksum(a || b)` must be computable from `checksum(a)` and
//! `b` alone, without re-reading `a`.

/// An incremental checksum accumulator. Feed it bytes in order with
/// [`Checksum::update`]; call [`Checksum::finalize`] once at the end.
#[derive(Default)]
pub struct Checksum {
    hasher: crc32fast::Hasher,
}

impl Checksum {
    /// Start a fresh checksum with no bytes folded in yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `bytes` into the running checksum.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Produce the checksum over every byte fed so far.
    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

/// One-shot convenience wrapper for when the whole buffer is in hand.
pub fn checksum_bytes(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

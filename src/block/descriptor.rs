//! In-band block descriptor with hash-derived guard words
//!
//! Every managed block begins with a fixed 64-byte descriptor, followed by
//! the payload the client sees. Block addresses are self-describing:
//! neighbors are reached through the stored `left`/`right` addresses, so
//! the heap needs no external structure beyond the free pool.
//!
//! The two guard tags are hashes over the other fields, recomputed on
//! every descriptor store. A load that fails the guard check means some
//! write ran past its payload and into a header; there is no safe way to
//! continue from that.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// Size in bytes of the in-band header preceding every payload.
///
/// The pointer returned by `alloc` sits exactly this many bytes after the
/// block address, so `payload -> header` conversion is a single
/// subtraction. Pinned at 64 so payloads stay 64-byte aligned whenever
/// block addresses are.
pub const HEADER_SIZE: usize = std::mem::size_of::<BlockDesc>();

const GUARD_SEED_BEGIN: u64 = 1;
const GUARD_SEED_END: u64 = 2;

/// Block states over a block's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ChunkKind {
    /// In the free pool, available for allocation
    Free = 0,
    /// Handed out to a client
    Arena = 1,
    /// Oversize allocation that bypassed the pool entirely
    Huge = 2,
    /// Consumed by a merge; terminal
    Invalid = 3,
}

impl ChunkKind {
    /// Decode a raw kind tag read from managed memory.
    ///
    /// Returns `None` for values no live descriptor can carry, which is
    /// the first corruption tripwire on the host load path.
    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(ChunkKind::Free),
            1 => Some(ChunkKind::Arena),
            2 => Some(ChunkKind::Huge),
            3 => Some(ChunkKind::Invalid),
            _ => None,
        }
    }
}

/// In-band block header.
///
/// `#[repr(C, align(64))]` pins the layout to eight word-sized fields,
/// 64 bytes total on 64-bit targets. Host-backed pools store this
/// directly at the block address; device-backed pools keep it in a side
/// map and never touch the managed memory itself.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDesc {
    pub(crate) kind: ChunkKind,
    pub(crate) index: u64,
    pub(crate) size: u64,
    pub(crate) total_size: u64,
    pub(crate) left: usize,
    pub(crate) right: usize,
    guard_begin: u64,
    guard_end: u64,
}

impl BlockDesc {
    /// Stamp a fresh descriptor with valid guards.
    ///
    /// `total_size` covers header plus payload; the client-visible `size`
    /// is derived from it. `left`/`right` are neighbor addresses within
    /// the same backing chunk, 0 at a chunk boundary.
    pub(crate) fn new(
        kind: ChunkKind,
        index: u64,
        total_size: usize,
        left: usize,
        right: usize,
    ) -> Self {
        debug_assert!(total_size >= HEADER_SIZE);
        let mut desc = BlockDesc {
            kind,
            index,
            size: (total_size - HEADER_SIZE) as u64,
            total_size: total_size as u64,
            left,
            right,
            guard_begin: 0,
            guard_end: 0,
        };
        desc.update_guards();
        desc
    }

    /// Block state
    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    /// Identifier of the backing system chunk this block was carved from.
    /// Blocks with different indices are never buddies.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Payload bytes visible to the client
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Header plus payload bytes
    pub fn total_size(&self) -> usize {
        self.total_size as usize
    }

    /// Address of the adjacent block on the left, if any
    pub fn left_addr(&self) -> Option<usize> {
        (self.left != 0).then_some(self.left)
    }

    /// Address of the adjacent block on the right, if any
    pub fn right_addr(&self) -> Option<usize> {
        (self.right != 0).then_some(self.right)
    }

    fn guard_hash(&self, seed: u64) -> u64 {
        // DefaultHasher is keyed with fixed constants, so tags computed at
        // store time validate at load time within the same process.
        let mut hasher = DefaultHasher::new();
        hasher.write_u64(seed);
        hasher.write_u64(self.kind as u64);
        hasher.write_u64(self.index);
        hasher.write_u64(self.size);
        hasher.write_u64(self.total_size);
        hasher.write_usize(self.left);
        hasher.write_usize(self.right);
        hasher.finish()
    }

    /// Recompute both guard tags from the current field values.
    /// Must run after every field mutation and before any store.
    pub(crate) fn update_guards(&mut self) {
        self.guard_begin = self.guard_hash(GUARD_SEED_BEGIN);
        self.guard_end = self.guard_hash(GUARD_SEED_END);
    }

    /// Whether both guard tags match the current field values
    pub fn guards_valid(&self) -> bool {
        self.guard_begin == self.guard_hash(GUARD_SEED_BEGIN)
            && self.guard_end == self.guard_hash(GUARD_SEED_END)
    }
}

//! Block operations: neighbor navigation, split, and merge
//!
//! A `MemoryBlock` is a plain address, not a borrow. All descriptor
//! access goes through the [`MetadataCache`], which is what lets the same
//! split/merge code run against device memory the host can never
//! dereference.
//!
//! `left`/`right` are relation addresses, not owners: ownership runs from
//! the allocator to each backing chunk, and the neighbor links only
//! reconstruct adjacency inside one chunk.

use std::ptr::NonNull;

use crate::block::cache::MetadataCache;
use crate::block::descriptor::{BlockDesc, ChunkKind, HEADER_SIZE};

/// Address of a managed block's header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryBlock(usize);

impl MemoryBlock {
    /// Wrap a raw header address
    pub fn from_addr(addr: usize) -> Self {
        debug_assert!(addr != 0, "block address must not be null");
        MemoryBlock(addr)
    }

    /// Recover the block from a payload pointer handed out by `alloc`.
    /// The header sits exactly [`HEADER_SIZE`] bytes before the payload.
    pub fn from_payload(payload: NonNull<u8>) -> Self {
        MemoryBlock(payload.as_ptr() as usize - HEADER_SIZE)
    }

    /// Header address
    pub fn addr(&self) -> usize {
        self.0
    }

    /// Header address as a pointer, for handing back to the system allocator
    pub fn as_ptr(&self) -> NonNull<u8> {
        // SAFETY: block addresses are never zero.
        unsafe { NonNull::new_unchecked(self.0 as *mut u8) }
    }

    /// Client-visible payload address, one header past the block address
    pub fn payload(&self) -> NonNull<u8> {
        // SAFETY: the header address is nonzero and payloads follow it.
        unsafe { NonNull::new_unchecked((self.0 + HEADER_SIZE) as *mut u8) }
    }

    /// Stamp a fresh header and register it with the cache.
    ///
    /// `total_size` covers header plus payload; `left`/`right` are the
    /// neighbor addresses, 0 at a chunk boundary.
    pub fn init(
        &self,
        cache: &mut MetadataCache,
        kind: ChunkKind,
        index: u64,
        total_size: usize,
        left: usize,
        right: usize,
    ) {
        cache.save(*self, BlockDesc::new(kind, index, total_size, left, right));
    }

    /// Flip this block to `Free`, refreshing the guards
    pub fn mark_as_free(&self, cache: &mut MetadataCache) {
        let mut desc = cache.load(*self);
        desc.kind = ChunkKind::Free;
        cache.save(*self, desc);
    }

    /// The adjacent block on the left, if one exists in the same backing chunk
    pub fn left_buddy(&self, cache: &MetadataCache) -> Option<MemoryBlock> {
        let desc = cache.load(*self);
        let left = MemoryBlock(desc.left_addr()?);
        (cache.load(left).index() == desc.index()).then_some(left)
    }

    /// The adjacent block on the right, if one exists in the same backing chunk
    pub fn right_buddy(&self, cache: &MetadataCache) -> Option<MemoryBlock> {
        let desc = cache.load(*self);
        let right = MemoryBlock(desc.right_addr()?);
        (cache.load(right).index() == desc.index()).then_some(right)
    }

    /// Shrink this block to `total_size` bytes and stamp the remainder as a
    /// fresh free neighbor, rewiring links on both sides.
    ///
    /// No-op when the residual could not hold a header plus a usable
    /// payload: anything under `min_residual` (the pool's chunk
    /// granularity) or not strictly larger than one header stays fused to
    /// this block, and the caller allocates the whole thing.
    pub fn split(&self, cache: &mut MetadataCache, total_size: usize, min_residual: usize) {
        let mut desc = cache.load(*self);
        assert!(
            desc.total_size() >= total_size,
            "split of {} bytes out of a {}-byte block",
            total_size,
            desc.total_size()
        );

        let remaining = desc.total_size() - total_size;
        if remaining < min_residual || remaining <= HEADER_SIZE {
            return;
        }

        let right_partition = MemoryBlock(self.0 + total_size);
        let original_right = desc.right;

        right_partition.init(
            cache,
            ChunkKind::Free,
            desc.index(),
            remaining,
            self.0,
            original_right,
        );

        desc.right = right_partition.0;
        desc.total_size = total_size as u64;
        desc.size = (total_size - HEADER_SIZE) as u64;
        cache.save(*self, desc);

        if original_right != 0 {
            let neighbor = MemoryBlock(original_right);
            let mut neighbor_desc = cache.load(neighbor);
            neighbor_desc.left = right_partition.0;
            cache.save(neighbor, neighbor_desc);
        }
    }

    /// Absorb `right_buddy`, which must be this block's immediate right
    /// neighbor in the same chunk. The absorbed header is marked Invalid
    /// and its cache entry dropped.
    pub fn merge(&self, cache: &mut MetadataCache, right_buddy: MemoryBlock) {
        let mut desc = cache.load(*self);
        let rb_desc = cache.load(right_buddy);

        assert_eq!(
            desc.right,
            right_buddy.0,
            "merge target {:#x} is not the right neighbor of {:#x}",
            right_buddy.0,
            self.0
        );
        assert_eq!(
            desc.index(),
            rb_desc.index(),
            "merge across backing chunks {} and {}",
            desc.index(),
            rb_desc.index()
        );
        debug_assert_eq!(desc.kind(), ChunkKind::Free);
        debug_assert_eq!(rb_desc.kind(), ChunkKind::Free);

        desc.right = rb_desc.right;
        if let Some(far_addr) = rb_desc.right_addr() {
            let far = MemoryBlock(far_addr);
            let mut far_desc = cache.load(far);
            far_desc.left = self.0;
            cache.save(far, far_desc);
        }

        desc.total_size += rb_desc.total_size;
        desc.size = desc.total_size - HEADER_SIZE as u64;
        cache.save(*self, desc);

        let mut dead = rb_desc;
        dead.kind = ChunkKind::Invalid;
        cache.save(right_buddy, dead);
        cache.invalidate(right_buddy);
    }
}

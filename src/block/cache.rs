//! Descriptor cache: in-place for host memory, side map for device memory
//!
//! The same buddy algorithm serves both host RAM and device memory. The
//! difference is confined here: host-backed blocks keep their descriptor
//! in band at the block address, while device-backed blocks keep it in a
//! host-side map, because host code must never dereference a device
//! pointer.

use std::collections::HashMap;

use crate::block::descriptor::{BlockDesc, ChunkKind};
use crate::block::MemoryBlock;

/// Lookup from block address to its current descriptor
#[derive(Debug)]
pub struct MetadataCache {
    device: bool,
    cache: HashMap<usize, BlockDesc>,
}

impl MetadataCache {
    /// With `device = true` descriptors live only in the side map and the
    /// managed memory is never read or written through this cache.
    pub fn new(device: bool) -> Self {
        MetadataCache {
            device,
            cache: HashMap::new(),
        }
    }

    /// Load a block's descriptor, validating its guard tags.
    ///
    /// Panics on guard mismatch or on an address the cache has never seen:
    /// both mean the heap structure can no longer be trusted, and every
    /// later operation would compound the damage.
    pub fn load(&self, block: MemoryBlock) -> BlockDesc {
        let desc = if self.device {
            match self.cache.get(&block.addr()) {
                Some(desc) => *desc,
                None => {
                    tracing::error!("no descriptor cached for block {:#x}", block.addr());
                    panic!(
                        "unknown block {:#x}: pointer was not allocated here or was already released",
                        block.addr()
                    );
                }
            }
        } else {
            // The kind tag sits at offset 0; decode it before reading the
            // full struct so a trashed header cannot produce an invalid
            // enum value.
            //
            // SAFETY: host-backed block addresses point at headers this
            // allocator wrote inside chunks it still owns, and are 64-byte
            // aligned by construction.
            let raw_kind = unsafe { (block.addr() as *const u64).read() };
            if ChunkKind::from_raw(raw_kind).is_none() {
                tracing::error!(
                    "block {:#x} carries unknown kind tag {:#x}",
                    block.addr(),
                    raw_kind
                );
                panic!(
                    "heap corruption: unknown kind tag {:#x} at block {:#x}",
                    raw_kind,
                    block.addr()
                );
            }
            // SAFETY: same provenance as above; the kind tag was just
            // validated so every field holds a representable value.
            unsafe { (block.addr() as *const BlockDesc).read() }
        };

        if !desc.guards_valid() {
            tracing::error!("guard mismatch on block {:#x}: {:?}", block.addr(), desc);
            panic!("heap corruption: guard mismatch on block {:#x}", block.addr());
        }
        desc
    }

    /// Store a block's descriptor with freshly computed guard tags
    pub fn save(&mut self, block: MemoryBlock, mut desc: BlockDesc) {
        desc.update_guards();
        if self.device {
            self.cache.insert(block.addr(), desc);
        } else {
            // SAFETY: the block address points into a chunk owned by this
            // allocator with room for a header, aligned for BlockDesc.
            unsafe { (block.addr() as *mut BlockDesc).write(desc) };
        }
    }

    /// Drop a block's side-map entry.
    ///
    /// In-place (host) descriptors have nothing to drop; the Invalid kind
    /// written by `merge` is what marks them dead.
    pub fn invalidate(&mut self, block: MemoryBlock) {
        if self.device {
            self.cache.remove(&block.addr());
        }
    }

    /// Whether an address currently has a side-map entry. Always false in
    /// host mode, where descriptors live in band.
    pub fn contains(&self, block: MemoryBlock) -> bool {
        self.device && self.cache.contains_key(&block.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::descriptor::HEADER_SIZE;
    use std::alloc::{alloc, dealloc, Layout};

    fn host_buffer(size: usize) -> (*mut u8, Layout) {
        let layout = Layout::from_size_align(size, 64).unwrap();
        let ptr = unsafe { alloc(layout) };
        assert!(!ptr.is_null());
        (ptr, layout)
    }

    #[test]
    fn test_host_mode_round_trips_in_place() {
        let (ptr, layout) = host_buffer(4096);
        let block = MemoryBlock::from_addr(ptr as usize);
        let mut cache = MetadataCache::new(false);

        let desc = BlockDesc::new(ChunkKind::Free, 0, 4096, 0, 0);
        cache.save(block, desc);

        let loaded = cache.load(block);
        assert_eq!(loaded.kind(), ChunkKind::Free);
        assert_eq!(loaded.total_size(), 4096);
        assert_eq!(loaded.size(), 4096 - HEADER_SIZE);
        assert!(loaded.guards_valid());

        unsafe { dealloc(ptr, layout) };
    }

    #[test]
    fn test_device_mode_never_touches_memory() {
        // A made-up address: device mode must not dereference it.
        let block = MemoryBlock::from_addr(0xdead_0000);
        let mut cache = MetadataCache::new(true);

        cache.save(block, BlockDesc::new(ChunkKind::Huge, 7, 1 << 20, 0, 0));
        let loaded = cache.load(block);
        assert_eq!(loaded.kind(), ChunkKind::Huge);
        assert_eq!(loaded.index(), 7);
        assert!(cache.contains(block));

        cache.invalidate(block);
        assert!(!cache.contains(block));
    }

    #[test]
    #[should_panic(expected = "unknown block")]
    fn test_device_mode_unknown_address_panics() {
        let cache = MetadataCache::new(true);
        cache.load(MemoryBlock::from_addr(0xbeef_0000));
    }

    #[test]
    #[should_panic(expected = "guard mismatch")]
    fn test_host_mode_detects_clobbered_header() {
        let (ptr, layout) = host_buffer(4096);
        let block = MemoryBlock::from_addr(ptr as usize);
        let mut cache = MetadataCache::new(false);
        cache.save(block, BlockDesc::new(ChunkKind::Arena, 0, 4096, 0, 0));

        // Simulate a buffer underrun trampling the size field.
        unsafe { (ptr as *mut u64).add(2).write(12345) };

        let result = std::panic::catch_unwind(|| cache.load(block));
        unsafe { dealloc(ptr, layout) };
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }
}

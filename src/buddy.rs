//! Buddy allocator over coarse system chunks
//!
//! Carves client allocations out of large chunks acquired from a
//! [`SystemAllocator`], splitting blocks on allocation and coalescing
//! neighbors on free. The system allocator is touched only on refill, on
//! the oversize bypass path, and at teardown; everything else costs
//! header bookkeeping and one mutex.
//!
//! Chunks are never returned before teardown. Requests above
//! `max_chunk_size` bypass the pool entirely and go straight to the
//! system allocator as huge blocks.

use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

use crate::block::{ChunkKind, MemoryBlock, MetadataCache, HEADER_SIZE};
use crate::error::{MemForgeError, MemForgeResult};
use crate::pool::{FreePool, PoolKey};
use crate::system::{DeviceSizing, SystemAllocator};

fn integrity(msg: String) -> MemForgeError {
    MemForgeError::IntegrityViolation(msg)
}

/// Round `size` up to a multiple of `alignment`; `None` on overflow,
/// which the caller reports as an ordinary allocation miss.
fn align_to(size: usize, alignment: usize) -> Option<usize> {
    let remaining = size % alignment;
    if remaining == 0 {
        Some(size)
    } else {
        size.checked_add(alignment - remaining)
    }
}

/// One backing chunk as handed out by the system allocator
#[derive(Debug, Clone, Copy)]
struct ChunkRecord {
    index: u64,
    base: usize,
    bytes: usize,
}

/// Everything the allocator mutates, guarded by one lock
struct PoolState {
    pool: FreePool,
    cache: MetadataCache,
    system: Box<dyn SystemAllocator>,
    /// Backing chunks in refill order, for teardown and the integrity walk
    chunks: Vec<ChunkRecord>,
    total_used: usize,
    total_free: usize,
    /// Sticky device refill size; 0 until first latched
    realloc_size: usize,
}

/// Buddy memory pool between a client and a coarse system allocator.
///
/// `alloc` and `free` serialize on an internal mutex, so one instance can
/// be shared across threads. Blocks handed out stay valid until passed
/// back to [`free`](Self::free); the backing chunks stay with the pool
/// until it is dropped.
///
/// # Example
///
/// ```
/// use memforge::{BuddyAllocator, HostAllocator};
///
/// let pool = BuddyAllocator::new(
///     Box::new(HostAllocator::new(4096)),
///     4096,    // min_chunk_size: alignment granularity and split floor
///     1 << 20, // max_chunk_size: oversize threshold and refill size
/// )?;
///
/// let p = pool.alloc(512).expect("allocation failed");
/// assert!(pool.used() >= 512);
/// unsafe { pool.free(p) };
/// assert_eq!(pool.used(), 0);
/// # Ok::<(), memforge::MemForgeError>(())
/// ```
pub struct BuddyAllocator {
    min_chunk_size: usize,
    max_chunk_size: usize,
    sizing: DeviceSizing,
    state: Mutex<PoolState>,
}

impl BuddyAllocator {
    /// Create a pool over `system`.
    ///
    /// `min_chunk_size` is the allocation alignment and split floor;
    /// `max_chunk_size` is the oversize threshold and the refill size for
    /// host backends.
    ///
    /// # Errors
    /// Rejects a `min_chunk_size` that is not a power of two, is smaller
    /// than the block header, or does not divide `max_chunk_size`.
    pub fn new(
        system: Box<dyn SystemAllocator>,
        min_chunk_size: usize,
        max_chunk_size: usize,
    ) -> MemForgeResult<Self> {
        Self::with_device_sizing(system, min_chunk_size, max_chunk_size, DeviceSizing::default())
    }

    /// Like [`new`](Self::new), with explicit device refill sizing.
    /// The sizing only applies when `system.use_gpu()` is true.
    pub fn with_device_sizing(
        system: Box<dyn SystemAllocator>,
        min_chunk_size: usize,
        max_chunk_size: usize,
        sizing: DeviceSizing,
    ) -> MemForgeResult<Self> {
        if !min_chunk_size.is_power_of_two() {
            return Err(MemForgeError::InvalidConfiguration(format!(
                "min_chunk_size must be a power of two, got {}",
                min_chunk_size
            )));
        }
        if min_chunk_size < HEADER_SIZE {
            return Err(MemForgeError::InvalidConfiguration(format!(
                "min_chunk_size {} is smaller than the block header ({} bytes)",
                min_chunk_size, HEADER_SIZE
            )));
        }
        if max_chunk_size < min_chunk_size || max_chunk_size % min_chunk_size != 0 {
            return Err(MemForgeError::InvalidConfiguration(format!(
                "max_chunk_size {} must be a multiple of min_chunk_size {}",
                max_chunk_size, min_chunk_size
            )));
        }

        let cache = MetadataCache::new(system.use_gpu());
        Ok(BuddyAllocator {
            min_chunk_size,
            max_chunk_size,
            sizing,
            state: Mutex::new(PoolState {
                pool: FreePool::new(),
                cache,
                system,
                chunks: Vec::new(),
                total_used: 0,
                total_free: 0,
                realloc_size: 0,
            }),
        })
    }

    /// Allocate at least `unaligned_size` bytes.
    ///
    /// Returns the payload pointer, or `None` when the system allocator
    /// cannot supply memory (no side effects in that case). `alloc(0)` is
    /// valid and returns a distinct minimum-granularity block.
    pub fn alloc(&self, unaligned_size: usize) -> Option<NonNull<u8>> {
        let size = unaligned_size
            .checked_add(HEADER_SIZE)
            .and_then(|s| align_to(s, self.min_chunk_size))?;

        let mut state = self.lock_state();
        tracing::trace!("allocate {} bytes from chunk size {}", unaligned_size, size);

        // Oversize requests bypass the pool: never split, never merged.
        if size > self.max_chunk_size {
            tracing::trace!("allocate from system allocator directly");
            return Self::system_alloc(&mut state, size);
        }

        let entry = match state.pool.find(size) {
            Some(entry) => {
                tracing::trace!("allocation from existing block at {:#x}", entry.2);
                entry
            }
            None => self.refill_pool(&mut state, size)?,
        };

        let block = self.split_to_alloc(&mut state, entry, size);

        // The block can be larger than `size` when a residual too small to
        // stand alone was swallowed; account what was actually consumed so
        // used + free always tiles the chunks.
        let consumed = state.cache.load(block).total_size();
        state.total_used += consumed;
        state.total_free -= consumed;

        Some(block.payload())
    }

    /// Return a payload pointer obtained from [`alloc`](Self::alloc).
    ///
    /// Freed blocks immediately coalesce with free neighbors on both
    /// sides; huge blocks go straight back to the system allocator.
    ///
    /// # Safety
    /// `ptr` must have been returned by `alloc` on this allocator and not
    /// freed since. The guard tags catch most violations, but a foreign
    /// pointer makes the header read itself undefined.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let mut block = MemoryBlock::from_payload(ptr);
        let mut state = self.lock_state();
        tracing::trace!("free block at {:#x}", block.addr());

        let desc = state.cache.load(block);
        if desc.kind() == ChunkKind::Huge {
            tracing::trace!("free huge block directly to system allocator");
            state
                .system
                .free(block.as_ptr(), desc.total_size(), desc.index());
            state.cache.invalidate(block);
            return;
        }

        assert_eq!(
            desc.kind(),
            ChunkKind::Arena,
            "free of block {:#x} in state {:?}: double free or foreign pointer",
            block.addr(),
            desc.kind()
        );

        block.mark_as_free(&mut state.cache);
        state.total_used -= desc.total_size();
        state.total_free += desc.total_size();

        // Right merge first, then left; a neighbor that is not Free is
        // skipped without aborting the other side's merge.
        if let Some(right) = block.right_buddy(&state.cache) {
            let rb_desc = state.cache.load(right);
            if rb_desc.kind() == ChunkKind::Free {
                tracing::trace!(
                    "merging block {:#x} with its right buddy {:#x}",
                    block.addr(),
                    right.addr()
                );
                state.pool.remove(rb_desc.index(), rb_desc.total_size(), right);
                block.merge(&mut state.cache, right);
            }
        }

        if let Some(left) = block.left_buddy(&state.cache) {
            let lb_desc = state.cache.load(left);
            if lb_desc.kind() == ChunkKind::Free {
                tracing::trace!(
                    "merging block {:#x} into its left buddy {:#x}",
                    block.addr(),
                    left.addr()
                );
                state.pool.remove(lb_desc.index(), lb_desc.total_size(), left);
                left.merge(&mut state.cache, block);
                block = left;
            }
        }

        let desc = state.cache.load(block);
        tracing::trace!(
            "inserting free block ({:#x}, {})",
            block.addr(),
            desc.total_size()
        );
        state.pool.insert(desc.index(), desc.total_size(), block);
    }

    /// Bytes currently handed out, as consumed block sizes (header
    /// included). Huge blocks are not counted.
    pub fn used(&self) -> usize {
        self.lock_state().total_used
    }

    /// Bytes sitting in the free pool across all backing chunks
    pub fn available_bytes(&self) -> usize {
        self.lock_state().total_free
    }

    /// Number of blocks in the free pool
    pub fn free_block_count(&self) -> usize {
        self.lock_state().pool.len()
    }

    /// Allocation alignment granularity and split floor
    pub fn min_chunk_size(&self) -> usize {
        self.min_chunk_size
    }

    /// Oversize threshold; also the host refill size
    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Walk every backing chunk and check the heap's structural
    /// invariants: exact tiling with symmetric neighbor links, no two
    /// adjacent free blocks, pool membership matching block state, and
    /// the usage counters adding up.
    ///
    /// Every descriptor on the walk passes through the guard check.
    /// Intended for tests and debugging; holds the allocator lock for the
    /// whole walk.
    pub fn verify_integrity(&self) -> MemForgeResult<()> {
        let state = self.lock_state();
        let mut free_bytes = 0usize;
        let mut used_bytes = 0usize;
        let mut free_blocks = 0usize;

        for chunk in &state.chunks {
            let mut covered = 0usize;
            let mut prev: Option<(usize, ChunkKind)> = None;
            let mut cursor = Some(MemoryBlock::from_addr(chunk.base));

            while let Some(block) = cursor {
                let desc = state.cache.load(block);

                if block.addr() != chunk.base + covered {
                    return Err(integrity(format!(
                        "chunk {}: block {:#x} does not tile, expected {:#x}",
                        chunk.index,
                        block.addr(),
                        chunk.base + covered
                    )));
                }
                if desc.index() != chunk.index {
                    return Err(integrity(format!(
                        "block {:#x} carries chunk index {} inside chunk {}",
                        block.addr(),
                        desc.index(),
                        chunk.index
                    )));
                }
                if !matches!(desc.kind(), ChunkKind::Free | ChunkKind::Arena) {
                    return Err(integrity(format!(
                        "block {:#x} in chunk {} has kind {:?}",
                        block.addr(),
                        chunk.index,
                        desc.kind()
                    )));
                }
                if desc.size() + HEADER_SIZE != desc.total_size() {
                    return Err(integrity(format!(
                        "block {:#x}: payload size {} inconsistent with total {}",
                        block.addr(),
                        desc.size(),
                        desc.total_size()
                    )));
                }

                let expected_left = prev.map(|(addr, _)| addr);
                if desc.left_addr() != expected_left {
                    return Err(integrity(format!(
                        "block {:#x}: left link {:?} does not match neighbor {:?}",
                        block.addr(),
                        desc.left_addr(),
                        expected_left
                    )));
                }
                if let Some((_, prev_kind)) = prev {
                    if prev_kind == ChunkKind::Free && desc.kind() == ChunkKind::Free {
                        return Err(integrity(format!(
                            "adjacent free blocks at {:#x} in chunk {}",
                            block.addr(),
                            chunk.index
                        )));
                    }
                }

                let in_pool = state.pool.contains(desc.index(), desc.total_size(), block);
                match desc.kind() {
                    ChunkKind::Free if !in_pool => {
                        return Err(integrity(format!(
                            "free block {:#x} missing from the pool",
                            block.addr()
                        )));
                    }
                    ChunkKind::Arena if in_pool => {
                        return Err(integrity(format!(
                            "in-use block {:#x} still listed in the pool",
                            block.addr()
                        )));
                    }
                    _ => {}
                }

                match desc.kind() {
                    ChunkKind::Free => {
                        free_bytes += desc.total_size();
                        free_blocks += 1;
                    }
                    ChunkKind::Arena => used_bytes += desc.total_size(),
                    _ => unreachable!(),
                }

                covered += desc.total_size();
                prev = Some((block.addr(), desc.kind()));
                cursor = desc.right_addr().map(MemoryBlock::from_addr);
            }

            if covered != chunk.bytes {
                return Err(integrity(format!(
                    "chunk {} covers {} of {} bytes",
                    chunk.index, covered, chunk.bytes
                )));
            }
        }

        if free_blocks != state.pool.len() {
            return Err(integrity(format!(
                "pool tracks {} blocks but chunks hold {} free blocks",
                state.pool.len(),
                free_blocks
            )));
        }
        if free_bytes != state.total_free || used_bytes != state.total_used {
            return Err(integrity(format!(
                "counters used={} free={} disagree with walk used={} free={}",
                state.total_used, state.total_free, used_bytes, free_bytes
            )));
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // A poisoned lock means a thread died while mutating the heap
        // structure; nothing behind it can be trusted anymore.
        self.state.lock().expect("allocator mutex poisoned")
    }

    /// Oversize bypass: one dedicated system chunk per request
    fn system_alloc(state: &mut PoolState, size: usize) -> Option<NonNull<u8>> {
        let mut index = 0u64;
        let ptr = state.system.alloc(&mut index, size)?;
        tracing::trace!("allocated huge block at {:p} from system allocator", ptr.as_ptr());

        let block = MemoryBlock::from_addr(ptr.as_ptr() as usize);
        block.init(&mut state.cache, ChunkKind::Huge, index, size, 0, 0);
        Some(block.payload())
    }

    /// Grow the pool by one backing chunk sized for `request_bytes`;
    /// returns the new chunk's pool entry, or `None` on a system miss.
    fn refill_pool(&self, state: &mut PoolState, request_bytes: usize) -> Option<PoolKey> {
        let mut allocate_bytes = self.max_chunk_size;

        if state.system.use_gpu() {
            if state.total_used + state.total_free == 0 {
                // Very first refill: start from the configured floor.
                allocate_bytes = self.sizing.initial_allocation_size.max(request_bytes);
            } else {
                // Sticky refill size: an explicit override latches once
                // and stays; without one the device hint is re-queried on
                // every refill.
                if state.realloc_size == 0 || self.sizing.reallocate_memory_mb == 0 {
                    state.realloc_size = if self.sizing.reallocate_memory_mb > 0 {
                        self.sizing.override_bytes()
                    } else {
                        state.system.realloc_hint()
                    };
                }
                allocate_bytes = state.realloc_size.max(request_bytes);
            }
        }

        let mut index = 0u64;
        let ptr = state.system.alloc(&mut index, allocate_bytes)?;
        let base = ptr.as_ptr() as usize;
        assert_eq!(
            base % self.min_chunk_size,
            0,
            "system allocator returned chunk misaligned for min_chunk_size {}",
            self.min_chunk_size
        );

        tracing::debug!(
            "refill: new chunk {} with {} bytes at {:#x}",
            index,
            allocate_bytes,
            base
        );

        let block = MemoryBlock::from_addr(base);
        block.init(&mut state.cache, ChunkKind::Free, index, allocate_bytes, 0, 0);
        state.total_free += allocate_bytes;
        state.chunks.push(ChunkRecord {
            index,
            base,
            bytes: allocate_bytes,
        });
        state.pool.insert(index, allocate_bytes, block);
        Some((index, allocate_bytes, base))
    }

    /// Take `entry` out of the pool, cut it down to `size`, and hand the
    /// front back as an in-use block; the remainder rejoins the pool.
    fn split_to_alloc(&self, state: &mut PoolState, entry: PoolKey, size: usize) -> MemoryBlock {
        let (index, total_size, addr) = entry;
        let block = MemoryBlock::from_addr(addr);
        let removed = state.pool.remove(index, total_size, block);
        debug_assert!(removed, "pool entry vanished during allocation");

        tracing::trace!("split block ({:#x}, {})", addr, total_size);
        block.split(&mut state.cache, size, self.min_chunk_size);

        let mut desc = state.cache.load(block);
        desc.kind = ChunkKind::Arena;
        state.cache.save(block, desc);

        if let Some(right) = block.right_buddy(&state.cache) {
            let rb_desc = state.cache.load(right);
            if rb_desc.kind() == ChunkKind::Free {
                tracing::trace!(
                    "inserting split remainder ({:#x}, {})",
                    right.addr(),
                    rb_desc.total_size()
                );
                state.pool.insert(rb_desc.index(), rb_desc.total_size(), right);
            }
        }
        block
    }
}

impl Drop for BuddyAllocator {
    /// Release every fully coalesced backing chunk back to the system
    /// allocator. Chunks that still contain live blocks cannot be handed
    /// back safely and are leaked with a warning; huge blocks are the
    /// client's to free before teardown.
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            // Poisoned while some thread was mid-mutation; leaking is the
            // only option that cannot make things worse.
            Err(_) => return,
        };

        if state.total_used != 0 {
            tracing::warn!(
                "tearing down pool with {} bytes still in use; their chunks leak",
                state.total_used
            );
        }

        while let Some((index, total_size, addr)) = state.pool.pop_first() {
            let block = MemoryBlock::from_addr(addr);
            let desc = state.cache.load(block);
            let is_root = state
                .chunks
                .iter()
                .any(|c| c.index == index && c.base == addr && c.bytes == desc.total_size());

            if is_root {
                tracing::debug!("teardown: releasing chunk {} ({} bytes)", index, total_size);
                state.system.free(block.as_ptr(), desc.total_size(), desc.index());
            } else {
                tracing::warn!(
                    "teardown: leaking fragment ({:#x}, {}) of chunk {} with live blocks",
                    addr,
                    total_size,
                    index
                );
            }
            state.cache.invalidate(block);
        }
    }
}

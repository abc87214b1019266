//! System allocator contract and device refill sizing
//!
//! The pool acquires coarse chunks through this narrow interface and owns
//! the implementation for its whole lifetime. Chunks never need to be
//! coalescable with one another; each one becomes an independent region
//! of the pool, identified by the index the allocator assigns it.

use std::ptr::NonNull;

pub mod host;

pub use host::HostAllocator;

/// Coarse-grained chunk source backing a buddy pool.
///
/// Implementations report failure by returning `None`. The pool treats a
/// miss as recoverable allocation pressure, never as a fault.
pub trait SystemAllocator: Send {
    /// Reserve `size` bytes.
    ///
    /// On success, writes a fresh identifier for the new chunk into
    /// `index`; the same identifier comes back on [`free`](Self::free).
    /// Returned addresses must satisfy the pool's chunk alignment.
    fn alloc(&mut self, index: &mut u64, size: usize) -> Option<NonNull<u8>>;

    /// Release a chunk previously returned by [`alloc`](Self::alloc),
    /// with the size and index it was handed out under.
    fn free(&mut self, ptr: NonNull<u8>, size: usize, index: u64);

    /// Whether chunks live in device memory.
    ///
    /// Device chunks must never be dereferenced from host code, so the
    /// pool keeps their descriptors in a side map instead of in band, and
    /// applies the device refill sizing policy.
    fn use_gpu(&self) -> bool;

    /// Suggested refill size in bytes for device backends.
    ///
    /// Consulted by the pool's sticky refill sizing; host backends can
    /// leave the default.
    fn realloc_hint(&self) -> usize {
        0
    }
}

/// Refill sizing knobs for device-backed pools.
///
/// Device allocation is expensive and device fragmentation is
/// catastrophic, so refills ask for predictable, usually
/// larger-than-request slabs. These knobs mirror what runtimes often keep
/// as process-wide flags, but they live on the allocator so call sites
/// never consult ambient globals.
#[derive(Debug, Clone, Default)]
pub struct DeviceSizing {
    /// Floor for the very first refill, when nothing has been allocated yet
    pub initial_allocation_size: usize,

    /// When nonzero, pins the sticky refill size to this many MiB after
    /// the first latch. When zero, the system allocator's
    /// [`realloc_hint`](SystemAllocator::realloc_hint) is re-queried on
    /// every refill instead.
    pub reallocate_memory_mb: u64,
}

impl DeviceSizing {
    pub(crate) fn override_bytes(&self) -> usize {
        (self.reallocate_memory_mb as usize) << 20
    }
}

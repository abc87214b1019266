//! Shared fixtures for pool tests
//!
//! Consolidates the instrumented system allocators the integration suites
//! use: a counting wrapper over the real host source, a mock device
//! source, and a source that always misses. Stats handles are shared
//! through `Arc` so tests keep visibility after boxing the allocator into
//! a pool.

#![allow(dead_code)] // each integration test binary uses a subset

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memforge::{HostAllocator, SystemAllocator};
use once_cell::sync::Lazy;

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
});

/// Install the test tracing subscriber once per process
pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// Every chunk handed out or taken back by a system allocator
#[derive(Debug, Default)]
pub struct SystemStats {
    /// (index, bytes) per successful chunk allocation, in order
    pub allocs: Vec<(u64, usize)>,
    /// (index, bytes) per chunk release, in order
    pub frees: Vec<(u64, usize)>,
}

impl SystemStats {
    pub fn refill_count(&self) -> usize {
        self.allocs.len()
    }

    pub fn outstanding(&self) -> usize {
        self.allocs.len() - self.frees.len()
    }
}

pub type SharedStats = Arc<Mutex<SystemStats>>;

/// Host chunk source that records every alloc/free and can be told to
/// start missing after a number of chunks.
pub struct CountingHostAllocator {
    inner: HostAllocator,
    stats: SharedStats,
    fail_after: Option<usize>,
}

impl CountingHostAllocator {
    pub fn new(alignment: usize) -> (Self, SharedStats) {
        Self::with_capacity_limit(alignment, None)
    }

    /// `fail_after = Some(n)` makes every allocation past the n-th miss
    pub fn with_capacity_limit(alignment: usize, fail_after: Option<usize>) -> (Self, SharedStats) {
        let stats: SharedStats = Arc::default();
        (
            CountingHostAllocator {
                inner: HostAllocator::new(alignment),
                stats: stats.clone(),
                fail_after,
            },
            stats,
        )
    }
}

impl SystemAllocator for CountingHostAllocator {
    fn alloc(&mut self, index: &mut u64, size: usize) -> Option<NonNull<u8>> {
        let mut stats = self.stats.lock().unwrap();
        if let Some(limit) = self.fail_after {
            if stats.allocs.len() >= limit {
                return None;
            }
        }
        let ptr = self.inner.alloc(index, size)?;
        stats.allocs.push((*index, size));
        Some(ptr)
    }

    fn free(&mut self, ptr: NonNull<u8>, size: usize, index: u64) {
        self.stats.lock().unwrap().frees.push((index, size));
        self.inner.free(ptr, size, index);
    }

    fn use_gpu(&self) -> bool {
        false
    }
}

/// Stand-in for a device chunk source.
///
/// Chunks are plain host memory, but the source reports `use_gpu()`, so
/// the pool must keep every descriptor in its side map. Tests never write
/// through returned payload pointers - on a real device that memory would
/// not be host-addressable.
pub struct MockDeviceAllocator {
    alignment: usize,
    next_index: u64,
    hint: Arc<AtomicUsize>,
    stats: SharedStats,
    live: Vec<(usize, Layout)>,
}

impl MockDeviceAllocator {
    pub fn new(alignment: usize, hint_bytes: usize) -> (Self, SharedStats, Arc<AtomicUsize>) {
        let stats: SharedStats = Arc::default();
        let hint = Arc::new(AtomicUsize::new(hint_bytes));
        (
            MockDeviceAllocator {
                alignment,
                next_index: 0,
                hint: hint.clone(),
                stats: stats.clone(),
                live: Vec::new(),
            },
            stats,
            hint,
        )
    }
}

impl SystemAllocator for MockDeviceAllocator {
    fn alloc(&mut self, index: &mut u64, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, self.alignment).ok()?;
        let ptr = NonNull::new(unsafe { alloc(layout) })?;

        *index = self.next_index;
        self.next_index += 1;
        self.live.push((ptr.as_ptr() as usize, layout));
        self.stats.lock().unwrap().allocs.push((*index, size));
        Some(ptr)
    }

    fn free(&mut self, ptr: NonNull<u8>, size: usize, index: u64) {
        self.stats.lock().unwrap().frees.push((index, size));
        let addr = ptr.as_ptr() as usize;
        if let Some(pos) = self.live.iter().position(|(a, _)| *a == addr) {
            let (_, layout) = self.live.swap_remove(pos);
            unsafe { dealloc(ptr.as_ptr(), layout) };
        } else {
            panic!("device mock asked to free unknown chunk {:#x}", addr);
        }
    }

    fn use_gpu(&self) -> bool {
        true
    }

    fn realloc_hint(&self) -> usize {
        self.hint.load(Ordering::Relaxed)
    }
}

impl Drop for MockDeviceAllocator {
    fn drop(&mut self) {
        // Chunks the pool never returned (leaked huge blocks in tests)
        // still belong to this mock.
        for (addr, layout) in self.live.drain(..) {
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }
}

/// Chunk source that always misses; for exercising the no-memory paths
pub struct FailingAllocator {
    device: bool,
}

impl FailingAllocator {
    pub fn new(device: bool) -> Self {
        FailingAllocator { device }
    }
}

impl SystemAllocator for FailingAllocator {
    fn alloc(&mut self, _index: &mut u64, _size: usize) -> Option<NonNull<u8>> {
        None
    }

    fn free(&mut self, _ptr: NonNull<u8>, _size: usize, _index: u64) {
        panic!("nothing was ever allocated");
    }

    fn use_gpu(&self) -> bool {
        self.device
    }
}

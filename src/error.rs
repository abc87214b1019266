//! Unified error handling for MemForge
//!
//! Only construction and diagnostics report through `Result` here. An
//! allocation miss is not an error value: `BuddyAllocator::alloc` returns
//! `None` and leaves no side effects, so callers can fall back or retry.
//! Heap corruption is the opposite extreme - once a guard tag fails, or a
//! thread dies holding the allocator lock, there is no state worth
//! returning to, and the allocator aborts instead.

use thiserror::Error;

/// Error type for pool construction and integrity diagnostics
#[derive(Error, Debug)]
pub enum MemForgeError {
    /// Rejected pool configuration (sizes, alignment)
    #[error("invalid pool configuration: {0}")]
    InvalidConfiguration(String),

    /// A structural invariant of the managed heap does not hold
    #[error("heap integrity violation: {0}")]
    IntegrityViolation(String),
}

/// Result type used throughout MemForge
pub type MemForgeResult<T> = Result<T, MemForgeError>;

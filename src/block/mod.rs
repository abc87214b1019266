//! Managed block layout and descriptor access
//!
//! A block is a header followed by the payload the client sees. The
//! header carries the block's state, its backing-chunk identity, both
//! sizes, the neighbor links, and two guard words. Whether the header is
//! read in place (host chunks) or through a side map (device chunks) is
//! decided once, at cache construction.

pub mod cache;
pub mod descriptor;
pub mod memory_block;

pub use cache::MetadataCache;
pub use descriptor::{BlockDesc, ChunkKind, HEADER_SIZE};
pub use memory_block::MemoryBlock;

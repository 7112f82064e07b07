//! Device memory management
//!
//! Memory blocks are large allocations per memory class, owned by the
//! [`MemoryAllocator`](allocator::MemoryAllocator). Resource views claim
//! aligned ranges inside a block and bind once the block is backed.

pub mod alignment;
pub mod allocator;
pub mod block;
pub mod resource_view;
pub mod upload;

//! Byte storage allocation for wire buffers.
//!
//! Every [`WireBuffer`](super::WireBuffer) obtains its storage through a [`ByteAllocator`]
//! capability instead of reaching for the heap directly. Buffers on one side of a connection
//! normally share the process-wide [`SharedAllocator`] returned by [`shared_allocator`]; tests
//! and embedders may inject their own.
//!
//! # Lifecycle
//!
//! The shared allocator is created on first use and torn down once the last buffer holding a
//! reference to it is dropped. A later call to [`shared_allocator`] creates a fresh one.
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::debug;

use super::WireError;

/// Capability used by wire buffers to obtain and release storage.
pub trait ByteAllocator: Send + Sync {
    /// Allocates a zeroed block of exactly `size` bytes.
    fn allocate(&self, size: usize) -> Result<Box<[u8]>, WireError>;

    /// Returns a block previously obtained from [`ByteAllocator::allocate`].
    fn free(&self, block: Box<[u8]>);
}

/// Allocator backed directly by the global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl ByteAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<Box<[u8]>, WireError> {
        heap_block(size)
    }

    fn free(&self, block: Box<[u8]>) {
        drop(block);
    }
}

fn heap_block(size: usize) -> Result<Box<[u8]>, WireError> {
    let mut block = Vec::new();
    block
        .try_reserve_exact(size)
        .map_err(|_| WireError::OutOfMemory { requested: size })?;
    block.resize(size, 0);
    Ok(block.into_boxed_slice())
}

/// Bookkeeping kept by a [`SharedAllocator`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Blocks currently handed out.
    pub live_blocks: usize,
    /// Bytes currently handed out.
    pub live_bytes: usize,
    /// Total number of successful allocations.
    pub allocations: usize,
}

/// Allocator shared by many buffers; allocation and release are serialized by one lock.
#[derive(Debug, Default)]
pub struct SharedAllocator {
    stats: Mutex<AllocatorStats>,
}

impl SharedAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> AllocatorStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ByteAllocator for SharedAllocator {
    fn allocate(&self, size: usize) -> Result<Box<[u8]>, WireError> {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let block = heap_block(size)?;
        stats.live_blocks += 1;
        stats.live_bytes += size;
        stats.allocations += 1;
        Ok(block)
    }

    fn free(&self, block: Box<[u8]>) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.live_blocks = stats.live_blocks.saturating_sub(1);
        stats.live_bytes = stats.live_bytes.saturating_sub(block.len());
        drop(block);
    }
}

impl Drop for SharedAllocator {
    fn drop(&mut self) {
        debug!("releasing shared wire allocator: {:?}", self.stats());
    }
}

static GLOBAL: Mutex<Weak<SharedAllocator>> = Mutex::new(Weak::new());

/// Returns the process-wide allocator, creating it if no live buffer references one.
pub fn shared_allocator() -> Arc<SharedAllocator> {
    let mut slot = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(allocator) = slot.upgrade() {
        return allocator;
    }

    debug!("initializing shared wire allocator");
    let allocator = Arc::new(SharedAllocator::new());
    *slot = Arc::downgrade(&allocator);
    allocator
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_blocks_are_zeroed() {
        let block = HeapAllocator.allocate(32).unwrap();
        assert_eq!(block.len(), 32);
        assert!(block.iter().all(|b| *b == 0));
    }

    #[test]
    fn absurd_request_is_out_of_memory() {
        let err = HeapAllocator.allocate(usize::MAX).unwrap_err();
        assert!(matches!(err, WireError::OutOfMemory { requested } if requested == usize::MAX));
    }

    #[test]
    fn shared_allocator_tracks_live_blocks() {
        let allocator = SharedAllocator::new();
        let a = allocator.allocate(16).unwrap();
        let b = allocator.allocate(64).unwrap();
        assert_eq!(
            allocator.stats(),
            AllocatorStats {
                live_blocks: 2,
                live_bytes: 80,
                allocations: 2
            }
        );

        allocator.free(a);
        allocator.free(b);
        let stats = allocator.stats();
        assert_eq!(stats.live_blocks, 0);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.allocations, 2);
    }

    #[test]
    fn global_allocator_is_shared_while_referenced() {
        let first = shared_allocator();
        let second = shared_allocator();
        assert!(Arc::ptr_eq(&first, &second));
    }
}

//! Growable, offset-addressed byte storage backing a [`Message`](super::Message).
//!
//! Callers never hold references into a [`WireBuffer`] across a write: every position is an
//! offset, and a live slice is re-derived from it at the point of use. Growth therefore only
//! has to copy the live prefix; offsets recorded before it keep resolving to the same bytes.
use std::sync::Arc;

use log::trace;

use super::{ByteAllocator, WireError, shared_allocator};

/// Smallest capacity a buffer is created with.
pub(crate) const MIN_CAPACITY: usize = 16;

pub struct WireBuffer {
    storage: Box<[u8]>,
    len: usize,
    growths: usize,
    allocator: Arc<dyn ByteAllocator>,
}

impl WireBuffer {
    /// Creates a buffer backed by the process-wide shared allocator.
    pub fn new(capacity: usize) -> Result<Self, WireError> {
        Self::with_allocator(capacity, shared_allocator())
    }

    /// Creates a buffer whose capacity is `capacity` rounded up to a power of two.
    pub fn with_allocator(
        capacity: usize,
        allocator: Arc<dyn ByteAllocator>,
    ) -> Result<Self, WireError> {
        let capacity = capacity
            .max(MIN_CAPACITY)
            .checked_next_power_of_two()
            .ok_or(WireError::OutOfMemory {
                requested: capacity,
            })?;
        let storage = allocator.allocate(capacity)?;

        Ok(Self {
            storage,
            len: 0,
            growths: 0,
            allocator,
        })
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of bytes written so far; also the position of the write cursor.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of capacity doublings so far. One reallocation may cover several.
    pub fn growth_count(&self) -> usize {
        self.growths
    }

    /// Advances the cursor by `n` zeroed bytes, growing first if needed, and returns the
    /// offset the reserved region starts at.
    pub fn reserve_bytes(&mut self, n: usize) -> Result<usize, WireError> {
        let offset = self.len;
        let end = offset
            .checked_add(n)
            .ok_or(WireError::TooLarge { size: usize::MAX })?;
        self.grow_to(end)?;
        self.storage[offset..end].fill(0);
        self.len = end;
        Ok(offset)
    }

    /// Appends `src` and returns the offset it was written at.
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<usize, WireError> {
        let offset = self.reserve_bytes(src.len())?;
        self.storage[offset..offset + src.len()].copy_from_slice(src);
        Ok(offset)
    }

    /// Overwrites already written bytes starting at `offset`.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> Result<(), WireError> {
        self.bytes_mut(offset, src.len())?.copy_from_slice(src);
        Ok(())
    }

    /// Resolves `len` written bytes at `offset`.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8], WireError> {
        let end = self.checked_end(offset, len)?;
        Ok(&self.storage[offset..end])
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], WireError> {
        let end = self.checked_end(offset, len)?;
        Ok(&mut self.storage[offset..end])
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, WireError> {
        let raw = self.bytes(offset, size_of::<u32>())?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Everything written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    /// Doubles the capacity until it is at least `required`, copying the live prefix into the
    /// new storage and returning the old block to the allocator.
    pub fn grow_to(&mut self, required: usize) -> Result<(), WireError> {
        if required <= self.capacity() {
            return Ok(());
        }

        let mut capacity = self.capacity().max(MIN_CAPACITY);
        let mut doublings = 0;
        while capacity < required {
            capacity = capacity
                .checked_mul(2)
                .ok_or(WireError::OutOfMemory { requested: required })?;
            doublings += 1;
        }

        let mut storage = self.allocator.allocate(capacity)?;
        storage[..self.len].copy_from_slice(&self.storage[..self.len]);
        let old = std::mem::replace(&mut self.storage, storage);
        self.allocator.free(old);
        self.growths += doublings;

        trace!("wire buffer grew to {capacity} bytes ({} live)", self.len);
        Ok(())
    }

    /// Rewinds the cursor to the start while keeping the capacity for reuse.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Discards everything written at or after `offset`. Offsets past the cursor are ignored.
    pub fn truncate(&mut self, offset: usize) {
        self.len = self.len.min(offset);
    }

    fn checked_end(&self, offset: usize, len: usize) -> Result<usize, WireError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(end),
            _ => Err(WireError::OutOfBounds {
                offset,
                len,
                size: self.len,
            }),
        }
    }
}

impl Drop for WireBuffer {
    fn drop(&mut self) {
        let storage = std::mem::take(&mut self.storage);
        self.allocator.free(storage);
    }
}

impl std::fmt::Debug for WireBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("growths", &self.growths)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::SharedAllocator;

    use super::*;

    fn new_buffer(capacity: usize) -> (WireBuffer, Arc<SharedAllocator>) {
        let allocator = Arc::new(SharedAllocator::new());
        let buffer = WireBuffer::with_allocator(capacity, allocator.clone()).unwrap();
        (buffer, allocator)
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let (buffer, _) = new_buffer(100);
        assert_eq!(buffer.capacity(), 128);

        let (buffer, _) = new_buffer(1);
        assert_eq!(buffer.capacity(), MIN_CAPACITY);
    }

    #[test]
    fn reserve_returns_prior_cursor() {
        let (mut buffer, _) = new_buffer(16);
        assert_eq!(buffer.reserve_bytes(4).unwrap(), 0);
        assert_eq!(buffer.reserve_bytes(8).unwrap(), 4);
        assert_eq!(buffer.len(), 12);
    }

    #[test]
    fn growth_preserves_live_prefix() {
        let (mut buffer, allocator) = new_buffer(16);
        let first = buffer.write_bytes(b"offsets survive growth").unwrap();
        let second = buffer.write_bytes(&[7; 40]).unwrap();

        assert_eq!(buffer.capacity(), 64);
        assert_eq!(buffer.growth_count(), 2);
        assert_eq!(buffer.bytes(first, 22).unwrap(), b"offsets survive growth");
        assert_eq!(buffer.bytes(second, 40).unwrap(), &[7; 40]);
        assert_eq!(allocator.stats().live_blocks, 1);
        assert_eq!(allocator.stats().live_bytes, 64);
    }

    #[test]
    fn large_reservation_counts_every_doubling() {
        let (mut buffer, allocator) = new_buffer(64);
        buffer.reserve_bytes(4000).unwrap();

        assert_eq!(buffer.capacity(), 4096);
        assert_eq!(buffer.growth_count(), 6);
        // Still a single reallocation.
        assert_eq!(allocator.stats().allocations, 2);
    }

    #[test]
    fn truncate_rewinds_cursor() {
        let (mut buffer, _) = new_buffer(16);
        buffer.write_bytes(b"keep").unwrap();
        let mark = buffer.len();
        buffer.write_bytes(b"discard").unwrap();

        buffer.truncate(mark);
        assert_eq!(buffer.as_slice(), b"keep");
        buffer.truncate(100);
        assert_eq!(buffer.len(), 4);

        assert_eq!(buffer.write_bytes(b"!").unwrap(), mark);
        assert_eq!(buffer.as_slice(), b"keep!");
    }

    #[test]
    fn clear_keeps_capacity() {
        let (mut buffer, _) = new_buffer(16);
        buffer.write_bytes(&[1; 100]).unwrap();
        let capacity = buffer.capacity();

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), capacity);

        let offset = buffer.reserve_bytes(8).unwrap();
        assert_eq!(buffer.bytes(offset, 8).unwrap(), &[0; 8]);
    }

    #[test]
    fn reads_past_cursor_are_rejected() {
        let (mut buffer, _) = new_buffer(64);
        buffer.write_bytes(&[1, 2, 3, 4]).unwrap();

        assert_eq!(buffer.read_u32(0).unwrap(), u32::from_le_bytes([1, 2, 3, 4]));
        assert!(matches!(
            buffer.bytes(2, 4),
            Err(WireError::OutOfBounds {
                offset: 2,
                len: 4,
                size: 4
            })
        ));
    }

    #[test]
    fn drop_returns_storage() {
        let (buffer, allocator) = new_buffer(32);
        assert_eq!(allocator.stats().live_blocks, 1);
        drop(buffer);
        assert_eq!(allocator.stats().live_blocks, 0);
    }
}

//! Reusable message buffers.
//!
//! Connections check a [`BufferSet`] out of a [`BufferPool`] and keep it
//! for their lifetime. Sets are cleared on checkout (not on return), and a
//! set whose buffers ballooned past the retention cap is dropped instead of
//! cached, so one huge result row cannot pin megabytes in the pool forever.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, LazyLock};

use crossbeam_queue::ArrayQueue;

/// Sets kept around per pool.
const POOL_SLOTS: usize = 32;

/// Buffers that grew past this are not worth caching.
const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// Read/write buffers shared by one connection.
pub struct BufferSet {
    /// Payload of the last message read (length field stripped).
    pub read_buffer: Vec<u8>,
    /// Pending outgoing bytes, flushed explicitly.
    pub write_buffer: Vec<u8>,
    /// Type byte of the last message read.
    pub type_byte: u8,
}

impl BufferSet {
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::with_capacity(8192),
            type_byte: 0,
        }
    }

    fn reset(&mut self) {
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.type_byte = 0;
    }

    fn worth_caching(&self) -> bool {
        self.read_buffer.capacity() <= MAX_RETAINED_CAPACITY
            && self.write_buffer.capacity() <= MAX_RETAINED_CAPACITY
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Global buffer pool; every connection draws its set from here.
pub static GLOBAL_BUFFER_POOL: LazyLock<Arc<BufferPool>> =
    LazyLock::new(|| Arc::new(BufferPool::default()));

/// Fixed-slot pool of [`BufferSet`]s.
#[derive(Debug)]
pub struct BufferPool {
    slots: ArrayQueue<BufferSet>,
}

impl BufferPool {
    pub fn with_slots(slots: usize) -> Self {
        Self {
            slots: ArrayQueue::new(slots),
        }
    }

    /// Check a cleared set out of the pool, growing a fresh one when all
    /// slots are empty.
    pub fn get(self: &Arc<Self>) -> PooledBufferSet {
        let mut set = self.slots.pop().unwrap_or_default();
        set.reset();
        PooledBufferSet {
            pool: Arc::clone(self),
            set,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::with_slots(POOL_SLOTS)
    }
}

/// A checked-out [`BufferSet`]; going out of scope returns it to its pool
/// when it is still reasonably sized and a slot is free.
pub struct PooledBufferSet {
    pool: Arc<BufferPool>,
    set: BufferSet,
}

impl Deref for PooledBufferSet {
    type Target = BufferSet;

    fn deref(&self) -> &Self::Target {
        &self.set
    }
}

impl DerefMut for PooledBufferSet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.set
    }
}

impl Drop for PooledBufferSet {
    fn drop(&mut self) {
        let set = mem::take(&mut self.set);
        if set.worth_caching() {
            // A full pool simply drops the set.
            let _ = self.pool.slots.push(set);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_is_cleared() {
        let pool = Arc::new(BufferPool::with_slots(2));
        {
            let mut set = pool.get();
            set.write_buffer.extend_from_slice(b"abc");
            set.read_buffer.extend_from_slice(b"xyz");
            set.type_byte = b'Q';
        }
        let set = pool.get();
        assert!(set.write_buffer.is_empty());
        assert!(set.read_buffer.is_empty());
        assert_eq!(set.type_byte, 0);
    }

    #[test]
    fn returned_set_is_reused() {
        let pool = Arc::new(BufferPool::with_slots(1));
        let capacity = {
            let mut set = pool.get();
            set.write_buffer.reserve(10_000);
            set.write_buffer.capacity()
        };
        // The same allocation comes back.
        assert_eq!(pool.get().write_buffer.capacity(), capacity);
    }

    #[test]
    fn oversized_sets_are_not_cached() {
        let pool = Arc::new(BufferPool::with_slots(1));
        {
            let mut set = pool.get();
            set.read_buffer.reserve(MAX_RETAINED_CAPACITY * 2);
        }
        assert!(pool.get().read_buffer.capacity() <= MAX_RETAINED_CAPACITY);
    }

    #[test]
    fn full_pool_drops_extra_sets() {
        let pool = Arc::new(BufferPool::with_slots(1));
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        // Only one slot; a third checkout still works.
        let set = pool.get();
        assert!(set.read_buffer.is_empty());
    }
}

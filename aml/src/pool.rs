//! Bounded pools of recycled interpreter objects.
//!
//! The interpreter allocates and frees walk-state frames and parse ops at a very high rate while loading a
//! table. Rather than go to the global allocator for every one of them, released objects are kept on a
//! per-pool free list (up to `max_depth` of them) and handed back out by the next `acquire`. The free list is
//! a side table of owned boxes, so nothing is ever threaded through the memory of a reclaimed object.

use alloc::{boxed::Box, vec::Vec};
use core::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};
use log::trace;
use spinning_top::Spinlock;

/// Marks whether a pooled object is live or sitting on a free list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Descriptor {
    Active,
    Cached,
}

/// Something that can be recycled by an [`ObjectPool`].
pub trait Poolable: Send {
    /// Produce the blank state every object is handed out in.
    fn zeroed() -> Self;

    /// Scrub the object as it goes onto the free list. Implementations should drop anything they own and leave
    /// a recognisable sentinel behind, so use-after-release shows up in a debugger.
    fn mark_cached(&mut self);

    fn is_cached(&self) -> bool;
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct PoolStats {
    /// Total number of `acquire` calls.
    pub requests: usize,
    /// Number of `acquire` calls served from the free list.
    pub hits: usize,
    /// Number of objects obtained from the global allocator.
    pub allocations: usize,
    /// Number of objects handed back to the global allocator, by `release` overflow or `purge`.
    pub frees: usize,
    pub current_depth: usize,
    pub max_depth: usize,
}

pub struct ObjectPool<T: Poolable> {
    name: &'static str,
    max_depth: usize,
    free_list: Spinlock<Vec<Box<T>>>,
    requests: AtomicUsize,
    hits: AtomicUsize,
    allocations: AtomicUsize,
    frees: AtomicUsize,
}

impl<T> ObjectPool<T>
where
    T: Poolable,
{
    pub fn new(name: &'static str, max_depth: usize) -> ObjectPool<T> {
        ObjectPool {
            name,
            max_depth,
            free_list: Spinlock::new(Vec::with_capacity(max_depth)),
            requests: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Get an object from the pool, or from the global allocator if the pool is empty. The object is always
    /// returned in its zeroed state.
    pub fn acquire(&self) -> Box<T> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        /*
         * Take the free-list lock only for the pop. The fallback path below calls into the global allocator,
         * which may itself want to take locks, so it must never run with the lock held.
         */
        let cached = self.free_list.lock().pop();

        match cached {
            Some(mut object) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                *object = T::zeroed();
                object
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                Box::new(T::zeroed())
            }
        }
    }

    /// Return an object to the pool. If the pool is already at `max_depth`, the object is freed instead.
    pub fn release(&self, mut object: Box<T>) {
        let mut free_list = self.free_list.lock();
        if free_list.len() >= self.max_depth {
            drop(free_list);
            self.frees.fetch_add(1, Ordering::Relaxed);
            return;
        }

        object.mark_cached();
        free_list.push(object);
    }

    /// Free every object on the free list. Returns the number of objects freed.
    pub fn purge(&self) -> usize {
        let drained = mem::take(&mut *self.free_list.lock());
        let count = drained.len();
        self.frees.fetch_add(count, Ordering::Relaxed);
        trace!("Purged {} objects from the {} cache", count, self.name);
        count
    }

    pub fn current_depth(&self) -> usize {
        self.free_list.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            current_depth: self.current_depth(),
            max_depth: self.max_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENTINEL: u8 = 0xca;

    struct Block {
        descriptor: Descriptor,
        data: [u8; 16],
    }

    impl Poolable for Block {
        fn zeroed() -> Self {
            Block { descriptor: Descriptor::Active, data: [0; 16] }
        }

        fn mark_cached(&mut self) {
            self.descriptor = Descriptor::Cached;
            self.data = [SENTINEL; 16];
        }

        fn is_cached(&self) -> bool {
            self.descriptor == Descriptor::Cached
        }
    }

    #[test]
    fn release_then_acquire_reuses_storage() {
        let pool = ObjectPool::<Block>::new("test", 4);

        let mut block = pool.acquire();
        block.data[3] = 0x42;
        let address = &*block as *const Block;
        assert_eq!(pool.stats().allocations, 1);

        pool.release(block);
        assert_eq!(pool.current_depth(), 1);

        let block = pool.acquire();
        assert_eq!(&*block as *const Block, address);
        assert_eq!(pool.stats().allocations, 1);
        assert_eq!(pool.stats().hits, 1);
        assert_eq!(pool.current_depth(), 0);
    }

    #[test]
    fn acquired_objects_are_zeroed() {
        let pool = ObjectPool::<Block>::new("test", 4);
        let mut block = pool.acquire();
        block.data = [0xff; 16];
        pool.release(block);

        let block = pool.acquire();
        assert!(!block.is_cached());
        assert_eq!(block.data, [0; 16]);
    }

    #[test]
    fn released_objects_carry_the_sentinel() {
        let pool = ObjectPool::<Block>::new("test", 4);
        pool.release(pool.acquire());

        let free_list = pool.free_list.lock();
        assert!(free_list[0].is_cached());
        assert_eq!(free_list[0].data, [SENTINEL; 16]);
    }

    #[test]
    fn release_past_max_depth_frees() {
        let pool = ObjectPool::<Block>::new("test", 1);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.stats().allocations, 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.current_depth(), 1);
        assert_eq!(pool.stats().frees, 1);

        // The first acquire is served from the one cached block...
        let _a = pool.acquire();
        assert_eq!(pool.stats().allocations, 2);
        // ...and the block that overflowed the pool has to be allocated again.
        let _b = pool.acquire();
        assert_eq!(pool.stats().allocations, 3);
    }

    #[test]
    fn purge_empties_the_pool() {
        let pool = ObjectPool::<Block>::new("test", 8);
        let blocks: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        for block in blocks {
            pool.release(block);
        }
        assert_eq!(pool.current_depth(), 5);

        assert_eq!(pool.purge(), 5);
        assert_eq!(pool.current_depth(), 0);
        assert_eq!(pool.stats().frees, 5);

        pool.acquire();
        assert_eq!(pool.stats().allocations, 6);
    }
}

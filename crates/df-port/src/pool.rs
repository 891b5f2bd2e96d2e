//! Port buffer pools (component D).
//!
//! A buffer is either sitting in exactly one pool's free list, or pinned by
//! one or more outstanding references — never both, never neither. In the
//! original this was a hand-rolled reference counter; here it's
//! [`std::sync::Arc`]'s own strong count, which already gives the "one
//! atomic op per reference" property the design relies on. [`PooledValue`]
//! exists only to hook `Drop` so a buffer recycles back into its pool
//! instead of deallocating when the last `Arc` goes away.

use std::any::Any;
use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;
use parking_lot::RwLock;

/// A pooled, type-erased buffer. Dereferences to the boxed payload;
/// recycles itself into the owning pool's free list on drop.
pub struct PooledValue {
    value: ManuallyDrop<Box<dyn Any + Send + Sync>>,
    pool: Weak<UniTypePool>,
}

impl PooledValue {
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self.value.as_ref()
    }

    /// Builds a standalone value not backed by any pool — it simply drops
    /// when its last reference goes away. Used by tests that need a filled
    /// buffer without round-tripping through a pool's free list.
    #[cfg(test)]
    pub fn for_test(value: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            pool: Weak::new(),
        }
    }
}

impl Drop for PooledValue {
    fn drop(&mut self) {
        // SAFETY: `self.value` is never touched again after this point —
        // `Drop::drop` only runs once, and nothing else can observe `self`
        // afterward.
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(value);
        }
    }
}

/// Free-list of recyclable buffers for a single data type.
pub struct UniTypePool {
    free: SegQueue<Box<dyn Any + Send + Sync>>,
    recycled: AtomicU64,
    allocated: AtomicU64,
}

impl UniTypePool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            free: SegQueue::new(),
            recycled: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        })
    }

    /// Returns a buffer from the free list, or calls `make` to allocate a
    /// fresh one if the pool is empty (spec §4.D `GetUnused`).
    pub fn get_unused(
        self: &Arc<Self>,
        make: impl FnOnce() -> Box<dyn Any + Send + Sync>,
    ) -> Arc<PooledValue> {
        let value = match self.free.pop() {
            Some(v) => v,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                make()
            }
        };
        Arc::new(PooledValue {
            value: ManuallyDrop::new(value),
            pool: Arc::downgrade(self),
        })
    }

    fn recycle(&self, value: Box<dyn Any + Send + Sync>) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
        self.free.push(value);
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn recycled_count(&self) -> u64 {
        self.recycled.load(Ordering::Relaxed)
    }

    pub fn allocated_count(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// One [`UniTypePool`] per distinct data type, keyed by type uid. Used by
/// parts of the runtime (e.g. the finstructable-group loader) that hand out
/// buffers for ports whose concrete type isn't known until load time.
pub struct MultiTypePool {
    pools: RwLock<HashMap<u64, Arc<UniTypePool>>>,
}

impl Default for MultiTypePool {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiTypePool {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool_for(&self, type_uid: u64) -> Arc<UniTypePool> {
        if let Some(p) = self.pools.read().get(&type_uid) {
            return p.clone();
        }
        self.pools
            .write()
            .entry(type_uid)
            .or_insert_with(UniTypePool::new)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_allocates_via_make() {
        let pool = UniTypePool::new();
        let v = pool.get_unused(|| Box::new(42i32));
        assert_eq!(v.downcast_ref::<i32>(), Some(&42));
        assert_eq!(pool.allocated_count(), 1);
    }

    #[test]
    fn dropping_last_reference_recycles_into_free_list() {
        let pool = UniTypePool::new();
        {
            let _v = pool.get_unused(|| Box::new(1i32));
            assert_eq!(pool.free_len(), 0);
        }
        assert_eq!(pool.free_len(), 1);
        assert_eq!(pool.recycled_count(), 1);
    }

    #[test]
    fn recycled_buffer_is_reused_before_allocating() {
        let pool = UniTypePool::new();
        drop(pool.get_unused(|| Box::new(1i32)));
        let _v = pool.get_unused(|| Box::new(2i32));
        assert_eq!(pool.allocated_count(), 1);
        assert_eq!(pool.free_len(), 0);
    }

    #[test]
    fn buffer_outlives_pool_and_just_drops_normally() {
        let pool = UniTypePool::new();
        let v = pool.get_unused(|| Box::new(1i32));
        drop(pool);
        drop(v);
    }

    #[test]
    fn multi_type_pool_keeps_separate_free_lists_per_uid() {
        let multi = MultiTypePool::new();
        let a = multi.pool_for(1);
        let b = multi.pool_for(2);
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &multi.pool_for(1)));
    }
}

//! Reference-counted bucket freezing.
//!
//! A bucket is frozen while a merge or visit holds it; maintenance jobs
//! that move documents or compact lid space must skip frozen buckets.
//! Freezes nest: the bucket thaws when the last guard drops, at which
//! point registered listeners fire so blocked jobs can resume.

use lodestone_core::BucketId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type ThawListener = Box<dyn Fn(&BucketId) + Send + Sync>;

/// The freeze registry.
#[derive(Default)]
pub struct FrozenBuckets {
    counts: Mutex<HashMap<BucketId, usize>>,
    listeners: Mutex<Vec<ThawListener>>,
}

impl FrozenBuckets {
    /// An empty registry.
    pub fn new() -> Self {
        FrozenBuckets::default()
    }

    /// Bump the bucket's freeze count.
    pub fn freeze_bucket(&self, bucket: BucketId) {
        let mut counts = self.counts.lock();
        *counts.entry(bucket).or_insert(0) += 1;
    }

    /// Drop one freeze; fires thaw listeners when the count reaches zero.
    pub fn thaw_bucket(&self, bucket: BucketId) {
        let thawed = {
            let mut counts = self.counts.lock();
            match counts.get_mut(&bucket) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        counts.remove(&bucket);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if thawed {
            debug!(%bucket, "bucket thawed");
            for listener in self.listeners.lock().iter() {
                listener(&bucket);
            }
        }
    }

    /// True while the bucket has at least one freeze.
    pub fn is_frozen(&self, bucket: &BucketId) -> bool {
        self.counts.lock().contains_key(bucket)
    }

    /// Number of currently frozen buckets.
    pub fn num_frozen(&self) -> usize {
        self.counts.lock().len()
    }

    /// Register a thaw listener.
    pub fn add_thaw_listener(&self, listener: impl Fn(&BucketId) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(listener));
    }
}

/// RAII freeze of one bucket.
pub struct BucketGuard {
    frozen: Arc<FrozenBuckets>,
    bucket: BucketId,
}

impl BucketGuard {
    /// Freeze `bucket` for the guard's lifetime.
    pub fn new(frozen: Arc<FrozenBuckets>, bucket: BucketId) -> Self {
        frozen.freeze_bucket(bucket);
        BucketGuard { frozen, bucket }
    }

    /// The guarded bucket.
    pub fn bucket(&self) -> &BucketId {
        &self.bucket
    }
}

impl Drop for BucketGuard {
    fn drop(&mut self) {
        self.frozen.thaw_bucket(self.bucket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bucket(key: u64) -> BucketId {
        BucketId::new(8, key)
    }

    #[test]
    fn test_freeze_is_refcounted() {
        let frozen = FrozenBuckets::new();
        frozen.freeze_bucket(bucket(1));
        frozen.freeze_bucket(bucket(1));
        assert!(frozen.is_frozen(&bucket(1)));
        frozen.thaw_bucket(bucket(1));
        assert!(frozen.is_frozen(&bucket(1)));
        frozen.thaw_bucket(bucket(1));
        assert!(!frozen.is_frozen(&bucket(1)));
    }

    #[test]
    fn test_thaw_fires_listener_once_at_zero() {
        let frozen = FrozenBuckets::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        frozen.add_thaw_listener(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        frozen.freeze_bucket(bucket(2));
        frozen.freeze_bucket(bucket(2));
        frozen.thaw_bucket(bucket(2));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        frozen.thaw_bucket(bucket(2));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_freezes_for_its_lifetime() {
        let frozen = Arc::new(FrozenBuckets::new());
        {
            let _guard = BucketGuard::new(Arc::clone(&frozen), bucket(3));
            assert!(frozen.is_frozen(&bucket(3)));
        }
        assert!(!frozen.is_frozen(&bucket(3)));
    }

    #[test]
    fn test_thaw_of_unknown_bucket_is_noop() {
        let frozen = FrozenBuckets::new();
        frozen.thaw_bucket(bucket(9));
        assert_eq!(frozen.num_frozen(), 0);
    }
}

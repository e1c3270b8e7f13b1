//! Hash-partitioned mutable maps.
//!
//! The live registries are touched by every connection task. Splitting them
//! into independently locked partitions keeps unrelated conversations from
//! contending on one lock. Partition locks are never held across `.await`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::{Mutex, MutexGuard};

/// Default number of partitions.
pub const DEFAULT_SHARDS: usize = 16;

/// A fixed set of `Mutex<T>` partitions selected by key hash.
pub struct Sharded<T> {
    shards: Box<[Mutex<T>]>,
}

impl<T: Default> Sharded<T> {
    /// Creates `count` empty partitions (at least one).
    #[must_use]
    pub fn new(count: usize) -> Self {
        let shards = (0..count.max(1)).map(|_| Mutex::new(T::default())).collect();
        Self { shards }
    }
}

impl<T: Default> Default for Sharded<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl<T> Sharded<T> {
    /// Locks the partition owning `key`.
    pub fn lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, T> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        // Truncation is fine: only the low bits select a partition.
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index].lock()
    }

    /// Runs `f` on every partition in turn, one lock at a time.
    pub fn for_each(&self, mut f: impl FnMut(&mut T)) {
        for shard in &*self.shards {
            f(&mut shard.lock());
        }
    }

    /// Number of partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Always `false`; there is at least one partition.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

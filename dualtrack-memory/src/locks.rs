//! Per-id lock striping and read leases
//!
//! Mutations of a single record are serialised on one of a fixed number of
//! async mutexes chosen by hashing the id. Unrelated ids contend only when
//! they collide on a stripe.
//!
//! Read leases mark long-term records that an in-flight query has read but
//! not yet returned. They do not block writers; the decay sweep checks them
//! under the id lock and leaves leased records alone.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::record::MemoryId;

pub struct LockStripes {
    stripes: Vec<Mutex<()>>,
}

impl LockStripes {
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn stripe_of(&self, id: &MemoryId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Wait for exclusive access to `id`
    pub async fn lock(&self, id: &MemoryId) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(id)].lock().await
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}

/// Reference counts of leased ids
#[derive(Debug, Default)]
pub struct ReadLeases {
    held: DashMap<MemoryId, usize>,
}

impl ReadLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(self: &Arc<Self>, id: MemoryId) -> ReadLease {
        *self.held.entry(id).or_insert(0) += 1;
        ReadLease {
            leases: self.clone(),
            id,
        }
    }

    pub fn is_held(&self, id: &MemoryId) -> bool {
        self.held.contains_key(id)
    }
}

/// Released on drop
pub struct ReadLease {
    leases: Arc<ReadLeases>,
    id: MemoryId,
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        if let Entry::Occupied(mut held) = self.leases.held.entry(self.id) {
            *held.get_mut() -= 1;
            if *held.get() == 0 {
                held.remove();
            }
        }
    }
}

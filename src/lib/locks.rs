use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use tokio::sync::{Mutex, MutexGuard};

pub const DEFAULT_LOCK_SHARDS: usize = 64;

/// Fixed set of async mutexes; an aggregate id always maps to the same shard.
///
/// Unrelated ids may share a shard and contend, but the table never grows.
#[derive(Debug)]
pub struct LockTable {
    shards: Box<[Mutex<()>]>,
}

impl LockTable {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(())).collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_for(&self, aggregate_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        aggregate_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub async fn lock(&self, aggregate_id: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_for(aggregate_id)].lock().await
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_SHARDS)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[test]
    fn ids_map_to_a_stable_shard() {
        let table = LockTable::new(8);
        assert_eq!(table.shard_for("p1"), table.shard_for("p1"));
        assert!(table.shard_for("p2") < 8);
        assert_eq!(LockTable::new(0).shard_count(), 1);
    }

    #[tokio::test]
    async fn same_id_is_mutually_exclusive() {
        let table = Arc::new(LockTable::new(4));
        let guard = table.lock("p1").await;

        let contender = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                let _guard = table.lock("p1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}

// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide directory of live buffer pools.
//!
//! Purely observational: pools register themselves at construction and
//! unregister when dropped; the registry keeps weak references and serves
//! statistics snapshots. No correctness path depends on it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, Weak};
use std::time::SystemTime;

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::pool::PoolShared;

static REGISTRY: Lazy<BufferPoolRegistry> = Lazy::new(BufferPoolRegistry::new);

/// The process-wide registry instance.
pub fn global() -> &'static BufferPoolRegistry {
    &REGISTRY
}

/// Statistics snapshot of one registered pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub id: u64,
    pub name: String,
    pub category: String,
    pub total: usize,
    pub free: usize,
    pub filled: usize,
    pub buffer_size: usize,
    pub memory_bytes: usize,
    pub registered_at: SystemTime,
}

/// Aggregate statistics across every live pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalStats {
    pub total_pools: usize,
    pub total_buffers: usize,
    pub total_free: usize,
    pub total_filled: usize,
    pub total_memory_bytes: usize,
}

struct Entry {
    pool: Weak<PoolShared>,
    name: String,
    category: String,
    registered_at: SystemTime,
}

struct Inner {
    pools: BTreeMap<u64, Entry>,
    name_to_id: HashMap<String, u64>,
    next_id: u64,
}

/// Directory mapping registry ids and names to live pools.
///
/// Thread-safe through one mutex. Ids are monotonic and unique for the
/// process lifetime; names need not be unique (duplicates are warned).
pub struct BufferPoolRegistry {
    inner: Mutex<Inner>,
}

impl BufferPoolRegistry {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pools: BTreeMap::new(),
                name_to_id: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    pub(crate) fn register(&self, pool: Weak<PoolShared>, name: &str, category: &str) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if inner.name_to_id.contains_key(name) {
            warn!(name, "duplicate pool name registered");
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pools.insert(
            id,
            Entry {
                pool,
                name: name.to_string(),
                category: category.to_string(),
                registered_at: SystemTime::now(),
            },
        );
        inner.name_to_id.insert(name.to_string(), id);
        debug!(name, id, category, "pool registered");
        id
    }

    pub(crate) fn unregister(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        match inner.pools.remove(&id) {
            Some(entry) => {
                // Only drop the name index if it still points at us; a
                // duplicate name may have overwritten it.
                if inner.name_to_id.get(&entry.name) == Some(&id) {
                    inner.name_to_id.remove(&entry.name);
                }
                debug!(name = %entry.name, id, "pool unregistered");
            }
            None => warn!(id, "unregister of unknown pool id"),
        }
    }

    fn snapshot(id: u64, entry: &Entry) -> Option<PoolStats> {
        let shared = entry.pool.upgrade()?;
        let (total, free, filled, buffer_size) = shared.counts();
        Some(PoolStats {
            id,
            name: entry.name.clone(),
            category: entry.category.clone(),
            total,
            free,
            filled,
            buffer_size,
            memory_bytes: shared.memory_bytes(),
            registered_at: entry.registered_at,
        })
    }

    /// Snapshot of the pool registered under `name`, if still alive.
    pub fn find_by_name(&self, name: &str) -> Option<PoolStats> {
        let inner = self.inner.lock().unwrap();
        let id = *inner.name_to_id.get(name)?;
        Self::snapshot(id, inner.pools.get(&id)?)
    }

    /// Snapshots of every live pool in `category`.
    pub fn pools_in_category(&self, category: &str) -> Vec<PoolStats> {
        let inner = self.inner.lock().unwrap();
        inner
            .pools
            .iter()
            .filter(|(_, e)| e.category == category)
            .filter_map(|(&id, e)| Self::snapshot(id, e))
            .collect()
    }

    /// Snapshots of every live pool, in registration order.
    pub fn all_pools(&self) -> Vec<PoolStats> {
        let inner = self.inner.lock().unwrap();
        inner
            .pools
            .iter()
            .filter_map(|(&id, e)| Self::snapshot(id, e))
            .collect()
    }

    /// Number of registered pools.
    pub fn pool_count(&self) -> usize {
        self.inner.lock().unwrap().pools.len()
    }

    /// Sums of counts, queue sizes and memory across every live pool.
    pub fn global_stats(&self) -> GlobalStats {
        let mut stats = GlobalStats::default();
        for pool in self.all_pools() {
            stats.total_pools += 1;
            stats.total_buffers += pool.total;
            stats.total_free += pool.free;
            stats.total_filled += pool.filled;
            stats.total_memory_bytes += pool.memory_bytes;
        }
        stats
    }

    /// Logs one line per live pool plus the aggregate, at info level.
    pub fn log_all_stats(&self) {
        let pools = self.all_pools();
        info!(pools = pools.len(), "registered buffer pools");
        for pool in &pools {
            info!(
                id = pool.id,
                name = %pool.name,
                category = %pool.category,
                total = pool.total,
                free = pool.free,
                filled = pool.filled,
                memory_bytes = pool.memory_bytes,
                "pool"
            );
        }
        let stats = self.global_stats();
        info!(
            total_buffers = stats.total_buffers,
            total_memory_bytes = stats.total_memory_bytes,
            "registry totals"
        );
    }
}

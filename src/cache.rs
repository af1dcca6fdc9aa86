//! Bounded, per-connection prepared-statement cache, keyed by caller-supplied
//! name and evicted by least-recently-used order.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::handle::PreparedStatement;

/// Process-wide monotonic counter used to order LRU touches. Never locked:
/// it is only ever compared, so a stale read only affects eviction choice,
/// never correctness.
static LRU_EPOCH: AtomicU64 = AtomicU64::new(0);

fn next_epoch() -> u64 {
    LRU_EPOCH.fetch_add(1, Ordering::Relaxed) + 1
}

/// Two parallel arrays indexed together, matching the source layout: a
/// `statements[]` array and an `lru_counter[]` array of the same length.
/// Bounded by `capacity`; eviction scans for the minimum counter.
pub struct StatementCache {
    capacity: usize,
    statements: Vec<PreparedStatement>,
    lru_counter: Vec<u64>,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            statements: Vec::new(),
            lru_counter: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Linear scan by name. On hit, touches the LRU counter and bumps the
    /// statement's usage count, then returns the index.
    pub fn lookup(&mut self, name: &str) -> Option<usize> {
        let idx = self.statements.iter().position(|s| s.name == name)?;
        self.lru_counter[idx] = next_epoch();
        self.statements[idx].usage_count += 1;
        Some(idx)
    }

    pub fn get(&self, idx: usize) -> &PreparedStatement {
        &self.statements[idx]
    }

    /// Inserts a new statement, evicting the least-recently-used slot first
    /// if the cache is already at capacity. Returns the evicted statement,
    /// if any, so the caller can finalize its driver handle.
    pub fn insert(&mut self, stmt: PreparedStatement) -> Option<PreparedStatement> {
        let evicted = if self.statements.len() >= self.capacity && !self.statements.is_empty() {
            let evict_idx = self
                .lru_counter
                .iter()
                .enumerate()
                .min_by_key(|&(_, &counter)| counter)
                .map(|(i, _)| i)
                .expect("cache is non-empty");
            let evicted = self.statements.remove(evict_idx);
            self.lru_counter.remove(evict_idx);
            Some(evicted)
        } else {
            None
        };

        self.statements.push(stmt);
        self.lru_counter.push(next_epoch());
        evicted
    }

    /// Linear find-and-remove; shifts remaining entries to keep the arrays
    /// compact.
    pub fn remove(&mut self, name: &str) -> Option<PreparedStatement> {
        let idx = self.statements.iter().position(|s| s.name == name)?;
        self.lru_counter.remove(idx);
        Some(self.statements.remove(idx))
    }

    /// Called at disconnect: drains every cached statement so the caller can
    /// finalize each one.
    pub fn invalidate_all(&mut self) -> Vec<PreparedStatement> {
        self.lru_counter.clear();
        std::mem::take(&mut self.statements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(name: &str) -> PreparedStatement {
        PreparedStatement::new(name, format!("SELECT * FROM {name}"), true)
    }

    #[test]
    fn respects_capacity_bound() {
        let mut cache = StatementCache::new(2);
        assert!(cache.insert(stmt("a")).is_none());
        assert!(cache.insert(stmt("b")).is_none());
        assert_eq!(cache.len(), 2);
        let evicted = cache.insert(stmt("c"));
        assert_eq!(cache.len(), 2);
        assert_eq!(evicted.unwrap().name, "a");
    }

    #[test]
    fn lookup_bumps_lru_so_it_survives_eviction() {
        let mut cache = StatementCache::new(2);
        cache.insert(stmt("a"));
        cache.insert(stmt("b"));
        // touch "a" so it is newer than "b"
        cache.lookup("a").unwrap();
        let evicted = cache.insert(stmt("c")).unwrap();
        assert_eq!(evicted.name, "b");
    }

    #[test]
    fn lru_counter_strictly_increases_across_lookups() {
        let mut cache = StatementCache::new(4);
        cache.insert(stmt("a"));
        let idx = cache.lookup("a").unwrap();
        let first = cache.lru_counter[idx];
        let idx2 = cache.lookup("a").unwrap();
        let second = cache.lru_counter[idx2];
        assert!(second > first);
    }

    #[test]
    fn remove_compacts_arrays() {
        let mut cache = StatementCache::new(4);
        cache.insert(stmt("a"));
        cache.insert(stmt("b"));
        cache.remove("a");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lru_counter.len(), 1);
        assert!(cache.lookup("b").is_some());
    }

    #[test]
    fn invalidate_all_drains_cache() {
        let mut cache = StatementCache::new(4);
        cache.insert(stmt("a"));
        cache.insert(stmt("b"));
        let drained = cache.invalidate_all();
        assert_eq!(drained.len(), 2);
        assert!(cache.is_empty());
    }
}

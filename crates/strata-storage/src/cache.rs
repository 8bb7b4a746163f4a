//! Object cache
//!
//! Two LRU indexes share one cache: raw blocks keyed by physical address
//! and space-maps keyed by virtual address. The cache only indexes ids;
//! the records live in the storage arenas, whose `cached` flags the
//! coordinator keeps in step with the indexes here.
//!
//! Features:
//! - MRU promotion on every successful search
//! - Explicit LRU popping; the caller decides what is evictable
//! - Hit/miss/eviction statistics per family

use crate::arena::{BlockId, ObjectId};
use crate::lru::LruCache;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::{Error, PhysicalAddress, Result, VirtualAddress};

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of entries evicted
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    fn record(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// LRU indexes over cached blocks and space-maps
#[derive(Default)]
pub struct ObjectCache {
    blocks: LruCache<PhysicalAddress, BlockId>,
    space_maps: LruCache<VirtualAddress, ObjectId>,
    block_stats: CacheStats,
    space_map_stats: CacheStats,
}

impl ObjectCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the block at `addr` (floored), promoting it to MRU
    pub fn search_block(&mut self, addr: PhysicalAddress) -> Option<BlockId> {
        let found = self.blocks.get(&addr.floor()).copied();
        self.block_stats.record(found.is_some());
        found
    }

    /// Register a block; an address may be cached only once
    pub fn store_block(&mut self, addr: PhysicalAddress, id: BlockId) -> Result<()> {
        let addr = addr.floor();
        if let Some(existing) = self.blocks.peek(&addr) {
            return Err(Error::internal(format!(
                "block {addr} already cached as {existing}"
            )));
        }
        self.blocks.insert(addr, id);
        Ok(())
    }

    /// Drop the block at `addr` from the index
    pub fn evict_block(&mut self, addr: PhysicalAddress) -> Option<BlockId> {
        let id = self.blocks.remove(&addr.floor())?;
        self.block_stats.evictions.fetch_add(1, Ordering::Relaxed);
        Some(id)
    }

    /// Take the least recently used block out of the index
    pub fn pop_lru_block(&mut self) -> Option<(PhysicalAddress, BlockId)> {
        self.blocks.pop_lru()
    }

    /// Put back a block taken by `pop_lru_block` as most recently used
    pub fn restore_block(&mut self, addr: PhysicalAddress, id: BlockId) {
        self.blocks.insert(addr, id);
    }

    #[must_use]
    pub fn contains_block(&self, addr: PhysicalAddress) -> bool {
        self.blocks.contains(&addr.floor())
    }

    #[must_use]
    pub fn peek_block(&self, addr: PhysicalAddress) -> Option<BlockId> {
        self.blocks.peek(&addr.floor()).copied()
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Cached blocks from least to most recently used
    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.values().copied()
    }

    /// Find the space-map `vaddr`, promoting it to MRU
    pub fn search_space_map(&mut self, vaddr: &VirtualAddress) -> Option<ObjectId> {
        let found = self.space_maps.get(vaddr).copied();
        self.space_map_stats.record(found.is_some());
        found
    }

    pub fn store_space_map(&mut self, vaddr: VirtualAddress, id: ObjectId) -> Result<()> {
        if let Some(existing) = self.space_maps.peek(&vaddr) {
            return Err(Error::internal(format!(
                "space-map {vaddr} already cached as {existing}"
            )));
        }
        self.space_maps.insert(vaddr, id);
        Ok(())
    }

    pub fn evict_space_map(&mut self, vaddr: &VirtualAddress) -> Option<ObjectId> {
        let id = self.space_maps.remove(vaddr)?;
        self.space_map_stats
            .evictions
            .fetch_add(1, Ordering::Relaxed);
        Some(id)
    }

    pub fn pop_lru_space_map(&mut self) -> Option<(VirtualAddress, ObjectId)> {
        self.space_maps.pop_lru()
    }

    pub fn restore_space_map(&mut self, vaddr: VirtualAddress, id: ObjectId) {
        self.space_maps.insert(vaddr, id);
    }

    #[must_use]
    pub fn contains_space_map(&self, vaddr: &VirtualAddress) -> bool {
        self.space_maps.contains(vaddr)
    }

    #[must_use]
    pub fn space_map_count(&self) -> usize {
        self.space_maps.len()
    }

    /// Cached space-maps from least to most recently used
    pub fn space_maps(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.space_maps.values().copied()
    }

    #[must_use]
    pub const fn block_stats(&self) -> &CacheStats {
        &self.block_stats
    }

    #[must_use]
    pub const fn space_map_stats(&self) -> &CacheStats {
        &self.space_map_stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_store_and_search() {
        let mut cache = ObjectCache::new();
        let id = BlockId::from(4);
        cache.store_block(PhysicalAddress::block(130), id).unwrap();

        // Any fragment of the block resolves to it
        assert_eq!(cache.search_block(PhysicalAddress::new(130, 9)), Some(id));
        assert_eq!(cache.search_block(PhysicalAddress::block(131)), None);

        let stats = cache.block_stats();
        assert_eq!(stats.hits.load(Ordering::Relaxed), 1);
        assert_eq!(stats.misses.load(Ordering::Relaxed), 1);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
        stats.reset();
        assert!(stats.hit_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn test_cache_rejects_duplicate() {
        let mut cache = ObjectCache::new();
        cache.store_block(PhysicalAddress::block(130), BlockId::from(1)).unwrap();
        assert!(cache.store_block(PhysicalAddress::new(130, 2), BlockId::from(2)).is_err());

        let vaddr = VirtualAddress::for_space_map(1);
        cache.store_space_map(vaddr, ObjectId::from(0)).unwrap();
        assert!(cache.store_space_map(vaddr, ObjectId::from(1)).is_err());
    }

    #[test]
    fn test_cache_lru_ordering() {
        let mut cache = ObjectCache::new();
        for lba in 130..133 {
            cache
                .store_block(PhysicalAddress::block(lba), BlockId::from(lba as usize))
                .unwrap();
        }
        cache.search_block(PhysicalAddress::block(130));

        let (addr, id) = cache.pop_lru_block().unwrap();
        assert_eq!(addr, PhysicalAddress::block(131));
        cache.restore_block(addr, id);

        let order: Vec<_> = cache.blocks().map(usize::from).collect();
        assert_eq!(order, vec![132, 130, 131]);
    }

    #[test]
    fn test_cache_evict() {
        let mut cache = ObjectCache::new();
        let vaddr = VirtualAddress::for_space_map(2);
        cache.store_space_map(vaddr, ObjectId::from(3)).unwrap();
        assert!(cache.contains_space_map(&vaddr));
        assert_eq!(cache.evict_space_map(&vaddr), Some(ObjectId::from(3)));
        assert_eq!(cache.evict_space_map(&vaddr), None);
        assert_eq!(cache.space_map_count(), 0);
        assert_eq!(cache.space_map_stats().evictions.load(Ordering::Relaxed), 1);
    }
}

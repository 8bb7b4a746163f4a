//! Storage coordinator
//!
//! Resolves virtual objects to physical blocks through the per-region
//! space-maps and keeps blocks and space-maps in the object cache.
//!
//! Every operation answers with one of:
//! - `Ok(Outcome::Done(_))`: completed
//! - `Ok(Outcome::Pending)`: a block it needs has a job in flight; retry
//!   after draining the job queue
//! - `Ok(Outcome::Deferred)`: a write or sync was queued
//! - `Err(_)`: not found, out of space, device or decode failure
//!
//! Reference counting:
//! - an object attached to a block holds one reference on the block
//! - a queued job holds one reference on its block
//! - a block owned by a space-map holds one reference on the space-map
//!
//! A block is freed once it is unreferenced, uncached and has no job.

use crate::arena::{Arena, BlockId, ObjectId};
use crate::block::{BlockRef, JobState};
use crate::cache::ObjectCache;
use crate::codec::{FrameCodec, ObjectCodec, record_len};
use crate::device::BlockDevice;
use crate::io::VolumeIo;
use crate::jobs::{CompletionSink, JobCompletion, PendingJobQueue};
use crate::layout::Superblock;
use crate::object::{ObjectBody, Vnode};
use crate::ops::StorageOps;
use crate::spacemap::SpaceMap;
use std::sync::atomic::Ordering;
use strata_common::{
    CacheConfig, Error, JobKind, ObjectKind, Outcome, PhysicalAddress, REGION_BLOCKS, Result,
    StoreConfig, VirtualAddress, done,
};
use tracing::{debug, error};

/// Restores tolerated per squeeze sweep over space-maps
const SPACE_MAP_RESTORE_LIMIT: usize = 1;

/// Restores tolerated per squeeze sweep over blocks
const BLOCK_RESTORE_LIMIT: usize = 2;

/// Items evicted by one squeeze
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SqueezeReport {
    pub space_maps: usize,
    pub blocks: usize,
}

impl SqueezeReport {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.space_maps + self.blocks
    }
}

/// Space-map resolution and object caching over one volume
pub struct Storage {
    io: VolumeIo,
    ops: StorageOps,
    codec: Box<dyn ObjectCodec>,
    blocks: Arena<BlockId, BlockRef>,
    objects: Arena<ObjectId, Vnode>,
    cache: ObjectCache,
    jobs: PendingJobQueue,
    region_count: u64,
    limits: CacheConfig,
}

fn stale_block(id: BlockId) -> Error {
    Error::internal(format!("stale block handle {id}"))
}

fn stale_object(id: ObjectId) -> Error {
    Error::internal(format!("stale object handle {id}"))
}

impl Storage {
    #[must_use]
    pub fn new(device: Box<dyn BlockDevice>, config: &StoreConfig) -> Self {
        Self::with_codec(device, config, Box::new(FrameCodec))
    }

    #[must_use]
    pub fn with_codec(
        device: Box<dyn BlockDevice>,
        config: &StoreConfig,
        codec: Box<dyn ObjectCodec>,
    ) -> Self {
        let io = VolumeIo::new(device, config.retry);
        let region_count = (io.block_count() / REGION_BLOCKS).saturating_sub(1);
        Self {
            io,
            ops: config.io_mode.into(),
            codec,
            blocks: Arena::new(),
            objects: Arena::new(),
            cache: ObjectCache::new(),
            jobs: PendingJobQueue::new(),
            region_count,
            limits: config.cache,
        }
    }

    #[must_use]
    pub const fn ops(&self) -> StorageOps {
        self.ops
    }

    pub fn set_ops(&mut self, ops: StorageOps) {
        self.ops = ops;
    }

    /// Number of data regions
    #[must_use]
    pub const fn region_count(&self) -> u64 {
        self.region_count
    }

    pub(crate) fn set_region_count(&mut self, region_count: u64) {
        self.region_count = region_count;
    }

    /// Device size in blocks
    #[must_use]
    pub const fn block_count(&self) -> u64 {
        self.io.block_count()
    }

    #[must_use]
    pub const fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&BlockRef> {
        self.blocks.get(id)
    }

    /// Bytes of a block, e.g. one prepared for `spawn`
    pub fn block_data_mut(&mut self, id: BlockId) -> Option<&mut [u8]> {
        self.blocks.get_mut(id).map(|b| &mut b.data[..])
    }

    #[must_use]
    pub fn object(&self, id: ObjectId) -> Option<&Vnode> {
        self.objects.get(id)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut Vnode> {
        self.objects.get_mut(id)
    }

    /// Payload of a data or record object
    #[must_use]
    pub fn payload(&self, id: ObjectId) -> Option<&[u8]> {
        self.objects.get(id).and_then(|v| v.body.bytes())
    }

    pub fn payload_mut(&mut self, id: ObjectId) -> Option<&mut [u8]> {
        self.objects.get_mut(id).and_then(|v| v.body.bytes_mut())
    }

    /// Blocks alive in the arena, cached or not
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Objects alive in the arena, including space-maps
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the block at `addr` is in the object cache
    #[must_use]
    pub fn is_block_cached(&self, addr: PhysicalAddress) -> bool {
        self.cache.contains_block(addr)
    }

    /// Give back the device, dropping all in-memory state
    #[must_use]
    pub fn into_device(self) -> Box<dyn BlockDevice> {
        self.io.into_device()
    }

    fn block_ref(&self, id: BlockId) -> Result<&BlockRef> {
        self.blocks.get(id).ok_or_else(|| stale_block(id))
    }

    fn block_mut(&mut self, id: BlockId) -> Result<&mut BlockRef> {
        self.blocks.get_mut(id).ok_or_else(|| stale_block(id))
    }

    fn vnode(&self, id: ObjectId) -> Result<&Vnode> {
        self.objects.get(id).ok_or_else(|| stale_object(id))
    }

    fn vnode_mut(&mut self, id: ObjectId) -> Result<&mut Vnode> {
        self.objects.get_mut(id).ok_or_else(|| stale_object(id))
    }

    fn space_map(&self, id: ObjectId) -> Result<&SpaceMap> {
        self.vnode(id)?
            .space_map()
            .ok_or_else(|| Error::internal(format!("{id} is not a space-map")))
    }

    fn space_map_mut(&mut self, id: ObjectId) -> Result<&mut SpaceMap> {
        self.vnode_mut(id)?
            .space_map_mut()
            .ok_or_else(|| Error::internal(format!("{id} is not a space-map")))
    }

    pub fn superblock(&self, id: ObjectId) -> Result<&Superblock> {
        self.vnode(id)?
            .body
            .as_super()
            .ok_or_else(|| Error::internal(format!("{id} is not a superblock")))
    }

    pub fn superblock_mut(&mut self, id: ObjectId) -> Result<&mut Superblock> {
        self.vnode_mut(id)?
            .body
            .as_super_mut()
            .ok_or_else(|| Error::internal(format!("{id} is not a superblock")))
    }

    // Allocation

    /// Allocate an unbound, zeroed block
    pub fn new_block(&mut self) -> BlockId {
        self.blocks.insert(BlockRef::new(PhysicalAddress::default()))
    }

    fn new_block_at(&mut self, addr: PhysicalAddress, owner: Option<ObjectId>) -> Result<BlockId> {
        let id = self.blocks.insert(BlockRef::new(addr));
        if let Some(owner) = owner {
            self.attach_space_map(id, owner)?;
        }
        Ok(id)
    }

    /// Free a block nobody references
    pub fn free_block(&mut self, id: BlockId) -> Result<()> {
        let block = self.block_ref(id)?;
        if !block.is_orphan() {
            return Err(Error::internal(format!("block {id} still in use: {block:?}")));
        }
        let owner = self.blocks.remove(id).and_then(|b| b.space_map);
        if let Some(owner) = owner {
            let space_map = self.vnode_mut(owner)?;
            space_map.refcnt = space_map.refcnt.saturating_sub(1);
        }
        Ok(())
    }

    fn new_object(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        body: ObjectBody,
    ) -> ObjectId {
        let mut vnode = Vnode::new(vaddr, body);
        vnode.paddr = paddr;
        vnode.placed = true;
        self.objects.insert(vnode)
    }

    /// Free a block once it is unreferenced, uncached and idle
    fn retire_block(&mut self, id: BlockId) -> Result<()> {
        if self.block_ref(id)?.is_orphan() {
            self.free_block(id)?;
        }
        Ok(())
    }

    fn cache_block(&mut self, id: BlockId) -> Result<()> {
        let block = self.blocks.get_mut(id).ok_or_else(|| stale_block(id))?;
        self.cache.store_block(block.addr, id)?;
        block.cached = true;
        Ok(())
    }

    fn uncache_block(&mut self, id: BlockId) -> Result<()> {
        let block = self.blocks.get_mut(id).ok_or_else(|| stale_block(id))?;
        if block.cached {
            self.cache.evict_block(block.addr);
            block.cached = false;
        }
        Ok(())
    }

    fn attach(&mut self, obj: ObjectId, block: BlockId) -> Result<()> {
        self.block_mut(block)?.refcnt += 1;
        self.vnode_mut(obj)?.block = Some(block);
        Ok(())
    }

    fn detach(&mut self, obj: ObjectId) -> Result<Option<BlockId>> {
        let Some(id) = self.vnode_mut(obj)?.block.take() else {
            return Ok(None);
        };
        let block = self.block_mut(id)?;
        block.refcnt = block
            .refcnt
            .checked_sub(1)
            .ok_or_else(|| Error::internal(format!("refcount underflow on {id}")))?;
        Ok(Some(id))
    }

    fn attach_space_map(&mut self, block: BlockId, owner: ObjectId) -> Result<()> {
        if self.block_ref(block)?.space_map.is_none() {
            self.vnode_mut(owner)?.refcnt += 1;
            self.block_mut(block)?.space_map = Some(owner);
        }
        Ok(())
    }

    fn free_object(&mut self, id: ObjectId) -> Result<()> {
        if let Some(block) = self.detach(id)? {
            self.retire_block(block)?;
        }
        self.objects.remove(id);
        Ok(())
    }

    // Resolution

    /// Block at `addr` (floored), from the cache or the device
    ///
    /// A freshly loaded block is attached to `owner` and cached. A cached
    /// block with a job queued or in flight answers `Pending`.
    pub fn fetch_block(
        &mut self,
        addr: PhysicalAddress,
        owner: Option<ObjectId>,
    ) -> Result<Outcome<BlockId>> {
        let addr = addr.floor();
        if let Some(id) = self.cache.search_block(addr) {
            if self.block_ref(id)?.is_busy() {
                return Ok(Outcome::Pending);
            }
            if let Some(owner) = owner {
                self.attach_space_map(id, owner)?;
            }
            return Ok(Outcome::Done(id));
        }
        self.fetch_stable_block(addr, owner)
    }

    fn fetch_stable_block(
        &mut self,
        addr: PhysicalAddress,
        owner: Option<ObjectId>,
    ) -> Result<Outcome<BlockId>> {
        self.io.verify_lba(addr.lba)?;
        debug!(%addr, "block cache miss");

        let id = self.new_block_at(addr, owner)?;
        let block = self.blocks.get_mut(id).ok_or_else(|| stale_block(id))?;
        match self.ops.load(&mut self.io, &mut self.jobs, id, block) {
            Ok(outcome) => {
                self.cache_block(id)?;
                Ok(outcome.map(|()| id))
            }
            Err(e) => {
                self.free_block(id)?;
                Err(e)
            }
        }
    }

    fn resolve_region(&self, vaddr: &VirtualAddress) -> Result<u64> {
        if vaddr.kind == ObjectKind::Super {
            return Err(Error::internal("the superblock is not space-mapped"));
        }
        if self.region_count == 0 {
            return Err(Error::geometry("volume has no data regions"));
        }
        let region = vaddr.region(self.region_count);
        if region == 0 || region > self.region_count {
            return Err(Error::InvalidAddress {
                lba: region * REGION_BLOCKS,
                block_count: self.block_count(),
            });
        }
        Ok(region)
    }

    /// Space-map governing `vaddr`
    pub fn fetch_space_map(&mut self, vaddr: &VirtualAddress) -> Result<Outcome<ObjectId>> {
        let region = self.resolve_region(vaddr)?;
        self.fetch_space_map_at(region)
    }

    /// Space-map of `region`
    pub fn fetch_space_map_at(&mut self, region: u64) -> Result<Outcome<ObjectId>> {
        let vaddr = VirtualAddress::for_space_map(region);
        if let Some(id) = self.cache.search_space_map(&vaddr) {
            if let Some(block) = self.vnode(id)?.block
                && self.block_ref(block)?.slaved
            {
                return Ok(Outcome::Pending);
            }
            return Ok(Outcome::Done(id));
        }
        self.fetch_stable_space_map(vaddr)
    }

    fn fetch_stable_space_map(&mut self, vaddr: VirtualAddress) -> Result<Outcome<ObjectId>> {
        let addr = PhysicalAddress::block(vaddr.xno * REGION_BLOCKS);
        let block = done!(self.fetch_block(addr, None));

        let decoded = self
            .codec
            .decode(vaddr, &self.block_ref(block)?.data, addr);
        let body = decoded.inspect_err(|e| error!(%vaddr, %addr, error = %e, "bad space-map"))?;

        let id = self.new_object(vaddr, addr, body);
        self.attach(id, block)?;
        self.cache.store_space_map(vaddr, id)?;
        self.vnode_mut(id)?.cached = true;
        debug!(region = vaddr.xno, "space-map loaded");
        Ok(Outcome::Done(id))
    }

    fn predict_in(
        &self,
        space_map: ObjectId,
        vaddr: &VirtualAddress,
    ) -> Result<(PhysicalAddress, u32)> {
        let map = self.space_map(space_map)?;
        let out_of_space = || Error::OutOfSpace {
            region: map.region(),
            vaddr: *vaddr,
        };
        let paddr = map.predict(vaddr.kind).ok_or_else(out_of_space)?;
        let usage = map.usage_at(paddr.lba).ok_or_else(out_of_space)?;
        Ok((paddr, usage))
    }

    /// Whether `vaddr` currently has a mapping
    pub fn is_mapped(&mut self, vaddr: &VirtualAddress) -> Result<Outcome<bool>> {
        let space_map = done!(self.fetch_space_map(vaddr));
        Ok(Outcome::Done(self.space_map(space_map)?.lookup(vaddr).is_some()))
    }

    /// Make sure a later `spawn(vaddr)` will not have to wait
    ///
    /// Loads the space-map and, when the predicted block already holds
    /// other objects, the block itself.
    pub fn require(&mut self, vaddr: &VirtualAddress) -> Result<Outcome<()>> {
        let space_map = done!(self.fetch_space_map(vaddr));
        let (paddr, usage) = self.predict_in(space_map, vaddr)?;
        if usage > 0 {
            done!(self.fetch_block(paddr, Some(space_map)));
        }
        Ok(Outcome::Done(()))
    }

    /// Load an existing object
    pub fn stage(&mut self, vaddr: &VirtualAddress) -> Result<Outcome<ObjectId>> {
        let space_map = done!(self.fetch_space_map(vaddr));
        let paddr = self
            .space_map(space_map)?
            .lookup(vaddr)
            .ok_or(Error::NotFound { vaddr: *vaddr })?;
        self.io.verify_lba(paddr.lba)?;

        let block = done!(self.fetch_block(paddr, Some(space_map)));
        let decoded = self
            .codec
            .decode(*vaddr, &self.block_ref(block)?.data, paddr);
        let body = decoded.inspect_err(|e| error!(%vaddr, %paddr, error = %e, "decode failed"))?;

        let id = self.new_object(*vaddr, paddr, body);
        self.vnode_mut(id)?.refcnt = 1;
        self.attach(id, block)?;

        // The object now holds the only reference a data block needs
        if vaddr.kind.is_data_block() {
            self.uncache_block(block)?;
        }
        Ok(Outcome::Done(id))
    }

    /// Allocate and map a new object
    ///
    /// `supplied` is a block prepared by the caller (see [`Self::new_block`])
    /// to be bound at the allocated location; it must land on an unused
    /// block.
    pub fn spawn(
        &mut self,
        vaddr: &VirtualAddress,
        supplied: Option<BlockId>,
    ) -> Result<Outcome<ObjectId>> {
        if matches!(vaddr.kind, ObjectKind::Super | ObjectKind::SpaceMap) {
            return Err(Error::internal(format!("{} objects are not spawned", vaddr.kind)));
        }
        let space_map = done!(self.fetch_space_map(vaddr));
        if self.space_map(space_map)?.lookup(vaddr).is_some() {
            return Err(Error::AlreadyMapped { vaddr: *vaddr });
        }
        let (paddr, usage) = self.predict_in(space_map, vaddr)?;
        self.io.verify_lba(paddr.lba)?;

        let block = match supplied {
            Some(block) => {
                self.bind_block(block, vaddr, paddr, usage)?;
                block
            }
            None if usage == 0 => done!(self.obtain_zeroed_block(paddr, space_map)),
            None => done!(self.fetch_block(paddr, Some(space_map))),
        };

        let region = self.space_map(space_map)?.region();
        match self.space_map_mut(space_map)?.insert(*vaddr) {
            Some(placed) if placed == paddr => {}
            Some(placed) => {
                self.space_map_mut(space_map)?.remove(vaddr);
                self.retire_block(block)?;
                return Err(Error::internal(format!(
                    "{vaddr} placed at {placed}, predicted {paddr}"
                )));
            }
            None => {
                self.retire_block(block)?;
                return Err(Error::OutOfSpace {
                    region,
                    vaddr: *vaddr,
                });
            }
        }

        let body = if vaddr.kind.is_data_block() {
            ObjectBody::Data(self.block_ref(block)?.data.to_vec())
        } else {
            ObjectBody::Record(vec![0u8; record_len(vaddr.kind)])
        };
        let id = self.new_object(*vaddr, paddr, body);
        self.vnode_mut(id)?.refcnt = 1;
        self.attach(id, block)?;
        self.space_map_mut(space_map)?.mark_dirty();

        self.attach_space_map(block, space_map)?;
        if !self.block_ref(block)?.cached {
            self.cache_block(block)?;
        }
        debug!(%vaddr, %paddr, "spawned");
        Ok(Outcome::Done(id))
    }

    /// A supplied block replaces the whole target block, so the target
    /// must hold no objects and must not be cached.
    fn bind_block(
        &mut self,
        id: BlockId,
        vaddr: &VirtualAddress,
        paddr: PhysicalAddress,
        usage: u32,
    ) -> Result<()> {
        let addr = paddr.floor();
        if usage > 0 || self.cache.contains_block(addr) {
            return Err(Error::BlockInUse {
                lba: addr.lba,
                vaddr: *vaddr,
            });
        }
        let block = self.block_mut(id)?;
        if block.cached || block.is_busy() || block.space_map.is_some() {
            return Err(Error::internal(format!("supplied block {id} is not free")));
        }
        block.addr = addr;
        Ok(())
    }

    /// Reuse the cached block at `addr` or allocate one, zeroed, without I/O
    fn obtain_zeroed_block(
        &mut self,
        addr: PhysicalAddress,
        owner: ObjectId,
    ) -> Result<Outcome<BlockId>> {
        let addr = addr.floor();
        let id = match self.cache.search_block(addr) {
            Some(id) => {
                if self.block_ref(id)?.is_busy() {
                    return Ok(Outcome::Pending);
                }
                id
            }
            None => self.new_block_at(addr, Some(owner))?,
        };
        self.block_mut(id)?.zero();
        Ok(Outcome::Done(id))
    }

    // Write-back

    /// Encode an object into its block and save the block
    pub fn commit(&mut self, id: ObjectId) -> Result<Outcome<()>> {
        let vnode = self.objects.get(id).ok_or_else(|| stale_object(id))?;
        let (vaddr, paddr) = (vnode.vaddr, vnode.paddr);
        if !vnode.placed || paddr.is_null() {
            return Err(Error::internal(format!("{vaddr} has no location")));
        }
        let block_id = vnode
            .block
            .ok_or_else(|| Error::internal(format!("{vaddr} has no backing block")))?;
        let block = self.blocks.get_mut(block_id).ok_or_else(|| stale_block(block_id))?;
        if block.refcnt == 0 || block.slaved || !block.cached || block.addr != paddr.floor() {
            return Err(Error::internal(format!(
                "{vaddr} at {paddr} cannot be committed to {block:?}"
            )));
        }

        self.codec.encode(vaddr, &vnode.body, &mut block.data, paddr)?;
        let outcome = self.ops.save(&mut self.io, &mut self.jobs, block_id, block)?;

        // The block now holds this encoding; a failed write re-dirties it
        if let Some(map) = self.vnode_mut(id)?.space_map_mut() {
            map.mark_clean();
        }
        Ok(outcome)
    }

    /// Remove an object's mapping from its space-map
    ///
    /// A data block's backing block is dropped from the cache at once and
    /// freed if nothing else references it.
    pub fn unmap(&mut self, id: ObjectId) -> Result<Outcome<()>> {
        let vnode = self.vnode(id)?;
        let vaddr = vnode.vaddr;
        if matches!(vaddr.kind, ObjectKind::Super | ObjectKind::SpaceMap) {
            return Err(Error::internal(format!("{vaddr} cannot be unmapped")));
        }
        if !vnode.placed {
            return Err(Error::internal(format!("{vaddr} is not placed")));
        }

        let space_map = done!(self.fetch_space_map(&vaddr));
        self.space_map_mut(space_map)?
            .remove(&vaddr)
            .ok_or(Error::NotFound { vaddr })?;
        self.vnode_mut(id)?.placed = false;

        if vaddr.kind.is_data_block()
            && let Some(block) = self.detach(id)?
        {
            self.uncache_block(block)?;
            self.retire_block(block)?;
        }
        self.space_map_mut(space_map)?.mark_dirty();
        debug!(%vaddr, "unmapped");
        Ok(Outcome::Done(()))
    }

    /// Barrier on an object's backing block
    pub fn sync_object(&mut self, id: ObjectId) -> Result<Outcome<()>> {
        let vnode = self.vnode(id)?;
        let block_id = vnode
            .block
            .ok_or_else(|| Error::internal(format!("{} has no backing block", vnode.vaddr)))?;
        let block = self.blocks.get_mut(block_id).ok_or_else(|| stale_block(block_id))?;
        if block.slaved {
            return Err(Error::internal(format!("block {} is in flight", block.addr)));
        }
        self.ops.sync(&mut self.io, &mut self.jobs, block_id, block)
    }

    /// Flush the device
    pub fn sync_device(&mut self) -> Result<()> {
        self.io.sync()
    }

    /// Commit every dirty cached space-map
    pub fn flush(&mut self) -> Result<Outcome<()>> {
        let dirty: Vec<ObjectId> = self
            .cache
            .space_maps()
            .filter(|id| {
                self.objects
                    .get(*id)
                    .and_then(Vnode::space_map)
                    .is_some_and(SpaceMap::is_dirty)
            })
            .collect();

        let mut pending = false;
        let mut deferred = false;
        for id in dirty {
            if let Some(block) = self.vnode(id)?.block
                && self.block_ref(block)?.slaved
            {
                pending = true;
                continue;
            }
            match self.commit(id)? {
                Outcome::Done(()) => {}
                Outcome::Pending => pending = true,
                Outcome::Deferred => deferred = true,
            }
        }
        Ok(if pending {
            Outcome::Pending
        } else if deferred {
            Outcome::Deferred
        } else {
            Outcome::Done(())
        })
    }

    // Lifetime

    pub fn pin(&mut self, id: ObjectId) -> Result<()> {
        self.vnode_mut(id)?.pinned = true;
        Ok(())
    }

    /// Clear the pin; the object is freed if no reference remains
    pub fn unpin(&mut self, id: ObjectId) -> Result<()> {
        let vnode = self.vnode_mut(id)?;
        vnode.pinned = false;
        if vnode.refcnt == 0 {
            self.free_object(id)?;
        }
        Ok(())
    }

    /// Drop one consumer reference on a staged or spawned object
    ///
    /// At zero the object is freed and its block retired. Pinned objects
    /// stay until unpinned.
    pub fn release(&mut self, id: ObjectId) -> Result<()> {
        let vnode = self.vnode_mut(id)?;
        if vnode.kind() == ObjectKind::SpaceMap {
            return Err(Error::internal("space-maps are released by squeeze"));
        }
        vnode.refcnt = vnode.refcnt.saturating_sub(1);
        if vnode.refcnt == 0 && !vnode.pinned {
            self.free_object(id)?;
        }
        Ok(())
    }

    fn space_map_evictable(&self, id: ObjectId) -> Result<bool> {
        let vnode = self.vnode(id)?;
        let busy = match vnode.block {
            Some(block) => self.block_ref(block)?.is_busy(),
            None => false,
        };
        let dirty = vnode.space_map().is_some_and(SpaceMap::is_dirty);
        Ok(vnode.refcnt == 0 && !busy && !dirty && !vnode.pinned)
    }

    fn evict_space_map(&mut self, id: ObjectId) -> Result<()> {
        self.vnode_mut(id)?.cached = false;
        self.free_object(id)
    }

    fn evict_block(&mut self, id: BlockId) -> Result<()> {
        self.block_mut(id)?.cached = false;
        self.free_block(id)
    }

    fn squeeze_blocks(&mut self, count: usize) -> Result<usize> {
        let mut evicted = 0;
        let mut restored = 0;
        for _ in 0..count {
            if restored >= BLOCK_RESTORE_LIMIT {
                break;
            }
            let Some((addr, id)) = self.cache.pop_lru_block() else {
                break;
            };
            let block = self.block_ref(id)?;
            if block.is_evictable() && block.job.is_idle() {
                self.evict_block(id)?;
                self.cache.block_stats().evictions.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
            } else {
                self.cache.restore_block(addr, id);
                restored += 1;
            }
        }
        Ok(evicted)
    }

    fn squeeze_space_maps(&mut self, count: usize) -> Result<usize> {
        let mut evicted = 0;
        let mut restored = 0;
        for _ in 0..count {
            if restored >= SPACE_MAP_RESTORE_LIMIT {
                break;
            }
            let Some((vaddr, id)) = self.cache.pop_lru_space_map() else {
                break;
            };
            if self.space_map_evictable(id)? {
                self.evict_space_map(id)?;
                self.cache
                    .space_map_stats()
                    .evictions
                    .fetch_add(1, Ordering::Relaxed);
                evicted += 1;
            } else {
                self.cache.restore_space_map(vaddr, id);
                restored += 1;
            }
        }
        Ok(evicted)
    }

    /// Evict up to `count` space-maps, then up to `count` blocks
    ///
    /// Each sweep stops early once it has put back too many busy entries,
    /// so the cost is bounded even when everything is referenced.
    pub fn squeeze(&mut self, count: usize) -> Result<SqueezeReport> {
        // Space-maps first: blocks they release are reclaimed in the same pass
        let space_maps = self.squeeze_space_maps(count)?;
        let report = SqueezeReport {
            space_maps,
            blocks: self.squeeze_blocks(count)?,
        };
        if report.total() > 0 {
            debug!(blocks = report.blocks, space_maps = report.space_maps, "squeezed");
        }
        Ok(report)
    }

    /// Squeeze the cache back under its configured capacities
    pub fn relax(&mut self) -> Result<SqueezeReport> {
        let space_maps = self
            .cache
            .space_map_count()
            .saturating_sub(self.limits.space_map_capacity);
        let space_maps = self.squeeze_space_maps(space_maps)?;
        let blocks = self
            .cache
            .block_count()
            .saturating_sub(self.limits.block_capacity);
        Ok(SqueezeReport {
            space_maps,
            blocks: self.squeeze_blocks(blocks)?,
        })
    }

    /// Evict everything evictable, regardless of LRU position
    pub fn drain_cache(&mut self) -> Result<SqueezeReport> {
        let mut report = SqueezeReport::default();
        loop {
            let mut progress = false;

            let blocks: Vec<BlockId> = self.cache.blocks().collect();
            for id in blocks {
                let block = self.block_ref(id)?;
                if block.is_evictable() && block.job.is_idle() {
                    let addr = block.addr;
                    self.cache.evict_block(addr);
                    self.evict_block(id)?;
                    report.blocks += 1;
                    progress = true;
                }
            }

            let space_maps: Vec<ObjectId> = self.cache.space_maps().collect();
            for id in space_maps {
                if self.space_map_evictable(id)? {
                    let vaddr = self.vnode(id)?.vaddr;
                    self.cache.evict_space_map(&vaddr);
                    self.evict_space_map(id)?;
                    report.space_maps += 1;
                    progress = true;
                }
            }

            if !progress {
                return Ok(report);
            }
        }
    }

    // Job execution

    /// Dequeue the next job and mark its block in flight
    pub fn pop_job(&mut self) -> Result<Option<BlockId>> {
        let Some(id) = self.jobs.pop() else {
            return Ok(None);
        };
        self.block_mut(id)?.slaved = true;
        Ok(Some(id))
    }

    /// Perform the device I/O of a dispatched job
    pub fn execute_job(&mut self, id: BlockId) -> Result<JobCompletion> {
        let block = self.blocks.get_mut(id).ok_or_else(|| stale_block(id))?;
        let JobState::Queued(kind) = block.job else {
            return Err(Error::internal(format!("block {id} has no queued job")));
        };
        if !block.slaved {
            return Err(Error::internal(format!("block {id} was not dispatched")));
        }

        let lba = block.addr.lba;
        let status = match kind {
            JobKind::Read => self.io.read(lba, &mut block.data),
            JobKind::Write => self.io.write(lba, &block.data),
            JobKind::Sync => self.io.sync(),
        };
        match &status {
            Ok(()) => debug!(lba, %kind, "job done"),
            Err(e) => error!(lba, %kind, error = %e, "job failed"),
        }
        Ok(JobCompletion {
            block: id,
            addr: block.addr,
            kind,
            status,
        })
    }

    /// Return a block to idle after its job ran
    ///
    /// A block whose read failed is dropped from the cache so that the
    /// next fetch reloads it. A space-map whose write failed is marked
    /// dirty again and stays cached until a later flush lands it.
    pub fn complete_job(&mut self, completion: &JobCompletion) -> Result<()> {
        let id = completion.block;
        let block = self.block_mut(id)?;
        if !block.slaved {
            return Err(Error::internal(format!("block {id} is not in flight")));
        }
        block.job = JobState::Idle;
        block.slaved = false;
        block.refcnt = block.refcnt.saturating_sub(1);

        if completion.status.is_err() {
            match completion.kind {
                JobKind::Read => self.uncache_block(id)?,
                JobKind::Write => {
                    if let Some(map) = self.space_map_backed_by(id)? {
                        map.mark_dirty();
                    }
                }
                JobKind::Sync => {}
            }
        }
        self.retire_block(id)
    }

    /// Cached space-map whose own block is `block`
    fn space_map_backed_by(&mut self, block: BlockId) -> Result<Option<&mut SpaceMap>> {
        let found = self
            .cache
            .space_maps()
            .find(|id| self.objects.get(*id).is_some_and(|v| v.block == Some(block)));
        match found {
            Some(id) => self.space_map_mut(id).map(Some),
            None => Ok(None),
        }
    }

    /// Drain the job queue, reporting each completion to `sink`
    pub fn run_jobs(&mut self, sink: &mut impl CompletionSink) -> Result<usize> {
        let mut executed = 0;
        while let Some(id) = self.pop_job()? {
            let completion = self.execute_job(id)?;
            self.complete_job(&completion)?;
            sink.notify(completion);
            executed += 1;
        }
        Ok(executed)
    }

    // Boot support

    /// Write a freshly built object straight to the device
    pub(crate) fn write_fresh(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        body: &ObjectBody,
    ) -> Result<()> {
        let mut block = BlockRef::new(paddr);
        self.codec.encode(vaddr, body, &mut block.data, paddr)?;
        self.io.write(block.addr.lba, &block.data)
    }

    /// Load a well-known object outside any space-map and pin it
    ///
    /// On failure the block is dropped again.
    pub(crate) fn load_pinned(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
    ) -> Result<ObjectId> {
        let block = match self.fetch_block(paddr, None)? {
            Outcome::Done(block) => block,
            Outcome::Pending | Outcome::Deferred => {
                return Err(Error::internal(format!("{vaddr} load did not complete")));
            }
        };
        let decoded = self
            .codec
            .decode(vaddr, &self.block_ref(block)?.data, paddr);
        let body = match decoded {
            Ok(body) => body,
            Err(e) => {
                self.uncache_block(block)?;
                self.retire_block(block)?;
                return Err(e);
            }
        };

        let id = self.new_object(vaddr, paddr, body);
        let vnode = self.vnode_mut(id)?;
        vnode.refcnt = 1;
        vnode.pinned = true;
        self.attach(id, block)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceStats, MemoryDevice};
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use strata_common::{IoMode, REGION_SIZE};

    const REGIONS: u64 = 3;

    /// Formatted in-memory volume: superblock plus empty space-maps
    fn volume() -> MemoryDevice {
        let size = (REGIONS + 1) * REGION_SIZE;
        let mut dev = MemoryDevice::new(size);
        let codec = FrameCodec;
        let sb = Superblock::new(size).unwrap();
        let sb_addr = PhysicalAddress::block(1);
        codec
            .encode(
                VirtualAddress::for_super(),
                &ObjectBody::Super(sb),
                dev.block_mut(1),
                sb_addr,
            )
            .unwrap();
        for region in 1..=REGIONS {
            let map = SpaceMap::new(region);
            let addr = map.address();
            codec
                .encode(
                    VirtualAddress::for_space_map(region),
                    &ObjectBody::SpaceMap(Box::new(map)),
                    dev.block_mut(addr.lba),
                    addr,
                )
                .unwrap();
        }
        dev
    }

    fn storage_with(mode: IoMode) -> (Storage, Arc<DeviceStats>) {
        let dev = volume();
        let stats = dev.stats();
        let config = StoreConfig {
            io_mode: mode,
            ..StoreConfig::default()
        };
        (Storage::new(Box::new(dev), &config), stats)
    }

    fn storage() -> (Storage, Arc<DeviceStats>) {
        storage_with(IoMode::Sync)
    }

    fn inode(ino: u64) -> VirtualAddress {
        VirtualAddress::for_inode(ObjectKind::Inode, ino)
    }

    fn done<T: std::fmt::Debug>(outcome: Result<Outcome<T>>) -> T {
        match outcome.unwrap() {
            Outcome::Done(v) => v,
            other => panic!("expected Done, got {other:?}"),
        }
    }

    /// Every cached flag agrees with cache membership
    fn assert_cache_consistent(storage: &Storage) {
        for (id, block) in storage.blocks.iter() {
            assert_eq!(
                block.cached,
                storage.cache.peek_block(block.addr) == Some(id),
                "block {id} at {}",
                block.addr
            );
        }
        for (id, vnode) in storage.objects.iter() {
            if vnode.kind() == ObjectKind::SpaceMap {
                assert_eq!(vnode.cached, storage.cache.contains_space_map(&vnode.vaddr));
            }
        }
        assert_eq!(
            storage.cache.block_count(),
            storage.blocks.iter().filter(|(_, b)| b.cached).count()
        );
    }

    #[test]
    fn test_cold_then_warm_fetch() {
        let (mut storage, stats) = storage();
        let addr = PhysicalAddress::new(130, 3);

        let id = done(storage.fetch_block(addr, None));
        assert_eq!(stats.reads(), 1);
        assert!(storage.block(id).unwrap().cached);
        assert!(storage.is_block_cached(PhysicalAddress::block(130)));

        let again = done(storage.fetch_block(PhysicalAddress::block(130), None));
        assert_eq!(again, id);
        assert_eq!(stats.reads(), 1);
        assert_cache_consistent(&storage);
    }

    #[test]
    fn test_fetch_rejects_out_of_range() {
        let (mut storage, stats) = storage();
        let beyond = PhysicalAddress::block(storage.block_count());
        assert!(matches!(
            storage.fetch_block(beyond, None),
            Err(Error::InvalidAddress { .. })
        ));
        assert!(storage.fetch_block(PhysicalAddress::block(0), None).is_err());
        assert_eq!(stats.reads(), 0);
        assert_eq!(storage.live_blocks(), 0);
    }

    #[test]
    fn test_device_error_releases_block() {
        let mut dev = volume();
        dev.fail_next(1, std::io::ErrorKind::PermissionDenied);
        let mut storage = Storage::new(Box::new(dev), &StoreConfig::default());

        assert!(matches!(
            storage.fetch_block(PhysicalAddress::block(140), None),
            Err(Error::DiskIo(_))
        ));
        assert_eq!(storage.live_blocks(), 0);
        assert!(!storage.is_block_cached(PhysicalAddress::block(140)));
    }

    #[test]
    fn test_fetch_space_map() {
        let (mut storage, stats) = storage();
        let vaddr = inode(7);
        let sm = done(storage.fetch_space_map(&vaddr));
        let region = vaddr.region(REGIONS);

        let vnode = storage.object(sm).unwrap();
        assert_eq!(vnode.vaddr, VirtualAddress::for_space_map(region));
        assert_eq!(vnode.paddr, PhysicalAddress::block(region * REGION_BLOCKS));
        assert!(vnode.cached);
        assert_eq!(stats.reads(), 1);

        assert_eq!(done(storage.fetch_space_map_at(region)), sm);
        assert_eq!(stats.reads(), 1);
        assert_cache_consistent(&storage);
    }

    #[test]
    fn test_corrupt_space_map_is_reported() {
        let mut dev = volume();
        dev.block_mut(2 * REGION_BLOCKS).fill(0xFF);
        let mut storage = Storage::new(Box::new(dev), &StoreConfig::default());

        assert!(matches!(
            storage.fetch_space_map_at(2),
            Err(Error::Decode(_))
        ));
        assert!(!storage.cache().contains_space_map(&VirtualAddress::for_space_map(2)));
        assert_eq!(storage.live_objects(), 0);
    }

    #[test]
    fn test_spawn_commit_stage_roundtrip() {
        let (mut storage, _) = storage();
        let vaddr = inode(42);

        let id = done(storage.spawn(&vaddr, None));
        storage.payload_mut(id).unwrap()[..11].copy_from_slice(b"hello inode");
        done(storage.commit(id));
        let written = storage.payload(id).unwrap().to_vec();
        storage.release(id).unwrap();
        done(storage.flush());

        // Cold restart on the same device
        let dev = storage.into_device();
        let mut storage = Storage::new(dev, &StoreConfig::default());
        let staged = done(storage.stage(&vaddr));
        assert_eq!(storage.payload(staged).unwrap(), &written[..]);
        assert!(storage.object(staged).unwrap().placed);
    }

    #[test]
    fn test_spawn_on_empty_block_does_not_read() {
        let (mut storage, stats) = storage();
        let vaddr = inode(1);
        done(storage.require(&vaddr));
        let reads = stats.reads();

        let id = done(storage.spawn(&vaddr, None));
        assert_eq!(stats.reads(), reads);

        let vnode = storage.object(id).unwrap();
        let block = storage.block(vnode.block.unwrap()).unwrap();
        assert!(block.cached);
        assert!(block.data.iter().all(|&b| b == 0));
        assert_eq!(block.refcnt, 1);
        assert!(block.space_map.is_some());
        assert_cache_consistent(&storage);
    }

    #[test]
    fn test_spawn_into_used_block_reads_it() {
        let (mut storage, stats) = storage();
        let first = done(storage.spawn(&inode(1), None));
        done(storage.commit(first));
        let lba = storage.object(first).unwrap().paddr.lba;
        storage.release(first).unwrap();
        storage.drain_cache().unwrap();
        assert!(!storage.is_block_cached(PhysicalAddress::block(lba)));

        // Find another inode landing in the same region
        let region = inode(1).region(REGIONS);
        let other = (2..1000)
            .map(inode)
            .find(|v| v.region(REGIONS) == region)
            .unwrap();
        let reads = stats.reads();
        let id = done(storage.spawn(&other, None));
        assert_eq!(storage.object(id).unwrap().paddr.lba, lba);
        assert!(stats.reads() > reads);
    }

    #[test]
    fn test_spawn_twice_is_rejected() {
        let (mut storage, _) = storage();
        let vaddr = inode(3);
        done(storage.spawn(&vaddr, None));
        assert!(matches!(
            storage.spawn(&vaddr, None),
            Err(Error::AlreadyMapped { .. })
        ));
        assert!(storage
            .spawn(&VirtualAddress::for_space_map(1), None)
            .is_err());
    }

    #[test]
    fn test_spawn_with_supplied_block() {
        let (mut storage, stats) = storage();
        let vaddr = VirtualAddress::for_data_block(9);

        let block = storage.new_block();
        storage.block_data_mut(block).unwrap().fill(0x5A);
        let id = done(storage.spawn(&vaddr, Some(block)));

        let vnode = storage.object(id).unwrap();
        assert_eq!(vnode.block, Some(block));
        assert_eq!(vnode.paddr.frg, 0);
        assert!(storage.payload(id).unwrap().iter().all(|&b| b == 0x5A));
        assert!(storage.block(block).unwrap().cached);

        done(storage.commit(id));
        storage.release(id).unwrap();
        done(storage.flush());

        let dev = storage.into_device();
        let mut storage = Storage::new(dev, &StoreConfig::default());
        let staged = done(storage.stage(&vaddr));
        assert!(storage.payload(staged).unwrap().iter().all(|&b| b == 0x5A));
        assert!(stats.writes() >= 2);
    }

    #[test]
    fn test_supplied_block_onto_used_block() {
        let (mut storage, _) = storage();
        let first = done(storage.spawn(&inode(30), None));
        let paddr = storage.object(first).unwrap().paddr;

        // Find another inode that lands in the same block
        let regions = storage.region_count();
        let region = inode(30).region(regions);
        let second = (31..10_000)
            .map(inode)
            .find(|v| v.region(regions) == region)
            .unwrap();

        let block = storage.new_block();
        let err = storage.spawn(&second, Some(block)).unwrap_err();
        assert!(
            matches!(err, Error::BlockInUse { lba, vaddr } if lba == paddr.lba && vaddr == second),
            "{err:?}"
        );
        assert!(!done(storage.is_mapped(&second)));
        assert!(done(storage.is_mapped(&inode(30))));
        assert_cache_consistent(&storage);
    }

    #[test]
    fn test_stage_data_block_leaves_cache() {
        let (mut storage, _) = storage();
        let vaddr = VirtualAddress::for_data_block(5);
        let id = done(storage.spawn(&vaddr, None));
        storage.payload_mut(id).unwrap().fill(0xAB);
        done(storage.commit(id));
        storage.release(id).unwrap();

        let staged = done(storage.stage(&vaddr));
        let block = storage.object(staged).unwrap().block.unwrap();
        assert!(!storage.block(block).unwrap().cached);
        assert_eq!(storage.block(block).unwrap().refcnt, 1);
        assert!(storage.payload(staged).unwrap().iter().all(|&b| b == 0xAB));
        assert_cache_consistent(&storage);

        // Releasing the only reference frees the block
        let live = storage.live_blocks();
        storage.release(staged).unwrap();
        assert_eq!(storage.live_blocks(), live - 1);
    }

    #[test]
    fn test_stage_missing_is_not_found() {
        let (mut storage, _) = storage();
        let err = storage.stage(&inode(77)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_unmap_then_stage_is_not_found() {
        let (mut storage, _) = storage();
        let vaddr = inode(11);
        let id = done(storage.spawn(&vaddr, None));
        done(storage.commit(id));

        done(storage.unmap(id));
        assert!(!storage.object(id).unwrap().placed);
        assert!(storage.stage(&vaddr).unwrap_err().is_not_found());
        assert!(storage.commit(id).is_err());
        storage.release(id).unwrap();

        // Space-map change reaches the device through flush
        done(storage.flush());
        let dev = storage.into_device();
        let mut storage = Storage::new(dev, &StoreConfig::default());
        assert!(storage.stage(&vaddr).unwrap_err().is_not_found());
    }

    #[test]
    fn test_unmap_data_block_evicts_it() {
        let (mut storage, _) = storage();
        let vaddr = VirtualAddress::for_data_block(3);
        let id = done(storage.spawn(&vaddr, None));
        let addr = storage.object(id).unwrap().paddr;
        let live = storage.live_blocks();

        done(storage.unmap(id));
        assert!(!storage.is_block_cached(addr));
        assert_eq!(storage.live_blocks(), live - 1);
        assert_eq!(storage.object(id).unwrap().block, None);
        assert!(matches!(storage.unmap(id), Err(Error::Internal(_))));
        storage.release(id).unwrap();
        assert_cache_consistent(&storage);
    }

    #[test]
    fn test_out_of_space() {
        let (mut storage, _) = storage();
        let region = 1;
        let mut xno = 0;
        let mut placed = 0;
        loop {
            xno += 1;
            let vaddr = VirtualAddress::for_data_block(xno);
            if vaddr.region(REGIONS) != region {
                continue;
            }
            match storage.spawn(&vaddr, None) {
                Ok(Outcome::Done(id)) => {
                    storage.release(id).unwrap();
                    placed += 1;
                }
                Err(e) => {
                    assert!(e.is_out_of_space(), "{e}");
                    break;
                }
                Ok(other) => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(placed, 126);
        assert!(storage.require(&VirtualAddress::for_data_block(xno)).is_err());
    }

    #[test]
    fn test_commit_preconditions() {
        let (mut storage, _) = storage();
        let id = done(storage.spawn(&inode(5), None));
        let block = storage.object(id).unwrap().block.unwrap();

        storage.blocks.get_mut(block).unwrap().slaved = true;
        assert!(matches!(storage.commit(id), Err(Error::Internal(_))));
        storage.blocks.get_mut(block).unwrap().slaved = false;

        storage.uncache_block(block).unwrap();
        assert!(matches!(storage.commit(id), Err(Error::Internal(_))));
    }

    #[test]
    fn test_squeeze_after_commit_and_sync() {
        let (mut storage, stats) = storage();
        let id = done(storage.spawn(&inode(8), None));
        let addr = storage.object(id).unwrap().paddr;
        done(storage.commit(id));
        done(storage.sync_object(id));
        assert_eq!(stats.syncs(), 1);
        storage.release(id).unwrap();
        done(storage.flush());

        storage.squeeze(usize::MAX).unwrap();
        assert!(!storage.is_block_cached(addr));
        assert_cache_consistent(&storage);
    }

    #[test]
    fn test_squeeze_never_evicts_referenced() {
        let (mut storage, _) = storage();
        let held: Vec<ObjectId> = (1..=6)
            .map(|ino| done(storage.spawn(&inode(ino), None)))
            .collect();
        let addrs: Vec<PhysicalAddress> = held
            .iter()
            .map(|id| storage.object(*id).unwrap().paddr)
            .collect();

        for _ in 0..5 {
            storage.squeeze(usize::MAX).unwrap();
        }
        for addr in addrs {
            assert!(storage.is_block_cached(addr));
        }
        for id in &held {
            assert!(storage.object(*id).is_some());
        }
        assert_cache_consistent(&storage);
    }

    #[test]
    fn test_squeeze_is_bounded() {
        let (mut storage, _) = storage();
        for lba in 200..220 {
            done(storage.fetch_block(PhysicalAddress::block(lba), None));
        }
        assert_eq!(storage.cache().block_count(), 20);

        let report = storage.squeeze(5).unwrap();
        assert_eq!(report.blocks, 5);
        assert_eq!(storage.cache().block_count(), 15);

        // Everything referenced: the sweep gives up after two restores
        let ids: Vec<BlockId> = storage.cache().blocks().collect();
        for id in &ids {
            storage.blocks.get_mut(*id).unwrap().refcnt = 1;
        }
        let report = storage.squeeze(usize::MAX).unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(storage.cache().block_count(), 15);
        assert_cache_consistent(&storage);
    }

    #[test]
    fn test_squeeze_space_maps() {
        let (mut storage, _) = storage();
        for region in 1..=REGIONS {
            done(storage.fetch_space_map_at(region));
        }
        assert_eq!(storage.cache().space_map_count(), 3);

        // Blocks released by the evicted maps go in the same pass
        let report = storage.squeeze(usize::MAX).unwrap();
        assert_eq!(report.space_maps, 3);
        assert_eq!(report.blocks, 3);
        assert_eq!(storage.live_objects(), 0);
        assert_eq!(storage.live_blocks(), 0);
        assert_eq!(storage.cache().block_count(), 0);
    }

    #[test]
    fn test_dirty_space_map_survives_squeeze() {
        let (mut storage, _) = storage();
        let id = done(storage.spawn(&inode(4), None));
        done(storage.commit(id));
        storage.release(id).unwrap();

        storage.drain_cache().unwrap();
        assert_eq!(storage.cache().space_map_count(), 1);

        done(storage.flush());
        storage.drain_cache().unwrap();
        assert_eq!(storage.cache().space_map_count(), 0);
        assert_eq!(storage.live_blocks(), 0);
        assert_eq!(storage.live_objects(), 0);
    }

    #[test]
    fn test_relax_honours_capacity() {
        let dev = volume();
        let config = StoreConfig {
            cache: CacheConfig {
                block_capacity: 4,
                space_map_capacity: 1,
            },
            ..StoreConfig::default()
        };
        let mut storage = Storage::new(Box::new(dev), &config);
        for lba in 200..210 {
            done(storage.fetch_block(PhysicalAddress::block(lba), None));
        }
        let report = storage.relax().unwrap();
        assert_eq!(report.blocks, 6);
        assert_eq!(storage.cache().block_count(), 4);
    }

    #[test]
    fn test_deferred_fetch_resolves_after_jobs() {
        let (mut storage, stats) = storage_with(IoMode::Deferred);
        let addr = PhysicalAddress::block(150);

        assert_eq!(storage.fetch_block(addr, None).unwrap(), Outcome::Pending);
        assert_eq!(stats.reads(), 0);
        assert_eq!(storage.pending_jobs(), 1);
        // Still in flight
        assert_eq!(storage.fetch_block(addr, None).unwrap(), Outcome::Pending);

        let mut completions = Vec::new();
        let ran = storage
            .run_jobs(&mut |c: JobCompletion| completions.push((c.kind, c.status.is_ok())))
            .unwrap();
        assert_eq!(ran, 1);
        assert_eq!(completions, vec![(JobKind::Read, true)]);
        assert_eq!(stats.reads(), 1);

        let id = done(storage.fetch_block(addr, None));
        let block = storage.block(id).unwrap();
        assert_eq!(block.refcnt, 0);
        assert!(!block.slaved);
        assert_eq!(block.job, JobState::Idle);
        assert_eq!(stats.reads(), 1);
    }

    #[test]
    fn test_deferred_spawn_commit() {
        let (mut storage, stats) = storage_with(IoMode::Deferred);
        let vaddr = inode(21);

        assert_eq!(storage.spawn(&vaddr, None).unwrap(), Outcome::Pending);
        storage.run_jobs(&mut |_| {}).unwrap();

        let id = done(storage.spawn(&vaddr, None));
        storage.payload_mut(id).unwrap()[0] = 0x99;
        assert_eq!(storage.commit(id).unwrap(), Outcome::Deferred);
        assert_eq!(stats.writes(), 0);

        // Queued but not yet dispatched: a second commit merges
        assert_eq!(storage.commit(id).unwrap(), Outcome::Deferred);
        assert_eq!(storage.pending_jobs(), 1);
        assert!(matches!(
            storage.sync_object(id),
            Err(Error::JobConflict { .. })
        ));

        assert_eq!(storage.flush().unwrap(), Outcome::Deferred);
        assert_eq!(storage.run_jobs(&mut |_| {}).unwrap(), 2);
        assert_eq!(stats.writes(), 2);

        assert_eq!(storage.sync_object(id).unwrap(), Outcome::Deferred);
        storage.run_jobs(&mut |_| {}).unwrap();
        assert_eq!(stats.syncs(), 1);

        storage.release(id).unwrap();
        storage.drain_cache().unwrap();
        assert_eq!(storage.live_blocks(), 0);
    }

    #[test]
    fn test_in_flight_block_blocks_fetch() {
        let (mut storage, _) = storage_with(IoMode::Deferred);
        let addr = PhysicalAddress::block(160);
        storage.fetch_block(addr, None).unwrap();

        let id = storage.pop_job().unwrap().unwrap();
        assert!(storage.block(id).unwrap().slaved);
        assert_eq!(storage.fetch_block(addr, None).unwrap(), Outcome::Pending);
        assert_eq!(storage.squeeze(usize::MAX).unwrap().blocks, 0);

        let completion = storage.execute_job(id).unwrap();
        assert!(completion.status.is_ok());
        storage.complete_job(&completion).unwrap();
        assert!(storage.complete_job(&completion).is_err());
        assert_eq!(done(storage.fetch_block(addr, None)), id);
    }

    #[test]
    fn test_failed_deferred_read_uncaches() {
        let mut dev = volume();
        dev.fail_next(1, std::io::ErrorKind::PermissionDenied);
        let config = StoreConfig {
            io_mode: IoMode::Deferred,
            ..StoreConfig::default()
        };
        let mut storage = Storage::new(Box::new(dev), &config);
        let addr = PhysicalAddress::block(170);

        storage.fetch_block(addr, None).unwrap();
        let mut failed = 0;
        storage
            .run_jobs(&mut |c: JobCompletion| {
                if c.status.is_err() {
                    failed += 1;
                }
            })
            .unwrap();
        assert_eq!(failed, 1);
        assert!(!storage.is_block_cached(addr));
        assert_eq!(storage.live_blocks(), 0);

        // A new fetch retries the load
        assert_eq!(storage.fetch_block(addr, None).unwrap(), Outcome::Pending);
    }

    /// Fails every write to one block while armed
    struct FailingWrites {
        inner: MemoryDevice,
        lba: Arc<AtomicU64>,
    }

    impl BlockDevice for FailingWrites {
        fn block_count(&self) -> u64 {
            self.inner.block_count()
        }

        fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> std::io::Result<()> {
            self.inner.read_block(lba, buf)
        }

        fn write_block(&mut self, lba: u64, buf: &[u8]) -> std::io::Result<()> {
            if lba == self.lba.load(Ordering::SeqCst) {
                return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
            }
            self.inner.write_block(lba, buf)
        }

        fn sync(&mut self) -> std::io::Result<()> {
            self.inner.sync()
        }
    }

    #[test]
    fn test_failed_space_map_write_redirties() {
        let armed = Arc::new(AtomicU64::new(u64::MAX));
        let dev = FailingWrites {
            inner: volume(),
            lba: Arc::clone(&armed),
        };
        let config = StoreConfig {
            io_mode: IoMode::Deferred,
            ..StoreConfig::default()
        };
        let mut storage = Storage::new(Box::new(dev), &config);
        let vaddr = inode(21);

        let id = loop {
            match storage.spawn(&vaddr, None).unwrap() {
                Outcome::Done(id) => break id,
                _ => {
                    storage.run_jobs(&mut |_| {}).unwrap();
                }
            }
        };
        let region = vaddr.region(storage.region_count());
        let map_lba = SpaceMap::new(region).address().lba;
        armed.store(map_lba, Ordering::SeqCst);

        assert_eq!(storage.commit(id).unwrap(), Outcome::Deferred);
        assert_eq!(storage.flush().unwrap(), Outcome::Deferred);
        let mut failed = 0;
        storage
            .run_jobs(&mut |c: JobCompletion| {
                if c.status.is_err() {
                    assert_eq!(c.addr.lba, map_lba);
                    failed += 1;
                }
            })
            .unwrap();
        assert_eq!(failed, 1);

        // The lost update is still owed to the device
        let map = done(storage.fetch_space_map(&vaddr));
        assert!(storage.object(map).unwrap().space_map().unwrap().is_dirty());
        storage.release(id).unwrap();
        storage.drain_cache().unwrap();
        assert_eq!(storage.cache().space_map_count(), 1);

        armed.store(u64::MAX, Ordering::SeqCst);
        assert_eq!(storage.flush().unwrap(), Outcome::Deferred);
        let mut failed = 0;
        storage
            .run_jobs(&mut |c: JobCompletion| {
                if c.status.is_err() {
                    failed += 1;
                }
            })
            .unwrap();
        assert_eq!(failed, 0);
        storage.drain_cache().unwrap();
        assert_eq!(storage.cache().space_map_count(), 0);

        let mut storage = Storage::new(storage.into_device(), &StoreConfig::default());
        done(storage.stage(&vaddr));
    }

    #[test]
    fn test_retry_exhaustion_is_fatal() {
        let mut dev = volume();
        dev.fail_next(1000, std::io::ErrorKind::Interrupted);
        let config = StoreConfig {
            retry: strata_common::RetryConfig {
                max_attempts: 3,
                backoff_micros: 1,
            },
            ..StoreConfig::default()
        };
        let mut storage = Storage::new(Box::new(dev), &config);
        let err = storage
            .fetch_block(PhysicalAddress::block(140), None)
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(storage.live_blocks(), 0);
    }

    #[test]
    fn test_load_pinned_unwinds_on_bad_object() {
        let (mut storage, _) = storage();
        // Block 2 holds no superblock
        let err = storage
            .load_pinned(VirtualAddress::for_super(), PhysicalAddress::block(2))
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(storage.live_blocks(), 0);
        assert_eq!(storage.cache().block_count(), 0);

        let id = storage
            .load_pinned(VirtualAddress::for_super(), PhysicalAddress::block(1))
            .unwrap();
        assert!(storage.object(id).unwrap().pinned);
        assert_eq!(storage.superblock(id).unwrap().region_count, REGIONS);
        storage.release(id).unwrap();
        assert!(storage.object(id).is_some());
        storage.unpin(id).unwrap();
        assert!(storage.object(id).is_none());
    }
}

//! In-memory block buffers
//!
//! A [`BlockRef`] mirrors one physical block. It is shared by every object
//! placed in it; the object cache only indexes it.

use crate::arena::ObjectId;
use strata_common::{BLOCK_SIZE, JobKind, PhysicalAddress};

/// Job-queue state of a block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JobState {
    #[default]
    Idle,
    Queued(JobKind),
}

impl JobState {
    #[must_use]
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// In-memory mirror of one physical block
pub struct BlockRef {
    /// Block address (fragment always 0)
    pub addr: PhysicalAddress,
    pub data: Box<[u8]>,
    /// Objects attached to this block, plus one for a queued job
    pub refcnt: u32,
    /// Registered in the object cache
    pub cached: bool,
    /// Handed to the job executor; contents are in flight
    pub slaved: bool,
    pub job: JobState,
    /// Owning space-map; holds one reference on it
    pub space_map: Option<ObjectId>,
}

impl BlockRef {
    #[must_use]
    pub fn new(addr: PhysicalAddress) -> Self {
        Self {
            addr: addr.floor(),
            data: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
            refcnt: 0,
            cached: false,
            slaved: false,
            job: JobState::Idle,
            space_map: None,
        }
    }

    pub fn zero(&mut self) {
        self.data.fill(0);
    }

    /// Waiting on, or being served by, the job queue
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.slaved || !self.job.is_idle()
    }

    /// Nobody holds it and no I/O is in flight
    #[must_use]
    pub const fn is_evictable(&self) -> bool {
        self.refcnt == 0 && !self.slaved
    }

    /// Neither referenced, cached nor queued
    #[must_use]
    pub const fn is_orphan(&self) -> bool {
        self.is_evictable() && !self.cached && self.job.is_idle()
    }

    /// Bytes of an object of `len` bytes placed at `addr`
    #[must_use]
    pub fn fragment(&self, addr: PhysicalAddress, len: usize) -> &[u8] {
        let start = addr.offset_in_block();
        &self.data[start..start + len]
    }

    pub fn fragment_mut(&mut self, addr: PhysicalAddress, len: usize) -> &mut [u8] {
        let start = addr.offset_in_block();
        &mut self.data[start..start + len]
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRef")
            .field("addr", &self.addr)
            .field("refcnt", &self.refcnt)
            .field("cached", &self.cached)
            .field("slaved", &self.slaved)
            .field("job", &self.job)
            .field("space_map", &self.space_map)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_floors_address() {
        let block = BlockRef::new(PhysicalAddress::new(200, 7));
        assert_eq!(block.addr, PhysicalAddress::block(200));
        assert_eq!(block.data.len(), BLOCK_SIZE);
        assert!(block.is_orphan());
    }

    #[test]
    fn test_block_evictability() {
        let mut block = BlockRef::new(PhysicalAddress::block(130));
        block.refcnt = 1;
        assert!(!block.is_evictable());

        block.refcnt = 0;
        block.slaved = true;
        assert!(!block.is_evictable());
        assert!(block.is_busy());

        block.slaved = false;
        block.job = JobState::Queued(JobKind::Write);
        assert!(block.is_busy());
        assert!(block.is_evictable());
        assert!(!block.is_orphan());
    }

    #[test]
    fn test_block_fragments() {
        let mut block = BlockRef::new(PhysicalAddress::block(130));
        let addr = PhysicalAddress::new(130, 2);
        block.fragment_mut(addr, 1024).fill(0xEE);
        assert_eq!(block.data[1023], 0);
        assert_eq!(block.data[1024], 0xEE);
        assert_eq!(block.data[2047], 0xEE);
        assert_eq!(block.data[2048], 0);
        assert!(block.fragment(addr, 1024).iter().all(|&b| b == 0xEE));

        block.zero();
        assert!(block.data.iter().all(|&b| b == 0));
    }
}

//! Block load/save/sync strategies
//!
//! [`StorageOps::Sync`] calls through to the device and always completes.
//! [`StorageOps::Deferred`] queues a block job instead: loads answer
//! `Pending`, saves and syncs answer `Deferred`.

use crate::arena::BlockId;
use crate::block::BlockRef;
use crate::io::VolumeIo;
use crate::jobs::PendingJobQueue;
use strata_common::{IoMode, JobKind, Outcome, Result};

/// Operation strategy of a storage coordinator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StorageOps {
    #[default]
    Sync,
    Deferred,
}

impl From<IoMode> for StorageOps {
    fn from(mode: IoMode) -> Self {
        match mode {
            IoMode::Sync => Self::Sync,
            IoMode::Deferred => Self::Deferred,
        }
    }
}

impl StorageOps {
    /// Fill `block` from the device
    pub fn load(
        self,
        io: &mut VolumeIo,
        jobs: &mut PendingJobQueue,
        id: BlockId,
        block: &mut BlockRef,
    ) -> Result<Outcome<()>> {
        match self {
            Self::Sync => {
                io.read(block.addr.lba, &mut block.data)?;
                Ok(Outcome::Done(()))
            }
            Self::Deferred => {
                jobs.push(id, block, JobKind::Read)?;
                Ok(Outcome::Pending)
            }
        }
    }

    /// Write `block` to the device
    pub fn save(
        self,
        io: &mut VolumeIo,
        jobs: &mut PendingJobQueue,
        id: BlockId,
        block: &mut BlockRef,
    ) -> Result<Outcome<()>> {
        match self {
            Self::Sync => {
                io.write(block.addr.lba, &block.data)?;
                Ok(Outcome::Done(()))
            }
            Self::Deferred => {
                jobs.push(id, block, JobKind::Write)?;
                Ok(Outcome::Deferred)
            }
        }
    }

    /// Make previous writes of `block` durable
    pub fn sync(
        self,
        io: &mut VolumeIo,
        jobs: &mut PendingJobQueue,
        id: BlockId,
        block: &mut BlockRef,
    ) -> Result<Outcome<()>> {
        match self {
            Self::Sync => {
                io.sync()?;
                Ok(Outcome::Done(()))
            }
            Self::Deferred => {
                jobs.push(id, block, JobKind::Sync)?;
                Ok(Outcome::Deferred)
            }
        }
    }
}

//! Volume format, open and close
//!
//! A volume is laid out as:
//! - region 0: null block, superblock at [`LBA_SUPER`], then unused
//! - regions 1..=N: one space-map block followed by 127 allocatable blocks
//!
//! Opening a volume pins the superblock and the root directory for the
//! lifetime of the [`Volume`]. Boot runs with synchronous ops; the
//! configured I/O mode applies once the volume is open.

use crate::arena::ObjectId;
use crate::device::BlockDevice;
use crate::jobs::JobCompletion;
use crate::layout::{Superblock, volume_size_for};
use crate::object::ObjectBody;
use crate::ops::StorageOps;
use crate::spacemap::SpaceMap;
use crate::storage::Storage;
use strata_common::{
    BLOCK_SIZE, Error, INO_ROOT, LBA_SUPER, ObjectKind, Outcome, PhysicalAddress, Result,
    StoreConfig, VOLUME_SIZE_MIN, VirtualAddress,
};
use tracing::{error, info, warn};

/// Options for [`Volume::format`]
#[derive(Clone, Copy, Debug, Default)]
pub struct FormatOptions {
    /// Volume size in bytes; defaults to the largest size the device holds
    pub volume_size: Option<u64>,
}

/// An open volume
pub struct Volume {
    storage: Storage,
    super_id: ObjectId,
    root_id: ObjectId,
}

/// Virtual address of the root directory
#[must_use]
pub const fn root_vaddr() -> VirtualAddress {
    VirtualAddress::for_inode(ObjectKind::Dir, INO_ROOT)
}

fn expect_done<T>(outcome: Result<Outcome<T>>) -> Result<T> {
    match outcome? {
        Outcome::Done(value) => Ok(value),
        Outcome::Pending | Outcome::Deferred => Err(Error::internal(
            "synchronous operation did not complete",
        )),
    }
}

fn device_capacity(device: &dyn BlockDevice) -> u64 {
    device.block_count() * BLOCK_SIZE as u64
}

impl Volume {
    /// Write an empty volume to `device` and open it
    pub fn format(
        device: Box<dyn BlockDevice>,
        config: &StoreConfig,
        options: FormatOptions,
    ) -> Result<Self> {
        let capacity = device_capacity(device.as_ref());
        let volume_size = options
            .volume_size
            .unwrap_or_else(|| volume_size_for(capacity));
        if volume_size > capacity {
            return Err(Error::geometry(format!(
                "volume size {volume_size} exceeds device capacity {capacity}"
            )));
        }
        let sb = Superblock::new(volume_size)?;
        let region_count = sb.region_count;
        let uuid = sb.uuid;

        let mut storage = Storage::new(device, config);
        storage.set_ops(StorageOps::Sync);
        storage.set_region_count(region_count);

        storage.write_fresh(
            VirtualAddress::for_super(),
            PhysicalAddress::block(LBA_SUPER),
            &ObjectBody::Super(sb),
        )?;
        for region in 1..=region_count {
            let map = SpaceMap::new(region);
            let addr = map.address();
            storage.write_fresh(
                VirtualAddress::for_space_map(region),
                addr,
                &ObjectBody::SpaceMap(Box::new(map)),
            )?;
        }

        let root = expect_done(storage.spawn(&root_vaddr(), None))?;
        expect_done(storage.commit(root))?;
        storage.release(root)?;
        expect_done(storage.flush())?;
        storage.sync_device()?;

        info!(%uuid, volume_size, region_count, "formatted volume");
        Self::open(storage.into_device(), config)
    }

    /// Open a formatted volume
    ///
    /// A missing or damaged superblock or root directory is reported as
    /// [`Error::Corrupted`].
    pub fn open(device: Box<dyn BlockDevice>, config: &StoreConfig) -> Result<Self> {
        let capacity = device_capacity(device.as_ref());
        if capacity < VOLUME_SIZE_MIN {
            return Err(Error::geometry(format!(
                "device capacity {capacity} is below minimum volume size {VOLUME_SIZE_MIN}"
            )));
        }

        let mut storage = Storage::new(device, config);
        storage.set_ops(StorageOps::Sync);

        let super_id = storage
            .load_pinned(VirtualAddress::for_super(), PhysicalAddress::block(LBA_SUPER))
            .map_err(|e| match e {
                Error::Decode(msg) => Error::Corrupted(format!("superblock: {msg}")),
                e => e,
            })
            .inspect_err(|e| error!(error = %e, "cannot load superblock"))?;
        let root_id = Self::boot(&mut storage, super_id, capacity)
            .inspect_err(|e| error!(error = %e, "volume open failed"))?;

        storage.set_ops(config.io_mode.into());
        let volume = Self {
            storage,
            super_id,
            root_id,
        };
        let sb = volume.superblock()?;
        info!(
            uuid = %sb.uuid,
            volume_size = sb.volume_size,
            regions = sb.region_count,
            mount_count = sb.mount_count,
            "opened volume"
        );
        Ok(volume)
    }

    fn boot(storage: &mut Storage, super_id: ObjectId, capacity: u64) -> Result<ObjectId> {
        let sb = storage.superblock(super_id)?;
        sb.validate(capacity)?;
        let (region_count, apex_ino, apex_vlba) = (sb.region_count, sb.apex_ino, sb.apex_vlba);
        storage.set_region_count(region_count);

        let root = match storage.stage(&root_vaddr()) {
            Ok(outcome) => expect_done(Ok(outcome))?,
            Err(e) if e.is_not_found() || matches!(e, Error::Decode(_)) => {
                return Err(Error::corrupted(format!("missing root directory: {e}")));
            }
            Err(e) => return Err(e),
        };
        storage.pin(root)?;

        Self::verify_apex(storage, apex_ino, apex_vlba)?;

        let sb = storage.superblock_mut(super_id)?;
        sb.mount_count += 1;
        sb.seal();
        expect_done(storage.commit(super_id))?;
        Ok(root)
    }

    /// Nothing may be mapped past the allocation apex
    fn verify_apex(storage: &mut Storage, apex_ino: u64, apex_vlba: u64) -> Result<()> {
        let beyond = [
            VirtualAddress::for_inode(ObjectKind::Inode, apex_ino + 1),
            VirtualAddress::for_inode(ObjectKind::Dir, apex_ino + 1),
            VirtualAddress::for_data_block(apex_vlba + 1),
        ];
        for vaddr in beyond {
            if expect_done(storage.is_mapped(&vaddr))? {
                return Err(Error::corrupted(format!(
                    "{vaddr} exists beyond the allocation apex"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    pub fn superblock(&self) -> Result<&Superblock> {
        self.storage.superblock(self.super_id)
    }

    /// The pinned root directory object
    #[must_use]
    pub const fn root(&self) -> ObjectId {
        self.root_id
    }

    /// Hand out the next inode number
    pub fn allocate_ino(&mut self) -> Result<u64> {
        let sb = self.storage.superblock_mut(self.super_id)?;
        sb.apex_ino += 1;
        sb.seal();
        Ok(sb.apex_ino)
    }

    /// Hand out the next virtual data block number
    pub fn allocate_vlba(&mut self) -> Result<u64> {
        let sb = self.storage.superblock_mut(self.super_id)?;
        sb.apex_vlba += 1;
        sb.seal();
        Ok(sb.apex_vlba)
    }

    /// Write the superblock back
    pub fn commit_superblock(&mut self) -> Result<Outcome<()>> {
        self.storage.commit(self.super_id)
    }

    /// Flush all metadata and give back the device
    pub fn close(mut self) -> Result<Box<dyn BlockDevice>> {
        let mut failed = 0usize;
        self.storage.run_jobs(&mut |c: JobCompletion| {
            if let Err(e) = &c.status {
                warn!(addr = %c.addr, kind = %c.kind, error = %e, "job failed during close");
                failed += 1;
            }
        })?;
        if failed > 0 {
            return Err(Error::storage(format!("{failed} pending jobs failed")));
        }

        self.storage.set_ops(StorageOps::Sync);
        expect_done(self.storage.commit(self.super_id))?;
        expect_done(self.storage.flush())?;
        self.storage.sync_device()?;

        for id in [self.root_id, self.super_id] {
            self.storage.unpin(id)?;
            self.storage.release(id)?;
        }
        let report = self.storage.drain_cache()?;
        if self.storage.live_objects() > 0 {
            warn!(
                objects = self.storage.live_objects(),
                "objects still referenced at close"
            );
        }
        info!(
            blocks = report.blocks,
            space_maps = report.space_maps,
            "closed volume"
        );
        Ok(self.storage.into_device())
    }
}

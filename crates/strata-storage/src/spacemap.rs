//! Per-region space-map
//!
//! Each region starts with a space-map block that records, for every block
//! in the region, which fragments are in use, and a bounded table of
//! virtual address to fragment index mappings.
//!
//! Allocation policy:
//! - whole blocks are taken from the end of the region backwards
//! - power-of-two sizes are placed on their natural alignment
//! - anything else is first fit
//!
//! Encoded layout (little endian):
//! ```text
//! region u64 | used u32 | count u32 | usage [u16; 128] | entries [24B; 240]
//! entry: kind u8 | flags u8 | frgi u16 | reserved u32 | ino u64 | xno u64
//! ```

use bytes::{Buf, BufMut};
use strata_common::{
    Error, FRAGMENTS_PER_BLOCK, ObjectKind, PhysicalAddress, REGION_BLOCKS, REGION_FRAGMENTS,
    Result, SPACE_MAP_ENTRIES, VirtualAddress,
};

const SLOTS: usize = REGION_BLOCKS as usize;
const FULL: u16 = u16::MAX;
const ENTRY_LEN: usize = 24;
const ENTRY_USED: u8 = 0x01;

/// Encoded size of a space-map in bytes
pub const SPACE_MAP_LEN: usize = 16 + SLOTS * 2 + SPACE_MAP_ENTRIES * ENTRY_LEN;

/// One virtual to physical mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceEntry {
    pub vaddr: VirtualAddress,
    /// Fragment index within the region
    pub frgi: u16,
}

/// Fragment usage and address mappings for one region
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceMap {
    region: u64,
    usage: [u16; SLOTS],
    entries: Vec<Option<SpaceEntry>>,
    used_fragments: usize,
    entry_count: usize,
    dirty: bool,
}

const fn fragment_mask(nfrg: usize) -> u16 {
    if nfrg >= FRAGMENTS_PER_BLOCK {
        FULL
    } else {
        ((1u32 << nfrg) - 1) as u16
    }
}

impl SpaceMap {
    /// Empty map for `region`; the map's own block is marked in use
    #[must_use]
    pub fn new(region: u64) -> Self {
        let mut usage = [0u16; SLOTS];
        usage[0] = FULL;
        Self {
            region,
            usage,
            entries: vec![None; SPACE_MAP_ENTRIES],
            used_fragments: FRAGMENTS_PER_BLOCK,
            entry_count: 0,
            dirty: false,
        }
    }

    #[must_use]
    pub const fn region(&self) -> u64 {
        self.region
    }

    /// First block of the region, where the map itself lives
    #[must_use]
    pub const fn base_lba(&self) -> u64 {
        self.region * REGION_BLOCKS
    }

    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        PhysicalAddress::block(self.base_lba())
    }

    #[must_use]
    pub const fn used_fragments(&self) -> usize {
        self.used_fragments
    }

    #[must_use]
    pub const fn free_fragments(&self) -> usize {
        REGION_FRAGMENTS - self.used_fragments
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.entry_count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.entry_count >= SPACE_MAP_ENTRIES
    }

    /// Has changes not yet written back
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn entries(&self) -> impl Iterator<Item = &SpaceEntry> {
        self.entries.iter().flatten()
    }

    fn resolve(&self, frgi: u16) -> PhysicalAddress {
        let frgi = usize::from(frgi);
        PhysicalAddress::new(
            self.base_lba() + (frgi / FRAGMENTS_PER_BLOCK) as u64,
            (frgi % FRAGMENTS_PER_BLOCK) as u16,
        )
    }

    fn has_space(&self, kind: ObjectKind) -> bool {
        // Data blocks keep a block of headroom for smaller objects
        let reserve = if kind.is_data_block() {
            FRAGMENTS_PER_BLOCK
        } else {
            0
        };
        !self.is_full() && self.used_fragments + kind.fragments() + reserve <= REGION_FRAGMENTS
    }

    fn find_free(&self, nfrg: usize) -> Option<u16> {
        let mask = fragment_mask(nfrg);
        let position = if nfrg >= FRAGMENTS_PER_BLOCK {
            (1..SLOTS)
                .rev()
                .find(|&slot| self.usage[slot] == 0)
                .map(|slot| (slot, 0))
        } else {
            let step = if nfrg.is_power_of_two() { nfrg } else { 1 };
            (1..SLOTS).find_map(|slot| {
                (0..=FRAGMENTS_PER_BLOCK - nfrg)
                    .step_by(step)
                    .find(|&shift| self.usage[slot] & (mask << shift) == 0)
                    .map(|shift| (slot, shift))
            })
        };
        position.map(|(slot, shift)| (slot * FRAGMENTS_PER_BLOCK + shift) as u16)
    }

    /// Where the next object of `kind` would be placed
    #[must_use]
    pub fn predict(&self, kind: ObjectKind) -> Option<PhysicalAddress> {
        if !self.has_space(kind) {
            return None;
        }
        self.find_free(kind.fragments()).map(|frgi| self.resolve(frgi))
    }

    /// Fragments in use in block `lba`, if the block belongs to this region
    #[must_use]
    pub fn usage_at(&self, lba: u64) -> Option<u32> {
        let base = self.base_lba();
        if lba < base || lba >= base + REGION_BLOCKS {
            return None;
        }
        Some(self.usage[(lba - base) as usize].count_ones())
    }

    /// Current mapping of `vaddr`
    #[must_use]
    pub fn lookup(&self, vaddr: &VirtualAddress) -> Option<PhysicalAddress> {
        self.entries()
            .find(|e| e.vaddr == *vaddr)
            .map(|e| self.resolve(e.frgi))
    }

    /// Map `vaddr` at the predicted location
    ///
    /// Returns `None` when `vaddr` is already mapped or no space is left.
    pub fn insert(&mut self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        if self.lookup(&vaddr).is_some() || !self.has_space(vaddr.kind) {
            return None;
        }
        let nfrg = vaddr.kind.fragments();
        let frgi = self.find_free(nfrg)?;
        let slot = self.entries.iter().position(Option::is_none)?;

        let index = usize::from(frgi);
        let block = index / FRAGMENTS_PER_BLOCK;
        let shift = index % FRAGMENTS_PER_BLOCK;
        self.usage[block] |= fragment_mask(nfrg) << shift;
        self.entries[slot] = Some(SpaceEntry { vaddr, frgi });
        self.used_fragments += nfrg;
        self.entry_count += 1;
        Some(self.resolve(frgi))
    }

    /// Unmap `vaddr`, releasing its fragments
    pub fn remove(&mut self, vaddr: &VirtualAddress) -> Option<PhysicalAddress> {
        let slot = self
            .entries
            .iter()
            .position(|e| e.is_some_and(|e| e.vaddr == *vaddr))?;
        let entry = self.entries[slot].take()?;

        let nfrg = entry.vaddr.kind.fragments();
        let index = usize::from(entry.frgi);
        self.usage[index / FRAGMENTS_PER_BLOCK] &= !(fragment_mask(nfrg) << (index % FRAGMENTS_PER_BLOCK));
        self.used_fragments -= nfrg;
        self.entry_count -= 1;
        Some(self.resolve(entry.frgi))
    }

    /// Serialize into `buf`
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.region);
        buf.put_u32_le(self.used_fragments as u32);
        buf.put_u32_le(self.entry_count as u32);
        for usage in &self.usage {
            buf.put_u16_le(*usage);
        }
        for entry in &self.entries {
            match entry {
                Some(e) => {
                    buf.put_u8(e.vaddr.kind.code());
                    buf.put_u8(ENTRY_USED);
                    buf.put_u16_le(e.frgi);
                    buf.put_u32_le(0);
                    buf.put_u64_le(e.vaddr.ino);
                    buf.put_u64_le(e.vaddr.xno);
                }
                None => buf.put_bytes(0, ENTRY_LEN),
            }
        }
    }

    /// Parse and cross-check an encoded map of `region`
    pub fn decode(region: u64, data: &[u8]) -> Result<Self> {
        if data.len() < SPACE_MAP_LEN {
            return Err(Error::decode(format!(
                "space-map of {} bytes, expected {SPACE_MAP_LEN}",
                data.len()
            )));
        }
        let mut buf = data;

        let stored_region = buf.get_u64_le();
        if stored_region != region {
            return Err(Error::decode(format!(
                "space-map for region {stored_region} found in region {region}"
            )));
        }
        let used_fragments = buf.get_u32_le() as usize;
        let entry_count = buf.get_u32_le() as usize;

        let mut usage = [0u16; SLOTS];
        for slot in &mut usage {
            *slot = buf.get_u16_le();
        }
        if usage[0] != FULL {
            return Err(Error::decode("space-map block not marked in use"));
        }

        let mut map = Self::new(region);
        for slot in 0..SPACE_MAP_ENTRIES {
            let code = buf.get_u8();
            let flags = buf.get_u8();
            let frgi = buf.get_u16_le();
            buf.advance(4);
            let ino = buf.get_u64_le();
            let xno = buf.get_u64_le();
            if flags & ENTRY_USED == 0 {
                continue;
            }

            let kind = ObjectKind::from_code(code)
                .ok_or_else(|| Error::decode(format!("unknown object kind {code} in space-map")))?;
            let nfrg = kind.fragments();
            let index = usize::from(frgi);
            let shift = index % FRAGMENTS_PER_BLOCK;
            if index >= REGION_FRAGMENTS || index < FRAGMENTS_PER_BLOCK || shift + nfrg > FRAGMENTS_PER_BLOCK {
                return Err(Error::decode(format!("fragment index {frgi} out of range")));
            }
            let mask = fragment_mask(nfrg) << shift;
            let block = index / FRAGMENTS_PER_BLOCK;
            if map.usage[block] & mask != 0 {
                return Err(Error::decode(format!("overlapping mapping at fragment {frgi}")));
            }
            map.usage[block] |= mask;
            map.entries[slot] = Some(SpaceEntry {
                vaddr: VirtualAddress::new(kind, ino, xno),
                frgi,
            });
            map.used_fragments += nfrg;
            map.entry_count += 1;
        }

        if map.usage != usage
            || map.used_fragments != used_fragments
            || map.entry_count != entry_count
        {
            return Err(Error::decode(format!(
                "space-map of region {region} is inconsistent with its entries"
            )));
        }
        Ok(map)
    }
}

//! Object encoding within blocks
//!
//! Every object except raw data blocks starts with a 32 byte header at its
//! fragment offset:
//! ```text
//! mark [4] | version u8 | kind u8 | flags u16 | length u32 | ino u64 | xno u64 | crc u32
//! ```
//! `length` is the object size in bytes and `crc` is the CRC32C of the
//! payload that follows the header. Data blocks are stored raw.

use crate::layout::Superblock;
use crate::object::ObjectBody;
use crate::spacemap::SpaceMap;
use bytes::{Buf, BufMut};
use strata_common::{BLOCK_SIZE, Error, ObjectKind, PhysicalAddress, Result, VirtualAddress};

/// Header mark of an encoded object
pub const HEADER_MARK: [u8; 4] = *b"STR1";

/// Header format version
pub const HEADER_VERSION: u8 = 1;

/// Object header size in bytes
pub const HEADER_LEN: usize = 32;

/// Payload capacity of a record object of `kind`
#[must_use]
pub const fn record_len(kind: ObjectKind) -> usize {
    kind.size() - HEADER_LEN
}

/// Translation between block bytes and typed objects
pub trait ObjectCodec: Send {
    /// Decode the object `vaddr` stored at `paddr` in `block`
    fn decode(&self, vaddr: VirtualAddress, block: &[u8], paddr: PhysicalAddress)
    -> Result<ObjectBody>;

    /// Encode `body` into its location in `block`
    fn encode(
        &self,
        vaddr: VirtualAddress,
        body: &ObjectBody,
        block: &mut [u8],
        paddr: PhysicalAddress,
    ) -> Result<()>;
}

/// Default codec: headered, checksummed objects; raw data blocks
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    fn region<'a>(
        kind: ObjectKind,
        block: &'a [u8],
        paddr: PhysicalAddress,
    ) -> Result<&'a [u8]> {
        let start = paddr.offset_in_block();
        let end = start + kind.size();
        if block.len() != BLOCK_SIZE || end > BLOCK_SIZE {
            return Err(Error::decode(format!(
                "{kind} object at {paddr} does not fit in its block"
            )));
        }
        Ok(&block[start..end])
    }

    fn check_header(vaddr: VirtualAddress, frame: &[u8], paddr: PhysicalAddress) -> Result<()> {
        let mut hdr = &frame[..HEADER_LEN];

        let mut mark = [0u8; 4];
        hdr.copy_to_slice(&mut mark);
        if mark != HEADER_MARK {
            return Err(Error::decode(format!("no object header at {paddr}")));
        }
        let version = hdr.get_u8();
        if version != HEADER_VERSION {
            return Err(Error::decode(format!(
                "unsupported header version {version} at {paddr}"
            )));
        }
        let code = hdr.get_u8();
        if ObjectKind::from_code(code) != Some(vaddr.kind) {
            return Err(Error::decode(format!(
                "expected {} object at {paddr}, found kind {code}",
                vaddr.kind
            )));
        }
        hdr.advance(2);
        let length = hdr.get_u32_le() as usize;
        if length != vaddr.kind.size() {
            return Err(Error::decode(format!(
                "bad object length {length} at {paddr}"
            )));
        }
        let ino = hdr.get_u64_le();
        let xno = hdr.get_u64_le();
        if ino != vaddr.ino || xno != vaddr.xno {
            return Err(Error::decode(format!(
                "object at {paddr} belongs to {}:{ino}:{xno}, not {vaddr}",
                vaddr.kind
            )));
        }
        let crc = hdr.get_u32_le();
        let actual = crc32c::crc32c(&frame[HEADER_LEN..]);
        if crc != actual {
            return Err(Error::decode(format!(
                "checksum mismatch at {paddr}: stored {crc:#010x}, computed {actual:#010x}"
            )));
        }
        Ok(())
    }

    fn put_header(vaddr: VirtualAddress, frame: &mut [u8]) {
        let crc = crc32c::crc32c(&frame[HEADER_LEN..]);
        let mut hdr = &mut frame[..HEADER_LEN];
        hdr.put_slice(&HEADER_MARK);
        hdr.put_u8(HEADER_VERSION);
        hdr.put_u8(vaddr.kind.code());
        hdr.put_u16_le(0);
        hdr.put_u32_le(vaddr.kind.size() as u32);
        hdr.put_u64_le(vaddr.ino);
        hdr.put_u64_le(vaddr.xno);
        hdr.put_u32_le(crc);
    }
}

impl ObjectCodec for FrameCodec {
    fn decode(
        &self,
        vaddr: VirtualAddress,
        block: &[u8],
        paddr: PhysicalAddress,
    ) -> Result<ObjectBody> {
        let frame = Self::region(vaddr.kind, block, paddr)?;
        if vaddr.kind.is_data_block() {
            return Ok(ObjectBody::Data(frame.to_vec()));
        }

        Self::check_header(vaddr, frame, paddr)?;
        let payload = &frame[HEADER_LEN..];
        match vaddr.kind {
            ObjectKind::Super => Superblock::from_bytes(payload).map(ObjectBody::Super),
            ObjectKind::SpaceMap => {
                SpaceMap::decode(vaddr.xno, payload).map(|m| ObjectBody::SpaceMap(Box::new(m)))
            }
            _ => Ok(ObjectBody::Record(payload.to_vec())),
        }
    }

    fn encode(
        &self,
        vaddr: VirtualAddress,
        body: &ObjectBody,
        block: &mut [u8],
        paddr: PhysicalAddress,
    ) -> Result<()> {
        let start = paddr.offset_in_block();
        let end = start + vaddr.kind.size();
        if block.len() != BLOCK_SIZE || end > BLOCK_SIZE {
            return Err(Error::encode(format!(
                "{} object at {paddr} does not fit in its block",
                vaddr.kind
            )));
        }
        let frame = &mut block[start..end];

        match (vaddr.kind, body) {
            (ObjectKind::DataBlock, ObjectBody::Data(data)) => {
                if data.len() != frame.len() {
                    return Err(Error::encode(format!(
                        "data block of {} bytes, expected {BLOCK_SIZE}",
                        data.len()
                    )));
                }
                frame.copy_from_slice(data);
                return Ok(());
            }
            (ObjectKind::Super, ObjectBody::Super(sb)) => {
                let bytes = sb.to_bytes();
                let payload = &mut frame[HEADER_LEN..];
                payload.fill(0);
                payload[..bytes.len()].copy_from_slice(&bytes);
            }
            (ObjectKind::SpaceMap, ObjectBody::SpaceMap(map)) => {
                let mut payload = &mut frame[HEADER_LEN..];
                payload.fill(0);
                map.encode(&mut payload);
            }
            (kind, ObjectBody::Record(record))
                if !matches!(kind, ObjectKind::Super | ObjectKind::SpaceMap | ObjectKind::DataBlock) =>
            {
                let payload = &mut frame[HEADER_LEN..];
                if record.len() > payload.len() {
                    return Err(Error::encode(format!(
                        "{kind} record of {} bytes exceeds {}",
                        record.len(),
                        payload.len()
                    )));
                }
                payload.fill(0);
                payload[..record.len()].copy_from_slice(record);
            }
            (kind, _) => {
                return Err(Error::encode(format!("body does not match {kind} object")));
            }
        }
        Self::put_header(vaddr, frame);
        Ok(())
    }
}

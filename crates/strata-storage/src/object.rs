//! Decoded objects (vnodes)

use crate::arena::BlockId;
use crate::layout::Superblock;
use crate::spacemap::SpaceMap;
use strata_common::{ObjectKind, PhysicalAddress, VirtualAddress};

/// Typed content of a decoded object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectBody {
    Super(Superblock),
    SpaceMap(Box<SpaceMap>),
    /// Raw block contents
    Data(Vec<u8>),
    /// Opaque payload of inode, directory and segment objects
    Record(Vec<u8>),
}

impl ObjectBody {
    #[must_use]
    pub fn as_space_map(&self) -> Option<&SpaceMap> {
        match self {
            Self::SpaceMap(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_space_map_mut(&mut self) -> Option<&mut SpaceMap> {
        match self {
            Self::SpaceMap(map) => Some(map),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_super(&self) -> Option<&Superblock> {
        match self {
            Self::Super(sb) => Some(sb),
            _ => None,
        }
    }

    pub fn as_super_mut(&mut self) -> Option<&mut Superblock> {
        match self {
            Self::Super(sb) => Some(sb),
            _ => None,
        }
    }

    /// Payload bytes of data and record objects
    #[must_use]
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Data(b) | Self::Record(b) => Some(b),
            Self::Super(_) | Self::SpaceMap(_) => None,
        }
    }

    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::Data(b) | Self::Record(b) => Some(b),
            Self::Super(_) | Self::SpaceMap(_) => None,
        }
    }
}

/// In-memory view of one virtual object
#[derive(Debug)]
pub struct Vnode {
    pub vaddr: VirtualAddress,
    pub paddr: PhysicalAddress,
    /// Backing block; holds one reference on it
    pub block: Option<BlockId>,
    /// Consumer references; for space-maps, attached blocks count too
    pub refcnt: u32,
    /// Has a physical location in its space-map
    pub placed: bool,
    /// Kept alive through release and cache draining
    pub pinned: bool,
    /// Registered in the space-map cache
    pub cached: bool,
    pub body: ObjectBody,
}

impl Vnode {
    #[must_use]
    pub const fn new(vaddr: VirtualAddress, body: ObjectBody) -> Self {
        Self {
            vaddr,
            paddr: PhysicalAddress::new(0, 0),
            block: None,
            refcnt: 0,
            placed: false,
            pinned: false,
            cached: false,
            body,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        self.vaddr.kind
    }

    pub fn space_map(&self) -> Option<&SpaceMap> {
        self.body.as_space_map()
    }

    pub fn space_map_mut(&mut self) -> Option<&mut SpaceMap> {
        self.body.as_space_map_mut()
    }
}

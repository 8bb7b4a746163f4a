//! Error types for Strata
//!
//! Errors fall into three groups:
//! - transient device errors, retried by the storage layer and escalated
//!   to [`Error::Fatal`] once the retry budget is spent
//! - capacity and logical errors (`OutOfSpace`, `NotFound`, geometry),
//!   returned to the caller as-is
//! - consistency errors ([`Error::Corrupted`]) raised while opening or
//!   verifying a volume
//!
//! `Pending` and `Deferred` are not errors; see [`crate::Outcome`].

use crate::types::{JobKind, VirtualAddress};
use std::io;
use thiserror::Error;

/// Common result type for Strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Strata
#[derive(Debug, Error)]
pub enum Error {
    // Device errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] io::Error),

    #[error("fatal device failure: {0}")]
    Fatal(String),

    #[error("physical address out of range: lba {lba}, volume has {block_count} blocks")]
    InvalidAddress { lba: u64, block_count: u64 },

    // Mapping errors
    #[error("object not mapped: {vaddr}")]
    NotFound { vaddr: VirtualAddress },

    #[error("object already mapped: {vaddr}")]
    AlreadyMapped { vaddr: VirtualAddress },

    #[error("no space left in region {region} for {vaddr}")]
    OutOfSpace { region: u64, vaddr: VirtualAddress },

    #[error("block {lba} already holds objects, cannot bind a supplied block for {vaddr}")]
    BlockInUse { lba: u64, vaddr: VirtualAddress },

    // Job queue errors
    #[error("block {lba} already queued for {queued}, cannot queue {requested}")]
    JobConflict {
        lba: u64,
        queued: JobKind,
        requested: JobKind,
    },

    // Volume errors
    #[error("invalid volume geometry: {0}")]
    InvalidGeometry(String),

    #[error("volume corrupted: {0}")]
    Corrupted(String),

    // Codec errors
    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    // Internal errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corruption error
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create an encode error
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Create a geometry error
    pub fn geometry(msg: impl Into<String>) -> Self {
        Self::InvalidGeometry(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a transient device error worth retrying
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DiskIo(e) => is_transient_io(e),
            _ => false,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is an out of space error
    #[must_use]
    pub const fn is_out_of_space(&self) -> bool {
        matches!(self, Self::OutOfSpace { .. })
    }

    /// Check if the volume should be considered unusable
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Corrupted(_))
    }
}

/// Would-block, interrupted and temporary resource exhaustion
#[must_use]
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::OutOfMemory
            | io::ErrorKind::StorageFull
    )
}

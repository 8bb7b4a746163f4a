//! Strata Common - Shared types and utilities
//!
//! This crate provides the volume geometry, object addressing, the
//! `Outcome` control signal, configuration and the error type used by
//! every Strata component.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheConfig, IoMode, RetryConfig, StoreConfig};
pub use error::{Error, Result};
pub use types::*;

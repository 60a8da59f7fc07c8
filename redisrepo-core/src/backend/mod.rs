//! Backend module for the hash-per-entity data plane
//!
//! Provides a trait-based abstraction over the four primitives the store and
//! the enumeration need, with a Redis implementation and an in-process one.

pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Hash field holding the serialized entity.
pub const PAYLOAD_FIELD: &str = "json";

/// One round trip of a cursor-based scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub keys: Vec<String>,
    /// Continuation token; `0` means the scan is complete.
    pub cursor: u64,
}

/// Trait for hash backends
#[async_trait]
pub trait HashBackend: Send + Sync {
    /// Read one field of the hash at `key`
    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Write one field of the hash at `key`, overwriting any previous value
    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Delete one field of the hash at `key`; absent fields are ignored
    async fn delete_field(&self, key: &str, field: &str) -> Result<()>;

    /// Fetch the next batch of keys matching a glob pattern.
    /// Start with cursor `0`; `count` is a per-round-trip hint.
    async fn scan_page(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage>;
}

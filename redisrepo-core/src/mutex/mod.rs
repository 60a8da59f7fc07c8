//! Distributed per-entity mutexes
//!
//! `Mutexes` is the capability the repository depends on. `Redlock` implements
//! it on top of any set of `LockNode`s (Redis servers, or in-process tables).

pub mod memory;
pub mod redis;
pub mod redlock;

use crate::error::Result;
use crate::id::EntityId;
use async_trait::async_trait;
use std::time::Duration;

pub use self::memory::MemoryLockNode;
pub use self::redis::RedisLockNode;
pub use self::redlock::{Redlock, RedlockOptions};

/// Outcome of `Mutexes::lock`.
///
/// `acquired == false` covers both a lock held elsewhere and a backend that
/// could not be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockAttempt {
    pub acquired: bool,
    /// Set by implementations that know the entity does not exist.
    pub absent: bool,
}

impl LockAttempt {
    pub fn acquired() -> Self {
        Self {
            acquired: true,
            absent: false,
        }
    }

    pub fn not_acquired() -> Self {
        Self::default()
    }
}

/// Trait for per-entity advisory lock managers
#[async_trait]
pub trait Mutexes<I: EntityId>: Send + Sync {
    /// Try to take the lock of an existing entity
    async fn lock(&self, id: &I) -> Result<LockAttempt>;

    /// Try to take the lock for an entity about to be created
    async fn new_and_lock(&self, id: &I) -> Result<bool>;

    /// Release locks held by this manager; never fails
    async fn unlock_all(&self, ids: &[I]);
}

/// One independent lock server taking part in the Redlock quorum
#[async_trait]
pub trait LockNode: Send + Sync {
    /// Set `name` to `token` with a lease of `ttl`, only if `name` is free
    async fn try_acquire(&self, name: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `name` only if it still holds `token`
    async fn release(&self, name: &str, token: &str) -> Result<bool>;
}

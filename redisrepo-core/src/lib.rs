//! redisrepo - Redis-backed entity persistence with per-entity distributed mutexes
//!
//! - Entities stored as JSON in the `json` field of one Redis hash per id
//! - Redlock-style locks keyed by the same `<prefix><id>` naming scheme
//! - Cursor-based prefix scans for id enumeration
//! - In-memory backend for running without any Redis

pub mod backend;
pub mod config;
pub mod error;
pub mod id;
pub mod mutex;
pub mod repository;
pub mod store;

pub use backend::{HashBackend, MemoryBackend, RedisBackend, ScanPage, PAYLOAD_FIELD};
pub use self::config::{LockConfig, RedisConfig, RepositoryConfig};
pub use error::{RepoError, Result};
pub use id::{EntityId, Keyspace};
pub use mutex::{
    LockAttempt, LockNode, MemoryLockNode, Mutexes, RedisLockNode, Redlock, RedlockOptions,
};
pub use repository::{
    Repository, RepositoryBuilder, StoreRepository, DEFAULT_SCAN_BATCH_SIZE,
};
pub use store::{EntityStore, ProcessEntity};

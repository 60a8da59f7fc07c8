use crate::backend::{HashBackend, MemoryBackend, RedisBackend};
use crate::config::RepositoryConfig;
use crate::error::{RepoError, Result};
use crate::id::{EntityId, Keyspace};
use crate::mutex::{
    LockAttempt, LockNode, MemoryLockNode, Mutexes, RedisLockNode, Redlock, RedlockOptions,
};
use crate::store::{EntityStore, ProcessEntity};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Keys requested per SCAN round trip unless configured otherwise.
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 100;

/// Persistence contract used by the entity-processing layer.
#[async_trait]
pub trait Repository<T, I>: Send + Sync
where
    T: Send + Sync + 'static,
    I: EntityId,
{
    async fn load(&self, id: &I) -> Result<Option<T>>;

    async fn save(&self, id: &I, entity: &T) -> Result<()>;

    async fn save_all(
        &self,
        inserts: &HashMap<I, T>,
        updates: &HashMap<I, ProcessEntity<T>>,
    ) -> Result<()>;

    async fn remove_all(&self, ids: &[I]) -> Result<()>;

    async fn lock(&self, id: &I) -> Result<LockAttempt>;

    async fn new_and_lock(&self, id: &I) -> Result<bool>;

    async fn unlock_all(&self, ids: &[I]);

    /// Every id of the collection, found by a cursor scan without locking.
    /// Keys stable for the whole scan are returned; keys written or removed
    /// meanwhile may or may not be.
    async fn query_all_ids(&self) -> Result<Vec<I>>;

    /// Same cost as `query_all_ids`; no counter is maintained.
    async fn count(&self) -> Result<u64>;
}

/// Repository composed of an `EntityStore`, a `Mutexes` implementation and
/// direct keyspace scans on the same backend.
pub struct StoreRepository<T, I> {
    store: EntityStore<T, I>,
    backend: Arc<dyn HashBackend>,
    mutexes: Arc<dyn Mutexes<I>>,
    scan_batch_size: usize,
}

impl<T, I> StoreRepository<T, I>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    I: EntityId,
{
    pub fn new(
        backend: Arc<dyn HashBackend>,
        keyspace: Keyspace,
        mutexes: Arc<dyn Mutexes<I>>,
    ) -> Self {
        Self {
            store: EntityStore::new(backend.clone(), keyspace),
            backend,
            mutexes,
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
        }
    }

    /// Redis repository with a single-node Redlock on the same connection
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let backend = RedisBackend::connect(url).await?;
        let keyspace = Keyspace::new(prefix);
        let node: Arc<dyn LockNode> = Arc::new(RedisLockNode::from_connection(backend.connection()));
        let mutexes = Redlock::new(vec![node], keyspace.clone(), RedlockOptions::default())?;
        Ok(Self::new(Arc::new(backend), keyspace, Arc::new(mutexes)))
    }

    /// Redis repository using caller-provided mutexes
    pub async fn connect_with_mutexes(
        url: &str,
        prefix: &str,
        mutexes: Arc<dyn Mutexes<I>>,
    ) -> Result<Self> {
        let backend = RedisBackend::connect(url).await?;
        Ok(Self::new(Arc::new(backend), Keyspace::new(prefix), mutexes))
    }

    /// Stand-in that never touches the network
    pub fn in_memory(prefix: &str) -> Result<Self> {
        Self::in_memory_with_options(prefix, RedlockOptions::default())
    }

    pub fn in_memory_with_options(prefix: &str, lock_options: RedlockOptions) -> Result<Self> {
        let keyspace = Keyspace::new(prefix);
        let node: Arc<dyn LockNode> = Arc::new(MemoryLockNode::new());
        let mutexes = Redlock::new(vec![node], keyspace.clone(), lock_options)?;
        Ok(Self::new(
            Arc::new(MemoryBackend::new()),
            keyspace,
            Arc::new(mutexes),
        ))
    }

    pub fn with_scan_batch_size(mut self, scan_batch_size: usize) -> Self {
        self.scan_batch_size = scan_batch_size.max(1);
        self
    }

    pub fn keyspace(&self) -> &Keyspace {
        self.store.keyspace()
    }
}

#[async_trait]
impl<T, I> Repository<T, I> for StoreRepository<T, I>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    I: EntityId,
{
    async fn load(&self, id: &I) -> Result<Option<T>> {
        self.store.load(id).await
    }

    async fn save(&self, id: &I, entity: &T) -> Result<()> {
        self.store.save(id, entity).await
    }

    async fn save_all(
        &self,
        inserts: &HashMap<I, T>,
        updates: &HashMap<I, ProcessEntity<T>>,
    ) -> Result<()> {
        self.store.save_all(inserts, updates).await
    }

    async fn remove_all(&self, ids: &[I]) -> Result<()> {
        self.store.remove_all(ids).await
    }

    async fn lock(&self, id: &I) -> Result<LockAttempt> {
        self.mutexes.lock(id).await
    }

    async fn new_and_lock(&self, id: &I) -> Result<bool> {
        self.mutexes.new_and_lock(id).await
    }

    async fn unlock_all(&self, ids: &[I]) {
        self.mutexes.unlock_all(ids).await
    }

    async fn query_all_ids(&self) -> Result<Vec<I>> {
        let keyspace = self.store.keyspace();
        let pattern = keyspace.scan_pattern();

        let mut cursor = 0;
        let mut rounds = 0;
        let mut seen: HashSet<String> = HashSet::new();
        let mut ids = Vec::new();
        loop {
            let page = self
                .backend
                .scan_page(cursor, &pattern, self.scan_batch_size)
                .await?;
            rounds += 1;

            for key in page.keys {
                // SCAN may hand out the same key twice
                if seen.contains(&key) {
                    continue;
                }
                ids.push(keyspace.id_from_key(&key)?);
                seen.insert(key);
            }

            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        tracing::debug!(
            "Scanned {} ids under {} in {} round(s)",
            ids.len(),
            keyspace.prefix(),
            rounds
        );
        Ok(ids)
    }

    async fn count(&self) -> Result<u64> {
        let ids = self.query_all_ids().await?;
        Ok(ids.len() as u64)
    }
}

/// Builds a repository, choosing Redis or in-memory mode once.
#[derive(Debug, Clone, Default)]
pub struct RepositoryBuilder {
    key_prefix: Option<String>,
    redis_url: Option<String>,
    lock_urls: Vec<String>,
    scan_batch_size: Option<usize>,
    lock_options: Option<RedlockOptions>,
}

impl RepositoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RepositoryConfig) -> Self {
        let mut builder = Self::new()
            .key_prefix(config.key_prefix.clone())
            .scan_batch_size(config.scan_batch_size)
            .lock_options(config.lock.to_redlock_options());

        if let Some(redis) = &config.redis {
            builder = builder
                .redis_url(redis.url.clone())
                .lock_urls(redis.lock_urls.clone());
        }

        builder
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Redlock nodes; defaults to the data connection alone
    pub fn lock_urls(mut self, urls: Vec<String>) -> Self {
        self.lock_urls = urls;
        self
    }

    pub fn scan_batch_size(mut self, size: usize) -> Self {
        self.scan_batch_size = Some(size);
        self
    }

    pub fn lock_options(mut self, options: RedlockOptions) -> Self {
        self.lock_options = Some(options);
        self
    }

    fn resolve_prefix(&self) -> Result<String> {
        let prefix = self.key_prefix.as_deref().unwrap_or_default();
        if prefix.trim().is_empty() {
            return Err(RepoError::Config(
                "repository key prefix cannot be empty".to_string(),
            ));
        }

        Ok(prefix.to_string())
    }

    fn resolve_scan_batch_size(&self) -> Result<usize> {
        match self.scan_batch_size {
            Some(0) => Err(RepoError::Config(
                "scan batch size must be greater than zero".to_string(),
            )),
            Some(size) => Ok(size),
            None => Ok(DEFAULT_SCAN_BATCH_SIZE),
        }
    }

    fn resolve_redis_url(&self) -> Option<&str> {
        self.redis_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub async fn build<T, I>(&self) -> Result<Arc<dyn Repository<T, I>>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        I: EntityId,
    {
        let prefix = self.resolve_prefix()?;
        let scan_batch_size = self.resolve_scan_batch_size()?;
        let keyspace = Keyspace::new(prefix.as_str());
        let lock_options = self.lock_options.clone().unwrap_or_default();
        lock_options.validate_for(&keyspace)?;

        let (backend, nodes) = match self.resolve_redis_url() {
            Some(url) => {
                let redis = RedisBackend::connect(url).await?;
                let nodes = self.connect_lock_nodes(&redis).await?;
                tracing::info!(
                    "Redis repository for {} with {} lock node(s)",
                    prefix,
                    nodes.len()
                );
                let backend: Arc<dyn HashBackend> = Arc::new(redis);
                (backend, nodes)
            }
            None => {
                tracing::info!("No Redis url configured; in-memory repository for {}", prefix);
                let backend: Arc<dyn HashBackend> = Arc::new(MemoryBackend::new());
                let node: Arc<dyn LockNode> = Arc::new(MemoryLockNode::new());
                (backend, vec![node])
            }
        };

        let mutexes = Redlock::new(nodes, keyspace.clone(), lock_options)?;
        let repository: Arc<dyn Repository<T, I>> = Arc::new(
            StoreRepository::<T, I>::new(backend, keyspace, Arc::new(mutexes))
                .with_scan_batch_size(scan_batch_size),
        );

        Ok(repository)
    }

    async fn connect_lock_nodes(&self, backend: &RedisBackend) -> Result<Vec<Arc<dyn LockNode>>> {
        let urls: Vec<&str> = self
            .lock_urls
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .collect();

        if urls.is_empty() {
            let node: Arc<dyn LockNode> =
                Arc::new(RedisLockNode::from_connection(backend.connection()));
            return Ok(vec![node]);
        }

        let mut nodes: Vec<Arc<dyn LockNode>> = Vec::with_capacity(urls.len());
        for url in urls {
            let node = RedisLockNode::connect(url).await?;
            nodes.push(Arc::new(node));
        }
        Ok(nodes)
    }
}

use super::{LockAttempt, LockNode, Mutexes};
use crate::error::{RepoError, Result};
use crate::id::{EntityId, Keyspace};
use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use ulid::Ulid;

#[derive(Debug, Clone)]
pub struct RedlockOptions {
    /// Lease of an acquired lock
    pub expiry: Duration,
    pub tries: u32,
    pub retry_delay_min: Duration,
    pub retry_delay_max: Duration,
    /// Fraction of `expiry` assumed lost to clock drift
    pub drift_factor: f64,
    /// Fraction of `expiry` a single node may take to answer
    pub timeout_factor: f64,
    /// Prepended to `<prefix><id>` so lock keys never collide with records
    pub namespace: String,
    /// Upper bound for the whole acquisition, retries included
    pub acquire_timeout: Option<Duration>,
}

impl RedlockOptions {
    pub fn validate(&self) -> Result<()> {
        if self.expiry.is_zero() {
            return Err(RepoError::Config(
                "redlock expiry must be greater than zero".to_string(),
            ));
        }
        if self.tries == 0 {
            return Err(RepoError::Config(
                "redlock tries must be greater than zero".to_string(),
            ));
        }
        if self.retry_delay_min > self.retry_delay_max {
            return Err(RepoError::Config(
                "redlock retry_delay_min exceeds retry_delay_max".to_string(),
            ));
        }
        if self.namespace.is_empty() {
            return Err(RepoError::Config(
                "redlock namespace cannot be empty".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.drift_factor)
            || self.timeout_factor <= 0.0
            || self.timeout_factor > 1.0
        {
            return Err(RepoError::Config(
                "redlock drift_factor and timeout_factor must be fractions".to_string(),
            ));
        }
        Ok(())
    }

    /// Rejects a namespace that would place lock keys under the record prefix
    /// of `keyspace`, where scans would report them as entities.
    pub fn validate_for(&self, keyspace: &Keyspace) -> Result<()> {
        self.validate()?;

        let prefix = keyspace.prefix();
        if format!("{}{}", self.namespace, prefix).starts_with(prefix) {
            return Err(RepoError::Config(format!(
                "lock namespace {:?} overlaps key prefix {:?}",
                self.namespace, prefix
            )));
        }
        Ok(())
    }
}

impl Default for RedlockOptions {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(8),
            tries: 32,
            retry_delay_min: Duration::from_millis(50),
            retry_delay_max: Duration::from_millis(250),
            drift_factor: 0.01,
            timeout_factor: 0.05,
            namespace: "lock:".to_string(),
            acquire_timeout: None,
        }
    }
}

/// Redlock over a set of independent lock nodes.
///
/// A lock is held when a majority of nodes accepted the same random token
/// and the lease is still valid after subtracting elapsed time and drift.
/// Tokens of held locks are remembered per instance, so `unlock_all` only
/// releases what this instance acquired.
pub struct Redlock {
    nodes: Vec<Arc<dyn LockNode>>,
    keyspace: Keyspace,
    options: RedlockOptions,
    held: Mutex<HashMap<String, HeldLock>>,
}

struct HeldLock {
    token: String,
    valid_until: Instant,
}

impl Redlock {
    pub fn new(
        nodes: Vec<Arc<dyn LockNode>>,
        keyspace: Keyspace,
        options: RedlockOptions,
    ) -> Result<Self> {
        if nodes.is_empty() {
            return Err(RepoError::Config(
                "redlock needs at least one lock node".to_string(),
            ));
        }
        options.validate_for(&keyspace)?;

        Ok(Self {
            nodes,
            keyspace,
            options,
            held: Mutex::new(HashMap::new()),
        })
    }

    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn options(&self) -> &RedlockOptions {
        &self.options
    }

    pub fn lock_name<I: EntityId>(&self, id: &I) -> String {
        format!("{}{}", self.options.namespace, self.keyspace.key(id))
    }

    /// Acquire `name`, retrying until `tries` or `acquire_timeout` runs out.
    ///
    /// Dropping the returned future stops acquisition; holds left on
    /// individual nodes then lapse with the lease.
    pub async fn acquire(&self, name: &str) -> bool {
        let deadline = self.options.acquire_timeout.map(|limit| Instant::now() + limit);

        for attempt in 0..self.options.tries {
            if attempt > 0 {
                let mut delay = self.retry_delay();
                if let Some(deadline) = deadline {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    delay = delay.min(remaining);
                }
                tokio::time::sleep(delay).await;
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }

            if let Some(lock) = self.try_once(name).await {
                let mut held = self.held.lock().await;
                // leases that ran out without an unlock
                let now = Instant::now();
                held.retain(|_, lock| lock.valid_until > now);
                held.insert(name.to_string(), lock);
                tracing::debug!("Acquired lock {} after {} attempt(s)", name, attempt + 1);
                return true;
            }
        }

        tracing::debug!("Gave up acquiring lock {}", name);
        false
    }

    /// Release `name` if this instance holds it; a no-op otherwise.
    pub async fn release(&self, name: &str) {
        let lock = self.held.lock().await.remove(name);
        let Some(HeldLock { token, .. }) = lock else {
            tracing::debug!("Unlock of {} ignored: not held", name);
            return;
        };

        let failures = self.release_everywhere(name, &token).await;
        if failures > 0 {
            tracing::warn!(
                "Releasing lock {} failed on {}/{} node(s); lease will expire",
                name,
                failures,
                self.nodes.len()
            );
        }
    }

    /// Whether this instance holds `name` with a lease that has not run out.
    pub async fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .await
            .get(name)
            .is_some_and(|lock| lock.valid_until > Instant::now())
    }

    async fn try_once(&self, name: &str) -> Option<HeldLock> {
        let token = Ulid::new().to_string();
        let expiry = self.options.expiry;
        let node_timeout = expiry.mul_f64(self.options.timeout_factor);
        let start = Instant::now();

        let outcomes = join_all(self.nodes.iter().map(|node| {
            let token = token.as_str();
            async move {
                match tokio::time::timeout(node_timeout, node.try_acquire(name, token, expiry))
                    .await
                {
                    Ok(Ok(taken)) => Ok(taken),
                    Ok(Err(error)) => Err(error.to_string()),
                    Err(_) => Err(format!("timed out after {:?}", node_timeout)),
                }
            }
        }))
        .await;

        let mut granted = 0;
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(true) => granted += 1,
                Ok(false) => {}
                Err(error) => errors.push(error),
            }
        }

        let drift = expiry.mul_f64(self.options.drift_factor) + Duration::from_millis(2);
        let validity = expiry
            .checked_sub(start.elapsed())
            .and_then(|left| left.checked_sub(drift))
            .filter(|left| !left.is_zero());

        if let Some(validity) = validity {
            if granted >= self.quorum() {
                return Some(HeldLock {
                    token,
                    valid_until: Instant::now() + validity,
                });
            }
        }

        if !errors.is_empty() {
            tracing::warn!(
                "Lock {} attempt hit {} node error(s): {}",
                name,
                errors.len(),
                errors.join("; ")
            );
        }

        // a node that timed out may still have stored the token
        if granted > 0 || !errors.is_empty() {
            self.release_everywhere(name, &token).await;
        }
        None
    }

    /// Returns the number of nodes that answered with an error.
    async fn release_everywhere(&self, name: &str, token: &str) -> usize {
        let node_timeout = self.options.expiry.mul_f64(self.options.timeout_factor);
        let outcomes = join_all(
            self.nodes
                .iter()
                .map(|node| tokio::time::timeout(node_timeout, node.release(name, token))),
        )
        .await;

        outcomes
            .into_iter()
            .filter(|outcome| !matches!(outcome, Ok(Ok(_))))
            .count()
    }

    fn retry_delay(&self) -> Duration {
        let min = self.options.retry_delay_min.as_millis() as u64;
        let max = self.options.retry_delay_max.as_millis() as u64;
        let millis = rand::thread_rng().gen_range(min.min(max)..=max.max(min));
        Duration::from_millis(millis)
    }
}

#[async_trait]
impl<I: EntityId> Mutexes<I> for Redlock {
    async fn lock(&self, id: &I) -> Result<LockAttempt> {
        let name = self.lock_name(id);
        if self.acquire(&name).await {
            Ok(LockAttempt::acquired())
        } else {
            Ok(LockAttempt::not_acquired())
        }
    }

    async fn new_and_lock(&self, id: &I) -> Result<bool> {
        let name = self.lock_name(id);
        Ok(self.acquire(&name).await)
    }

    async fn unlock_all(&self, ids: &[I]) {
        for id in ids {
            let name = self.lock_name(id);
            self.release(&name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::MemoryLockNode;

    struct DownNode;

    #[async_trait]
    impl LockNode for DownNode {
        async fn try_acquire(&self, _name: &str, _token: &str, _ttl: Duration) -> Result<bool> {
            Err(RepoError::Internal("connection refused".to_string()))
        }

        async fn release(&self, _name: &str, _token: &str) -> Result<bool> {
            Err(RepoError::Internal("connection refused".to_string()))
        }
    }

    fn fast_options() -> RedlockOptions {
        RedlockOptions {
            tries: 2,
            retry_delay_min: Duration::from_millis(1),
            retry_delay_max: Duration::from_millis(2),
            ..RedlockOptions::default()
        }
    }

    fn redlock(nodes: Vec<Arc<dyn LockNode>>) -> Redlock {
        Redlock::new(nodes, Keyspace::new("order:"), fast_options()).unwrap()
    }

    #[test]
    fn rejects_empty_node_list() {
        let result = Redlock::new(Vec::new(), Keyspace::new("x:"), RedlockOptions::default());
        assert!(matches!(result, Err(RepoError::Config(_))));
    }

    #[test]
    fn rejects_inverted_retry_delays() {
        let options = RedlockOptions {
            retry_delay_min: Duration::from_millis(300),
            ..RedlockOptions::default()
        };
        let node: Arc<dyn LockNode> = Arc::new(MemoryLockNode::new());
        let result = Redlock::new(vec![node], Keyspace::new("x:"), options);
        assert!(matches!(result, Err(RepoError::Config(_))));
    }

    #[test]
    fn rejects_namespaces_that_collide_with_records() {
        let node: Arc<dyn LockNode> = Arc::new(MemoryLockNode::new());

        let empty = RedlockOptions {
            namespace: String::new(),
            ..RedlockOptions::default()
        };
        assert!(matches!(empty.validate(), Err(RepoError::Config(_))));
        let result = Redlock::new(vec![node.clone()], Keyspace::new("user:"), empty);
        assert!(matches!(result, Err(RepoError::Config(_))));

        // "lock:lock:7" would be scanned as record "lock:7"
        let result = Redlock::new(
            vec![node.clone()],
            Keyspace::new("lock:"),
            RedlockOptions::default(),
        );
        assert!(matches!(result, Err(RepoError::Config(_))));

        let nested = RedlockOptions {
            namespace: "a".to_string(),
            ..RedlockOptions::default()
        };
        assert!(nested.validate_for(&Keyspace::new("aa")).is_err());
        assert!(nested.validate_for(&Keyspace::new("b:")).is_ok());
        assert!(RedlockOptions::default()
            .validate_for(&Keyspace::new("user:"))
            .is_ok());
    }

    #[test]
    fn lock_names_live_outside_the_record_keyspace() {
        let lock = redlock(vec![Arc::new(MemoryLockNode::new())]);
        assert_eq!(lock.lock_name(&"7".to_string()), "lock:order:7");
    }

    #[tokio::test]
    async fn second_manager_cannot_take_a_held_lock() {
        let node = MemoryLockNode::new();
        let a = redlock(vec![Arc::new(node.clone())]);
        let b = redlock(vec![Arc::new(node.clone())]);
        let id = "7".to_string();

        assert_eq!(a.lock(&id).await.unwrap(), LockAttempt::acquired());
        assert_eq!(b.lock(&id).await.unwrap(), LockAttempt::not_acquired());

        // b never held it, so its unlock must leave a's lock alone
        Mutexes::<String>::unlock_all(&b, &[id.clone()]).await;
        assert!(node.is_locked("lock:order:7").await);

        Mutexes::<String>::unlock_all(&a, &[id.clone()]).await;
        assert!(!node.is_locked("lock:order:7").await);
        assert_eq!(b.lock(&id).await.unwrap(), LockAttempt::acquired());
    }

    #[tokio::test]
    async fn lock_is_not_reentrant() {
        let lock = redlock(vec![Arc::new(MemoryLockNode::new())]);
        assert!(lock.new_and_lock(&1u64).await.unwrap());
        assert!(!lock.new_and_lock(&1u64).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_lockers_get_exactly_one_winner() {
        let node = MemoryLockNode::new();
        let managers: Vec<Arc<Redlock>> = (0..8)
            .map(|_| Arc::new(redlock(vec![Arc::new(node.clone())])))
            .collect();

        let handles: Vec<_> = managers
            .iter()
            .cloned()
            .map(|m| tokio::spawn(async move { m.lock(&"42".to_string()).await.unwrap() }))
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().acquired {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn majority_of_nodes_is_enough() {
        let lock = redlock(vec![
            Arc::new(MemoryLockNode::new()),
            Arc::new(MemoryLockNode::new()),
            Arc::new(DownNode),
        ]);
        assert_eq!(lock.quorum(), 2);
        assert!(lock.lock(&"a".to_string()).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn minority_grant_fails_and_rolls_back() {
        let healthy = MemoryLockNode::new();
        let lock = redlock(vec![
            Arc::new(healthy.clone()),
            Arc::new(DownNode),
            Arc::new(DownNode),
        ]);

        let attempt = lock.lock(&"a".to_string()).await.unwrap();
        assert_eq!(attempt, LockAttempt::not_acquired());
        assert!(!healthy.is_locked("lock:order:a").await);
    }

    #[tokio::test]
    async fn unreachable_backend_reports_not_acquired_without_error() {
        let lock = redlock(vec![Arc::new(DownNode)]);
        let attempt = lock.lock(&"a".to_string()).await.unwrap();
        assert!(!attempt.acquired);
        assert!(!attempt.absent);
    }

    #[tokio::test]
    async fn unlock_of_never_held_lock_is_a_noop() {
        let lock = redlock(vec![Arc::new(DownNode)]);
        Mutexes::<String>::unlock_all(&lock, &["nobody".to_string()]).await;
        assert!(!lock.is_held("lock:order:nobody").await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_timeout_bounds_waiting() {
        let node = MemoryLockNode::new();
        let holder = redlock(vec![Arc::new(node.clone())]);
        assert!(holder.new_and_lock(&"x".to_string()).await.unwrap());

        let waiter = Redlock::new(
            vec![Arc::new(node.clone())],
            Keyspace::new("order:"),
            RedlockOptions {
                tries: u32::MAX,
                acquire_timeout: Some(Duration::from_millis(500)),
                ..RedlockOptions::default()
            },
        )
        .unwrap();

        let started = Instant::now();
        assert!(!waiter.new_and_lock(&"x".to_string()).await.unwrap());
        assert!(started.elapsed() <= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn dropped_acquisition_is_cancelled() {
        let node = MemoryLockNode::new();
        let holder = redlock(vec![Arc::new(node.clone())]);
        assert!(holder.new_and_lock(&"x".to_string()).await.unwrap());

        let waiter = Redlock::new(
            vec![Arc::new(node)],
            Keyspace::new("order:"),
            RedlockOptions::default(),
        )
        .unwrap();

        let waited =
            tokio::time::timeout(Duration::from_millis(20), waiter.new_and_lock(&"x".to_string()))
                .await;
        assert!(waited.is_err());
        assert!(!waiter.is_held("lock:order:x").await);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_leases_are_forgotten() {
        let lock = redlock(vec![Arc::new(MemoryLockNode::new())]);
        assert!(lock.new_and_lock(&"a".to_string()).await.unwrap());
        assert!(lock.is_held("lock:order:a").await);

        tokio::time::advance(lock.options().expiry + Duration::from_secs(1)).await;
        assert!(!lock.is_held("lock:order:a").await);

        assert!(lock.new_and_lock(&"b".to_string()).await.unwrap());
        let held = lock.held.lock().await;
        assert_eq!(held.len(), 1);
        assert!(held.contains_key("lock:order:b"));
    }
}

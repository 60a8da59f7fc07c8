use super::LockNode;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Lease {
    token: String,
    expires_at: Instant,
}

/// In-process lock node with lease expiry.
///
/// Clones share the same lock table, so several `Redlock`s built from one
/// node contend with each other like separate processes on one Redis.
#[derive(Clone, Default)]
pub struct MemoryLockNode {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl MemoryLockNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is currently leased
    pub async fn is_locked(&self, name: &str) -> bool {
        let leases = self.leases.lock().await;
        leases
            .get(name)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }
}

#[async_trait]
impl LockNode for MemoryLockNode {
    async fn try_acquire(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        if let Some(lease) = leases.get(name) {
            if lease.expires_at > now {
                return Ok(false);
            }
        }

        leases.insert(
            name.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let owned = leases
            .get(name)
            .is_some_and(|lease| lease.token == token && lease.expires_at > Instant::now());

        if owned {
            leases.remove(name);
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let node = MemoryLockNode::new();
        let ttl = Duration::from_secs(8);

        assert!(node.try_acquire("lock:a", "t1", ttl).await.unwrap());
        assert!(!node.try_acquire("lock:a", "t2", ttl).await.unwrap());

        // wrong token never releases
        assert!(!node.release("lock:a", "t2").await.unwrap());
        assert!(node.is_locked("lock:a").await);

        assert!(node.release("lock:a", "t1").await.unwrap());
        assert!(node.try_acquire("lock:a", "t2", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expires_without_release() {
        let node = MemoryLockNode::new();

        assert!(node
            .try_acquire("lock:a", "t1", Duration::from_millis(100))
            .await
            .unwrap());
        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(!node.is_locked("lock:a").await);
        assert!(node
            .try_acquire("lock:a", "t2", Duration::from_millis(100))
            .await
            .unwrap());
        // the crashed holder's late release must not free the new lease
        assert!(!node.release("lock:a", "t1").await.unwrap());
    }
}

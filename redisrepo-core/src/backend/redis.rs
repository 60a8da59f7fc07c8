use super::{HashBackend, ScanPage};
use crate::error::{RepoError, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};

/// Redis-based hash backend
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
}

impl RedisBackend {
    /// Open a multiplexed connection and check it with a ping
    pub async fn connect(url: &str) -> Result<Self> {
        let conn = open_checked_connection(url).await?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

pub(crate) async fn open_checked_connection(url: &str) -> Result<MultiplexedConnection> {
    let client = Client::open(url)
        .map_err(|e| RepoError::Config(format!("Invalid Redis url '{}': {}", url, e)))?;

    let mut conn = client.get_multiplexed_async_connection().await?;

    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    Ok(conn)
}

#[async_trait]
impl HashBackend for RedisBackend {
    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(key, field).await?;
        Ok(())
    }

    async fn scan_page(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage> {
        let mut conn = self.conn.clone();
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(ScanPage { keys, cursor })
    }
}

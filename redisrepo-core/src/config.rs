use crate::error::{RepoError, Result};
use crate::id::Keyspace;
use crate::mutex::RedlockOptions;
use crate::repository::DEFAULT_SCAN_BATCH_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub key_prefix: String,
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
    /// Absent means in-memory mode
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Redlock nodes; empty means the data connection alone
    #[serde(default)]
    pub lock_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub expiry_ms: u64,
    pub tries: u32,
    pub retry_delay_min_ms: u64,
    pub retry_delay_max_ms: u64,
    pub drift_factor: f64,
    pub timeout_factor: f64,
    pub namespace: String,
    pub acquire_timeout_ms: Option<u64>,
}

fn default_scan_batch_size() -> usize {
    DEFAULT_SCAN_BATCH_SIZE
}

impl Default for LockConfig {
    fn default() -> Self {
        let options = RedlockOptions::default();
        Self {
            expiry_ms: options.expiry.as_millis() as u64,
            tries: options.tries,
            retry_delay_min_ms: options.retry_delay_min.as_millis() as u64,
            retry_delay_max_ms: options.retry_delay_max.as_millis() as u64,
            drift_factor: options.drift_factor,
            timeout_factor: options.timeout_factor,
            namespace: options.namespace,
            acquire_timeout_ms: None,
        }
    }
}

impl LockConfig {
    pub fn to_redlock_options(&self) -> RedlockOptions {
        RedlockOptions {
            expiry: Duration::from_millis(self.expiry_ms),
            tries: self.tries,
            retry_delay_min: Duration::from_millis(self.retry_delay_min_ms),
            retry_delay_max: Duration::from_millis(self.retry_delay_max_ms),
            drift_factor: self.drift_factor,
            timeout_factor: self.timeout_factor,
            namespace: self.namespace.clone(),
            acquire_timeout: self.acquire_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl RepositoryConfig {
    /// In-memory configuration for `key_prefix`
    pub fn in_memory(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            redis: None,
            lock: LockConfig::default(),
        }
    }

    /// Load from a file, overridden by `REDISREPO_*` environment variables
    /// (`__` separates nested keys, e.g. `REDISREPO_REDIS__URL`).
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("REDISREPO")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| RepoError::Config(e.to_string()))?;

        let config: RepositoryConfig = settings
            .try_deserialize()
            .map_err(|e| RepoError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.trim().is_empty() {
            return Err(RepoError::Config("key_prefix cannot be empty".to_string()));
        }
        if self.scan_batch_size == 0 {
            return Err(RepoError::Config(
                "scan_batch_size must be greater than zero".to_string(),
            ));
        }
        if let Some(redis) = &self.redis {
            if redis.url.trim().is_empty() {
                return Err(RepoError::Config("redis.url cannot be empty".to_string()));
            }
        }
        self.lock
            .to_redlock_options()
            .validate_for(&Keyspace::new(self.key_prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("repo.toml");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(contents.as_bytes()).expect("write");
        let path = path.to_string_lossy().to_string();
        (dir, path)
    }

    #[test]
    fn minimal_file_uses_defaults() {
        let (_dir, path) = write_config("key_prefix = \"user:\"\n");
        let config = RepositoryConfig::from_file(&path).expect("config");

        assert_eq!(config.key_prefix, "user:");
        assert_eq!(config.scan_batch_size, DEFAULT_SCAN_BATCH_SIZE);
        assert!(config.redis.is_none());

        let options = config.lock.to_redlock_options();
        assert_eq!(options.expiry, Duration::from_secs(8));
        assert_eq!(options.tries, 32);
        assert_eq!(options.namespace, "lock:");
        assert!(options.acquire_timeout.is_none());
    }

    #[test]
    fn full_file_is_parsed() {
        let (_dir, path) = write_config(
            r#"
key_prefix = "order:"
scan_batch_size = 500

[redis]
url = "redis://127.0.0.1:6379"
lock_urls = ["redis://10.0.0.1:6379", "redis://10.0.0.2:6379", "redis://10.0.0.3:6379"]

[lock]
expiry_ms = 3000
tries = 5
acquire_timeout_ms = 1500
"#,
        );
        let config = RepositoryConfig::from_file(&path).expect("config");

        assert_eq!(config.scan_batch_size, 500);
        let redis = config.redis.as_ref().expect("redis");
        assert_eq!(redis.url, "redis://127.0.0.1:6379");
        assert_eq!(redis.lock_urls.len(), 3);

        let options = config.lock.to_redlock_options();
        assert_eq!(options.expiry, Duration::from_millis(3000));
        assert_eq!(options.tries, 5);
        assert_eq!(options.acquire_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.retry_delay_max, Duration::from_millis(250));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let (_dir, path) = write_config("key_prefix = \"\"\n");
        assert!(matches!(
            RepositoryConfig::from_file(&path),
            Err(RepoError::Config(_))
        ));

        let (_dir, path) = write_config("key_prefix = \"a:\"\nscan_batch_size = 0\n");
        assert!(matches!(
            RepositoryConfig::from_file(&path),
            Err(RepoError::Config(_))
        ));

        let mut config = RepositoryConfig::in_memory("a:");
        config.lock.retry_delay_min_ms = 900;
        assert!(config.validate().is_err());
    }

    #[test]
    fn lock_namespace_must_stay_apart_from_records() {
        let mut config = RepositoryConfig::in_memory("user:");
        config.lock.namespace = String::new();
        assert!(matches!(config.validate(), Err(RepoError::Config(_))));

        let (_dir, path) = write_config("key_prefix = \"lock:\"\n");
        assert!(matches!(
            RepositoryConfig::from_file(&path),
            Err(RepoError::Config(_))
        ));

        let (_dir, path) = write_config("key_prefix = \"lock:\"\n[lock]\nnamespace = \"mutex:\"\n");
        assert!(RepositoryConfig::from_file(&path).is_ok());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = RepositoryConfig::from_file("/definitely/not/here/repo.toml");
        assert!(matches!(result, Err(RepoError::Config(_))));
    }
}

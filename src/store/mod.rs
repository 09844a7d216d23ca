//! TTL-bounded progress/result store.
//!
//! Progress updates and final results live under `progress:{job_id}` and
//! `result:{job_id}` so their lifetimes expire independently. Every write
//! carries the same fixed TTL, applied atomically with the write. The
//! underlying connection is created lazily on first use with a bounded
//! number of attempts, then shared for the rest of the process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use tracing::info;

use crate::config::StoreConfig;
use crate::types::{AppError, AppResult, ProgressUpdate};
use crate::utils::with_fixed_retry;

/// Minimal key-value surface the store needs: set-with-expiry and get.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> AppResult<()>;
    async fn get(&self, key: &str) -> AppResult<Option<String>>;
}

/// Redis-backed `Kv`. Connects on first use, retrying a bounded number
/// of times with a fixed delay, then caches the connection manager.
pub struct RedisKv {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    connect_attempts: u32,
    connect_delay: Duration,
}

impl RedisKv {
    pub fn new(config: &StoreConfig) -> AppResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            connect_attempts: config.connect_attempts,
            connect_delay: config.connect_delay(),
        })
    }

    async fn conn(&self) -> AppResult<ConnectionManager> {
        let manager = self
            .conn
            .get_or_try_init(|| async {
                let client = self.client.clone();
                let manager = with_fixed_retry(self.connect_attempts, self.connect_delay, move || {
                    let client = client.clone();
                    async move { ConnectionManager::new(client).await }
                })
                .await
                .map_err(|e| {
                    AppError::StoreUnavailable(format!(
                        "could not connect after {} attempts: {}",
                        self.connect_attempts, e
                    ))
                })?;
                info!("store connection established");
                Ok::<_, AppError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> AppResult<()> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get(key)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }
}

fn progress_key(job_id: &str) -> String {
    format!("progress:{}", job_id)
}

fn result_key(job_id: &str) -> String {
    format!("result:{}", job_id)
}

/// Durable job progress/result store, addressed by job id.
#[derive(Clone)]
pub struct JobStore {
    kv: Arc<dyn Kv>,
    ttl: Duration,
}

impl JobStore {
    pub fn new(config: &StoreConfig) -> AppResult<Self> {
        Ok(Self {
            kv: Arc::new(RedisKv::new(config)?),
            ttl: config.ttl(),
        })
    }

    /// Build a store over an alternative backend. Used by tests; also the
    /// seam for swapping the KV engine without touching callers.
    pub fn with_backend(kv: Arc<dyn Kv>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub async fn set_progress(&self, update: &ProgressUpdate) -> AppResult<()> {
        let value = serde_json::to_string(update)
            .map_err(|e| AppError::Internal(format!("failed to encode progress: {}", e)))?;
        self.kv
            .set_ex(&progress_key(&update.job_id), value, self.ttl)
            .await
    }

    pub async fn get_progress(&self, job_id: &str) -> AppResult<Option<ProgressUpdate>> {
        match self.kv.get(&progress_key(job_id)).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| AppError::MalformedMessage(format!("stored progress: {}", e))),
        }
    }

    pub async fn set_result(&self, job_id: &str, result: &serde_json::Value) -> AppResult<()> {
        let value = serde_json::to_string(result)
            .map_err(|e| AppError::Internal(format!("failed to encode result: {}", e)))?;
        self.kv.set_ex(&result_key(job_id), value, self.ttl).await
    }

    pub async fn get_result(&self, job_id: &str) -> AppResult<Option<serde_json::Value>> {
        match self.kv.get(&result_key(job_id)).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| AppError::MalformedMessage(format!("stored result: {}", e))),
        }
    }
}

/// In-memory `Kv` with real expiry, for tests that exercise store
/// semantics without a live server.
#[cfg(test)]
pub(crate) struct MemoryKv {
    entries: std::sync::Mutex<std::collections::HashMap<String, (String, tokio::time::Instant)>>,
}

#[cfg(test)]
impl MemoryKv {
    pub(crate) fn new() -> Self {
        Self {
            entries: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Kv for MemoryKv {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> AppResult<()> {
        let expires = tokio::time::Instant::now() + ttl;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((_, expires)) if *expires <= tokio::time::Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub(crate) fn memory_store(ttl: Duration) -> JobStore {
    JobStore::with_backend(Arc::new(MemoryKv::new()), ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobStage;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_key_layout() {
        assert_eq!(progress_key("abc123"), "progress:abc123");
        assert_eq!(result_key("abc123"), "result:abc123");
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_durable_until_ttl() {
        let store = memory_store(DAY);
        let payload = serde_json::json!({"topics": ["rust", "redis"]});

        store.set_result("abc123", &payload).await.unwrap();
        assert_eq!(store.get_result("abc123").await.unwrap(), Some(payload.clone()));
        // Repeated reads return the same value.
        assert_eq!(store.get_result("abc123").await.unwrap(), Some(payload));

        tokio::time::advance(DAY + Duration::from_secs(1)).await;
        assert_eq!(store.get_result("abc123").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_replaces_previous_update() {
        let store = memory_store(DAY);

        store
            .set_progress(&ProgressUpdate {
                job_id: "abc123".to_string(),
                stage: JobStage::Started,
                message: "picked up".to_string(),
                percent: 0.0,
            })
            .await
            .unwrap();
        store
            .set_progress(&ProgressUpdate {
                job_id: "abc123".to_string(),
                stage: JobStage::Running,
                message: "clustering".to_string(),
                percent: 0.4,
            })
            .await
            .unwrap();

        let current = store.get_progress("abc123").await.unwrap().unwrap();
        assert_eq!(current.stage, JobStage::Running);
        assert_eq!(current.percent, 0.4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_and_result_expire_independently() {
        let store = memory_store(DAY);

        store
            .set_progress(&ProgressUpdate {
                job_id: "abc123".to_string(),
                stage: JobStage::Running,
                message: String::new(),
                percent: 0.5,
            })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        store
            .set_result("abc123", &serde_json::json!({"ok": true}))
            .await
            .unwrap();

        // Progress written earlier expires first.
        tokio::time::advance(DAY - Duration::from_secs(30)).await;
        assert!(store.get_progress("abc123").await.unwrap().is_none());
        assert!(store.get_result("abc123").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_job_reads_as_none() {
        let store = memory_store(DAY);
        assert!(store.get_progress("missing").await.unwrap().is_none());
        assert!(store.get_result("missing").await.unwrap().is_none());
    }
}

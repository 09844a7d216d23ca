use anyhow::Result;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub analytics: AnalyticsConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    pub topic_queue: String,
    pub sentiment_queue: String,
    pub progress_queue: String,
    pub results_queue: String,
    pub rpc_timeout_secs: u64,
}

impl BrokerConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    pub ttl_secs: u64,
    pub connect_attempts: u32,
    pub connect_delay_ms: u64,
}

impl StoreConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_size: usize,
    pub acquire_timeout_secs: u64,
}

impl AnalyticsConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// 0 means retry forever.
    pub max_reconnect_attempts: u32,
}

impl WorkerConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            broker: BrokerConfig {
                url: env::var("BROKER_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                topic_queue: env::var("TOPIC_QUEUE")
                    .unwrap_or_else(|_| "topic_model_queue".to_string()),
                sentiment_queue: env::var("SENTIMENT_QUEUE")
                    .unwrap_or_else(|_| "sentiment_analysis_queue".to_string()),
                progress_queue: env::var("PROGRESS_QUEUE")
                    .unwrap_or_else(|_| "job_progress_queue".to_string()),
                results_queue: env::var("RESULTS_QUEUE")
                    .unwrap_or_else(|_| "job_results_queue".to_string()),
                rpc_timeout_secs: env::var("RPC_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()?,
            },
            store: StoreConfig {
                url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                ttl_secs: env::var("RESULT_TTL_SECS")
                    .unwrap_or_else(|_| "86400".to_string())
                    .parse()?,
                connect_attempts: env::var("STORE_CONNECT_ATTEMPTS")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()?,
                connect_delay_ms: env::var("STORE_CONNECT_DELAY_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()?,
            },
            analytics: AnalyticsConfig {
                host: env::var("CH_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env::var("CH_PORT")
                    .unwrap_or_else(|_| "8123".to_string())
                    .parse()?,
                database: env::var("CH_DATABASE").unwrap_or_else(|_| "default".to_string()),
                user: env::var("CH_USER").unwrap_or_else(|_| "default".to_string()),
                password: env::var("CH_PASSWORD").unwrap_or_default(),
                pool_size: env::var("CH_POOL_SIZE")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse()?,
                acquire_timeout_secs: env::var("CH_ACQUIRE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()?,
            },
            worker: WorkerConfig {
                backoff_base_ms: env::var("WORKER_BACKOFF_BASE_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()?,
                backoff_max_ms: env::var("WORKER_BACKOFF_MAX_MS")
                    .unwrap_or_else(|_| "60000".to_string())
                    .parse()?,
                max_reconnect_attempts: env::var("WORKER_MAX_RECONNECT_ATTEMPTS")
                    .unwrap_or_else(|_| "0".to_string())
                    .parse()?,
            },
        })
    }
}

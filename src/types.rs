// Wire types and error taxonomy

use serde::{Deserialize, Serialize};

/// Version stamped into every published message and validated at the
/// consume boundary. Bump when a field changes meaning.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema() -> u32 {
    SCHEMA_VERSION
}

/// Lifecycle stage of a job. `Done` is terminal: once stored, no later
/// update may revert it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Started,
    Running,
    Done,
    Error,
}

impl JobStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Done)
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStage::Started => write!(f, "started"),
            JobStage::Running => write!(f, "running"),
            JobStage::Done => write!(f, "done"),
            JobStage::Error => write!(f, "error"),
        }
    }
}

/// Caller-supplied parameters for one analytical job. Field names follow
/// the wire schema the web tier already speaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParams {
    pub subreddit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option: Option<String>,
    #[serde(rename = "startDate", default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<chrono::NaiveDate>,
    #[serde(rename = "endDate", default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<chrono::NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,
}

/// One unit of asynchronous analytical work. The `job_id` is the only
/// correlation mechanism between a request, its progress updates and its
/// result; it is also duplicated into the envelope correlation id so
/// listeners never have to dig it out of an arbitrary body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default = "default_schema")]
    pub schema: u32,
    pub job_id: String,
    #[serde(flatten)]
    pub params: JobParams,
}

/// Current progress of one job. Each update replaces the previous one in
/// the store; there is no history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub stage: JobStage,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub percent: f32,
}

/// Broker wire frame. Correlation id and reply queue ride as metadata
/// next to the body, never inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_schema")]
    pub schema: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            correlation_id: None,
            reply_to: None,
            body,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn encode(&self) -> AppResult<String> {
        serde_json::to_string(self)
            .map_err(|e| AppError::Internal(format!("failed to encode envelope: {}", e)))
    }

    pub fn decode(raw: &str) -> AppResult<Self> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| AppError::MalformedMessage(format!("invalid envelope: {}", e)))?;
        if envelope.schema > SCHEMA_VERSION {
            return Err(AppError::MalformedMessage(format!(
                "unsupported schema version {}",
                envelope.schema
            )));
        }
        Ok(envelope)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Connection pool exhausted after {0:?}")]
    PoolExhausted(std::time::Duration),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("RPC reply timed out after {0:?}")]
    RpcTimeout(std::time::Duration),

    #[error("Analytics query failed: {0}")]
    Analytics(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = std::result::Result<T, AppError>;

//! Job submission: fire-and-forget publishing and synchronous RPC.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::types::{AppError, AppResult, Envelope, JobParams, JobRequest, SCHEMA_VERSION};

use super::{broker_err, queue_key, reply_queue_name, Broker};

/// Which worker pool a job is routed to. Each kind has its own durable
/// work queue; progress and results flow through the shared queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Topic,
    Sentiment,
}

impl JobKind {
    pub fn queue<'a>(&self, config: &'a BrokerConfig) -> &'a str {
        match self {
            JobKind::Topic => &config.topic_queue,
            JobKind::Sentiment => &config.sentiment_queue,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Topic => write!(f, "topic"),
            JobKind::Sentiment => write!(f, "sentiment"),
        }
    }
}

/// Wrap job parameters in the wire envelope, duplicating `job_id` into
/// the correlation-id metadata so consumers never parse it out of the
/// body.
pub(crate) fn job_envelope(params: &JobParams, job_id: &str) -> AppResult<Envelope> {
    let request = JobRequest {
        schema: SCHEMA_VERSION,
        job_id: job_id.to_string(),
        params: params.clone(),
    };
    let body = serde_json::to_value(&request)
        .map_err(|e| AppError::Internal(format!("failed to encode job request: {}", e)))?;
    Ok(Envelope::new(body).with_correlation_id(job_id))
}

/// Publishes job requests onto a durable work queue.
///
/// Construction connects eagerly and fails immediately if the broker is
/// unreachable; retrying construction is the caller's concern.
pub struct JobDispatcher {
    broker: Broker,
    conn: MultiplexedConnection,
    queue: String,
    rpc_timeout: Duration,
}

impl JobDispatcher {
    pub async fn connect(config: &BrokerConfig, kind: JobKind) -> AppResult<Self> {
        let broker = Broker::new(config)?;
        let conn = broker.connect().await?;
        Ok(Self {
            queue: kind.queue(config).to_string(),
            rpc_timeout: config.rpc_timeout(),
            broker,
            conn,
        })
    }

    /// Fire-and-forget submission. Returns once the broker has accepted
    /// the publish; progress and results are polled separately through
    /// the store.
    pub async fn send_job(&mut self, params: &JobParams, job_id: &str) -> AppResult<()> {
        let envelope = job_envelope(params, job_id)?;
        self.broker.publish(&mut self.conn, &self.queue, &envelope).await?;
        debug!("dispatched job {} to {}", job_id, self.queue);
        Ok(())
    }

    /// Synchronous RPC submission: publish with a private reply queue
    /// and block until a reply with a matching correlation id arrives or
    /// the configured deadline elapses.
    pub async fn call(&mut self, params: &JobParams) -> AppResult<serde_json::Value> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let reply_queue = reply_queue_name();

        let envelope = job_envelope(params, &job_id)?.with_reply_to(&reply_queue);
        self.broker.publish(&mut self.conn, &self.queue, &envelope).await?;

        let deadline = tokio::time::Instant::now() + self.rpc_timeout;
        loop {
            let Some(poll) = poll_window(deadline, tokio::time::Instant::now()) else {
                return Err(AppError::RpcTimeout(self.rpc_timeout));
            };

            let popped: Option<(String, String)> = self
                .conn
                .brpop(queue_key(&reply_queue), poll)
                .await
                .map_err(broker_err)?;
            match popped {
                None => return Err(AppError::RpcTimeout(self.rpc_timeout)),
                Some((_, raw)) => {
                    if let Some(body) = match_reply(&raw, &job_id) {
                        return Ok(body);
                    }
                }
            }
        }
    }
}

/// The server applies blocking-pop timeouts with millisecond precision
/// and reads a zero timeout as "wait indefinitely", so a window that
/// would truncate to zero must end the wait instead of being passed on.
const MIN_RPC_POLL: Duration = Duration::from_millis(1);

/// Remaining blocking-pop window in seconds, or `None` once the
/// deadline is effectively spent.
fn poll_window(deadline: tokio::time::Instant, now: tokio::time::Instant) -> Option<f64> {
    let remaining = deadline.saturating_duration_since(now);
    if remaining < MIN_RPC_POLL {
        return None;
    }
    Some(remaining.as_secs_f64())
}

/// Decide whether a raw reply settles the call. Mismatched and
/// malformed replies are dropped and the wait continues; only the
/// worker writes to the private reply queue, so neither is retryable.
fn match_reply(raw: &str, correlation_id: &str) -> Option<serde_json::Value> {
    match Envelope::decode(raw) {
        Ok(reply) if reply.correlation_id.as_deref() == Some(correlation_id) => Some(reply.body),
        Ok(_) => {
            warn!("discarding reply with mismatched correlation id");
            None
        }
        Err(err) => {
            warn!("dropping malformed reply message: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            url: "redis://localhost:6379".to_string(),
            topic_queue: "topic_model_queue".to_string(),
            sentiment_queue: "sentiment_analysis_queue".to_string(),
            progress_queue: "job_progress_queue".to_string(),
            results_queue: "job_results_queue".to_string(),
            rpc_timeout_secs: 300,
        }
    }

    #[test]
    fn test_kind_routes_to_its_queue() {
        let config = test_config();
        assert_eq!(JobKind::Topic.queue(&config), "topic_model_queue");
        assert_eq!(JobKind::Sentiment.queue(&config), "sentiment_analysis_queue");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_window_ends_wait_when_deadline_spent() {
        let now = tokio::time::Instant::now();

        // A healthy window passes through in seconds.
        assert_eq!(poll_window(now + Duration::from_secs(2), now), Some(2.0));

        // A sub-millisecond remainder would truncate to a zero timeout,
        // which the server reads as "block forever".
        assert_eq!(poll_window(now + Duration::from_micros(400), now), None);
        assert_eq!(poll_window(now, now), None);
        assert_eq!(poll_window(now, now + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_match_reply_requires_matching_correlation_id() {
        let raw = Envelope::new(serde_json::json!({"ok": true}))
            .with_correlation_id("abc123")
            .encode()
            .unwrap();

        assert_eq!(
            match_reply(&raw, "abc123"),
            Some(serde_json::json!({"ok": true}))
        );
        assert_eq!(match_reply(&raw, "other-id"), None);
    }

    #[test]
    fn test_match_reply_skips_malformed_replies() {
        // A bad message on the reply queue keeps the wait going rather
        // than surfacing a parse error to the caller.
        assert_eq!(match_reply("not json", "abc123"), None);
    }

    #[test]
    fn test_job_envelope_carries_correlation_id() {
        let params = JobParams {
            subreddit: "test".to_string(),
            option: None,
            start_date: None,
            end_date: None,
            data_source: None,
        };

        let envelope = job_envelope(&params, "abc123").unwrap();
        assert_eq!(envelope.correlation_id.as_deref(), Some("abc123"));
        assert_eq!(envelope.body["job_id"], "abc123");
        assert_eq!(envelope.body["subreddit"], "test");
        assert!(envelope.reply_to.is_none());
    }
}

//! Worker-side consumption: pull one job at a time, run the job
//! function, emit progress and a result.
//!
//! The consume loop is supervised: any connect or consume failure is
//! logged and followed by an exponential-backoff sleep before
//! reconnecting. One message is in flight per consumer; horizontal
//! throughput comes from running more consumer processes competing for
//! the same queue.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::types::{AppError, AppResult, Envelope, JobRequest, JobStage, ProgressUpdate};

use super::dispatcher::JobKind;
use super::{Broker, Delivery, Supervisor};

/// Seconds each blocking pop waits before the loop re-checks the
/// connection.
const CONSUME_POLL_SECS: f64 = 5.0;

/// The opaque job function. Implementations receive the parsed request
/// and a sink for progress updates; the returned value becomes the job
/// result payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(
        &self,
        request: JobRequest,
        progress: &mut ProgressSink,
    ) -> AppResult<serde_json::Value>;
}

#[async_trait]
pub(crate) trait ProgressPublisher: Send {
    async fn publish(&mut self, update: &ProgressUpdate) -> AppResult<()>;
}

struct BrokerProgress {
    conn: MultiplexedConnection,
    broker: Broker,
    queue: String,
}

#[async_trait]
impl ProgressPublisher for BrokerProgress {
    async fn publish(&mut self, update: &ProgressUpdate) -> AppResult<()> {
        let body = serde_json::to_value(update)
            .map_err(|e| AppError::Internal(format!("failed to encode progress: {}", e)))?;
        let envelope = Envelope::new(body).with_correlation_id(&update.job_id);
        self.broker.publish(&mut self.conn, &self.queue, &envelope).await
    }
}

/// Keeps `percent` within 0.0–1.0 and never lets it run backwards.
fn next_percent(last: f32, requested: f32) -> f32 {
    requested.clamp(0.0, 1.0).max(last)
}

/// Publishes progress updates for one job with monotonically
/// non-decreasing `percent`.
pub struct ProgressSink {
    publisher: Box<dyn ProgressPublisher>,
    job_id: String,
    last_percent: f32,
}

impl ProgressSink {
    fn new(publisher: Box<dyn ProgressPublisher>, job_id: String) -> Self {
        Self {
            publisher,
            job_id,
            last_percent: 0.0,
        }
    }

    pub async fn update(
        &mut self,
        stage: JobStage,
        message: impl Into<String>,
        percent: f32,
    ) -> AppResult<()> {
        self.last_percent = next_percent(self.last_percent, percent);
        let update = ProgressUpdate {
            job_id: self.job_id.clone(),
            stage,
            message: message.into(),
            percent: self.last_percent,
        };
        self.publisher.publish(&update).await
    }

    #[cfg(test)]
    pub(crate) fn capture(
        job_id: &str,
    ) -> (Self, Arc<std::sync::Mutex<Vec<ProgressUpdate>>>) {
        let captured = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct Capture(Arc<std::sync::Mutex<Vec<ProgressUpdate>>>);

        #[async_trait]
        impl ProgressPublisher for Capture {
            async fn publish(&mut self, update: &ProgressUpdate) -> AppResult<()> {
                self.0.lock().unwrap().push(update.clone());
                Ok(())
            }
        }

        (
            Self::new(Box::new(Capture(Arc::clone(&captured))), job_id.to_string()),
            captured,
        )
    }
}

/// Parse a raw work-queue message into its envelope and typed request.
pub(crate) fn decode_request(raw: &str) -> AppResult<(Envelope, JobRequest)> {
    let envelope = Envelope::decode(raw)?;
    let request: JobRequest = serde_json::from_value(envelope.body.clone())
        .map_err(|e| AppError::MalformedMessage(format!("invalid job request: {}", e)))?;
    if request.job_id.is_empty() {
        return Err(AppError::MalformedMessage("empty job_id".to_string()));
    }
    Ok((envelope, request))
}

pub struct WorkerConsumer<H> {
    broker: Broker,
    queue: String,
    handler: Arc<H>,
    worker: WorkerConfig,
}

impl<H: JobHandler + 'static> WorkerConsumer<H> {
    pub fn new(broker: Broker, kind: JobKind, handler: H, worker: &WorkerConfig) -> Self {
        let queue = kind.queue(broker.config()).to_string();
        Self {
            broker,
            queue,
            handler: Arc::new(handler),
            worker: worker.clone(),
        }
    }

    /// Run the supervised consume loop. Only returns once the cap on
    /// consecutive failed reconnects (if configured) is exhausted.
    pub async fn run(&self) -> AppResult<()> {
        let mut supervisor = Supervisor::new(&self.worker);

        loop {
            if let Err(err) = self.consume_loop(&mut supervisor).await {
                error!("worker loop on {} failed: {}", self.queue, err);
            }
            let Some(delay) = supervisor.next_reconnect() else {
                return Err(AppError::BrokerUnavailable(format!(
                    "gave up on {} after {} consecutive reconnect attempts",
                    self.queue, self.worker.max_reconnect_attempts
                )));
            };
            warn!("reconnecting to {} in {:?}", self.queue, delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn consume_loop(&self, supervisor: &mut Supervisor) -> AppResult<()> {
        let mut conn = self.broker.connect().await?;
        let recovered = self.broker.recover(&mut conn, &self.queue).await?;
        if recovered > 0 {
            info!("requeued {} stale message(s) on {}", recovered, self.queue);
        }
        supervisor.connected();
        info!("consuming from {}", self.queue);

        loop {
            let Some(delivery) = self
                .broker
                .consume(&mut conn, &self.queue, CONSUME_POLL_SECS)
                .await?
            else {
                continue;
            };
            self.handle_delivery(&mut conn, delivery).await?;
        }
    }

    /// Process one delivery end to end. Only infrastructure failures
    /// propagate (leaving the message unacked for redelivery); bad
    /// messages and job failures are absorbed, logged and acked.
    async fn handle_delivery(
        &self,
        conn: &mut MultiplexedConnection,
        delivery: Delivery,
    ) -> AppResult<()> {
        let (envelope, request) = match decode_request(&delivery.raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("dropping malformed message on {}: {}", self.queue, err);
                return self.broker.ack(conn, &delivery).await;
            }
        };

        let job_id = request.job_id.clone();
        info!("processing job {} from {}", job_id, self.queue);

        let mut sink = ProgressSink::new(
            Box::new(BrokerProgress {
                conn: conn.clone(),
                broker: self.broker.clone(),
                queue: self.broker.config().progress_queue.clone(),
            }),
            job_id.clone(),
        );
        if let Err(err) = sink.update(JobStage::Started, "job received", 0.0).await {
            warn!("could not publish start progress for {}: {}", job_id, err);
        }

        match self.handler.run(request, &mut sink).await {
            Ok(result) => {
                let reply = Envelope::new(result).with_correlation_id(&job_id);
                self.broker
                    .publish(conn, &self.broker.config().results_queue, &reply)
                    .await?;
                if let Some(reply_to) = envelope.reply_to.as_deref() {
                    self.broker.publish(conn, reply_to, &reply).await?;
                }
                info!("job {} complete", job_id);
            }
            Err(err) => {
                // No retry and no dead-letter: the failure is made
                // visible to pollers through an error progress update.
                error!("job {} failed: {}", job_id, err);
                if let Err(publish_err) =
                    sink.update(JobStage::Error, &err.to_string(), 1.0).await
                {
                    warn!(
                        "could not publish error progress for {}: {}",
                        job_id, publish_err
                    );
                }
            }
        }

        self.broker.ack(conn, &delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_never_decreases() {
        assert_eq!(next_percent(0.0, 0.3), 0.3);
        assert_eq!(next_percent(0.5, 0.2), 0.5);
        assert_eq!(next_percent(0.5, 0.9), 0.9);
    }

    #[test]
    fn test_percent_clamped_to_unit_range() {
        assert_eq!(next_percent(0.0, -0.5), 0.0);
        assert_eq!(next_percent(0.0, 1.7), 1.0);
    }

    #[test]
    fn test_decode_request_rejects_garbage() {
        assert!(matches!(
            decode_request("not json at all"),
            Err(AppError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_request_requires_job_fields() {
        // Valid envelope, body missing the subreddit field.
        let raw = r#"{"schema":1,"body":{"job_id":"abc123"}}"#;
        assert!(matches!(
            decode_request(raw),
            Err(AppError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_request_roundtrip() {
        let raw = r#"{"schema":1,"correlation_id":"abc123","body":{"job_id":"abc123","subreddit":"test"}}"#;
        let (envelope, request) = decode_request(raw).unwrap();
        assert_eq!(envelope.correlation_id.as_deref(), Some("abc123"));
        assert_eq!(request.job_id, "abc123");
        assert_eq!(request.params.subreddit, "test");
    }

    #[tokio::test]
    async fn test_progress_sink_enforces_monotonic_percent() {
        let (mut sink, captured) = ProgressSink::capture("abc123");
        sink.update(JobStage::Started, "received", 0.0).await.unwrap();
        sink.update(JobStage::Running, "clustering", 0.6).await.unwrap();
        sink.update(JobStage::Running, "labeling", 0.4).await.unwrap();

        let updates = captured.lock().unwrap();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[1].percent, 0.6);
        // A late, lower percent is held at the high-water mark.
        assert_eq!(updates[2].percent, 0.6);
        assert!(updates.iter().all(|u| u.job_id == "abc123"));
    }
}

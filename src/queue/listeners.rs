//! Background loops that drain the progress and result queues into the
//! store.
//!
//! Both listeners follow the worker's supervised reconnect pattern and
//! ack every message after the write attempt, whatever the outcome: a
//! malformed or unwritable message is dropped, not retried, so a poison
//! message can never wedge the loop.

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::store::JobStore;
use crate::types::{AppResult, JobStage, ProgressUpdate};

use super::{Broker, Supervisor};

const CONSUME_POLL_SECS: f64 = 5.0;

/// Write a progress update unless the job is already finalized. A late
/// progress event must never revert a stored `done` stage.
pub(crate) async fn apply_progress(store: &JobStore, update: &ProgressUpdate) -> AppResult<()> {
    if let Some(current) = store.get_progress(&update.job_id).await? {
        if current.stage.is_terminal() {
            debug!("ignoring stale progress for finalized job {}", update.job_id);
            return Ok(());
        }
    }
    store.set_progress(update).await
}

/// Persist a job result and finalize its progress. This is the only
/// path that transitions a job to `done`.
pub(crate) async fn apply_result(store: &JobStore, job_id: &str, payload: &Value) -> AppResult<()> {
    store.set_result(job_id, payload).await?;
    store
        .set_progress(&ProgressUpdate {
            job_id: job_id.to_string(),
            stage: JobStage::Done,
            message: "job complete".to_string(),
            percent: 1.0,
        })
        .await
}

pub struct ProgressListener {
    broker: Broker,
    store: JobStore,
    worker: WorkerConfig,
}

impl ProgressListener {
    pub fn new(broker: Broker, store: JobStore, worker: &WorkerConfig) -> Self {
        Self {
            broker,
            store,
            worker: worker.clone(),
        }
    }

    pub async fn run(&self) -> AppResult<()> {
        let mut supervisor = Supervisor::new(&self.worker);
        loop {
            if let Err(err) = self.consume_loop(&mut supervisor).await {
                error!("progress listener failed: {}", err);
            }
            let Some(delay) = supervisor.next_reconnect() else {
                return Err(crate::types::AppError::BrokerUnavailable(
                    "progress listener gave up reconnecting".to_string(),
                ));
            };
            warn!("progress listener reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn consume_loop(&self, supervisor: &mut Supervisor) -> AppResult<()> {
        let queue = self.broker.config().progress_queue.clone();
        let mut conn = self.broker.connect().await?;
        let recovered = self.broker.recover(&mut conn, &queue).await?;
        if recovered > 0 {
            info!("requeued {} stale progress message(s)", recovered);
        }
        supervisor.connected();
        info!("listening for progress updates on {}", queue);

        loop {
            let Some(delivery) = self
                .broker
                .consume(&mut conn, &queue, CONSUME_POLL_SECS)
                .await?
            else {
                continue;
            };

            let parsed = delivery
                .envelope()
                .and_then(|envelope| {
                    serde_json::from_value::<ProgressUpdate>(envelope.body).map_err(|e| {
                        crate::types::AppError::MalformedMessage(format!(
                            "invalid progress update: {}",
                            e
                        ))
                    })
                });
            match parsed {
                Ok(update) => {
                    if let Err(err) = apply_progress(&self.store, &update).await {
                        warn!("could not store progress for {}: {}", update.job_id, err);
                    }
                }
                Err(err) => warn!("dropping malformed progress message: {}", err),
            }

            // Ack regardless of outcome: progress is replaceable state,
            // and a redelivered bad message would fail the same way.
            self.broker.ack(&mut conn, &delivery).await?;
        }
    }
}

pub struct ResultListener {
    broker: Broker,
    store: JobStore,
    worker: WorkerConfig,
}

impl ResultListener {
    pub fn new(broker: Broker, store: JobStore, worker: &WorkerConfig) -> Self {
        Self {
            broker,
            store,
            worker: worker.clone(),
        }
    }

    pub async fn run(&self) -> AppResult<()> {
        let mut supervisor = Supervisor::new(&self.worker);
        loop {
            if let Err(err) = self.consume_loop(&mut supervisor).await {
                error!("result listener failed: {}", err);
            }
            let Some(delay) = supervisor.next_reconnect() else {
                return Err(crate::types::AppError::BrokerUnavailable(
                    "result listener gave up reconnecting".to_string(),
                ));
            };
            warn!("result listener reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn consume_loop(&self, supervisor: &mut Supervisor) -> AppResult<()> {
        let queue = self.broker.config().results_queue.clone();
        let mut conn = self.broker.connect().await?;
        let recovered = self.broker.recover(&mut conn, &queue).await?;
        if recovered > 0 {
            info!("requeued {} stale result message(s)", recovered);
        }
        supervisor.connected();
        info!("listening for job results on {}", queue);

        loop {
            let Some(delivery) = self
                .broker
                .consume(&mut conn, &queue, CONSUME_POLL_SECS)
                .await?
            else {
                continue;
            };

            match delivery.envelope() {
                Ok(envelope) => match envelope.correlation_id.as_deref() {
                    // The job id rides only in the correlation metadata
                    // for results; without it the payload is unroutable.
                    None => warn!("dropping result message without correlation id"),
                    Some(job_id) => {
                        if let Err(err) = apply_result(&self.store, job_id, &envelope.body).await {
                            warn!("could not store result for {}: {}", job_id, err);
                        } else {
                            info!("stored result for job {}", job_id);
                        }
                    }
                },
                Err(err) => warn!("dropping malformed result message: {}", err),
            }

            self.broker.ack(&mut conn, &delivery).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::consumer::{decode_request, JobHandler, ProgressSink};
    use crate::queue::dispatcher::job_envelope;
    use crate::store::memory_store;
    use crate::types::{AppError, AppResult, Envelope, JobParams, JobRequest};
    use async_trait::async_trait;
    use std::time::Duration;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn update(job_id: &str, stage: JobStage, percent: f32) -> ProgressUpdate {
        ProgressUpdate {
            job_id: job_id.to_string(),
            stage,
            message: String::new(),
            percent,
        }
    }

    #[tokio::test]
    async fn test_progress_applies_in_order() {
        let store = memory_store(DAY);
        apply_progress(&store, &update("abc123", JobStage::Started, 0.0))
            .await
            .unwrap();
        apply_progress(&store, &update("abc123", JobStage::Running, 0.5))
            .await
            .unwrap();

        let current = store.get_progress("abc123").await.unwrap().unwrap();
        assert_eq!(current.stage, JobStage::Running);
    }

    #[tokio::test]
    async fn test_done_is_never_reverted() {
        let store = memory_store(DAY);
        apply_result(&store, "abc123", &serde_json::json!({"ok": true}))
            .await
            .unwrap();

        // A progress event that raced the result arrives late.
        apply_progress(&store, &update("abc123", JobStage::Running, 0.7))
            .await
            .unwrap();

        let current = store.get_progress("abc123").await.unwrap().unwrap();
        assert_eq!(current.stage, JobStage::Done);
        assert_eq!(current.percent, 1.0);
    }

    #[tokio::test]
    async fn test_duplicate_result_delivery_is_idempotent() {
        let store = memory_store(DAY);
        let payload = serde_json::json!({"topics": ["a"]});

        apply_result(&store, "abc123", &payload).await.unwrap();
        apply_result(&store, "abc123", &payload).await.unwrap();

        assert_eq!(store.get_result("abc123").await.unwrap(), Some(payload));
        let current = store.get_progress("abc123").await.unwrap().unwrap();
        assert_eq!(current.stage, JobStage::Done);
        assert_eq!(current.percent, 1.0);
    }

    #[tokio::test]
    async fn test_error_progress_still_applies_before_done() {
        let store = memory_store(DAY);
        apply_progress(&store, &update("abc123", JobStage::Error, 1.0))
            .await
            .unwrap();
        let current = store.get_progress("abc123").await.unwrap().unwrap();
        assert_eq!(current.stage, JobStage::Error);
    }

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn run(
            &self,
            request: JobRequest,
            progress: &mut ProgressSink,
        ) -> AppResult<serde_json::Value> {
            progress.update(JobStage::Running, "analyzing", 0.5).await?;
            Ok(serde_json::json!({ "subreddit": request.params.subreddit, "topics": ["a", "b"] }))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn run(
            &self,
            _request: JobRequest,
            _progress: &mut ProgressSink,
        ) -> AppResult<serde_json::Value> {
            Err(AppError::JobFailed("model blew up".to_string()))
        }
    }

    /// Dispatch -> worker -> listeners -> store, exercised through the
    /// same encode/decode/apply functions the wire path uses.
    #[tokio::test]
    async fn test_end_to_end_job_lifecycle() {
        let store = memory_store(DAY);
        let params = JobParams {
            subreddit: "test".to_string(),
            option: None,
            start_date: None,
            end_date: None,
            data_source: None,
        };

        // Dispatcher publishes the request.
        let raw = job_envelope(&params, "abc123").unwrap().encode().unwrap();

        // Worker pulls, decodes, runs the job function.
        let (_envelope, request) = decode_request(&raw).unwrap();
        let (mut sink, captured) = ProgressSink::capture(&request.job_id);
        let result = EchoHandler.run(request, &mut sink).await.unwrap();
        let reply = Envelope::new(result).with_correlation_id("abc123");

        // Progress listener drains what the worker emitted so far.
        for progress in captured.lock().unwrap().iter() {
            apply_progress(&store, progress).await.unwrap();
        }
        let mid_flight = store.get_progress("abc123").await.unwrap().unwrap();
        assert_eq!(mid_flight.stage, JobStage::Running);

        // Result listener persists the reply and finalizes the job.
        let delivered = Envelope::decode(&reply.encode().unwrap()).unwrap();
        let job_id = delivered.correlation_id.clone().unwrap();
        apply_result(&store, &job_id, &delivered.body).await.unwrap();

        let final_progress = store.get_progress("abc123").await.unwrap().unwrap();
        assert_eq!(final_progress.stage, JobStage::Done);
        assert_eq!(final_progress.percent, 1.0);
        let result = store.get_result("abc123").await.unwrap().unwrap();
        assert_eq!(result["subreddit"], "test");
    }

    /// A failing job surfaces through an error progress update instead
    /// of disappearing.
    #[tokio::test]
    async fn test_failed_job_is_visible_to_pollers() {
        let store = memory_store(DAY);
        let raw = job_envelope(
            &JobParams {
                subreddit: "test".to_string(),
                option: None,
                start_date: None,
                end_date: None,
                data_source: None,
            },
            "abc123",
        )
        .unwrap()
        .encode()
        .unwrap();

        let (_envelope, request) = decode_request(&raw).unwrap();
        let (mut sink, captured) = ProgressSink::capture(&request.job_id);
        let err = FailingHandler.run(request, &mut sink).await.unwrap_err();

        // The worker publishes the error stage before acking.
        sink.update(JobStage::Error, &err.to_string(), 1.0)
            .await
            .unwrap();
        for progress in captured.lock().unwrap().iter() {
            apply_progress(&store, progress).await.unwrap();
        }

        let current = store.get_progress("abc123").await.unwrap().unwrap();
        assert_eq!(current.stage, JobStage::Error);
        assert!(store.get_result("abc123").await.unwrap().is_none());
    }
}

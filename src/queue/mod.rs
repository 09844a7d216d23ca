//! Broker layer: durable job queues over Redis lists.
//!
//! A publish is an LPUSH of an `Envelope`; a consume is a BRPOPLPUSH
//! into a per-queue processing list, so an unacknowledged message
//! survives a consumer crash. Acking removes the entry from the
//! processing list; `recover` pushes stale processing entries back onto
//! the work queue at consumer startup. A message held by a crashed
//! consumer is therefore redelivered, possibly to a different competing
//! consumer; that is the at-least-once contract callers must tolerate.

pub mod consumer;
pub mod dispatcher;
pub mod listeners;

pub use consumer::{JobHandler, ProgressSink, WorkerConsumer};
pub use dispatcher::{JobDispatcher, JobKind};
pub use listeners::{ProgressListener, ResultListener};

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::config::{BrokerConfig, WorkerConfig};
use crate::types::{AppError, AppResult, Envelope};
use crate::utils::Backoff;

/// Reconnect policy shared by the supervised consume loops: exponential
/// backoff between attempts, reset once a session connects, and an
/// optional cap on *consecutive* failed reconnects.
pub(crate) struct Supervisor {
    backoff: Backoff,
    max_attempts: u32,
}

impl Supervisor {
    pub fn new(worker: &WorkerConfig) -> Self {
        Self {
            backoff: Backoff::new(worker.backoff_base(), worker.backoff_max()),
            max_attempts: worker.max_reconnect_attempts,
        }
    }

    /// A session connected and recovered its queue; the failure streak
    /// is over.
    pub fn connected(&mut self) {
        self.backoff.reset();
    }

    /// Delay before the next reconnect, or `None` once the cap on
    /// consecutive failures is exhausted.
    pub fn next_reconnect(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.backoff.attempts() >= self.max_attempts {
            return None;
        }
        Some(self.backoff.next_delay())
    }
}

pub(crate) fn queue_key(name: &str) -> String {
    format!("queue:{}", name)
}

pub(crate) fn processing_key(name: &str) -> String {
    format!("queue:{}:processing", name)
}

/// Fresh private reply-queue name for one RPC exchange. The backing
/// list only exists while it holds a pending reply, so it cleans
/// itself up once consumed.
pub(crate) fn reply_queue_name() -> String {
    format!("reply:{}", uuid::Uuid::new_v4())
}

pub(crate) fn broker_err(e: redis::RedisError) -> AppError {
    AppError::BrokerUnavailable(e.to_string())
}

/// One message pulled from a work queue, pending acknowledgement.
pub(crate) struct Delivery {
    pub queue: String,
    pub raw: String,
}

impl Delivery {
    pub fn envelope(&self) -> AppResult<Envelope> {
        Envelope::decode(&self.raw)
    }
}

/// Cheap, cloneable handle to the broker. Each long-running loop opens
/// its own connection from the shared client so a consumer's blocking
/// pop never starves another component.
#[derive(Clone)]
pub struct Broker {
    client: redis::Client,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(config: &BrokerConfig) -> AppResult<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(broker_err)?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) async fn connect(&self) -> AppResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(broker_err)
    }

    pub(crate) async fn publish(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        envelope: &Envelope,
    ) -> AppResult<()> {
        let raw = envelope.encode()?;
        conn.lpush::<_, _, ()>(queue_key(queue), raw)
            .await
            .map_err(broker_err)
    }

    /// Pull one message, moving it to the processing list until acked.
    /// `None` means the poll window elapsed with the queue empty.
    pub(crate) async fn consume(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        poll: f64,
    ) -> AppResult<Option<Delivery>> {
        let raw: Option<String> = conn
            .brpoplpush(queue_key(queue), processing_key(queue), poll)
            .await
            .map_err(broker_err)?;
        Ok(raw.map(|raw| Delivery {
            queue: queue.to_string(),
            raw,
        }))
    }

    pub(crate) async fn ack(
        &self,
        conn: &mut MultiplexedConnection,
        delivery: &Delivery,
    ) -> AppResult<()> {
        conn.lrem::<_, _, ()>(processing_key(&delivery.queue), 1, &delivery.raw)
            .await
            .map_err(broker_err)
    }

    /// Requeue messages left in the processing list by a previous run.
    pub(crate) async fn recover(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
    ) -> AppResult<usize> {
        let stale: usize = conn
            .llen(processing_key(queue))
            .await
            .map_err(broker_err)?;
        for _ in 0..stale {
            let _: Option<String> = conn
                .rpoplpush(processing_key(queue), queue_key(queue))
                .await
                .map_err(broker_err)?;
        }
        Ok(stale)
    }
}

//! Message queue boundary.
//!
//! The pipeline talks to its broker through [`MessageQueue`]: persistent
//! publish, and a manual-ack consumer limited by a prefetch (QoS) window. Each
//! pulled message is a [`Delivery`] that must be settled exactly once, either
//! with [`Delivery::ack`] or [`Delivery::nack`]. Settling consumes the
//! delivery, so a second ack of the same handle does not type-check.
//!
//! The prefetch window is enforced on the consumer side: every delivery holds
//! a semaphore permit that is released when the delivery is settled or
//! dropped. A consumer therefore never holds more than `prefetch` unsettled
//! deliveries at once.
//!
//! ## Implementations
//!
//! - [`memory::MemoryQueue`] - in-process FIFO used by tests and
//!   `--backend memory`.
//! - [`redis_streams::RedisStreamsQueue`] - Redis Streams consumer group.

pub mod memory;
pub mod redis_streams;

use async_trait::async_trait;
use bytes::Bytes;
use core::fmt;
use reportq_core::Result;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio_util::sync::CancellationToken;

/// Stream of deliveries handed out by [`MessageQueue::consume`]. The stream
/// ends when the consumer is cancelled or the broker closes it.
pub type DeliveryStream = mpsc::Receiver<Delivery>;

/// Opaque broker token identifying one unsettled delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker-side settlement of a delivery.
#[async_trait]
pub trait Settle: Send + Sync {
    async fn ack(&self, tag: &DeliveryTag) -> Result<()>;

    /// Rejects the delivery. With `requeue` the message goes back to the
    /// queue; without it the message is dead-lettered and never retried.
    async fn nack(&self, tag: &DeliveryTag, body: &Bytes, requeue: bool) -> Result<()>;
}

/// A message pulled off the queue that has not been settled yet.
pub struct Delivery {
    tag: DeliveryTag,
    body: Bytes,
    settler: Arc<dyn Settle>,
    _permit: OwnedSemaphorePermit,
}

impl Delivery {
    pub fn new(
        tag: DeliveryTag,
        body: Bytes,
        settler: Arc<dyn Settle>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            tag,
            body,
            settler,
            _permit: permit,
        }
    }

    pub fn tag(&self) -> &DeliveryTag {
        &self.tag
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Confirms successful processing.
    pub async fn ack(self) -> Result<()> {
        self.settler.ack(&self.tag).await
    }

    /// Rejects the delivery, see [`Settle::nack`].
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.settler.nack(&self.tag, &self.body, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// A durable, at-least-once FIFO queue with manual acknowledgment.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Publishes a persistent message.
    async fn publish(&self, body: Bytes) -> Result<()>;

    /// Starts a manual-ack consumer that never holds more than `prefetch`
    /// unsettled deliveries. The stream closes once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Fails if the consumer cannot be registered; callers treat this as a
    /// fatal transport error.
    async fn consume(&self, prefetch: usize, cancel: CancellationToken) -> Result<DeliveryStream>;
}

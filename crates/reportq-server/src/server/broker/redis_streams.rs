//! Redis Streams backed [`MessageQueue`].
//!
//! - Publish: `XADD <stream> * payload <body>`
//! - Consume: consumer group `reportq`, one `XREADGROUP ... COUNT 1` per free
//!   prefetch slot. Entries left pending by a previous run of the same
//!   consumer are replayed first.
//! - Ack: `XACK`
//! - Nack: re-`XADD` to the stream (requeue) or to `<stream>:dlq` (dead
//!   letter), then `XACK`.

use super::{Delivery, DeliveryStream, DeliveryTag, MessageQueue, Settle};
use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use redis::{Client, RedisError};
use reportq_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

const PAYLOAD_FIELD: &str = "payload";
const DEFAULT_GROUP: &str = "reportq";
const DEFAULT_CONSUMER: &str = "reportq-server";
const DEFAULT_BLOCK: Duration = Duration::from_secs(1);
const NEW_ENTRIES: &str = ">";
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

fn broker_error(context: &str, err: &RedisError) -> Error {
    Error::Broker {
        context: format!("{context}: {err}"),
    }
}

struct StreamSettler {
    conn: MultiplexedConnection,
    stream_key: String,
    dlq_key: String,
    group: String,
}

impl StreamSettler {
    async fn xack(&self, tag: &DeliveryTag) -> Result<()> {
        let mut conn = self.conn.clone();
        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(tag.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XACK failed", &e))?;
        if acked == 0 {
            return Err(Error::AlreadySettled {
                tag: tag.to_string(),
            });
        }
        Ok(())
    }

    async fn xadd(&self, key: &str, body: &Bytes, origin: &DeliveryTag) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(key)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(body.as_ref())
            .arg("origin")
            .arg(origin.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XADD failed", &e))?;
        Ok(())
    }
}

#[async_trait]
impl Settle for StreamSettler {
    async fn ack(&self, tag: &DeliveryTag) -> Result<()> {
        self.xack(tag).await
    }

    async fn nack(&self, tag: &DeliveryTag, body: &Bytes, requeue: bool) -> Result<()> {
        // Re-add before acking so a crash in between duplicates the message
        // instead of losing it.
        let target = if requeue {
            &self.stream_key
        } else {
            &self.dlq_key
        };
        self.xadd(target, body, tag).await?;
        self.xack(tag).await
    }
}

/// A consumer group on one Redis stream.
pub struct RedisStreamsQueue {
    client: Client,
    conn: MultiplexedConnection,
    stream_key: String,
    group: String,
    consumer: String,
    block: Duration,
}

impl RedisStreamsQueue {
    /// Connects, verifies the server with `PING` and makes sure the stream and
    /// its consumer group exist.
    pub async fn connect(url: &str, stream_key: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| Error::Connection {
            context: format!("invalid Redis URL: {e}"),
        })?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Connection {
                context: format!("failed to connect to Redis: {e}"),
            })?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Connection {
                context: format!("Redis PING failed: {e}"),
            })?;

        let queue = Self {
            client,
            conn,
            stream_key: stream_key.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: DEFAULT_CONSUMER.to_string(),
            block: DEFAULT_BLOCK,
        };
        queue.ensure_group().await?;
        tracing::info!(stream = %queue.stream_key, group = %queue.group, "connected to Redis stream");
        Ok(queue)
    }

    /// Overrides the consumer name. Entries are only replayed to a consumer
    /// with the same name, so every instance needs a stable, distinct one.
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(broker_error("XGROUP CREATE failed", &e)),
        }
    }
}

/// Reads one entry after `cursor` from this consumer's pending list, or a new
/// entry when `cursor` is `>`. `None` means the pending list is exhausted or
/// nothing arrived before the block timeout.
async fn read_one(
    conn: &mut MultiplexedConnection,
    stream_key: &str,
    group: &str,
    consumer: &str,
    cursor: &str,
    block: Duration,
) -> Result<Option<(DeliveryTag, Bytes)>> {
    let mut cmd = redis::cmd("XREADGROUP");
    cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(1);
    if cursor == NEW_ENTRIES {
        cmd.arg("BLOCK").arg(block.as_millis() as u64);
    }
    cmd.arg("STREAMS").arg(stream_key).arg(cursor);

    let reply: Option<StreamReadReply> = cmd
        .query_async(conn)
        .await
        .map_err(|e| broker_error("XREADGROUP failed", &e))?;

    let entry = reply
        .into_iter()
        .flat_map(|reply| reply.keys)
        .flat_map(|key| key.ids)
        .next();

    Ok(entry.map(|entry| {
        // A missing payload becomes an empty body so the distributor rejects
        // it instead of the entry staying pending forever.
        let body = entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default();
        (DeliveryTag::new(entry.id), Bytes::from(body))
    }))
}

#[async_trait]
impl MessageQueue for RedisStreamsQueue {
    async fn publish(&self, body: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(body.as_ref())
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XADD failed", &e))?;
        tracing::trace!(stream = %self.stream_key, %id, "published entry");
        Ok(())
    }

    async fn consume(&self, prefetch: usize, cancel: CancellationToken) -> Result<DeliveryStream> {
        if prefetch == 0 {
            return Err(Error::Broker {
                context: "prefetch must be greater than 0".to_string(),
            });
        }

        // Blocking reads get their own connection so they never stall acks
        // and publishes multiplexed on the shared one.
        let mut reader = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Connection {
                context: format!("failed to open consumer connection: {e}"),
            })?;

        let settler: Arc<dyn Settle> = Arc::new(StreamSettler {
            conn: self.conn.clone(),
            stream_key: self.stream_key.clone(),
            dlq_key: format!("{}:dlq", self.stream_key),
            group: self.group.clone(),
        });
        let stream_key = self.stream_key.clone();
        let group = self.group.clone();
        let consumer = self.consumer.clone();
        let block = self.block;

        let (tx, rx) = mpsc::channel(prefetch);
        let window = Arc::new(Semaphore::new(prefetch));

        tokio::spawn(async move {
            tracing::debug!(%stream_key, %consumer, prefetch, "stream consumer started");
            // Replay this consumer's pending entries (ids after `cursor`)
            // before switching to new ones.
            let mut cursor = String::from("0");
            'consume: loop {
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    permit = Arc::clone(&window).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let (tag, body) = loop {
                    let read = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break 'consume,
                        read = read_one(&mut reader, &stream_key, &group, &consumer, &cursor, block) => read,
                    };
                    match read {
                        Ok(Some((tag, body))) => {
                            if cursor != NEW_ENTRIES {
                                cursor = tag.as_str().to_string();
                            }
                            break (tag, body);
                        }
                        Ok(None) if cursor != NEW_ENTRIES => {
                            tracing::debug!(%stream_key, "pending entries replayed");
                            cursor = NEW_ENTRIES.to_string();
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "stream read failed, retrying");
                            tokio::select! {
                                biased;
                                () = cancel.cancelled() => break 'consume,
                                () = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                            }
                        }
                    }
                };

                let delivery = Delivery::new(tag, body, Arc::clone(&settler), permit);
                if tx.send(delivery).await.is_err() {
                    // The entry stays in the group's pending list and is
                    // replayed on the next start.
                    break;
                }
            }
            tracing::debug!(%stream_key, "stream consumer stopped");
        });

        Ok(rx)
    }
}

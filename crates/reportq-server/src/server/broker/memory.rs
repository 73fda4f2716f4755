//! In-process queue with the same delivery semantics as the real broker:
//! FIFO, manual ack/nack, prefetch window, dead-lettering.

use super::{Delivery, DeliveryStream, DeliveryTag, MessageQueue, Settle};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use reportq_core::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct State {
    ready: VecDeque<Bytes>,
    unacked: HashMap<DeliveryTag, Bytes>,
    acked: Vec<Bytes>,
    dead_letters: Vec<Bytes>,
    closed: bool,
    #[cfg(test)]
    failing_publishes: usize,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    next_tag: AtomicU64,
}

impl Shared {
    /// Waits for the next ready message and moves it to the unacked set.
    /// Returns `None` once the queue is closed and drained.
    async fn next_ready(&self) -> Option<(DeliveryTag, Bytes)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(body) = state.ready.pop_front() {
                    let tag = DeliveryTag::new(
                        (self.next_tag.fetch_add(1, Ordering::Relaxed) + 1).to_string(),
                    );
                    state.unacked.insert(tag.clone(), body.clone());
                    return Some((tag, body));
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Called once the queue is closed and drained. Waits until every
    /// delivery handed out through `window` is settled or dropped, since a
    /// requeueing nack can still put a message back. Returns `true` if one
    /// did.
    async fn wait_drained(&self, window: &Arc<Semaphore>, prefetch: u32) -> bool {
        loop {
            let notified = self.notify.notified();
            if !self.state.lock().ready.is_empty() {
                return true;
            }
            tokio::select! {
                _ = Arc::clone(window).acquire_many_owned(prefetch) => {
                    return !self.state.lock().ready.is_empty();
                }
                () = notified => {}
            }
        }
    }

    fn requeue_front(&self, tag: &DeliveryTag) {
        let mut state = self.state.lock();
        if let Some(body) = state.unacked.remove(tag) {
            state.ready.push_front(body);
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Settle for Shared {
    async fn ack(&self, tag: &DeliveryTag) -> Result<()> {
        let mut state = self.state.lock();
        let body = state
            .unacked
            .remove(tag)
            .ok_or_else(|| Error::AlreadySettled {
                tag: tag.to_string(),
            })?;
        state.acked.push(body);
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag, _body: &Bytes, requeue: bool) -> Result<()> {
        let mut state = self.state.lock();
        let body = state
            .unacked
            .remove(tag)
            .ok_or_else(|| Error::AlreadySettled {
                tag: tag.to_string(),
            })?;
        if requeue {
            state.ready.push_front(body);
            drop(state);
            self.notify.notify_waiters();
        } else {
            state.dead_letters.push(body);
        }
        Ok(())
    }
}

/// In-memory [`MessageQueue`].
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                next_tag: AtomicU64::new(0),
            }),
        }
    }

    /// Stops handing out deliveries once the ready list is drained and every
    /// outstanding delivery is settled or dropped. Consumers then see their
    /// stream end, which lets the pipeline drain and exit. Publishing after
    /// close fails.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Moves every unacknowledged message back to the front of the queue, in
    /// delivery order. This is what the broker does when a consumer goes away
    /// without settling.
    pub fn recover(&self) -> usize {
        let mut state = self.shared.state.lock();
        let mut unacked: Vec<_> = state.unacked.drain().collect();
        unacked.sort_by_key(|(tag, _)| tag.as_str().parse::<u64>().unwrap_or(u64::MAX));
        let recovered = unacked.len();
        for (_, body) in unacked.into_iter().rev() {
            state.ready.push_front(body);
        }
        drop(state);
        self.shared.notify.notify_waiters();
        recovered
    }

    pub fn ready_len(&self) -> usize {
        self.shared.state.lock().ready.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.shared.state.lock().unacked.len()
    }

    pub fn acked(&self) -> Vec<Bytes> {
        self.shared.state.lock().acked.clone()
    }

    pub fn dead_letters(&self) -> Vec<Bytes> {
        self.shared.state.lock().dead_letters.clone()
    }

    /// Makes the next `count` publishes fail.
    #[cfg(test)]
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.state.lock().failing_publishes = count;
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, body: Bytes) -> Result<()> {
        let mut state = self.shared.state.lock();
        #[cfg(test)]
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(Error::Broker {
                context: "publish rejected".to_string(),
            });
        }
        if state.closed {
            return Err(Error::Broker {
                context: "queue is closed".to_string(),
            });
        }
        state.ready.push_back(body);
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, prefetch: usize, cancel: CancellationToken) -> Result<DeliveryStream> {
        if prefetch == 0 {
            return Err(Error::Broker {
                context: "prefetch must be greater than 0".to_string(),
            });
        }

        let window_size = u32::try_from(prefetch).map_err(|_| Error::Broker {
            context: format!("prefetch {prefetch} is too large"),
        })?;
        let (tx, rx) = mpsc::channel(prefetch);
        let window = Arc::new(Semaphore::new(prefetch));
        let shared = Arc::clone(&self.shared);
        let settler: Arc<dyn Settle> = Arc::clone(&self.shared) as Arc<dyn Settle>;

        tokio::spawn(async move {
            tracing::debug!(prefetch, "memory queue consumer started");
            loop {
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    permit = Arc::clone(&window).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    next = shared.next_ready() => next,
                };
                let Some((tag, body)) = next else {
                    drop(permit);
                    let requeued = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        requeued = shared.wait_drained(&window, window_size) => requeued,
                    };
                    if requeued {
                        continue;
                    }
                    tracing::debug!("memory queue closed, ending delivery stream");
                    break;
                };

                let delivery = Delivery::new(tag, body, Arc::clone(&settler), permit);
                if let Err(mpsc::error::SendError(delivery)) = tx.send(delivery).await {
                    shared.requeue_front(delivery.tag());
                    break;
                }
            }
            tracing::debug!("memory queue consumer stopped");
        });

        Ok(rx)
    }
}

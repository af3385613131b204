// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! In-memory task queue.
//!
//! Single-process stand-in for the shared broker: FIFO delivery, explicit
//! ack/nack, requeue at the back of the queue and a dead-letter list for
//! messages rejected without requeue. `close()` lets consumers drain the
//! remaining messages and then stop.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::domain::queue::{Delivery, DeliveryId, QueueError, TaskQueue};

struct Message {
    attempt: u32,
    payload: Vec<u8>,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    ready: VecDeque<Message>,
    in_flight: HashMap<DeliveryId, Message>,
    dead_letters: Vec<Vec<u8>>,
    closed: bool,
}

#[derive(Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Unavailable("queue is closed".to_string()));
            }
            state.ready.push_back(Message {
                attempt: 1,
                payload,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Stop accepting messages; consumers see `None` once the backlog and
    /// in-flight deliveries are settled
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.in_flight.len()
    }

    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.state.lock().dead_letters.clone()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn next_task(&self) -> Result<Option<Delivery>, QueueError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(message) = state.ready.pop_front() {
                    state.next_id += 1;
                    let delivery_id = DeliveryId(state.next_id);
                    let delivery = Delivery {
                        delivery_id,
                        attempt: message.attempt,
                        payload: message.payload.clone(),
                    };
                    state.in_flight.insert(delivery_id, message);
                    return Ok(Some(delivery));
                }
                if state.closed && state.in_flight.is_empty() {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, delivery: DeliveryId) -> Result<(), QueueError> {
        let settled = {
            let mut state = self.state.lock();
            state
                .in_flight
                .remove(&delivery)
                .ok_or(QueueError::UnknownDelivery(delivery))?;
            state.closed && state.in_flight.is_empty() && state.ready.is_empty()
        };
        if settled {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn nack(&self, delivery: DeliveryId, requeue: bool) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            let mut message = state
                .in_flight
                .remove(&delivery)
                .ok_or(QueueError::UnknownDelivery(delivery))?;
            if requeue {
                message.attempt += 1;
                debug!(delivery = %delivery, attempt = message.attempt, "Requeueing message");
                state.ready.push_back(message);
            } else {
                warn!(delivery = %delivery, "Dead-lettering message");
                state.dead_letters.push(message.payload);
            }
        }
        // Wakes consumers for a requeued message, or for the closed-and-drained check
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Enqueue one task per non-blank line read from `reader`. Returns the
/// number of lines enqueued.
pub async fn enqueue_json_lines<R>(queue: &InMemoryTaskQueue, reader: R) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        queue.enqueue(line.as_bytes().to_vec())?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(b"one".to_vec()).unwrap();
        queue.enqueue(b"two".to_vec()).unwrap();

        let first = queue.next_task().await.unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(first.attempt, 1);
        queue.ack(first.delivery_id).await.unwrap();

        let second = queue.next_task().await.unwrap().unwrap();
        assert_eq!(second.payload, b"two");
        assert!(queue.ack(first.delivery_id).await.is_err());
    }

    #[tokio::test]
    async fn test_requeue_increments_attempt() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(b"task".to_vec()).unwrap();

        let delivery = queue.next_task().await.unwrap().unwrap();
        queue.nack(delivery.delivery_id, true).await.unwrap();

        let again = queue.next_task().await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
        assert_ne!(again.delivery_id, delivery.delivery_id);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(b"bad".to_vec()).unwrap();
        let delivery = queue.next_task().await.unwrap().unwrap();
        queue.nack(delivery.delivery_id, false).await.unwrap();

        assert_eq!(queue.dead_letters(), vec![b"bad".to_vec()]);
        queue.close();
        assert!(queue.next_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_drains_then_ends() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(b"last".to_vec()).unwrap();
        queue.close();
        assert!(queue.enqueue(b"late".to_vec()).is_err());

        let delivery = queue.next_task().await.unwrap().unwrap();
        queue.ack(delivery.delivery_id).await.unwrap();
        assert!(queue.next_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_json_lines_skips_blank_and_comments() {
        let queue = InMemoryTaskQueue::new();
        let input: &[u8] = b"{\"a\":1}\n\n# comment\n{\"b\":2}\n";
        let count = enqueue_json_lines(&queue, input).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(queue.pending(), 2);
    }
}

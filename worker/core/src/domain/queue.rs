// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Task queue interface.
//!
//! The broker and its delivery semantics live outside the worker; this
//! trait is the seam the worker pool consumes. Deliveries are at-least-once:
//! a message that is neither acked nor nacked may be redelivered.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryId(pub u64);

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One delivery of a raw task message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: DeliveryId,
    /// 1 for the first delivery of a message, incremented on every requeue
    pub attempt: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Unknown delivery: {0}")]
    UnknownDelivery(DeliveryId),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Wait for the next delivery; `None` once the queue is closed and drained
    async fn next_task(&self) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: DeliveryId) -> Result<(), QueueError>;

    /// Reject a delivery. With `requeue` the message is delivered again,
    /// otherwise it is dead-lettered.
    async fn nack(&self, delivery: DeliveryId, requeue: bool) -> Result<(), QueueError>;
}

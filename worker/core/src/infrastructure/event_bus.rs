// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Event Bus Implementation - Pub/Sub for Task Lifecycle Events
//
// In-memory event streaming over tokio broadcast channels. Events are not
// persisted; the committed bundle history in the state store is the
// durable record.

use crate::domain::events::TaskEvent;
use crate::domain::repository::RepositoryId;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<TaskEvent>>,
}

impl EventBus {
    /// Capacity bounds how many events a slow subscriber may fall behind
    /// before it starts losing the oldest ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish(&self, event: TaskEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is subscribed
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of one repository only
    pub fn subscribe_repository(&self, repository: RepositoryId) -> RepositoryEventReceiver {
        RepositoryEventReceiver {
            receiver: self.sender.subscribe(),
            repository,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<TaskEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<TaskEvent, EventBusError> {
        self.receiver.recv().await.map_err(recv_error)
    }

    pub fn try_recv(&mut self) -> Result<TaskEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

pub struct RepositoryEventReceiver {
    receiver: broadcast::Receiver<TaskEvent>,
    repository: RepositoryId,
}

impl RepositoryEventReceiver {
    /// Next event for the subscribed repository; other repositories'
    /// events are skipped
    pub async fn recv(&mut self) -> Result<TaskEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(recv_error)?;
            if *event.repository() == self.repository {
                return Ok(event);
            }
        }
    }
}

fn recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("Event bus closed")]
    Closed,

    #[error("Receiver lagged by {0} events")]
    Lagged(u64),

    #[error("No events available")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::TaskId;
    use chrono::Utc;

    fn unchanged(repository: &str) -> TaskEvent {
        TaskEvent::TaskUnchanged {
            task_id: TaskId::new(),
            repository: RepositoryId::new(repository),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        let event = unchanged("acme");
        let task_id = event.task_id();
        bus.publish(event);

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.task_id(), task_id);
    }

    #[tokio::test]
    async fn test_repository_filtering() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe_repository(RepositoryId::new("acme"));

        bus.publish(unchanged("other"));
        bus.publish(unchanged("acme"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.repository().as_str(), "acme");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(unchanged("acme"));
    }

    #[test]
    fn test_try_recv_empty() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }
}

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;
use ulid::Ulid;

use crate::model::Span;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    RequestAllocated {
        domain: String,
        request_id: Ulid,
        parent_id: Option<Ulid>,
        slot: Span,
        reservations: Vec<Ulid>,
    },
    RequestFailed {
        domain: String,
        request_id: Ulid,
        parent_id: Option<Ulid>,
        slot: Span,
        reason: String,
    },
}

impl Notification {
    /// The abstract request if there is one, otherwise the request itself.
    pub fn subject(&self) -> Ulid {
        match self {
            Notification::RequestAllocated {
                request_id, parent_id, ..
            }
            | Notification::RequestFailed {
                request_id, parent_id, ..
            } => parent_id.unwrap_or(*request_id),
        }
    }
}

/// Outbound side effects. Enqueued during a cycle, delivered by `flush`.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn enqueue(&self, notification: Notification);

    /// Deliver everything queued so far. Returns how many were delivered.
    async fn flush(&self) -> usize;
}

/// Queue plus broadcast channels, one per subject and one for everything.
pub struct NotifyHub {
    queue: Mutex<Vec<Notification>>,
    all: broadcast::Sender<Notification>,
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            channels: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Subscribe to notifications about one request. Creates the channel if needed.
    pub fn subscribe(&self, subject: Ulid) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(subject)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn unsubscribe(&self, subject: &Ulid) {
        self.channels.remove(subject);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn drain(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    fn enqueue(&self, notification: Notification) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }

    async fn flush(&self) -> usize {
        let batch = self.drain();
        for notification in &batch {
            match serde_json::to_string(notification) {
                Ok(json) => info!(target: "allotter::notify", "{json}"),
                Err(e) => tracing::warn!(error = %e, "notification not serializable"),
            }
            // No-op when nobody is listening.
            let _ = self.all.send(notification.clone());
            if let Some(sender) = self.channels.get(&notification.subject()) {
                let _ = sender.send(notification.clone());
            }
        }
        metrics::counter!(crate::observability::NOTIFICATIONS_FLUSHED_TOTAL).increment(batch.len() as u64);
        batch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocated(request_id: Ulid, parent_id: Option<Ulid>) -> Notification {
        Notification::RequestAllocated {
            domain: "local".into(),
            request_id,
            parent_id,
            slot: Span::new(0, 1000),
            reservations: vec![],
        }
    }

    #[tokio::test]
    async fn nothing_delivered_before_flush() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe_all();
        hub.enqueue(allocated(Ulid::new(), None));
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.pending(), 1);

        assert_eq!(hub.flush().await, 1);
        assert!(rx.recv().await.is_ok());
        assert_eq!(hub.pending(), 0);
        assert_eq!(hub.flush().await, 0);
    }

    #[tokio::test]
    async fn subject_channel_receives_child_events() {
        let hub = NotifyHub::new();
        let parent = Ulid::new();
        let mut rx = hub.subscribe(parent);
        let event = allocated(Ulid::new(), Some(parent));
        hub.enqueue(event.clone());
        hub.enqueue(allocated(Ulid::new(), None));
        hub.flush().await;

        assert_eq!(rx.recv().await.unwrap(), event);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn flush_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.enqueue(Notification::RequestFailed {
            domain: "local".into(),
            request_id: Ulid::new(),
            parent_id: None,
            slot: Span::new(0, 1),
            reason: "no room".into(),
        });
        assert_eq!(hub.flush().await, 1);
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(allocated(Ulid::nil(), None)).unwrap();
        assert_eq!(json["type"], "request_allocated");
        assert_eq!(json["domain"], "local");
        assert_eq!(json["slot"]["end"], 1000);
    }
}

//! In-process publish/subscribe broker standing in for the external message bus.
//!
//! - Topics are plain strings (`sensor/data`, `forecast/predictions`).
//! - Each subscriber owns a bounded tokio mpsc queue; `publish` is a non-blocking
//!   `try_send` per subscriber. A full subscriber misses that message, a closed one is pruned.

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::errors::SinkError;

/// Outbound side of the transport, as seen by the publication worker.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct InProcessBroker {
    subscribers: DashMap<String, Vec<mpsc::Sender<Message>>>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str, capacity: usize) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.entry(topic.to_string()).or_default().push(tx);
        debug!("new subscriber on `{}`", topic);
        rx
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

impl Transport for InProcessBroker {
    /// Publishing to a topic nobody listens on is not an error.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SinkError> {
        let Some(mut subs) = self.subscribers.get_mut(topic) else {
            return Ok(());
        };
        subs.retain(|tx| {
            let msg = Message {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            match tx.try_send(msg) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("subscriber on `{}` is full, message dropped", topic);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        Ok(())
    }
}

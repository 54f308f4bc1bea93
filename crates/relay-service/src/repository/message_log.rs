use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use svckit_mq::Message;
use uuid::Uuid;

/// A consumed message as exposed over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub id: Uuid,
    pub queue: String,
    pub topic: String,
    /// The payload as JSON, or a JSON string when it is not valid JSON.
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl ReceivedMessage {
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        let payload = message.json::<serde_json::Value>().unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned())
        });

        Self {
            id: Uuid::new_v4(),
            queue: message.queue.clone(),
            topic: message.topic.clone(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Bounded in-memory log of recently consumed messages. Oldest entries are
/// evicted first.
pub struct MessageLog {
    entries: Mutex<VecDeque<ReceivedMessage>>,
    capacity: usize,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, message: ReceivedMessage) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(message);
    }

    /// All entries, newest first.
    pub fn newest_first(&self) -> Vec<ReceivedMessage> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .rev()
            .cloned()
            .collect()
    }
}

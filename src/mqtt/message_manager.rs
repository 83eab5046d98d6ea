use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// Topic used for notices the manager writes into its own log
pub const SYSTEM_TOPIC: &str = "system";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for MessageRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(40).collect();
        write!(
            f,
            "{} - {}: {}",
            self.received_at.format("%H:%M:%S"),
            self.topic,
            preview
        )
    }
}

impl MessageRecord {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        MessageRecord {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    /// Decodes a raw payload: JSON is re-serialised pretty-printed, anything
    /// else is kept as (lossy) UTF-8 text.
    pub fn from_payload(topic: impl Into<String>, payload: &[u8]) -> Self {
        Self::from_topic(topic, format_payload(payload))
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::from_topic(SYSTEM_TOPIC, text)
    }

    pub fn is_system(&self) -> bool {
        self.topic == SYSTEM_TOPIC
    }

    pub fn render(&self) -> String {
        format!(
            "{}: {}\n{}",
            self.received_at.format("%H:%M:%S"),
            self.topic,
            self.payload
        )
    }
}

pub fn format_payload(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| text.into_owned()),
        Err(_) => text.into_owned(),
    }
}

/// Newest-first message log with a fixed capacity.
#[derive(Clone, Debug)]
pub struct MessageBuffer {
    capacity: usize,
    entries: VecDeque<MessageRecord>,
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: MessageRecord) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_front(record);
        self.entries.truncate(self.capacity);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageRecord> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<MessageRecord> {
        self.entries.iter().cloned().collect()
    }
}

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The caller's identity as resolved by the directory.
/// Carries only what the client core reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: Some(display_name.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

/// One chat utterance as held by a timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub author_display_name: String,
    pub body: String,
    /// Assigned by the message store. The only sort key.
    pub inserted_at: DateTime<Utc>,
}

impl Message {
    /// Total order used by every timeline: `(inserted_at, id)` ascending.
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.inserted_at, self.id)
    }

    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// A row as delivered by the push transport: no author display name yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessageRow {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub inserted_at: DateTime<Utc>,
}

impl RawMessageRow {
    pub fn with_display_name(self, author_display_name: String) -> Message {
        Message {
            id: self.id,
            channel_id: self.channel_id,
            author_id: self.author_id,
            author_display_name,
            body: self.body,
            inserted_at: self.inserted_at,
        }
    }
}

impl From<&Message> for RawMessageRow {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id,
            channel_id: msg.channel_id,
            author_id: msg.author_id,
            body: msg.body.clone(),
            inserted_at: msg.inserted_at,
        }
    }
}

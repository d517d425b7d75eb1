use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::RawMessageRow;

/// A push-transport topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id")]
pub enum Topic {
    /// Inserts for one channel.
    Channel(Uuid),
    /// A shared presence room.
    Presence(String),
}

impl Topic {
    /// Returns the channel id if this topic is scoped to a channel.
    pub fn channel_id(&self) -> Option<Uuid> {
        match self {
            Self::Channel(id) => Some(*id),
            Self::Presence(_) => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(id) => write!(f, "room:{}", id),
            Self::Presence(room) => write!(f, "presence:{}", room),
        }
    }
}

/// Subscription lifecycle as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    /// The subscription is active; announcements are safe from here on.
    Subscribed,
    TimedOut,
    ChannelError,
    Closed,
}

/// A presence announcement from one connection of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceBeacon {
    pub user_id: Uuid,
    pub username: Option<String>,
    pub online_at: DateTime<Utc>,
}

/// Authoritative full presence state: presence key -> beacons tracked under it.
pub type PresenceState = HashMap<String, Vec<PresenceBeacon>>;

/// Events delivered by the push transport to a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PushEvent {
    Status { status: SubscriptionStatus },

    /// A new message row was inserted into a channel.
    MessageInserted { row: RawMessageRow },

    /// Full presence snapshot. Replaces all prior presence state.
    PresenceSync { state: PresenceState },

    /// A peer announced itself between snapshots.
    PresenceJoin { beacon: PresenceBeacon },

    /// A peer left between snapshots.
    PresenceLeave { user_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_display_matches_channel_naming() {
        let id = Uuid::from_u128(1);
        assert_eq!(
            Topic::Channel(id).to_string(),
            "room:00000000-0000-0000-0000-000000000001"
        );
        assert_eq!(Topic::Presence("global_presence".into()).channel_id(), None);
        assert_eq!(Topic::Channel(id).channel_id(), Some(id));
    }

    #[test]
    fn push_event_is_tagged() {
        let event = PushEvent::PresenceLeave {
            user_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PresenceLeave");
        assert_eq!(json["data"]["user_id"], Uuid::nil().to_string());
    }
}

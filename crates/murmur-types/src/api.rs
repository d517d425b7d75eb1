use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Identity, Message};

// -- Messages --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    /// `None` when the author's profile row is missing.
    pub author_username: Option<String>,
    pub body: String,
    pub inserted_at: DateTime<Utc>,
}

impl MessageResponse {
    pub fn into_message(self, placeholder_name: &str) -> Message {
        Message {
            id: self.id,
            channel_id: self.channel_id,
            author_id: self.author_id,
            author_display_name: self
                .author_username
                .unwrap_or_else(|| placeholder_name.to_string()),
            body: self.body,
            inserted_at: self.inserted_at,
        }
    }
}

// -- Users --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: Option<String>,
}

impl From<UserResponse> for Identity {
    fn from(user: UserResponse) -> Self {
        Identity {
            id: user.id,
            display_name: user.username,
        }
    }
}

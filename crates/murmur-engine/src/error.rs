use uuid::Uuid;

/// Failure reported by a [`MessageStore`](crate::contracts::MessageStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store request failed: {0}")]
    Request(String),
    #[error("Unknown channel: {0}")]
    UnknownChannel(Uuid),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Failure reported by a [`Directory`](crate::contracts::Directory).
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("User not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Failure reported by a [`PushTransport`](crate::contracts::PushTransport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Subscription to {0} is closed")]
    Closed(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    /// Initial (or refresh) fetch of the newest page failed. Retryable.
    #[error("History fetch failed for channel {channel_id}: {source}")]
    HistoryFetchFailed {
        channel_id: Uuid,
        #[source]
        source: StoreError,
    },

    /// Backward page fetch failed. State is unchanged; retryable.
    #[error("Pagination fetch failed for channel {channel_id}: {source}")]
    PaginationFetchFailed {
        channel_id: Uuid,
        #[source]
        source: StoreError,
    },

    /// The store rejected an append. `draft` is the unsent body.
    #[error("Send failed for channel {channel_id}: {source}")]
    SendFailed {
        channel_id: Uuid,
        draft: String,
        #[source]
        source: StoreError,
    },

    /// No identity is known, so there is no author to send as.
    #[error("Not signed in; cannot send to channel {channel_id}")]
    NotSignedIn { channel_id: Uuid, draft: String },

    #[error("Subscribing to {topic} failed: {source}")]
    SubscribeFailed {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Message body is empty")]
    EmptyBody,

    #[error("Timeline for channel {channel_id} is closed")]
    Closed { channel_id: Uuid },
}

impl TimelineError {
    /// The unsent body carried by a failed send, for restoring the input box.
    pub fn into_draft(self) -> Option<String> {
        match self {
            Self::SendFailed { draft, .. } | Self::NotSignedIn { draft, .. } => Some(draft),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HistoryFetchFailed { .. } | Self::PaginationFetchFailed { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("Subscribing to presence room {room_id} failed: {source}")]
    SubscribeFailed {
        room_id: String,
        #[source]
        source: TransportError,
    },
}

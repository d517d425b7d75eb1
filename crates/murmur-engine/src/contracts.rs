//! Boundaries to the external collaborators: message store, identity
//! directory and push transport.
//!
//! The engine only ever reads pages from the store or appends to it; it never
//! mutates or deletes rows. Push delivery is modelled as an inbound event
//! channel owned by a [`Subscription`], consumed on the caller's task.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use murmur_types::{Identity, Message, PresenceBeacon, PushEvent, Topic};

use crate::error::{DirectoryError, StoreError, TransportError};

/// Range selector for [`MessageStore::fetch_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Exclusive upper bound on `inserted_at`. `None` means "newest".
    pub before: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl PageRequest {
    pub fn newest(limit: u32) -> Self {
        Self { before: None, limit }
    }

    pub fn before(cursor: DateTime<Utc>, limit: u32) -> Self {
        Self {
            before: Some(cursor),
            limit,
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Returns up to `page.limit` messages of a channel, newest first.
    async fn fetch_page(
        &self,
        channel_id: Uuid,
        page: PageRequest,
    ) -> Result<Vec<Message>, StoreError>;

    /// Appends a message. Not idempotent.
    async fn append(
        &self,
        channel_id: Uuid,
        author_id: Uuid,
        body: &str,
    ) -> Result<Message, StoreError>;
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// The signed-in caller, if any.
    async fn current_user(&self) -> Result<Option<Identity>, DirectoryError>;

    async fn display_name(&self, user_id: Uuid) -> Result<String, DirectoryError>;
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Joins `topic`. The first event on the returned subscription is a
    /// `Status` acknowledgment once the transport considers it active.
    async fn subscribe(&self, topic: Topic) -> Result<Subscription, TransportError>;
}

/// Transport-side half of a subscription.
#[async_trait]
pub trait SubscriptionHandle: Send + Sync {
    /// Announce a presence beacon on this subscription's topic.
    async fn track(&self, beacon: PresenceBeacon) -> Result<(), TransportError>;

    /// Leave the topic. Must be idempotent.
    fn close(&self);
}

/// An active subscription: inbound events plus the handle that releases it.
pub struct Subscription {
    pub topic: Topic,
    pub events: mpsc::UnboundedReceiver<PushEvent>,
    pub guard: SubscriptionGuard,
}

impl Subscription {
    pub fn new(
        topic: Topic,
        events: mpsc::UnboundedReceiver<PushEvent>,
        handle: impl SubscriptionHandle + 'static,
    ) -> Self {
        Self {
            topic,
            events,
            guard: SubscriptionGuard::new(handle),
        }
    }
}

/// Releases the transport handle exactly once: on [`release`](Self::release)
/// or, failing that, on drop.
pub struct SubscriptionGuard {
    handle: Box<dyn SubscriptionHandle>,
    released: AtomicBool,
}

impl SubscriptionGuard {
    pub fn new(handle: impl SubscriptionHandle + 'static) -> Self {
        Self {
            handle: Box::new(handle),
            released: AtomicBool::new(false),
        }
    }

    pub async fn track(&self, beacon: PresenceBeacon) -> Result<(), TransportError> {
        if self.is_released() {
            return Err(TransportError::Closed("released subscription".into()));
        }
        self.handle.track(beacon).await
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.handle.close();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandle {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SubscriptionHandle for CountingHandle {
        async fn track(&self, _beacon: PresenceBeacon) -> Result<(), TransportError> {
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn guard_closes_once_on_release_then_drop() {
        let closes = Arc::new(AtomicUsize::new(0));
        let guard = SubscriptionGuard::new(CountingHandle {
            closes: closes.clone(),
        });

        guard.release();
        guard.release();
        drop(guard);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_closes_on_drop_without_release() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let (_tx, rx) = mpsc::unbounded_channel();
            let _sub = Subscription::new(
                Topic::Channel(Uuid::nil()),
                rx,
                CountingHandle {
                    closes: closes.clone(),
                },
            );
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn track_after_release_is_rejected() {
        let guard = SubscriptionGuard::new(CountingHandle {
            closes: Arc::new(AtomicUsize::new(0)),
        });
        guard.release();

        let beacon = PresenceBeacon {
            user_id: Uuid::nil(),
            username: Some("alice".into()),
            online_at: Utc::now(),
        };
        assert!(matches!(
            guard.track(beacon).await,
            Err(TransportError::Closed(_))
        ));
    }
}

//! "Who is online" for one shared room.
//!
//! Full snapshots from the transport are authoritative and replace the peer
//! map wholesale. Incremental join beacons are applied only if they are newer
//! than the last snapshot, so a peer that disconnected uncleanly cannot
//! linger on the strength of an old announcement.
//!
//! Beacon stamps come from each peer's own clock. A snapshot is therefore
//! dated by the newest beacon it carries rather than by when it arrived here,
//! so local clock skew never decides whether a join is stale. Skew between
//! two peers still can.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use murmur_types::{
    Identity, PresenceBeacon, PresenceState, PushEvent, SubscriptionStatus, Topic,
};

use crate::config::PresenceConfig;
use crate::contracts::{Directory, PushTransport, Subscription, SubscriptionGuard};
use crate::error::PresenceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPresence {
    pub display_name: String,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlinePeer {
    pub user_id: Uuid,
    pub display_name: String,
    pub last_seen_at: DateTime<Utc>,
    pub is_self: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub room_id: String,
    /// Sorted by display name.
    pub peers: Vec<OnlinePeer>,
}

impl PresenceSnapshot {
    pub fn online_count(&self) -> usize {
        self.peers.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOutcome {
    Changed,
    Unchanged,
    /// Our own beacon went out after the subscription became active.
    Announced,
    /// A join beacon predating the last snapshot was dropped.
    IgnoredStale,
}

impl PresenceOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Changed)
    }
}

pub struct PresenceAggregator {
    transport: Arc<dyn PushTransport>,
    directory: Arc<dyn Directory>,
    config: PresenceConfig,
}

impl PresenceAggregator {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        directory: Arc<dyn Directory>,
        config: PresenceConfig,
    ) -> Self {
        Self {
            transport,
            directory,
            config,
        }
    }

    /// Joins `room_id` with an empty peer map. Our own beacon is sent later,
    /// when the transport's `Subscribed` acknowledgment is handled.
    pub async fn subscribe(&self, room_id: &str) -> Result<PresenceRoom, PresenceError> {
        let me = match self.directory.current_user().await {
            Ok(me) => me,
            Err(e) => {
                warn!("Could not resolve current user for presence: {}", e);
                None
            }
        };

        let subscription = self
            .transport
            .subscribe(Topic::Presence(room_id.to_string()))
            .await
            .map_err(|source| PresenceError::SubscribeFailed {
                room_id: room_id.to_string(),
                source,
            })?;

        info!("Joined presence room {}", room_id);
        Ok(PresenceRoom::new(
            room_id.to_string(),
            me,
            subscription,
            self.directory.clone(),
            self.config.clone(),
        ))
    }
}

#[derive(Default)]
struct RoomState {
    peers: BTreeMap<Uuid, PeerPresence>,
    /// Newest beacon stamp seen in a snapshot.
    last_sync_at: Option<DateTime<Utc>>,
    announced: bool,
    left: bool,
}

pub struct PresenceRoom {
    room_id: String,
    me: Option<Identity>,
    directory: Arc<dyn Directory>,
    config: PresenceConfig,
    state: Mutex<RoomState>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<PushEvent>>,
    subscription: SubscriptionGuard,
    closed: CancellationToken,
}

impl PresenceRoom {
    fn new(
        room_id: String,
        me: Option<Identity>,
        subscription: Subscription,
        directory: Arc<dyn Directory>,
        config: PresenceConfig,
    ) -> Self {
        let Subscription { events, guard, .. } = subscription;
        Self {
            room_id,
            me,
            directory,
            config,
            state: Mutex::new(RoomState::default()),
            events: tokio::sync::Mutex::new(events),
            subscription: guard,
            closed: CancellationToken::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn peers(&self) -> BTreeMap<Uuid, PeerPresence> {
        self.state().peers.clone()
    }

    pub fn is_announced(&self) -> bool {
        self.state().announced
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        let me = self.me.as_ref().map(|me| me.id);
        let mut peers: Vec<OnlinePeer> = self
            .state()
            .peers
            .iter()
            .map(|(user_id, peer)| OnlinePeer {
                user_id: *user_id,
                display_name: peer.display_name.clone(),
                last_seen_at: peer.last_seen_at,
                is_self: me == Some(*user_id),
            })
            .collect();
        peers.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then(a.user_id.cmp(&b.user_id))
        });

        PresenceSnapshot {
            room_id: self.room_id.clone(),
            peers,
        }
    }

    pub async fn next_event(&self) -> Option<PushEvent> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut events = self.events.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            event = events.recv() => event,
        }
    }

    pub async fn handle_event(&self, event: PushEvent) -> PresenceOutcome {
        if self.state().left {
            return PresenceOutcome::Unchanged;
        }

        match event {
            PushEvent::Status { status } => self.on_status(status).await,
            PushEvent::PresenceSync { state } => {
                self.on_sync(state);
                PresenceOutcome::Changed
            }
            PushEvent::PresenceJoin { beacon } => self.on_join(beacon),
            PushEvent::PresenceLeave { user_id } => self.on_leave(user_id),
            PushEvent::MessageInserted { .. } => {
                trace!("Ignoring message insert on presence room {}", self.room_id);
                PresenceOutcome::Unchanged
            }
        }
    }

    async fn on_status(&self, status: SubscriptionStatus) -> PresenceOutcome {
        if status != SubscriptionStatus::Subscribed {
            // Re-arm so the beacon is repeated once the transport recovers.
            warn!("Presence room {} subscription is {:?}", self.room_id, status);
            self.state().announced = false;
            return PresenceOutcome::Unchanged;
        }

        if self.state().announced {
            return PresenceOutcome::Unchanged;
        }

        match self.announce().await {
            true => PresenceOutcome::Announced,
            false => PresenceOutcome::Unchanged,
        }
    }

    async fn announce(&self) -> bool {
        let Some(me) = &self.me else {
            debug!("No identity; not announcing presence in {}", self.room_id);
            return false;
        };

        let username = match &me.display_name {
            Some(name) => name.clone(),
            None => match self.directory.display_name(me.id).await {
                Ok(name) => name,
                Err(e) => {
                    warn!("Display name lookup for own presence failed: {}", e);
                    self.config.placeholder_name.clone()
                }
            },
        };

        let beacon = PresenceBeacon {
            user_id: me.id,
            username: Some(username),
            online_at: Utc::now(),
        };

        match self.subscription.track(beacon).await {
            Ok(()) => {
                let mut state = self.state();
                if state.left {
                    return false;
                }
                state.announced = true;
                info!("Announced presence in {}", self.room_id);
                true
            }
            Err(e) => {
                warn!("Presence announcement in {} failed: {}", self.room_id, e);
                false
            }
        }
    }

    /// Replaces the peer map with `state`. Peers missing from the snapshot
    /// are gone; beacons without a display name are skipped; a peer with
    /// several connections is listed once, under its latest beacon.
    pub fn on_sync(&self, snapshot: PresenceState) {
        let mut peers: BTreeMap<Uuid, PeerPresence> = BTreeMap::new();
        let mut newest: Option<DateTime<Utc>> = None;
        for beacon in snapshot.into_values().flatten() {
            newest = newest.max(Some(beacon.online_at));
            let Some(name) = beacon.username.filter(|n| !n.is_empty()) else {
                continue;
            };
            match peers.entry(beacon.user_id) {
                Entry::Vacant(slot) => {
                    slot.insert(PeerPresence {
                        display_name: name,
                        last_seen_at: beacon.online_at,
                    });
                }
                Entry::Occupied(mut slot) => {
                    if beacon.online_at > slot.get().last_seen_at {
                        slot.insert(PeerPresence {
                            display_name: name,
                            last_seen_at: beacon.online_at,
                        });
                    }
                }
            }
        }

        let mut state = self.state();
        if state.left {
            return;
        }
        debug!(
            "Presence sync in {}: {} -> {} peers",
            self.room_id,
            state.peers.len(),
            peers.len()
        );
        state.peers = peers;
        // An empty snapshot carries no stamp; keep the previous one.
        state.last_sync_at = newest.or(state.last_sync_at);
    }

    fn on_join(&self, beacon: PresenceBeacon) -> PresenceOutcome {
        let Some(name) = beacon.username.filter(|n| !n.is_empty()) else {
            return PresenceOutcome::Unchanged;
        };

        let mut state = self.state();
        if state.last_sync_at.is_some_and(|synced| beacon.online_at < synced) {
            debug!(
                "Dropping stale beacon from {} in {}",
                beacon.user_id, self.room_id
            );
            return PresenceOutcome::IgnoredStale;
        }

        let newer = state
            .peers
            .get(&beacon.user_id)
            .is_none_or(|peer| beacon.online_at >= peer.last_seen_at);
        if !newer {
            return PresenceOutcome::Unchanged;
        }

        state.peers.insert(
            beacon.user_id,
            PeerPresence {
                display_name: name,
                last_seen_at: beacon.online_at,
            },
        );
        PresenceOutcome::Changed
    }

    fn on_leave(&self, user_id: Uuid) -> PresenceOutcome {
        match self.state().peers.remove(&user_id) {
            Some(_) => PresenceOutcome::Changed,
            None => PresenceOutcome::Unchanged,
        }
    }

    /// Leaves the room. Our entry disappears from other peers' next snapshot.
    pub fn unsubscribe(&self) {
        {
            let mut state = self.state();
            if state.left {
                return;
            }
            state.left = true;
            state.announced = false;
            state.peers.clear();
        }
        self.closed.cancel();
        self.subscription.release();
        info!("Left presence room {}", self.room_id);
    }
}

impl Drop for PresenceRoom {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

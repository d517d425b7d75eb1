use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use uuid::Uuid;

use murmur_engine::{PushTransport, Subscription, SubscriptionHandle, TransportError};
use murmur_types::{
    PresenceBeacon, PresenceState, PushEvent, RawMessageRow, SubscriptionStatus, Topic,
};

type Senders = HashMap<Topic, HashMap<Uuid, mpsc::UnboundedSender<PushEvent>>>;
type Rooms = HashMap<String, HashMap<Uuid, PresenceBeacon>>;

/// Routes push events to subscribers by topic.
///
/// Lock order is `subscribers` then `presence`. Presence changes happen with
/// the subscriber map held, so room snapshots go out in the order they were
/// taken.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    /// topic -> (conn_id -> sender)
    subscribers: Mutex<Senders>,

    /// presence room -> (conn_id -> tracked beacon)
    presence: Mutex<Rooms>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, Senders> {
        self.inner.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn presence(&self) -> MutexGuard<'_, Rooms> {
        self.inner.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send an event to every subscriber of `topic`. Returns how many
    /// subscribers received it; hung-up receivers are pruned.
    pub fn publish(&self, topic: &Topic, event: PushEvent) -> usize {
        fan_out(&mut self.subscribers(), topic, event)
    }

    /// Broadcast a freshly stored message row to its channel's subscribers.
    pub fn publish_insert(&self, row: RawMessageRow) -> usize {
        let topic = Topic::Channel(row.channel_id);
        self.publish(&topic, PushEvent::MessageInserted { row })
    }

    /// Report a subscription status change to every subscriber of `topic`.
    pub fn publish_status(&self, topic: &Topic, status: SubscriptionStatus) -> usize {
        self.publish(topic, PushEvent::Status { status })
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.subscribers().get(topic).map_or(0, HashMap::len)
    }

    /// Current presence state of `room`, keyed by connection.
    pub fn presence_state(&self, room: &str) -> PresenceState {
        room_state(&self.presence(), room)
    }

    fn track(&self, room: &str, conn_id: Uuid, beacon: PresenceBeacon) {
        let mut subscribers = self.subscribers();
        let state = {
            let mut presence = self.presence();
            presence
                .entry(room.to_string())
                .or_default()
                .insert(conn_id, beacon.clone());
            room_state(&presence, room)
        };

        debug!("Tracked {} in presence room {}", beacon.user_id, room);
        let topic = Topic::Presence(room.to_string());
        fan_out(&mut subscribers, &topic, PushEvent::PresenceJoin { beacon });
        fan_out(&mut subscribers, &topic, PushEvent::PresenceSync { state });
    }

    fn disconnect(&self, topic: &Topic, conn_id: Uuid) {
        let mut subscribers = self.subscribers();
        if let Some(conns) = subscribers.get_mut(topic) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                subscribers.remove(topic);
            }
        }

        let Topic::Presence(room) = topic else {
            debug!("Connection {} left {}", conn_id, topic);
            return;
        };

        // Only announce a leave once the user has no connection left in the room.
        let (departed, state) = {
            let mut presence = self.presence();
            let Some(conns) = presence.get_mut(room) else {
                return;
            };
            let Some(beacon) = conns.remove(&conn_id) else {
                return;
            };
            let still_here = conns.values().any(|b| b.user_id == beacon.user_id);
            if conns.is_empty() {
                presence.remove(room);
            }
            ((!still_here).then_some(beacon.user_id), room_state(&presence, room))
        };

        if let Some(user_id) = departed {
            info!("{} left presence room {}", user_id, room);
            fan_out(&mut subscribers, topic, PushEvent::PresenceLeave { user_id });
        }
        fan_out(&mut subscribers, topic, PushEvent::PresenceSync { state });
    }
}

fn fan_out(subscribers: &mut Senders, topic: &Topic, event: PushEvent) -> usize {
    let Some(conns) = subscribers.get_mut(topic) else {
        trace!("No subscribers on {}", topic);
        return 0;
    };

    conns.retain(|conn_id, tx| {
        let alive = tx.send(event.clone()).is_ok();
        if !alive {
            debug!("Pruning dead connection {} on {}", conn_id, topic);
        }
        alive
    });
    let delivered = conns.len();
    if conns.is_empty() {
        subscribers.remove(topic);
    }
    delivered
}

fn room_state(rooms: &Rooms, room: &str) -> PresenceState {
    rooms
        .get(room)
        .map(|conns| {
            conns
                .iter()
                .map(|(conn_id, beacon)| (conn_id.to_string(), vec![beacon.clone()]))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl PushTransport for LocalHub {
    async fn subscribe(&self, topic: Topic) -> Result<Subscription, TransportError> {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subscribers = self.subscribers();
        let _ = tx.send(PushEvent::Status {
            status: SubscriptionStatus::Subscribed,
        });
        // New presence members start from the room's current state.
        if let Topic::Presence(room) = &topic {
            let _ = tx.send(PushEvent::PresenceSync {
                state: self.presence_state(room),
            });
        }
        subscribers
            .entry(topic.clone())
            .or_default()
            .insert(conn_id, tx);
        drop(subscribers);
        debug!("Connection {} subscribed to {}", conn_id, topic);

        let handle = HubHandle {
            hub: self.clone(),
            topic: topic.clone(),
            conn_id,
        };
        Ok(Subscription::new(topic, rx, handle))
    }
}

struct HubHandle {
    hub: LocalHub,
    topic: Topic,
    conn_id: Uuid,
}

#[async_trait]
impl SubscriptionHandle for HubHandle {
    async fn track(&self, beacon: PresenceBeacon) -> Result<(), TransportError> {
        let Topic::Presence(room) = &self.topic else {
            return Err(TransportError::Backend(anyhow::anyhow!(
                "Cannot track presence on {}",
                self.topic
            )));
        };
        if self.hub.subscriber_count(&self.topic) == 0 {
            return Err(TransportError::Closed(self.topic.to_string()));
        }
        self.hub.track(room, self.conn_id, beacon);
        Ok(())
    }

    fn close(&self) {
        self.hub.disconnect(&self.topic, self.conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn beacon(id: u128, name: &str) -> PresenceBeacon {
        PresenceBeacon {
            user_id: Uuid::from_u128(id),
            username: Some(name.to_string()),
            online_at: Utc::now(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PushEvent>) -> Vec<PushEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn subscribe_acknowledges_first() {
        let hub = LocalHub::new();
        let mut sub = hub.subscribe(Topic::Channel(Uuid::from_u128(1))).await.unwrap();

        assert!(matches!(
            sub.events.recv().await,
            Some(PushEvent::Status {
                status: SubscriptionStatus::Subscribed
            })
        ));
    }

    #[tokio::test]
    async fn inserts_reach_only_their_channel() {
        let hub = LocalHub::new();
        let general = Uuid::from_u128(1);
        let random = Uuid::from_u128(2);
        let mut a = hub.subscribe(Topic::Channel(general)).await.unwrap();
        let mut b = hub.subscribe(Topic::Channel(random)).await.unwrap();
        drain(&mut a.events);
        drain(&mut b.events);

        let row = RawMessageRow {
            id: Uuid::from_u128(10),
            channel_id: general,
            author_id: Uuid::from_u128(3),
            body: "hi".into(),
            inserted_at: Utc::now(),
        };
        assert_eq!(hub.publish_insert(row), 1);

        assert_eq!(drain(&mut a.events).len(), 1);
        assert!(drain(&mut b.events).is_empty());
    }

    #[tokio::test]
    async fn release_removes_subscriber() {
        let hub = LocalHub::new();
        let topic = Topic::Channel(Uuid::from_u128(1));
        let sub = hub.subscribe(topic.clone()).await.unwrap();
        assert_eq!(hub.subscriber_count(&topic), 1);

        sub.guard.release();
        assert_eq!(hub.subscriber_count(&topic), 0);
        assert_eq!(hub.publish_status(&topic, SubscriptionStatus::Closed), 0);
    }

    #[tokio::test]
    async fn tracking_syncs_the_whole_room() {
        let hub = LocalHub::new();
        let topic = Topic::Presence("lobby".into());
        let mut alice = hub.subscribe(topic.clone()).await.unwrap();
        let mut bob = hub.subscribe(topic.clone()).await.unwrap();
        drain(&mut alice.events);
        drain(&mut bob.events);

        alice.guard.track(beacon(1, "alice")).await.unwrap();
        bob.guard.track(beacon(2, "bob")).await.unwrap();

        let last_sync = drain(&mut alice.events)
            .into_iter()
            .filter_map(|e| match e {
                PushEvent::PresenceSync { state } => Some(state),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_sync.len(), 2);

        // A late joiner gets the current room state right after the ack.
        let mut carol = hub.subscribe(topic.clone()).await.unwrap();
        let events = drain(&mut carol.events);
        assert!(matches!(&events[1], PushEvent::PresenceSync { state } if state.len() == 2));
    }

    #[tokio::test]
    async fn leave_is_announced_after_last_connection_closes() {
        let hub = LocalHub::new();
        let topic = Topic::Presence("lobby".into());
        let mut watcher = hub.subscribe(topic.clone()).await.unwrap();
        let tab1 = hub.subscribe(topic.clone()).await.unwrap();
        let tab2 = hub.subscribe(topic.clone()).await.unwrap();
        tab1.guard.track(beacon(7, "dana")).await.unwrap();
        tab2.guard.track(beacon(7, "dana")).await.unwrap();
        drain(&mut watcher.events);

        tab1.guard.release();
        let events = drain(&mut watcher.events);
        assert!(!events.iter().any(|e| matches!(e, PushEvent::PresenceLeave { .. })));

        drop(tab2);
        let events = drain(&mut watcher.events);
        assert!(events.iter().any(
            |e| matches!(e, PushEvent::PresenceLeave { user_id } if *user_id == Uuid::from_u128(7))
        ));
        assert!(hub.presence_state("lobby").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tracks_end_on_the_full_room() {
        let hub = LocalHub::new();
        let topic = Topic::Presence("lobby".into());
        let mut watcher = hub.subscribe(topic.clone()).await.unwrap();

        let mut tasks = Vec::new();
        for id in 1..=16u128 {
            let hub = hub.clone();
            let topic = topic.clone();
            tasks.push(tokio::spawn(async move {
                let sub = hub.subscribe(topic).await.unwrap();
                sub.guard.track(beacon(id, "peer")).await.unwrap();
                sub
            }));
        }
        let mut subs = Vec::new();
        for task in tasks {
            subs.push(task.await.unwrap());
        }

        let syncs: Vec<PresenceState> = drain(&mut watcher.events)
            .into_iter()
            .filter_map(|e| match e {
                PushEvent::PresenceSync { state } => Some(state),
                _ => None,
            })
            .collect();
        // Each snapshot holds at least as many peers as the one before it.
        assert!(syncs.windows(2).all(|w| w[0].len() <= w[1].len()));
        assert_eq!(syncs.last().unwrap().len(), 16);

        // Every tracker's own view ends on the full room too.
        for sub in &mut subs {
            let last = drain(&mut sub.events)
                .into_iter()
                .filter_map(|e| match e {
                    PushEvent::PresenceSync { state } => Some(state),
                    _ => None,
                })
                .last()
                .unwrap();
            assert_eq!(last.len(), 16);
        }
    }

    #[tokio::test]
    async fn track_on_channel_topic_is_rejected() {
        let hub = LocalHub::new();
        let sub = hub.subscribe(Topic::Channel(Uuid::from_u128(1))).await.unwrap();
        assert!(sub.guard.track(beacon(1, "alice")).await.is_err());
    }
}

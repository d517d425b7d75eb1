//! Hand-written collaborators for driving the engine in tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Semaphore, mpsc};
use uuid::Uuid;

use murmur_engine::{
    Directory, DirectoryError, MessageStore, PageRequest, PushTransport, StoreError,
    Subscription, SubscriptionHandle, TransportError,
};
use murmur_types::{
    Identity, Message, PresenceBeacon, PushEvent, RawMessageRow, SubscriptionStatus, Topic,
};

pub const GENERAL: Uuid = Uuid::from_u128(0x100);
pub const ALICE: Uuid = Uuid::from_u128(0xA11CE);
pub const BOB: Uuid = Uuid::from_u128(0xB0B);

/// Route engine logs to the test harness; `RUST_LOG` selects the level.
pub fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=warn".into()),
        )
        .try_init();
}

/// `hh:mm` on a fixed day.
pub fn at(hh: u32, mm: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hh, mm, 0).unwrap()
}

pub fn message(id: u128, author: Uuid, inserted_at: DateTime<Utc>) -> Message {
    Message {
        id: Uuid::from_u128(id),
        channel_id: GENERAL,
        author_id: author,
        author_display_name: name_of(author).to_string(),
        body: format!("message {}", id),
        inserted_at,
    }
}

pub fn row(id: u128, author: Uuid, inserted_at: DateTime<Utc>) -> RawMessageRow {
    RawMessageRow::from(&message(id, author, inserted_at))
}

pub fn name_of(user: Uuid) -> &'static str {
    match user {
        ALICE => "alice",
        BOB => "bob",
        _ => "someone",
    }
}

pub fn ids(messages: &[Message]) -> Vec<u128> {
    messages.iter().map(|m| m.id.as_u128()).collect()
}

pub fn assert_ordered(messages: &[Message]) {
    for pair in messages.windows(2) {
        assert!(
            pair[0].cmp_order(&pair[1]).is_lt(),
            "out of order or duplicate: {:?} then {:?}",
            pair[0].id,
            pair[1].id
        );
    }
}

// -- Store --

#[derive(Default)]
pub struct MockStore {
    rows: Mutex<Vec<Message>>,
    pub fetches: AtomicUsize,
    pub appends: Mutex<Vec<(Uuid, Uuid, String)>>,
    fail_fetches: AtomicUsize,
    fail_appends: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockStore {
    pub fn with_rows(rows: Vec<Message>) -> Arc<Self> {
        let store = Self::default();
        *store.rows.lock().unwrap() = rows;
        Arc::new(store)
    }

    pub fn add_row(&self, message: Message) {
        self.rows.lock().unwrap().push(message);
    }

    /// Fail the next `n` fetches.
    pub fn fail_fetches(&self, n: usize) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Hold every subsequent fetch until a permit is added to the returned gate.
    pub fn hold_fetches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Let fetches started from now on through; already held ones keep
    /// waiting on their gate.
    pub fn stop_holding(&self) {
        *self.gate.lock().unwrap() = None;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for MockStore {
    async fn fetch_page(
        &self,
        channel_id: Uuid,
        page: PageRequest,
    ) -> Result<Vec<Message>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        let failing = self
            .fail_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Request("connection reset".into()));
        }

        let mut rows: Vec<Message> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .filter(|m| page.before.is_none_or(|cursor| m.inserted_at < cursor))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.cmp_order(a));
        rows.truncate(page.limit as usize);
        Ok(rows)
    }

    async fn append(
        &self,
        channel_id: Uuid,
        author_id: Uuid,
        body: &str,
    ) -> Result<Message, StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Request("insert rejected".into()));
        }
        self.appends
            .lock()
            .unwrap()
            .push((channel_id, author_id, body.to_string()));
        let msg = Message {
            id: Uuid::new_v4(),
            channel_id,
            author_id,
            author_display_name: name_of(author_id).to_string(),
            body: body.to_string(),
            inserted_at: Utc::now(),
        };
        self.add_row(msg.clone());
        Ok(msg)
    }
}

// -- Directory --

pub struct MockDirectory {
    me: Option<Identity>,
    names: HashMap<Uuid, String>,
    pub lookups: AtomicUsize,
}

impl MockDirectory {
    pub fn signed_in_as(user: Uuid) -> Arc<Self> {
        Arc::new(Self {
            me: Some(Identity::new(user, name_of(user))),
            names: [(ALICE, "alice".to_string()), (BOB, "bob".to_string())].into(),
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn anonymous() -> Arc<Self> {
        Arc::new(Self {
            me: None,
            names: [(ALICE, "alice".to_string()), (BOB, "bob".to_string())].into(),
            lookups: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Directory for MockDirectory {
    async fn current_user(&self) -> Result<Option<Identity>, DirectoryError> {
        Ok(self.me.clone())
    }

    async fn display_name(&self, user_id: Uuid) -> Result<String, DirectoryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.names
            .get(&user_id)
            .cloned()
            .ok_or(DirectoryError::NotFound(user_id))
    }
}

// -- Transport --

#[derive(Default)]
pub struct MockTransport {
    senders: Mutex<Vec<(Topic, mpsc::UnboundedSender<PushEvent>)>>,
    pub closes: Arc<AtomicUsize>,
    pub tracked: Arc<Mutex<Vec<PresenceBeacon>>>,
    pub refuse: AtomicBool,
    /// Skip the automatic `Subscribed` acknowledgment.
    pub silent: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, topic: &Topic, event: PushEvent) {
        for (t, tx) in self.senders.lock().unwrap().iter() {
            if t == topic {
                let _ = tx.send(event.clone());
            }
        }
    }

    pub fn insert(&self, row: RawMessageRow) {
        self.push(
            &Topic::Channel(row.channel_id),
            PushEvent::MessageInserted { row },
        );
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct MockHandle {
    closes: Arc<AtomicUsize>,
    tracked: Arc<Mutex<Vec<PresenceBeacon>>>,
}

#[async_trait]
impl SubscriptionHandle for MockHandle {
    async fn track(&self, beacon: PresenceBeacon) -> Result<(), TransportError> {
        self.tracked.lock().unwrap().push(beacon);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PushTransport for MockTransport {
    async fn subscribe(&self, topic: Topic) -> Result<Subscription, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(topic.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.silent.load(Ordering::SeqCst) {
            let _ = tx.send(PushEvent::Status {
                status: SubscriptionStatus::Subscribed,
            });
        }
        self.senders.lock().unwrap().push((topic.clone(), tx));
        Ok(Subscription::new(
            topic,
            rx,
            MockHandle {
                closes: self.closes.clone(),
                tracked: self.tracked.clone(),
            },
        ))
    }
}

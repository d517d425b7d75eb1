//! Per-channel timeline reconciliation.
//!
//! A [`Timeline`] merges three producers into one ordered, duplicate-free
//! message sequence: the initial history fetch, backward pagination, and live
//! inserts from the push transport. All operations take `&self` and run on the
//! caller's task; the state lock is never held across an await point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use murmur_types::{Identity, Message, PushEvent, RawMessageRow, Topic};

use crate::config::TimelineConfig;
use crate::contracts::{
    Directory, MessageStore, PageRequest, PushTransport, Subscription, SubscriptionGuard,
};
use crate::error::TimelineError;
use crate::ordering::{OrderedMessages, Placement, into_chronological};

/// Lifecycle of a timeline. A channel that has not been opened has no
/// `Timeline` value at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelinePhase {
    Loading,
    Ready,
    LoadingOlder,
    Closed,
}

/// Why [`Timeline::load_older`] did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Empty,
    Exhausted,
    InFlight,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOlderOutcome {
    Loaded { added: usize, has_more_older: bool },
    Skipped(SkipReason),
    /// The fetch resolved after `close`, or after a refresh replaced the
    /// messages its cursor came from; its result was discarded.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveInsertOutcome {
    Inserted {
        /// The at-bottom flag as the caller last reported it, before this insert.
        auto_scroll: bool,
        placement: Placement,
    },
    /// Already held; push transports may redeliver.
    Duplicate,
    ForeignChannel,
    /// Arrived after `close`; discarded.
    Stale,
}

impl LiveInsertOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineStats {
    pub duplicates_ignored: u64,
    pub reordered_inserts: u64,
    pub placeholder_names: u64,
    pub stale_discarded: u64,
    pub pages_fetched: u64,
}

/// Read-only copy of a timeline handed to views.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineSnapshot {
    pub channel_id: Uuid,
    pub me: Option<Uuid>,
    pub messages: Vec<Message>,
    pub oldest_loaded_cursor: Option<DateTime<Utc>>,
    pub has_more_older: bool,
    pub phase: TimelinePhase,
}

impl TimelineSnapshot {
    pub fn is_mine(&self, message: &Message) -> bool {
        self.me == Some(message.author_id)
    }
}

/// Result of [`TimelineEngine::open`]. A failed history fetch still yields a
/// live, empty timeline; the failure is reported alongside it.
pub struct Opened {
    pub timeline: Timeline,
    pub history_error: Option<TimelineError>,
}

/// Opens timelines against one set of collaborators.
#[derive(Clone)]
pub struct TimelineEngine {
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn Directory>,
    transport: Arc<dyn PushTransport>,
    config: TimelineConfig,
}

impl TimelineEngine {
    pub fn new(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn Directory>,
        transport: Arc<dyn PushTransport>,
        config: TimelineConfig,
    ) -> Self {
        Self {
            store,
            directory,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    /// Subscribes to live inserts for `channel_id`, then loads the newest page.
    ///
    /// The subscription is taken first so inserts landing during the history
    /// fetch are buffered rather than lost; overlap is removed by dedup.
    pub async fn open(&self, channel_id: Uuid) -> Result<Opened, TimelineError> {
        let me = match self.directory.current_user().await {
            Ok(me) => me,
            Err(e) => {
                warn!("Could not resolve current user for channel {}: {}", channel_id, e);
                None
            }
        };

        let topic = Topic::Channel(channel_id);
        let subscription = self
            .transport
            .subscribe(topic.clone())
            .await
            .map_err(|source| TimelineError::SubscribeFailed {
                topic: topic.to_string(),
                source,
            })?;

        let timeline = Timeline::new(
            channel_id,
            me,
            subscription,
            self.store.clone(),
            self.directory.clone(),
            self.config.clone(),
        );

        let history_error = timeline.load_newest().await.err();
        match &history_error {
            None => info!(
                "Opened channel {} with {} messages",
                channel_id,
                timeline.len()
            ),
            Some(e) => warn!("Opened channel {} without history: {}", channel_id, e),
        }

        Ok(Opened {
            timeline,
            history_error,
        })
    }
}

struct TimelineState {
    phase: TimelinePhase,
    messages: OrderedMessages,
    has_more_older: bool,
    /// Bumped on close; fetches compare it after their await point.
    generation: u64,
    /// Bumped whenever the held run is replaced wholesale. A cursor taken
    /// under an older epoch no longer borders the held messages.
    epoch: u64,
    stats: TimelineStats,
}

impl TimelineState {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.phase != TimelinePhase::Closed
    }
}

pub struct Timeline {
    channel_id: Uuid,
    me: Option<Identity>,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn Directory>,
    config: TimelineConfig,
    state: Mutex<TimelineState>,
    at_bottom: AtomicBool,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<PushEvent>>,
    subscription: SubscriptionGuard,
    closed: CancellationToken,
}

impl Timeline {
    fn new(
        channel_id: Uuid,
        me: Option<Identity>,
        subscription: Subscription,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn Directory>,
        config: TimelineConfig,
    ) -> Self {
        let Subscription { events, guard, .. } = subscription;
        Self {
            channel_id,
            me,
            store,
            directory,
            config,
            state: Mutex::new(TimelineState {
                phase: TimelinePhase::Loading,
                messages: OrderedMessages::new(),
                has_more_older: true,
                generation: 0,
                epoch: 0,
                stats: TimelineStats::default(),
            }),
            // A freshly opened channel is rendered scrolled to the latest message.
            at_bottom: AtomicBool::new(true),
            events: tokio::sync::Mutex::new(events),
            subscription: guard,
            closed: CancellationToken::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, TimelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    pub fn me(&self) -> Option<&Identity> {
        self.me.as_ref()
    }

    pub fn phase(&self) -> TimelinePhase {
        self.state().phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == TimelinePhase::Closed
    }

    pub fn len(&self) -> usize {
        self.state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().messages.is_empty()
    }

    pub fn has_more_older(&self) -> bool {
        self.state().has_more_older
    }

    pub fn oldest_loaded_cursor(&self) -> Option<DateTime<Utc>> {
        self.state().messages.oldest_cursor()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state().messages.as_slice().to_vec()
    }

    pub fn stats(&self) -> TimelineStats {
        self.state().stats
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        let state = self.state();
        TimelineSnapshot {
            channel_id: self.channel_id,
            me: self.me.as_ref().map(|me| me.id),
            messages: state.messages.as_slice().to_vec(),
            oldest_loaded_cursor: state.messages.oldest_cursor(),
            has_more_older: state.has_more_older,
            phase: state.phase,
        }
    }

    /// Reported by the view whenever its scroll position crosses the bottom.
    pub fn set_at_bottom(&self, at_bottom: bool) {
        self.at_bottom.store(at_bottom, Ordering::Release);
    }

    pub fn is_at_bottom(&self) -> bool {
        self.at_bottom.load(Ordering::Acquire)
    }

    /// Waits for the next push event. `None` once closed or the transport
    /// hangs up.
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

    /// Fetches the newest page and merges it in. Used by `open` and to retry
    /// a failed history fetch or fill a gap after reconnecting.
    pub async fn refresh(&self) -> Result<usize, TimelineError> {
        self.load_newest().await
    }

    async fn load_newest(&self) -> Result<usize, TimelineError> {
        let generation = {
            let state = self.state();
            if state.phase == TimelinePhase::Closed {
                return Err(TimelineError::Closed {
                    channel_id: self.channel_id,
                });
            }
            state.generation
        };

        let page_size = self.config.page_size;
        let result = self
            .store
            .fetch_page(self.channel_id, PageRequest::newest(page_size))
            .await;

        let mut state = self.state();
        if !state.is_current(generation) {
            state.stats.stale_discarded += 1;
            debug!("Discarding history page for closed channel {}", self.channel_id);
            return Err(TimelineError::Closed {
                channel_id: self.channel_id,
            });
        }
        if state.phase == TimelinePhase::Loading {
            state.phase = TimelinePhase::Ready;
        }

        let page = match result {
            Ok(page) => page,
            Err(source) => {
                if state.messages.is_empty() {
                    state.has_more_older = true;
                }
                return Err(TimelineError::HistoryFetchFailed {
                    channel_id: self.channel_id,
                    source,
                });
            }
        };

        state.stats.pages_fetched += 1;
        let fetched = page.len();
        let full_page = fetched >= page_size as usize;
        let page = into_chronological(page);

        // A full page that starts after everything held leaves a hole between
        // the two; drop the held run and paginate back from the new page.
        let leaves_gap = full_page
            && match (page.first(), state.messages.last()) {
                (Some(oldest_new), Some(newest_held)) => {
                    oldest_new.cmp_order(newest_held) == std::cmp::Ordering::Greater
                }
                _ => false,
            };

        let added = if state.messages.is_empty() || leaves_gap {
            if leaves_gap {
                warn!(
                    "Newest page for channel {} does not overlap held messages; resetting",
                    self.channel_id
                );
            }
            state.messages.reset(page);
            state.epoch += 1;
            state.has_more_older = full_page;
            state.messages.len()
        } else {
            state.messages.merge(page)
        };

        debug!(
            "Loaded newest page for channel {}: {} fetched, {} new",
            self.channel_id, fetched, added
        );
        Ok(added)
    }

    /// Fetches the page strictly older than the oldest held message and
    /// prepends it. At most one call per timeline is in flight; overlapping
    /// calls return [`SkipReason::InFlight`] immediately.
    pub async fn load_older(&self) -> Result<LoadOlderOutcome, TimelineError> {
        let (cursor, generation, epoch) = {
            let mut state = self.state();
            let skip = match state.phase {
                TimelinePhase::Closed => Some(SkipReason::Closed),
                TimelinePhase::LoadingOlder => Some(SkipReason::InFlight),
                _ if state.messages.is_empty() => Some(SkipReason::Empty),
                _ if !state.has_more_older => Some(SkipReason::Exhausted),
                _ => None,
            };
            if let Some(reason) = skip {
                trace!("load_older on channel {} skipped: {:?}", self.channel_id, reason);
                return Ok(LoadOlderOutcome::Skipped(reason));
            }
            let Some(cursor) = state.messages.oldest_cursor() else {
                return Ok(LoadOlderOutcome::Skipped(SkipReason::Empty));
            };
            state.phase = TimelinePhase::LoadingOlder;
            (cursor, state.generation, state.epoch)
        };

        // Declared before `state` below so it drops after the state lock is
        // released; also resets the phase if this future is dropped mid-fetch.
        let _in_flight = InFlightGuard { timeline: self };

        let page_size = self.config.page_size;
        let result = self
            .store
            .fetch_page(self.channel_id, PageRequest::before(cursor, page_size))
            .await;

        let mut state = self.state();
        if !state.is_current(generation) {
            state.stats.stale_discarded += 1;
            debug!("Discarding older page for closed channel {}", self.channel_id);
            return Ok(LoadOlderOutcome::Stale);
        }
        if state.epoch != epoch {
            state.stats.stale_discarded += 1;
            debug!(
                "Discarding older page for channel {}: held messages were replaced",
                self.channel_id
            );
            return Ok(LoadOlderOutcome::Stale);
        }

        let page = result.map_err(|source| {
            warn!("Pagination fetch failed for channel {}: {}", self.channel_id, source);
            TimelineError::PaginationFetchFailed {
                channel_id: self.channel_id,
                source,
            }
        })?;

        state.stats.pages_fetched += 1;
        let fetched = page.len();
        let added = state.messages.prepend_page(into_chronological(page));
        state.has_more_older = fetched >= page_size as usize;

        debug!(
            "Loaded older page for channel {} before {}: {} fetched, {} new, more={}",
            self.channel_id, cursor, fetched, added, state.has_more_older
        );
        Ok(LoadOlderOutcome::Loaded {
            added,
            has_more_older: state.has_more_older,
        })
    }

    /// Merges one push-delivered row.
    ///
    /// Redeliveries are dropped. The author's display name is resolved
    /// best-effort; a failed lookup stores the placeholder name rather than
    /// dropping the message.
    pub async fn on_live_insert(&self, row: RawMessageRow) -> LiveInsertOutcome {
        let generation = {
            let mut state = self.state();
            if state.phase == TimelinePhase::Closed {
                state.stats.stale_discarded += 1;
                return LiveInsertOutcome::Stale;
            }
            if row.channel_id != self.channel_id {
                warn!(
                    "Ignoring insert {} for channel {} on timeline {}",
                    row.id, row.channel_id, self.channel_id
                );
                return LiveInsertOutcome::ForeignChannel;
            }
            if state.messages.contains(&row.id) {
                state.stats.duplicates_ignored += 1;
                trace!("Duplicate delivery of {} ignored", row.id);
                return LiveInsertOutcome::Duplicate;
            }
            state.generation
        };

        let auto_scroll = self.is_at_bottom();
        let (name, placeholder) = self.resolve_author(row.author_id).await;

        let mut state = self.state();
        if !state.is_current(generation) {
            state.stats.stale_discarded += 1;
            return LiveInsertOutcome::Stale;
        }
        if placeholder {
            state.stats.placeholder_names += 1;
        }

        let message = row.with_display_name(name);
        let message_id = message.id;
        match state.messages.insert(message) {
            // A page fetched during the name lookup already brought it in.
            None => {
                state.stats.duplicates_ignored += 1;
                LiveInsertOutcome::Duplicate
            }
            Some(placement) => {
                if let Placement::Reordered { index } = placement {
                    state.stats.reordered_inserts += 1;
                    debug!(
                        "Live insert {} older than tail; placed at {} of {}",
                        message_id,
                        index,
                        state.messages.len()
                    );
                }
                LiveInsertOutcome::Inserted {
                    auto_scroll,
                    placement,
                }
            }
        }
    }

    async fn resolve_author(&self, author_id: Uuid) -> (String, bool) {
        if let Some(name) = self
            .me
            .as_ref()
            .filter(|me| me.id == author_id)
            .and_then(|me| me.display_name.clone())
        {
            return (name, false);
        }

        match self.directory.display_name(author_id).await {
            Ok(name) => (name, false),
            Err(e) => {
                warn!("Display name lookup for {} failed: {}", author_id, e);
                (self.config.placeholder_name.clone(), true)
            }
        }
    }

    /// Asks the store to append a message. The message is not inserted
    /// locally; it comes back through the live stream. On failure the body
    /// is returned in the error so the caller can restore the draft.
    pub async fn send(&self, body: &str, author_id: Uuid) -> Result<Message, TimelineError> {
        if self.is_closed() {
            return Err(TimelineError::Closed {
                channel_id: self.channel_id,
            });
        }
        if body.trim().is_empty() {
            return Err(TimelineError::EmptyBody);
        }

        self.store
            .append(self.channel_id, author_id, body)
            .await
            .map_err(|source| {
                warn!("Send to channel {} failed: {}", self.channel_id, source);
                TimelineError::SendFailed {
                    channel_id: self.channel_id,
                    draft: body.to_string(),
                    source,
                }
            })
    }

    /// [`send`](Self::send) as the identity resolved at open.
    pub async fn send_as_me(&self, body: &str) -> Result<Message, TimelineError> {
        let Some(author_id) = self.me.as_ref().map(|me| me.id) else {
            return Err(TimelineError::NotSignedIn {
                channel_id: self.channel_id,
                draft: body.to_string(),
            });
        };
        self.send(body, author_id).await
    }

    /// Releases the live subscription. Terminal; repeated calls are no-ops.
    pub fn close(&self) {
        {
            let mut state = self.state();
            if state.phase == TimelinePhase::Closed {
                return;
            }
            state.phase = TimelinePhase::Closed;
            state.generation += 1;
        }
        self.closed.cancel();
        self.subscription.release();
        info!("Closed channel {}", self.channel_id);
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

struct InFlightGuard<'a> {
    timeline: &'a Timeline,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.timeline.state();
        if state.phase == TimelinePhase::LoadingOlder {
            state.phase = TimelinePhase::Ready;
        }
    }
}

//! Event loops that drain a subscription and push snapshots to a view.

use murmur_types::{PushEvent, SubscriptionStatus};
use tracing::{debug, info, trace, warn};

use crate::presence::{PresenceRoom, PresenceSnapshot};
use crate::timeline::{LiveInsertOutcome, Timeline, TimelineSnapshot};

/// Renders a channel. Receives a fresh snapshot after every change.
pub trait TimelineView: Send + Sync {
    fn on_timeline_changed(&self, snapshot: &TimelineSnapshot, auto_scroll: bool);
}

impl<F> TimelineView for F
where
    F: Fn(&TimelineSnapshot, bool) + Send + Sync,
{
    fn on_timeline_changed(&self, snapshot: &TimelineSnapshot, auto_scroll: bool) {
        self(snapshot, auto_scroll)
    }
}

/// Renders the online list.
pub trait PresenceView: Send + Sync {
    fn on_presence_changed(&self, snapshot: &PresenceSnapshot);
}

impl<F> PresenceView for F
where
    F: Fn(&PresenceSnapshot) + Send + Sync,
{
    fn on_presence_changed(&self, snapshot: &PresenceSnapshot) {
        self(snapshot)
    }
}

/// Counters for one finished timeline loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineLoopReport {
    pub events: u64,
    pub renders: u64,
    pub refreshes: u64,
}

/// Drains `timeline`'s live events in delivery order until it is closed or
/// the transport hangs up.
///
/// The current state is rendered once up front, scrolled to the bottom. After
/// the transport reports an interruption, the next `Subscribed` triggers a
/// refresh so inserts missed while disconnected are fetched.
pub async fn run_timeline(timeline: &Timeline, view: &dyn TimelineView) -> TimelineLoopReport {
    let mut report = TimelineLoopReport::default();
    let mut interrupted = false;

    view.on_timeline_changed(&timeline.snapshot(), true);
    report.renders += 1;

    while let Some(event) = timeline.next_event().await {
        report.events += 1;
        match event {
            PushEvent::MessageInserted { row } => {
                let outcome = timeline.on_live_insert(row).await;
                trace!("Live insert on {}: {:?}", timeline.channel_id(), outcome);
                if let LiveInsertOutcome::Inserted { auto_scroll, .. } = outcome {
                    view.on_timeline_changed(&timeline.snapshot(), auto_scroll);
                    report.renders += 1;
                }
            }
            PushEvent::Status {
                status: SubscriptionStatus::Subscribed,
            } => {
                if !interrupted {
                    debug!("Channel {} subscription active", timeline.channel_id());
                    continue;
                }
                interrupted = false;
                info!("Channel {} resubscribed; refreshing", timeline.channel_id());
                report.refreshes += 1;
                match timeline.refresh().await {
                    Ok(0) => {}
                    Ok(_) => {
                        view.on_timeline_changed(&timeline.snapshot(), timeline.is_at_bottom());
                        report.renders += 1;
                    }
                    Err(e) => warn!("Refresh after resubscribe failed: {}", e),
                }
            }
            PushEvent::Status { status } => {
                warn!("Channel {} subscription is {:?}", timeline.channel_id(), status);
                interrupted = true;
            }
            other => trace!("Ignoring {:?} on channel {}", other, timeline.channel_id()),
        }
    }

    debug!("Timeline loop for {} finished: {:?}", timeline.channel_id(), report);
    report
}

/// Drains `room`'s presence events until it is left or the transport hangs up.
pub async fn run_presence(room: &PresenceRoom, view: &dyn PresenceView) -> u64 {
    let mut renders = 0;
    while let Some(event) = room.next_event().await {
        if room.handle_event(event).await.changed() {
            view.on_presence_changed(&room.snapshot());
            renders += 1;
        }
    }
    debug!("Presence loop for {} finished after {} renders", room.room_id(), renders);
    renders
}

//! Client-side core of the murmur chat client.
//!
//! - [`timeline`]: per-channel message timeline reconciling history, backward
//!   pagination and live inserts into one ordered, duplicate-free sequence
//! - [`presence`]: "who is online" for a shared room, rebuilt from
//!   authoritative snapshots
//! - [`contracts`]: the message store, directory and push transport the core
//!   consumes
//! - [`session`]: event loops feeding view callbacks

pub mod config;
pub mod contracts;
pub mod error;
pub mod ordering;
pub mod presence;
pub mod session;
pub mod timeline;

pub use config::{DEFAULT_PAGE_SIZE, DEFAULT_PRESENCE_ROOM, PLACEHOLDER_NAME, PresenceConfig, TimelineConfig};
pub use contracts::{
    Directory, MessageStore, PageRequest, PushTransport, Subscription, SubscriptionGuard,
    SubscriptionHandle,
};
pub use error::{DirectoryError, PresenceError, StoreError, TimelineError, TransportError};
pub use ordering::{OrderedMessages, Placement};
pub use presence::{
    OnlinePeer, PeerPresence, PresenceAggregator, PresenceOutcome, PresenceRoom, PresenceSnapshot,
};
pub use session::{PresenceView, TimelineLoopReport, TimelineView, run_presence, run_timeline};
pub use timeline::{
    LiveInsertOutcome, LoadOlderOutcome, Opened, SkipReason, Timeline, TimelineEngine,
    TimelinePhase, TimelineSnapshot, TimelineStats,
};

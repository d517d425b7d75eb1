pub mod api;
pub mod events;
pub mod models;

pub use events::{PresenceBeacon, PresenceState, PushEvent, SubscriptionStatus, Topic};
pub use models::{Channel, Identity, Message, RawMessageRow};

/// Messages fetched per history or pagination request.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Display name used when an author's profile cannot be resolved.
pub const PLACEHOLDER_NAME: &str = "Unknown";

/// Room shared by every client for the "who is online" list.
pub const DEFAULT_PRESENCE_ROOM: &str = "global_presence";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineConfig {
    pub page_size: u32,
    pub placeholder_name: String,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            placeholder_name: PLACEHOLDER_NAME.to_string(),
        }
    }
}

impl TimelineConfig {
    /// A page size of zero would never make progress; it is clamped to one.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    pub placeholder_name: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            placeholder_name: PLACEHOLDER_NAME.to_string(),
        }
    }
}

//! Database row types. These map directly to SQLite rows and stay
//! independent of the engine's models.

pub struct UserRow {
    pub id: String,
    pub username: Option<String>,
    pub created_at: String,
}

pub struct ChannelRow {
    pub id: String,
    pub slug: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    /// `None` when the author has no profile row.
    pub author_username: Option<String>,
    pub body: String,
    pub inserted_at: String,
}

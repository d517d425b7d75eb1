use crate::models::{ChannelRow, MessageRow, UserRow};
use crate::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension};

const MESSAGE_COLUMNS: &str =
    "m.id, m.channel_id, m.author_id, u.username, m.body, m.inserted_at
     FROM messages m
     LEFT JOIN users u ON m.author_id = u.id";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username) VALUES (?1, ?2)",
                (id, username),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    // -- Channels --

    pub fn create_channel(&self, id: &str, slug: &str, created_by: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channels (id, slug, created_by) VALUES (?1, ?2, ?3)",
                (id, slug, created_by),
            )?;
            Ok(())
        })
    }

    pub fn get_channels(&self) -> Result<Vec<ChannelRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, slug, created_at FROM channels ORDER BY slug ASC")?;
            let rows = stmt
                .query_map([], channel_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_channel(&self, id: &str) -> Result<Option<ChannelRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, slug, created_at FROM channels WHERE id = ?1",
                    [id],
                    channel_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn get_channel_by_slug(&self, slug: &str) -> Result<Option<ChannelRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, slug, created_at FROM channels WHERE slug = ?1",
                    [slug],
                    channel_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    // -- Messages --

    /// Inserts a message with an explicit stamp and reads it back with its
    /// author's username.
    pub fn insert_message(
        &self,
        id: &str,
        channel_id: &str,
        author_id: &str,
        body: &str,
        inserted_at: &str,
    ) -> Result<MessageRow> {
        self.with_conn(|conn| insert_message(conn, id, channel_id, author_id, body, inserted_at))
    }

    /// Inserts a message stamped `now`, or one microsecond after the
    /// channel's latest message if that is not earlier. Stamps within a
    /// channel are strictly increasing.
    pub fn append_message(
        &self,
        id: &str,
        channel_id: &str,
        author_id: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<MessageRow> {
        self.with_conn(|conn| {
            let latest: Option<String> = conn.query_row(
                "SELECT MAX(inserted_at) FROM messages WHERE channel_id = ?1",
                [channel_id],
                |row| row.get(0),
            )?;

            let mut at = now.trunc_subsecs(6);
            if let Some(latest) = latest {
                let latest = parse_time(&latest)?;
                if latest >= at {
                    at = latest + Duration::microseconds(1);
                }
            }
            insert_message(conn, id, channel_id, author_id, body, &format_time(at))
        })
    }

    /// Newest-first page of a channel, optionally strictly before `before`.
    pub fn get_messages(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, channel_id, before, limit))
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort as text.
pub fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    let at = DateTime::parse_from_rfc3339(s).with_context(|| format!("Bad timestamp: {}", s))?;
    Ok(at.with_timezone(&Utc))
}

fn insert_message(
    conn: &Connection,
    id: &str,
    channel_id: &str,
    author_id: &str,
    body: &str,
    inserted_at: &str,
) -> Result<MessageRow> {
    conn.execute(
        "INSERT INTO messages (id, channel_id, author_id, body, inserted_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![id, channel_id, author_id, body, inserted_at],
    )?;
    let row = conn.query_row(
        &format!("SELECT {} WHERE m.id = ?1", MESSAGE_COLUMNS),
        [id],
        message_row,
    )?;
    Ok(row)
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, username, created_at FROM users WHERE {} = ?1",
        column
    ))?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                created_at: row.get(2)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_messages(
    conn: &Connection,
    channel_id: &str,
    before: Option<&str>,
    limit: u32,
) -> Result<Vec<MessageRow>> {
    // JOIN users to fetch author_username in a single query
    let mut stmt = conn.prepare(&format!(
        "SELECT {}
         WHERE m.channel_id = ?1 AND (?2 IS NULL OR m.inserted_at < ?2)
         ORDER BY m.inserted_at DESC, m.id DESC
         LIMIT ?3",
        MESSAGE_COLUMNS
    ))?;

    let rows = stmt
        .query_map(rusqlite::params![channel_id, before, limit], message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn channel_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelRow> {
    Ok(ChannelRow {
        id: row.get(0)?,
        slug: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        author_id: row.get(2)?,
        author_username: row.get(3)?,
        body: row.get(4)?,
        inserted_at: row.get(5)?,
    })
}

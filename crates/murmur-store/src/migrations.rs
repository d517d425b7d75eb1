use anyhow::Result;
use rusqlite::Connection;
use tracing::debug;

/// Id of the channel every fresh database starts with.
pub const GENERAL_CHANNEL_ID: &str = "00000000-0000-0000-0000-000000000001";

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT UNIQUE,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS channels (
            id          TEXT PRIMARY KEY,
            slug        TEXT NOT NULL UNIQUE,
            created_by  TEXT REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        -- inserted_at is RFC 3339 UTC with fixed microsecond precision, so
        -- text order is time order.
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            channel_id      TEXT NOT NULL REFERENCES channels(id),
            author_id       TEXT NOT NULL,
            body            TEXT NOT NULL,
            inserted_at     TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_channel
            ON messages(channel_id, inserted_at, id);

        INSERT OR IGNORE INTO channels (id, slug)
            VALUES ('00000000-0000-0000-0000-000000000001', 'general');
        ",
    )?;

    debug!("Database migrations complete");
    Ok(())
}

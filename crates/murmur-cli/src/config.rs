use anyhow::{Context, Result};
use murmur_engine::{DEFAULT_PAGE_SIZE, DEFAULT_PRESENCE_ROOM};

pub struct Config {
    pub db_path: String,
    pub channel: String,
    pub username: String,
    pub page_size: u32,
    pub presence_room: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_path = var("MURMUR_DB_PATH").unwrap_or_else(|| "murmur.db".into());
        let channel = var("MURMUR_CHANNEL").unwrap_or_else(|| "general".into());
        let username = var("MURMUR_USERNAME")
            .or_else(|| var("USER"))
            .unwrap_or_else(|| "anonymous".into());
        let page_size: u32 = var("MURMUR_PAGE_SIZE")
            .unwrap_or_else(|| DEFAULT_PAGE_SIZE.to_string())
            .parse()
            .context("MURMUR_PAGE_SIZE must be a positive integer")?;
        let presence_room =
            var("MURMUR_PRESENCE_ROOM").unwrap_or_else(|| DEFAULT_PRESENCE_ROOM.into());

        Ok(Self {
            db_path,
            channel,
            username,
            page_size,
            presence_room,
        })
    }
}

use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use murmur_engine::{
    Directory, DirectoryError, MessageStore, PLACEHOLDER_NAME, PageRequest, StoreError,
};
use murmur_hub::LocalHub;
use murmur_types::{Channel, Identity, Message, RawMessageRow};

use crate::Database;
use crate::models::{ChannelRow, MessageRow};
use crate::queries::{format_time, parse_time};

/// `MessageStore` and `Directory` over the local SQLite database.
///
/// When a hub is attached, every successful append is published to the
/// channel's subscribers, the way a hosted database feeds its change stream.
pub struct SqliteStore {
    db: Arc<Database>,
    hub: Option<LocalHub>,
    me: Option<Uuid>,
    placeholder_name: String,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            hub: None,
            me: None,
            placeholder_name: PLACEHOLDER_NAME.to_string(),
        }
    }

    pub fn with_hub(mut self, hub: LocalHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn signed_in_as(mut self, user_id: Uuid) -> Self {
        self.me = Some(user_id);
        self
    }

    async fn blocking<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow!("spawn_blocking join error: {}", e))?
    }

    /// Looks a user up by name, creating the profile on first use.
    pub async fn ensure_user(&self, username: &str) -> Result<Identity, StoreError> {
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(StoreError::Request("Username is empty".into()));
        }

        let identity = self
            .blocking(move |db| {
                if let Some(user) = db.get_user_by_username(&username)? {
                    return Ok(Identity {
                        id: parse_uuid(&user.id)?,
                        display_name: user.username,
                    });
                }
                let id = Uuid::new_v4();
                db.create_user(&id.to_string(), Some(&username))?;
                info!("Created user {} ({})", username, id);
                Ok(Identity::new(id, username))
            })
            .await?;
        Ok(identity)
    }

    /// All channels, ordered by slug.
    pub async fn channels(&self) -> Result<Vec<Channel>, StoreError> {
        let rows = self.blocking(|db| db.get_channels()).await?;
        let channels = rows
            .into_iter()
            .map(into_channel)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(channels)
    }

    pub async fn channel_by_slug(&self, slug: &str) -> Result<Option<Channel>, StoreError> {
        let slug = slug.to_string();
        let row = self.blocking(move |db| db.get_channel_by_slug(&slug)).await?;
        Ok(row.map(into_channel).transpose()?)
    }

    /// Creates a channel from a free-form name. The name is lowercased and
    /// runs of whitespace become `-`.
    pub async fn create_channel(&self, name: &str) -> Result<Channel, StoreError> {
        let Some(slug) = normalize_slug(name) else {
            return Err(StoreError::Request("Channel name is empty".into()));
        };
        if self.channel_by_slug(&slug).await?.is_some() {
            return Err(StoreError::Request(format!("Channel #{} already exists", slug)));
        }

        let id = Uuid::new_v4();
        let created_by = self.me.map(|me| me.to_string());
        let row = self
            .blocking(move |db| {
                db.create_channel(&id.to_string(), &slug, created_by.as_deref())?;
                db.get_channel(&id.to_string())?
                    .ok_or_else(|| anyhow!("Channel {} vanished after insert", id))
            })
            .await?;

        let channel = into_channel(row)?;
        info!("Created channel #{} ({})", channel.slug, channel.id);
        Ok(channel)
    }

    fn to_message(&self, row: MessageRow) -> anyhow::Result<Message> {
        Ok(Message {
            id: parse_uuid(&row.id)?,
            channel_id: parse_uuid(&row.channel_id)?,
            author_id: parse_uuid(&row.author_id)?,
            author_display_name: row
                .author_username
                .unwrap_or_else(|| self.placeholder_name.clone()),
            body: row.body,
            inserted_at: parse_time(&row.inserted_at)?,
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn fetch_page(
        &self,
        channel_id: Uuid,
        page: PageRequest,
    ) -> Result<Vec<Message>, StoreError> {
        let before = page.before.map(format_time);
        let rows = self
            .blocking(move |db| db.get_messages(&channel_id.to_string(), before.as_deref(), page.limit))
            .await?;

        debug!("Fetched {} rows from channel {}", rows.len(), channel_id);
        let messages = rows
            .into_iter()
            .map(|row| self.to_message(row))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(messages)
    }

    async fn append(
        &self,
        channel_id: Uuid,
        author_id: Uuid,
        body: &str,
    ) -> Result<Message, StoreError> {
        let body = body.to_string();
        let row = self
            .blocking(move |db| {
                let channel = channel_id.to_string();
                if db.get_channel(&channel)?.is_none() {
                    return Ok(None);
                }
                let row = db.append_message(
                    &Uuid::new_v4().to_string(),
                    &channel,
                    &author_id.to_string(),
                    &body,
                    Utc::now(),
                )?;
                Ok(Some(row))
            })
            .await?
            .ok_or(StoreError::UnknownChannel(channel_id))?;

        let message = self.to_message(row)?;
        if let Some(hub) = &self.hub {
            let delivered = hub.publish_insert(RawMessageRow::from(&message));
            debug!("Published {} to {} subscribers", message.id, delivered);
        }
        Ok(message)
    }
}

#[async_trait]
impl Directory for SqliteStore {
    async fn current_user(&self) -> Result<Option<Identity>, DirectoryError> {
        let Some(me) = self.me else {
            return Ok(None);
        };
        let user = self
            .blocking(move |db| db.get_user_by_id(&me.to_string()))
            .await?;
        Ok(Some(Identity {
            id: me,
            display_name: user.and_then(|u| u.username),
        }))
    }

    async fn display_name(&self, user_id: Uuid) -> Result<String, DirectoryError> {
        let user = self
            .blocking(move |db| db.get_user_by_id(&user_id.to_string()))
            .await?;
        user.and_then(|u| u.username)
            .ok_or(DirectoryError::NotFound(user_id))
    }
}

/// `None` when nothing but whitespace is left.
pub fn normalize_slug(name: &str) -> Option<String> {
    let slug = name
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    (!slug.is_empty()).then_some(slug)
}

fn parse_uuid(s: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Bad id: {}", s))
}

fn into_channel(row: ChannelRow) -> anyhow::Result<Channel> {
    Ok(Channel {
        id: parse_uuid(&row.id)?,
        slug: row.slug,
        created_at: parse_time(&row.created_at)?,
    })
}

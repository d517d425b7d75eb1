//! `MessageStore` and `Directory` backed by a murmur REST server.
//!
//! Routes:
//! - `GET  /channels/{id}/messages?limit=&before=` newest-first page
//! - `POST /channels/{id}/messages` append as the bearer of the token
//! - `GET  /users/{id}` profile lookup
//! - `GET  /auth/me` the token's own profile

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, warn};
use uuid::Uuid;

use murmur_engine::{
    Directory, DirectoryError, MessageStore, PLACEHOLDER_NAME, PageRequest, StoreError,
};
use murmur_types::api::{MessageResponse, SendMessageRequest, UserResponse};
use murmur_types::{Identity, Message};

pub struct HttpStore {
    client: Client,
    base_url: String,
    token: Option<String>,
    placeholder_name: String,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            placeholder_name: PLACEHOLDER_NAME.to_string(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(format!("{}{}", self.base_url, path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.post(format!("{}{}", self.base_url, path)))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }
}

/// Turns a non-success response into a `StoreError::Request` carrying the body.
async fn request_failed(what: &str, resp: Response) -> StoreError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    StoreError::Request(format!("{} failed ({}): {}", what, status, body))
}

#[async_trait]
impl MessageStore for HttpStore {
    async fn fetch_page(
        &self,
        channel_id: Uuid,
        page: PageRequest,
    ) -> Result<Vec<Message>, StoreError> {
        let mut query = vec![("limit", page.limit.to_string())];
        if let Some(before) = page.before {
            query.push(("before", before.to_rfc3339_opts(SecondsFormat::Micros, true)));
        }

        let resp = self
            .get(&format!("/channels/{}/messages", channel_id))
            .query(&query)
            .send()
            .await
            .map_err(|e| StoreError::Request(format!("Fetch request failed: {}", e)))?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(StoreError::UnknownChannel(channel_id)),
            s if !s.is_success() => return Err(request_failed("Fetch", resp).await),
            _ => {}
        }

        let rows: Vec<MessageResponse> = resp
            .json()
            .await
            .map_err(|e| StoreError::Request(format!("Bad page body: {}", e)))?;
        debug!("Fetched {} rows from channel {}", rows.len(), channel_id);

        Ok(rows
            .into_iter()
            .map(|row| row.into_message(&self.placeholder_name))
            .collect())
    }

    /// The server takes the author from the token; `author_id` is checked
    /// against what it reports back.
    async fn append(
        &self,
        channel_id: Uuid,
        author_id: Uuid,
        body: &str,
    ) -> Result<Message, StoreError> {
        let resp = self
            .post(&format!("/channels/{}/messages", channel_id))
            .json(&SendMessageRequest {
                body: body.to_string(),
            })
            .send()
            .await
            .map_err(|e| StoreError::Request(format!("Send request failed: {}", e)))?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(StoreError::UnknownChannel(channel_id)),
            s if !s.is_success() => return Err(request_failed("Send", resp).await),
            _ => {}
        }

        let row: MessageResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Request(format!("Bad message body: {}", e)))?;
        if row.author_id != author_id {
            warn!(
                "Server stored message {} as {} rather than {}",
                row.id, row.author_id, author_id
            );
        }
        Ok(row.into_message(&self.placeholder_name))
    }
}

#[async_trait]
impl Directory for HttpStore {
    async fn current_user(&self) -> Result<Option<Identity>, DirectoryError> {
        if self.token.is_none() {
            return Ok(None);
        }

        let resp = self
            .get("/auth/me")
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Profile request failed: {}", e))?;
        match resp.status() {
            StatusCode::UNAUTHORIZED => return Ok(None),
            s if !s.is_success() => {
                return Err(anyhow::anyhow!("Profile request failed ({})", s).into());
            }
            _ => {}
        }

        let user: UserResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Bad profile body: {}", e))?;
        Ok(Some(Identity::from(user)))
    }

    async fn display_name(&self, user_id: Uuid) -> Result<String, DirectoryError> {
        let resp = self
            .get(&format!("/users/{}", user_id))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("User request failed: {}", e))?;
        match resp.status() {
            StatusCode::NOT_FOUND => return Err(DirectoryError::NotFound(user_id)),
            s if !s.is_success() => {
                return Err(anyhow::anyhow!("User request failed ({})", s).into());
            }
            _ => {}
        }

        let user: UserResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Bad user body: {}", e))?;
        user.username.ok_or(DirectoryError::NotFound(user_id))
    }
}

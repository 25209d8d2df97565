use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use shared::{domain::UserId, protocol::ChatMessage};
use tracing::{debug, warn};

use crate::{error::FetchError, CredentialProvider};

/// Time range of one unread poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Read side of the message backend.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages sent by `sender_id` to `receiver_id`, in any order.
    async fn history(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<Vec<ChatMessage>, FetchError>;

    /// Every message addressed to `receiver_id` inside `window`.
    async fn messages_for_receiver(
        &self,
        receiver_id: UserId,
        window: &PollWindow,
    ) -> Result<Vec<ChatMessage>, FetchError>;
}

pub struct HttpMessageStore {
    http: Client,
    server_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpMessageStore {
    pub fn new(server_url: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            server_url,
            credentials,
        }
    }

    async fn fetch(&self, request: reqwest::RequestBuilder) -> Result<Vec<ChatMessage>, FetchError> {
        let request = match self.credentials.credential().await {
            Some(credential) => request.bearer_auth(credential.expose()),
            None => {
                debug!("chat: fetching messages without auth token");
                request
            }
        };
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let messages: Option<Vec<ChatMessage>> =
            serde_json::from_slice(&body).map_err(|err| FetchError::Decode(err.to_string()))?;
        Ok(messages.unwrap_or_default())
    }
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn history(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<Vec<ChatMessage>, FetchError> {
        let url = format!("{}/messages/{sender_id}/{receiver_id}", self.server_url);
        self.fetch(self.http.get(url)).await
    }

    async fn messages_for_receiver(
        &self,
        receiver_id: UserId,
        window: &PollWindow,
    ) -> Result<Vec<ChatMessage>, FetchError> {
        let url = format!("{}/messages/receiver/{receiver_id}", self.server_url);
        let request = self.http.get(url).query(&[
            ("startTime", window.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("endTime", window.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ]);
        self.fetch(request).await
    }
}

/// Rebuilds the canonical, time-ordered view of one conversation from the
/// two directional history legs.
pub struct HistoryReconciler {
    store: Arc<dyn MessageStore>,
}

impl HistoryReconciler {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub async fn load(
        &self,
        self_id: UserId,
        peer_id: UserId,
    ) -> Result<Vec<ChatMessage>, FetchError> {
        let (outgoing, incoming) = tokio::try_join!(
            self.store.history(self_id, peer_id),
            self.store.history(peer_id, self_id),
        )
        .map_err(|err| {
            warn!(self_id = self_id.0, peer_id = peer_id.0, error = %err, "chat: failed to load history");
            err
        })?;
        debug!(
            self_id = self_id.0,
            peer_id = peer_id.0,
            outgoing = outgoing.len(),
            incoming = incoming.len(),
            "chat: history loaded"
        );
        Ok(merge_legs(outgoing, incoming))
    }
}

/// Outgoing then incoming, stably sorted by timestamp. Equal timestamps keep
/// that order.
pub fn merge_legs(outgoing: Vec<ChatMessage>, incoming: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut merged = outgoing;
    merged.extend(incoming);
    merged.sort_by_key(|message| message.timestamp);
    merged
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;

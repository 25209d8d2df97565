use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

pub mod channel;
pub mod config;
pub mod conversation;
pub mod directory;
pub mod error;
pub mod history;
pub mod reconnect;
pub mod stomp;
pub mod subscriptions;
pub mod transport;
pub mod unread;

pub use channel::{
    ChannelEvent, ChannelSettings, ConnectOutcome, ConnectionState, MessageChannel, SendOutcome,
    SkipReason,
};
pub use config::{load_settings, ClientSettings};
pub use conversation::{ConversationView, LiveUpdate};
pub use directory::{rank_conversations, summarize, ConversationSummary};
pub use error::{AuthError, ConnectError, FetchError, PublishError, TransportError};
pub use history::{HistoryReconciler, HttpMessageStore, MessageStore, PollWindow};
pub use reconnect::{ReconnectPolicy, ReconnectSettings};
pub use subscriptions::{Subscription, SubscriptionRegistry};
pub use transport::{
    BrokerConnector, BrokerLink, TransportSession, TransportSettings, WebSocketConnector,
};
pub use unread::{PollerHandle, UnreadAggregator, UnreadEvent, UnreadSettings};

/// Bearer token presented to the broker and the history API.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Source of the current auth token. Consulted before every connection
/// attempt, so a refreshed token is picked up by the next reconnect.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self) -> Option<Credential>;
}

pub struct StaticCredential(Option<Credential>);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(Credential::new(token)))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn credential(&self) -> Option<Credential> {
        self.0.clone()
    }
}

/// Fire-and-forget local notification sink. Failures stay inside the
/// implementation.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!(title, body, "notification");
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

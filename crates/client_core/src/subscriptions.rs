use std::collections::HashMap;

use shared::{domain::UserId, protocol::ChatMessage};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{error::PublishError, transport::TransportSession};

/// Broker destination carrying messages addressed to `user_id`.
pub fn inbox_destination(user_id: UserId) -> String {
    format!("/user/{user_id}/topic/messages")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub user_id: UserId,
    pub destination: String,
    pub wire_id: String,
}

struct Entry {
    destination: String,
    sink: mpsc::Sender<ChatMessage>,
    /// `None` while the transport is down.
    wire_id: Option<String>,
}

/// At most one inbound subscription per local identity.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<UserId, Entry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_subscribed(&self, user_id: UserId) -> bool {
        self.entries
            .get(&user_id)
            .is_some_and(|entry| entry.wire_id.is_some())
    }

    pub async fn subscribe(
        &mut self,
        user_id: UserId,
        sink: mpsc::Sender<ChatMessage>,
        session: &TransportSession,
    ) -> Result<Subscription, PublishError> {
        if let Some(entry) = self.entries.get(&user_id) {
            if let Some(wire_id) = &entry.wire_id {
                info!(
                    user_id = user_id.0,
                    subscription = %wire_id,
                    "chat: already subscribed to private messages"
                );
                return Ok(Subscription {
                    user_id,
                    destination: entry.destination.clone(),
                    wire_id: wire_id.clone(),
                });
            }
        }

        let destination = inbox_destination(user_id);
        let wire_id = session.subscribe(&destination, sink.clone()).await?;
        info!(user_id = user_id.0, destination = %destination, "chat: subscribed to private messages");
        self.entries.insert(
            user_id,
            Entry {
                destination: destination.clone(),
                sink,
                wire_id: Some(wire_id.clone()),
            },
        );
        Ok(Subscription {
            user_id,
            destination,
            wire_id,
        })
    }

    /// Marks every entry inactive after the transport dropped. Identities and
    /// sinks are kept for [`Self::restore`].
    pub fn detach(&mut self) {
        for entry in self.entries.values_mut() {
            entry.wire_id = None;
        }
    }

    /// Re-issues every inactive subscription on a fresh session.
    pub async fn restore(&mut self, session: &TransportSession) -> Result<usize, PublishError> {
        let mut restored = 0;
        for (user_id, entry) in self.entries.iter_mut() {
            if entry.wire_id.is_some() {
                continue;
            }
            let wire_id = session
                .subscribe(&entry.destination, entry.sink.clone())
                .await?;
            debug!(user_id = user_id.0, subscription = %wire_id, "chat: subscription restored");
            entry.wire_id = Some(wire_id);
            restored += 1;
        }
        Ok(restored)
    }

    pub fn unsubscribe_all(&mut self) {
        if !self.entries.is_empty() {
            debug!(count = self.entries.len(), "chat: releasing subscriptions");
        }
        self.entries.clear();
    }
}

#[cfg(test)]
#[path = "tests/subscriptions_tests.rs"]
mod tests;

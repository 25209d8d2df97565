use std::sync::Arc;

use shared::{domain::UserId, protocol::ChatMessage};
use tracing::debug;

use crate::Notifier;

pub const INCOMING_TITLE: &str = "New Message from Your Counselor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveUpdate {
    Incoming { unread: usize },
    Outgoing,
    /// Not part of this conversation.
    Ignored,
}

/// Client-side state of one open conversation: the reconciled history plus
/// whatever arrived live since it was loaded.
pub struct ConversationView {
    self_id: UserId,
    peer_id: UserId,
    notifier: Arc<dyn Notifier>,
    incoming_title: String,
    messages: Vec<ChatMessage>,
    unread: usize,
}

impl ConversationView {
    pub fn new(self_id: UserId, peer_id: UserId, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            self_id,
            peer_id,
            notifier,
            incoming_title: INCOMING_TITLE.to_string(),
            messages: Vec::new(),
            unread: 0,
        }
    }

    pub fn with_incoming_title(mut self, title: impl Into<String>) -> Self {
        self.incoming_title = title.into();
        self
    }

    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    pub fn peer_id(&self) -> UserId {
        self.peer_id
    }

    /// Replaces the transcript with a freshly reconciled history.
    pub fn replace_history(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
    }

    /// Appends a live message in arrival order.
    pub fn push_live(&mut self, message: ChatMessage) -> LiveUpdate {
        if !message.is_between(self.self_id, self.peer_id) {
            debug!(
                message_id = message.id.0,
                sender_id = message.sender_id.0,
                "chat: message for another conversation ignored"
            );
            return LiveUpdate::Ignored;
        }

        let update = if message.receiver_id == self.self_id {
            self.unread += 1;
            self.notifier.notify(&self.incoming_title, &message.content);
            LiveUpdate::Incoming {
                unread: self.unread,
            }
        } else {
            self.unread = 0;
            LiveUpdate::Outgoing
        };
        self.messages.push(message);
        update
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn mark_read(&mut self) {
        self.unread = 0;
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;

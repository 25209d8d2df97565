use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationToken, MessageId, UserId},
    error::ContentError,
};

/// Upper bound on message content, in characters.
pub const MAX_CONTENT_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// True when the message travels between `a` and `b`, in either direction.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(rename = "chatToken")]
    pub conversation_token: ConversationToken,
    pub content: String,
}

impl OutboundMessage {
    /// Builds a publishable payload, trimming `text` and enforcing the
    /// content bounds.
    pub fn new(
        text: &str,
        receiver_id: UserId,
        sender_id: UserId,
        conversation_token: ConversationToken,
    ) -> Result<Self, ContentError> {
        let content = text.trim();
        if content.is_empty() {
            return Err(ContentError::Empty);
        }
        let actual = content.chars().count();
        if actual > MAX_CONTENT_LEN {
            return Err(ContentError::TooLong {
                limit: MAX_CONTENT_LEN,
                actual,
            });
        }
        Ok(Self {
            sender_id,
            receiver_id,
            conversation_token,
            content: content.to_string(),
        })
    }
}

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use shared::domain::Peer;

use crate::unread::UnreadAggregator;

/// One row of a counselor's conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub peer: Peer,
    pub latest_message_at: Option<DateTime<Utc>>,
    pub unread: usize,
}

pub fn summarize(peers: Vec<Peer>, aggregator: &UnreadAggregator) -> Vec<ConversationSummary> {
    let latest = aggregator.latest_by_sender();
    let unread = aggregator.unread_by_sender();
    peers
        .into_iter()
        .map(|peer| ConversationSummary {
            latest_message_at: latest.get(&peer.user_id).copied(),
            unread: unread.get(&peer.user_id).copied().unwrap_or(0),
            peer,
        })
        .collect()
}

/// Peers with messages first, newest first. The rest follow by last name,
/// then first name, ignoring case.
pub fn rank_conversations(mut summaries: Vec<ConversationSummary>) -> Vec<ConversationSummary> {
    summaries.sort_by(compare);
    summaries
}

fn compare(a: &ConversationSummary, b: &ConversationSummary) -> Ordering {
    match (a.latest_message_at, b.latest_message_at) {
        (Some(a_at), Some(b_at)) => b_at.cmp(&a_at),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => name_key(&a.peer).cmp(&name_key(&b.peer)),
    }
}

fn name_key(peer: &Peer) -> (String, String) {
    (peer.last_name.to_lowercase(), peer.first_name.to_lowercase())
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::ChatMessage,
};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::{
    error::FetchError,
    history::{MessageStore, PollWindow},
    Clock, Notifier,
};

pub const NOTIFICATION_TITLE: &str = "New Message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadSettings {
    pub poll_interval: Duration,
    /// How far back the first poll after activation looks.
    pub lookback: Duration,
    /// Added to `now` for the end of every window to absorb clock skew.
    pub forward_horizon: Duration,
}

impl Default for UnreadSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            lookback: Duration::from_secs(10 * 60 * 60),
            forward_horizon: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnreadEvent {
    NewMessages {
        messages: Vec<ChatMessage>,
        unread: usize,
    },
}

#[derive(Default)]
struct Tracker {
    /// Seen ids with their timestamps, pruned once they fall behind the
    /// window start by more than the forward horizon.
    seen: HashMap<MessageId, DateTime<Utc>>,
    /// Start of the previous successful poll.
    cursor: Option<DateTime<Utc>>,
    unread: Vec<ChatMessage>,
    latest: HashMap<UserId, DateTime<Utc>>,
}

/// Polls the receiver-wide message feed for one counselor and keeps the
/// unread set across every conversation.
pub struct UnreadAggregator {
    receiver_id: UserId,
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: UnreadSettings,
    tracker: StdMutex<Tracker>,
    events: broadcast::Sender<UnreadEvent>,
}

impl UnreadAggregator {
    pub fn new(
        receiver_id: UserId,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: UnreadSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            receiver_id,
            store,
            notifier,
            clock,
            settings,
            tracker: StdMutex::new(Tracker::default()),
            events,
        })
    }

    pub fn receiver_id(&self) -> UserId {
        self.receiver_id
    }

    /// Fetches the next window and returns the messages not seen before.
    pub async fn poll(&self) -> Result<Vec<ChatMessage>, FetchError> {
        let now = self.clock.now();
        let cursor = self.tracker().cursor;
        let Some(window) = self.window(now, cursor) else {
            warn!(
                receiver_id = self.receiver_id.0,
                lookback_secs = self.settings.lookback.as_secs(),
                forward_horizon_secs = self.settings.forward_horizon.as_secs(),
                "unread: poll window out of range"
            );
            return Err(FetchError::InvalidWindow);
        };

        let batch = match self
            .store
            .messages_for_receiver(self.receiver_id, &window)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                warn!(receiver_id = self.receiver_id.0, error = %err, "unread: poll failed");
                return Err(err);
            }
        };

        let fetched = batch.len();
        let (fresh, unread) = {
            let mut tracker = self.tracker();
            tracker.cursor = Some(now);
            let mut fresh = Vec::new();
            for message in batch {
                if tracker.seen.contains_key(&message.id) {
                    continue;
                }
                tracker.seen.insert(message.id, message.timestamp);
                let latest = tracker
                    .latest
                    .entry(message.sender_id)
                    .or_insert(message.timestamp);
                if message.timestamp > *latest {
                    *latest = message.timestamp;
                }
                tracker.unread.push(message.clone());
                fresh.push(message);
            }
            if let Some(oldest) = self.prune_before(now) {
                tracker.seen.retain(|_, timestamp| *timestamp >= oldest);
            }
            (fresh, tracker.unread.len())
        };

        debug!(fetched, fresh = fresh.len(), unread, "unread: poll complete");
        if !fresh.is_empty() {
            info!(fresh = fresh.len(), unread, "unread: new messages");
            self.notifier
                .notify(NOTIFICATION_TITLE, &notification_body(fresh.len()));
            let _ = self.events.send(UnreadEvent::NewMessages {
                messages: fresh.clone(),
                unread,
            });
        }
        Ok(fresh)
    }

    /// Polls now and then every `poll_interval` until the handle is stopped
    /// or dropped.
    pub fn spawn(self: &Arc<Self>) -> PollerHandle {
        let aggregator = Arc::clone(self);
        let period = if self.settings.poll_interval.is_zero() {
            let fallback = UnreadSettings::default().poll_interval;
            warn!(
                fallback_secs = fallback.as_secs(),
                "unread: zero poll interval, using default"
            );
            fallback
        } else {
            self.settings.poll_interval
        };
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Failures are already logged; the next tick re-covers the window.
                let _ = aggregator.poll().await;
            }
        });
        info!(
            receiver_id = self.receiver_id.0,
            interval_secs = period.as_secs(),
            "unread: poller started"
        );
        PollerHandle { task }
    }

    pub fn unread_count(&self) -> usize {
        self.tracker().unread.len()
    }

    /// Unread messages in the order they were first seen.
    pub fn unread_messages(&self) -> Vec<ChatMessage> {
        self.tracker().unread.clone()
    }

    pub fn unread_by_sender(&self) -> HashMap<UserId, usize> {
        let mut counts = HashMap::new();
        for message in &self.tracker().unread {
            *counts.entry(message.sender_id).or_insert(0) += 1;
        }
        counts
    }

    /// Newest timestamp seen from each sender, read or not.
    pub fn latest_by_sender(&self) -> HashMap<UserId, DateTime<Utc>> {
        self.tracker().latest.clone()
    }

    /// Clears `sender_id`'s unread messages. Their ids stay seen.
    pub fn mark_conversation_read(&self, sender_id: UserId) -> usize {
        let mut tracker = self.tracker();
        let before = tracker.unread.len();
        tracker.unread.retain(|message| message.sender_id != sender_id);
        let cleared = before - tracker.unread.len();
        if cleared > 0 {
            debug!(sender_id = sender_id.0, cleared, "unread: conversation marked read");
        }
        cleared
    }

    /// Forgets everything, the next poll looks back the full horizon again.
    pub fn reset(&self) {
        *self.tracker() = Tracker::default();
        info!(receiver_id = self.receiver_id.0, "unread: tracker reset");
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UnreadEvent> {
        self.events.subscribe()
    }

    pub fn stream(&self) -> BroadcastStream<UnreadEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    fn window(&self, now: DateTime<Utc>, cursor: Option<DateTime<Utc>>) -> Option<PollWindow> {
        let start = match cursor {
            Some(cursor) => cursor,
            None => now.checked_sub_signed(chrono::Duration::from_std(self.settings.lookback).ok()?)?,
        };
        let end = now.checked_add_signed(chrono::Duration::from_std(self.settings.forward_horizon).ok()?)?;
        Some(PollWindow { start, end })
    }

    /// Ids older than this can no longer appear in a window starting at `now`.
    fn prune_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(chrono::Duration::from_std(self.settings.forward_horizon).ok()?)
    }

    #[cfg(test)]
    fn seen_len(&self) -> usize {
        self.tracker().seen.len()
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn notification_body(count: usize) -> String {
    if count == 1 {
        "You have a new message!".to_string()
    } else {
        format!("You have {count} new messages!")
    }
}

/// Running poll loop. Dropping it stops the loop.
pub struct PollerHandle {
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;

use tokio_stream::StreamExt;

use super::*;
use crate::test_support::{at, message, FakeStore, ManualClock, RecordingNotifier};

const START: i64 = 36_000;

struct Harness {
    store: Arc<FakeStore>,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<ManualClock>,
    aggregator: Arc<UnreadAggregator>,
}

fn harness() -> Harness {
    harness_with(UnreadSettings::default())
}

fn harness_with(settings: UnreadSettings) -> Harness {
    let store = FakeStore::new();
    let notifier = RecordingNotifier::new();
    let clock = ManualClock::new(at(START));
    let aggregator = UnreadAggregator::new(
        UserId(1),
        store.clone(),
        notifier.clone(),
        clock.clone(),
        settings,
    );
    Harness {
        store,
        notifier,
        clock,
        aggregator,
    }
}

/// A message to the counselor `offset` seconds after the harness start.
fn recent(id: i64, sender: i64, offset: i64) -> ChatMessage {
    message(id, sender, 1, START + offset)
}

fn ids(messages: &[ChatMessage]) -> Vec<i64> {
    messages.iter().map(|message| message.id.0).collect()
}

#[tokio::test]
async fn overlapping_polls_never_double_count() {
    let h = harness();
    h.store.queue_poll(Ok(vec![
        recent(1, 3, 0),
        recent(2, 3, 1),
        recent(3, 4, 2),
    ]));
    h.store.queue_poll(Ok(vec![
        recent(2, 3, 1),
        recent(3, 4, 2),
        recent(4, 4, 3),
        recent(5, 5, 4),
    ]));

    let first = h.aggregator.poll().await.expect("first poll");
    let second = h.aggregator.poll().await.expect("second poll");

    assert_eq!(ids(&first), vec![1, 2, 3]);
    assert_eq!(ids(&second), vec![4, 5]);
    assert_eq!(h.aggregator.unread_count(), 5);
}

#[tokio::test]
async fn duplicates_inside_one_batch_count_once() {
    let h = harness();
    h.store.queue_poll(Ok(vec![
        recent(1, 3, 0),
        recent(1, 3, 0),
        recent(2, 3, 1),
    ]));

    let fresh = h.aggregator.poll().await.expect("poll");

    assert_eq!(ids(&fresh), vec![1, 2]);
    assert_eq!(h.aggregator.unread_count(), 2);
}

#[tokio::test]
async fn first_poll_looks_back_and_later_polls_start_at_previous_poll() {
    let h = harness();

    h.aggregator.poll().await.expect("first poll");
    h.clock.advance(chrono::Duration::seconds(15));
    h.aggregator.poll().await.expect("second poll");

    let windows = h.store.windows();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].0, UserId(1));
    assert_eq!(
        windows[0].1,
        PollWindow {
            start: at(0),
            end: at(START + 3600),
        }
    );
    assert_eq!(
        windows[1].1,
        PollWindow {
            start: at(START),
            end: at(START + 15 + 3600),
        }
    );
}

#[tokio::test]
async fn failed_poll_keeps_the_cursor() {
    let h = harness();
    h.store.queue_poll(Ok(Vec::new()));
    h.store.queue_poll(Err(500));
    h.store.queue_poll(Ok(vec![recent(7, 3, 20)]));

    h.aggregator.poll().await.expect("first poll");
    h.clock.advance(chrono::Duration::seconds(15));
    let failed = h.aggregator.poll().await;
    h.clock.advance(chrono::Duration::seconds(15));
    let recovered = h.aggregator.poll().await.expect("third poll");

    assert!(matches!(failed, Err(FetchError::Status(500))));
    assert_eq!(ids(&recovered), vec![7]);
    let windows = h.store.windows();
    assert_eq!(windows[1].1.start, at(START));
    assert_eq!(windows[2].1.start, at(START));
    assert_eq!(windows[2].1.end, at(START + 30 + 3600));
}

#[tokio::test]
async fn one_notification_per_growing_poll() {
    let h = harness();
    h.store.queue_poll(Ok(vec![
        recent(1, 3, 0),
        recent(2, 3, 1),
        recent(3, 4, 2),
    ]));
    h.store.queue_poll(Ok(vec![recent(3, 4, 2)]));
    h.store.queue_poll(Ok(vec![recent(4, 4, 3)]));

    for _ in 0..3 {
        h.aggregator.poll().await.expect("poll");
    }

    assert_eq!(
        h.notifier.notifications(),
        vec![
            ("New Message".to_string(), "You have 3 new messages!".to_string()),
            ("New Message".to_string(), "You have a new message!".to_string()),
        ]
    );
}

#[tokio::test]
async fn new_messages_are_broadcast_with_running_total() {
    let h = harness();
    let mut events = h.aggregator.subscribe_events();
    let mut stream = h.aggregator.stream();
    h.store.queue_poll(Ok(vec![recent(1, 3, 0)]));
    h.store.queue_poll(Ok(vec![recent(2, 4, 1)]));

    h.aggregator.poll().await.expect("poll");
    h.aggregator.poll().await.expect("poll");

    assert_eq!(
        events.recv().await.expect("event"),
        UnreadEvent::NewMessages {
            messages: vec![recent(1, 3, 0)],
            unread: 1,
        }
    );
    assert_eq!(
        events.recv().await.expect("event"),
        UnreadEvent::NewMessages {
            messages: vec![recent(2, 4, 1)],
            unread: 2,
        }
    );
    let streamed = stream.next().await.expect("stream item").expect("not lagged");
    assert!(matches!(streamed, UnreadEvent::NewMessages { unread: 1, .. }));
}

#[tokio::test]
async fn marking_a_conversation_read_keeps_ids_seen() {
    let h = harness();
    let batch = vec![
        recent(1, 3, 0),
        recent(2, 3, 5),
        recent(3, 4, 2),
    ];
    h.store.queue_poll(Ok(batch.clone()));
    h.store.queue_poll(Ok(batch));

    h.aggregator.poll().await.expect("poll");
    assert_eq!(h.aggregator.unread_by_sender().get(&UserId(3)), Some(&2));

    assert_eq!(h.aggregator.mark_conversation_read(UserId(3)), 2);
    assert_eq!(h.aggregator.unread_count(), 1);
    assert_eq!(ids(&h.aggregator.unread_messages()), vec![3]);

    let fresh = h.aggregator.poll().await.expect("poll again");
    assert!(fresh.is_empty());
    assert_eq!(h.aggregator.unread_count(), 1);
    assert_eq!(h.aggregator.latest_by_sender().get(&UserId(3)), Some(&at(START + 5)));
}

#[tokio::test]
async fn reset_forgets_seen_messages_and_cursor() {
    let h = harness();
    h.store.queue_poll(Ok(vec![recent(1, 3, 0)]));
    h.store.queue_poll(Ok(vec![recent(1, 3, 0)]));

    h.aggregator.poll().await.expect("poll");
    h.aggregator.reset();
    assert_eq!(h.aggregator.unread_count(), 0);
    h.clock.advance(chrono::Duration::seconds(60));
    let fresh = h.aggregator.poll().await.expect("poll after reset");

    assert_eq!(ids(&fresh), vec![1]);
    assert_eq!(h.store.windows()[1].1.start, at(START + 60 - 36_000));
}

#[tokio::test(start_paused = true)]
async fn poller_ticks_until_stopped_and_survives_failures() {
    let h = harness();
    h.store.queue_poll(Err(503));
    h.store.queue_poll(Ok(vec![recent(1, 3, 0)]));

    let handle = h.aggregator.spawn();
    assert!(handle.is_running());
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(h.store.windows().len(), 3);
    assert_eq!(h.aggregator.unread_count(), 1);

    handle.stop();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.store.windows().len(), 3);
}

#[tokio::test]
async fn ids_behind_the_window_are_forgotten() {
    let h = harness();
    h.store.queue_poll(Ok(vec![message(1, 3, 1, 0), recent(2, 3, 0)]));

    let fresh = h.aggregator.poll().await.expect("poll");

    assert_eq!(ids(&fresh), vec![1, 2]);
    assert_eq!(h.aggregator.unread_count(), 2);
    assert_eq!(h.aggregator.seen_len(), 1);
}

#[tokio::test]
async fn window_outside_the_calendar_is_an_error() {
    let h = harness_with(UnreadSettings {
        lookback: Duration::from_secs(u64::MAX),
        ..UnreadSettings::default()
    });

    let result = h.aggregator.poll().await;

    assert!(matches!(result, Err(FetchError::InvalidWindow)));
    assert!(h.store.windows().is_empty());
}

#[tokio::test(start_paused = true)]
async fn zero_poll_interval_uses_the_default_period() {
    let h = harness_with(UnreadSettings {
        poll_interval: Duration::ZERO,
        ..UnreadSettings::default()
    });

    let handle = h.aggregator.spawn();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(handle.is_running());
    assert_eq!(h.store.windows().len(), 1);

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(h.store.windows().len(), 2);
}

#[tokio::test]
async fn polls_are_addressed_to_the_aggregator_receiver() {
    let h = harness();
    h.store.queue_poll(Ok(Vec::new()));

    h.aggregator.poll().await.expect("poll");

    assert_eq!(h.aggregator.receiver_id(), UserId(1));
    let windows = h.store.windows();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].0, h.aggregator.receiver_id());
}

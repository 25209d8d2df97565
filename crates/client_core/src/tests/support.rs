use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::ChatMessage,
};
use tokio::sync::mpsc;

use crate::{
    error::{FetchError, TransportError},
    history::{MessageStore, PollWindow},
    stomp::{Command, Frame},
    transport::{BrokerConnector, BrokerLink, LinkEvent, OpenedLink},
    Clock, Notifier,
};

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

pub fn message(id: i64, sender: i64, receiver: i64, seconds: i64) -> ChatMessage {
    ChatMessage {
        id: MessageId(id),
        sender_id: UserId(sender),
        receiver_id: UserId(receiver),
        content: format!("message {id}"),
        timestamp: at(seconds),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBehavior {
    Accept,
    RejectCredential,
    Unreachable,
    /// Opens the link but never answers CONNECT.
    Silent,
}

/// In-memory broker. Every `open` consumes the next planned behavior and
/// falls back to `Accept`.
#[derive(Default)]
pub struct FakeBroker {
    plan: StdMutex<VecDeque<OpenBehavior>>,
    sent: Arc<StdMutex<Vec<(usize, Frame)>>>,
    links: StdMutex<Vec<mpsc::Sender<LinkEvent>>>,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn plan(&self, behaviors: impl IntoIterator<Item = OpenBehavior>) {
        self.plan.lock().expect("plan").extend(behaviors);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Links closed by the client, each counted once.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn links(&self) -> usize {
        self.links.lock().expect("links").len()
    }

    pub fn frames(&self, command: Command) -> Vec<Frame> {
        self.sent
            .lock()
            .expect("sent")
            .iter()
            .filter(|(_, frame)| frame.command == command)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn frames_on(&self, link: usize, command: Command) -> Vec<Frame> {
        self.sent
            .lock()
            .expect("sent")
            .iter()
            .filter(|(index, frame)| *index == link && frame.command == command)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub async fn drop_link(&self, index: usize) {
        let link = self.links.lock().expect("links")[index].clone();
        link.send(LinkEvent::Closed(Some("server restart".to_string())))
            .await
            .expect("link reader alive");
    }

    pub async fn deliver(&self, index: usize, subscription: &str, message: &ChatMessage) {
        let link = self.links.lock().expect("links")[index].clone();
        let frame = Frame::new(Command::Message)
            .header("subscription", subscription)
            .header("content-type", "application/json")
            .with_body(serde_json::to_string(message).expect("encode"));
        link.send(LinkEvent::Frame(frame))
            .await
            .expect("link reader alive");
    }
}

struct FakeLink {
    index: usize,
    behavior: OpenBehavior,
    events: mpsc::Sender<LinkEvent>,
    sent: Arc<StdMutex<Vec<(usize, Frame)>>>,
    closed: AtomicBool,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl BrokerLink for FakeLink {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let command = frame.command;
        self.sent.lock().expect("sent").push((self.index, frame));
        if command == Command::Connect {
            let reply = match self.behavior {
                OpenBehavior::Accept => Frame::new(Command::Connected).header("version", "1.2"),
                OpenBehavior::RejectCredential => {
                    Frame::new(Command::Error).header("message", "Invalid token")
                }
                OpenBehavior::Unreachable | OpenBehavior::Silent => return Ok(()),
            };
            let _ = self.events.send(LinkEvent::Frame(reply)).await;
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BrokerConnector for FakeBroker {
    async fn open(&self) -> Result<OpenedLink, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .plan
            .lock()
            .expect("plan")
            .pop_front()
            .unwrap_or(OpenBehavior::Accept);
        if behavior == OpenBehavior::Unreachable {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        let (events, inbound) = mpsc::channel(16);
        let index = {
            let mut links = self.links.lock().expect("links");
            links.push(events.clone());
            links.len() - 1
        };
        Ok(OpenedLink {
            link: Arc::new(FakeLink {
                index,
                behavior,
                events,
                sent: Arc::clone(&self.sent),
                closed: AtomicBool::new(false),
                closes: Arc::clone(&self.closes),
            }),
            inbound,
        })
    }

    fn host(&self) -> String {
        "broker.test".to_string()
    }
}

/// Scripted history/poll backend.
#[derive(Default)]
pub struct FakeStore {
    history: StdMutex<HashMap<(UserId, UserId), Vec<ChatMessage>>>,
    failing_history: StdMutex<Vec<(UserId, UserId)>>,
    polls: StdMutex<VecDeque<Result<Vec<ChatMessage>, u16>>>,
    pub windows: StdMutex<Vec<(UserId, PollWindow)>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_history(&self, sender: i64, receiver: i64, messages: Vec<ChatMessage>) {
        self.history
            .lock()
            .expect("history")
            .insert((UserId(sender), UserId(receiver)), messages);
    }

    pub fn fail_history(&self, sender: i64, receiver: i64) {
        self.failing_history
            .lock()
            .expect("failing")
            .push((UserId(sender), UserId(receiver)));
    }

    pub fn queue_poll(&self, result: Result<Vec<ChatMessage>, u16>) {
        self.polls.lock().expect("polls").push_back(result);
    }

    pub fn windows(&self) -> Vec<(UserId, PollWindow)> {
        self.windows.lock().expect("windows").clone()
    }
}

#[async_trait]
impl MessageStore for FakeStore {
    async fn history(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<Vec<ChatMessage>, FetchError> {
        if self
            .failing_history
            .lock()
            .expect("failing")
            .contains(&(sender_id, receiver_id))
        {
            return Err(FetchError::Status(503));
        }
        Ok(self
            .history
            .lock()
            .expect("history")
            .get(&(sender_id, receiver_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn messages_for_receiver(
        &self,
        receiver_id: UserId,
        window: &PollWindow,
    ) -> Result<Vec<ChatMessage>, FetchError> {
        self.windows
            .lock()
            .expect("windows")
            .push((receiver_id, *window));
        match self.polls.lock().expect("polls").pop_front() {
            Some(Ok(messages)) => Ok(messages),
            Some(Err(status)) => Err(FetchError::Status(status)),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: StdMutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notifications(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("sent").clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, body: &str) {
        self.sent
            .lock()
            .expect("sent")
            .push((title.to_string(), body.to_string()));
    }
}

pub struct ManualClock(StdMutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self(StdMutex::new(start)))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock().expect("clock");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().expect("clock")
    }
}

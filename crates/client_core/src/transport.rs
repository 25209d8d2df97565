use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::protocol::ChatMessage;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{AuthError, ConnectError, PublishError, TransportError},
    stomp::{self, Command, Frame},
    Credential,
};

const LINK_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(Frame),
    Closed(Option<String>),
    Failed(String),
}

/// Write half of a physical broker link.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;
    async fn close(&self);
}

pub struct OpenedLink {
    pub link: Arc<dyn BrokerLink>,
    pub inbound: mpsc::Receiver<LinkEvent>,
}

/// Opens physical links to the broker. One call per connection attempt.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(&self) -> Result<OpenedLink, TransportError>;
    fn host(&self) -> String;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

struct WebSocketLink {
    writer: Mutex<SplitSink<WsStream, WsMessage>>,
}

#[async_trait]
impl BrokerLink for WebSocketLink {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.writer
            .lock()
            .await
            .send(WsMessage::Text(stomp::encode(&frame)))
            .await
            .map_err(|err| TransportError::Write(err.to_string()))
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.send(WsMessage::Close(None)).await {
            debug!(error = %err, "transport: websocket close frame not sent");
        }
        let _ = writer.close().await;
    }
}

#[async_trait]
impl BrokerConnector for WebSocketConnector {
    async fn open(&self) -> Result<OpenedLink, TransportError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Connect(format!("{}: {err}", self.url)))?;
        let (writer, mut reader) = ws_stream.split();
        let (events, inbound) = mpsc::channel(LINK_EVENT_BUFFER);

        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                let event = match message {
                    Ok(WsMessage::Text(text)) => match stomp::decode(&text) {
                        Ok(Some(frame)) => LinkEvent::Frame(frame),
                        Ok(None) => continue,
                        Err(err) => LinkEvent::Failed(format!("invalid frame: {err}")),
                    },
                    Ok(WsMessage::Close(close)) => {
                        let _ = events
                            .send(LinkEvent::Closed(close.map(|frame| frame.reason.to_string())))
                            .await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = events.send(LinkEvent::Failed(err.to_string())).await;
                        return;
                    }
                };
                let failed = matches!(event, LinkEvent::Failed(_));
                if events.send(event).await.is_err() || failed {
                    return;
                }
            }
            let _ = events.send(LinkEvent::Closed(None)).await;
        });

        Ok(OpenedLink {
            link: Arc::new(WebSocketLink {
                writer: Mutex::new(writer),
            }),
            inbound,
        })
    }

    fn host(&self) -> String {
        self.url.host_str().unwrap_or("localhost").to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Closed(Option<String>),
    Errored(String),
    /// The session was torn down locally.
    Released,
}

/// Resolves once, when the connection it was issued for ends.
pub struct TerminationSignal(oneshot::Receiver<Termination>);

impl TerminationSignal {
    pub async fn wait(self) -> Termination {
        self.0.await.unwrap_or(Termination::Released)
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

type Routes = Arc<RwLock<HashMap<String, mpsc::Sender<ChatMessage>>>>;

struct ActiveLink {
    attempt: u64,
    link: Arc<dyn BrokerLink>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// Owns at most one physical broker connection.
pub struct TransportSession {
    connector: Arc<dyn BrokerConnector>,
    settings: TransportSettings,
    active: StdMutex<Option<ActiveLink>>,
    routes: Routes,
    attempts: AtomicU64,
    next_subscription: AtomicU64,
}

impl TransportSession {
    pub fn new(connector: Arc<dyn BrokerConnector>, settings: TransportSettings) -> Self {
        Self {
            connector,
            settings,
            active: StdMutex::new(None),
            routes: Arc::new(RwLock::new(HashMap::new())),
            attempts: AtomicU64::new(0),
            next_subscription: AtomicU64::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|active| active.connected.load(Ordering::SeqCst))
    }

    pub async fn connect(&self, credential: &Credential) -> Result<TerminationSignal, ConnectError> {
        if self.current_link().is_some() {
            self.disconnect().await;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let OpenedLink { link, mut inbound } = self.connector.open().await?;
        let pending = PendingLink::new(link);
        let sent = pending
            .link
            .send(Frame::connect(&self.connector.host(), credential.expose()))
            .await;
        if let Err(err) = sent {
            pending.close().await;
            return Err(err.into());
        }

        let handshake = tokio::time::timeout(self.settings.connect_timeout, async {
            loop {
                match inbound.recv().await {
                    Some(LinkEvent::Frame(frame)) => match frame.command {
                        Command::Connected => return Ok(frame),
                        Command::Error => {
                            let reason = frame
                                .get("message")
                                .map(str::to_string)
                                .unwrap_or_else(|| frame.body.clone());
                            return Err(ConnectError::Auth(AuthError::Rejected(reason)));
                        }
                        other => {
                            debug!(command = other.as_str(), "transport: frame before CONNECTED ignored");
                        }
                    },
                    Some(LinkEvent::Failed(reason)) => {
                        return Err(ConnectError::Transport(TransportError::Connect(reason)));
                    }
                    Some(LinkEvent::Closed(_)) | None => {
                        return Err(ConnectError::Transport(TransportError::Closed));
                    }
                }
            }
        })
        .await;

        let connected_frame = match handshake {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                pending.close().await;
                return Err(err);
            }
            Err(_) => {
                pending.close().await;
                return Err(TransportError::Timeout(self.settings.connect_timeout).into());
            }
        };
        let link = pending.disarm();

        info!(
            attempt,
            version = connected_frame.get("version").unwrap_or("1.2"),
            "transport: broker session established"
        );

        let connected = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = oneshot::channel();
        let reader = tokio::spawn(read_link(
            attempt,
            inbound,
            Arc::clone(&self.routes),
            Arc::clone(&connected),
            done_tx,
        ));

        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(ActiveLink {
                attempt,
                link,
                connected,
                reader,
            });
        if let Some(previous) = previous {
            // A concurrent connect raced us; keep only the newest link.
            previous.reader.abort();
            previous.link.close().await;
        }

        Ok(TerminationSignal(done_rx))
    }

    pub async fn publish(&self, destination: &str, payload: String) -> Result<(), PublishError> {
        let link = self.live_link().ok_or(PublishError::NotConnected)?;
        link.send(Frame::send(destination, payload)).await?;
        Ok(())
    }

    /// Subscribes `destination` and routes its messages into `sink`.
    /// Returns the wire subscription id.
    pub async fn subscribe(
        &self,
        destination: &str,
        sink: mpsc::Sender<ChatMessage>,
    ) -> Result<String, PublishError> {
        let link = self.live_link().ok_or(PublishError::NotConnected)?;
        let id = format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::SeqCst)
        );
        self.routes.write().await.insert(id.clone(), sink);
        if let Err(err) = link.send(Frame::subscribe(&id, destination)).await {
            self.routes.write().await.remove(&id);
            return Err(err.into());
        }
        debug!(subscription = %id, destination, "transport: subscribed");
        Ok(id)
    }

    pub async fn unsubscribe(&self, id: &str) -> Result<(), PublishError> {
        self.routes.write().await.remove(id);
        let link = self.live_link().ok_or(PublishError::NotConnected)?;
        link.send(Frame::unsubscribe(id)).await?;
        Ok(())
    }

    /// Idempotent. Releases every wire subscription.
    pub async fn disconnect(&self) {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.routes.write().await.clear();

        let Some(active) = active else {
            return;
        };
        active.reader.abort();
        if active.connected.swap(false, Ordering::SeqCst) {
            if let Err(err) = active.link.send(Frame::disconnect()).await {
                debug!(error = %err, "transport: DISCONNECT not delivered");
            }
        }
        active.link.close().await;
        info!(attempt = active.attempt, "transport: session released");
    }

    fn current_link(&self) -> Option<Arc<dyn BrokerLink>> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|active| Arc::clone(&active.link))
    }

    fn live_link(&self) -> Option<Arc<dyn BrokerLink>> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|active| active.connected.load(Ordering::SeqCst))
            .map(|active| Arc::clone(&active.link))
    }
}

/// A link between `open` and a completed handshake. Closed on drop unless
/// disarmed, so a cancelled `connect` does not leave the socket half-open.
struct PendingLink {
    link: Arc<dyn BrokerLink>,
    armed: bool,
}

impl PendingLink {
    fn new(link: Arc<dyn BrokerLink>) -> Self {
        Self { link, armed: true }
    }

    async fn close(mut self) {
        self.armed = false;
        self.link.close().await;
    }

    fn disarm(mut self) -> Arc<dyn BrokerLink> {
        self.armed = false;
        Arc::clone(&self.link)
    }
}

impl Drop for PendingLink {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let link = Arc::clone(&self.link);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("transport: closing link abandoned during handshake");
                runtime.spawn(async move { link.close().await });
            }
            Err(_) => warn!("transport: link abandoned during handshake outside a runtime"),
        }
    }
}

async fn read_link(
    attempt: u64,
    mut inbound: mpsc::Receiver<LinkEvent>,
    routes: Routes,
    connected: Arc<AtomicBool>,
    done: oneshot::Sender<Termination>,
) {
    let termination = loop {
        let frame = match inbound.recv().await {
            Some(LinkEvent::Frame(frame)) => frame,
            Some(LinkEvent::Closed(reason)) => break Termination::Closed(reason),
            Some(LinkEvent::Failed(reason)) => break Termination::Errored(reason),
            None => break Termination::Closed(None),
        };

        match frame.command {
            Command::Message => dispatch(&routes, frame).await,
            Command::Error => {
                let reason = frame
                    .get("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| frame.body.clone());
                break Termination::Errored(reason);
            }
            Command::Receipt => {}
            other => debug!(command = other.as_str(), "transport: unexpected frame ignored"),
        }
    };

    connected.store(false, Ordering::SeqCst);
    routes.write().await.clear();
    warn!(attempt, ?termination, "transport: broker session ended");
    let _ = done.send(termination);
}

async fn dispatch(routes: &Routes, frame: Frame) {
    let Some(subscription) = frame.get("subscription") else {
        warn!("transport: MESSAGE frame without subscription header dropped");
        return;
    };
    let Some(sink) = routes.read().await.get(subscription).cloned() else {
        debug!(subscription, "transport: message for unknown subscription dropped");
        return;
    };
    match serde_json::from_str::<ChatMessage>(&frame.body) {
        Ok(message) => {
            if sink.send(message).await.is_err() {
                debug!(subscription, "transport: inbox receiver dropped");
            }
        }
        Err(err) => warn!(subscription, error = %err, "transport: undecodable message dropped"),
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;

use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
    time::Duration,
};

use shared::{
    domain::{ConversationToken, UserId},
    error::ContentError,
    protocol::{ChatMessage, OutboundMessage},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{AuthError, ConnectError, PublishError, TransportError},
    reconnect::{ReconnectPolicy, ReconnectSettings},
    subscriptions::SubscriptionRegistry,
    transport::{Termination, TerminationSignal, TransportSession},
    CredentialProvider,
};

pub const SEND_DESTINATION: &str = "/app/sendMessage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    ConnectionLost { reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    Reconnected,
    AuthRejected { reason: String },
    ReconnectAbandoned { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
    /// The first attempt failed at the transport level; the reconnect
    /// supervisor owns the connection from here.
    Retrying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyText,
    TooLong,
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Published,
    Skipped(SkipReason),
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub send_destination: String,
    pub reconnect: ReconnectSettings,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            send_destination: SEND_DESTINATION.to_string(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

struct Identity {
    user_id: UserId,
    inbox: mpsc::Sender<ChatMessage>,
}

struct Lifecycle {
    identity: Option<Identity>,
    registry: SubscriptionRegistry,
    policy: ReconnectPolicy,
}

/// Realtime chat connection for one local user.
///
/// Owns the transport session, the subscription registry and the reconnect
/// policy. Construct one per logged-in session and share it by `Arc`.
pub struct MessageChannel {
    session: TransportSession,
    credentials: Arc<dyn CredentialProvider>,
    settings: ChannelSettings,
    lifecycle: Mutex<Lifecycle>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ChannelEvent>,
}

impl MessageChannel {
    pub fn new(
        session: TransportSession,
        credentials: Arc<dyn CredentialProvider>,
        settings: ChannelSettings,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            session,
            credentials,
            lifecycle: Mutex::new(Lifecycle {
                identity: None,
                registry: SubscriptionRegistry::new(),
                policy: ReconnectPolicy::new(settings.reconnect.clone()),
            }),
            settings,
            supervisor: StdMutex::new(None),
            state,
            events,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Connects and subscribes `user_id`'s inbox. Messages addressed to the
    /// user are pushed into `inbox` in transport order.
    pub async fn connect(
        self: &Arc<Self>,
        user_id: UserId,
        inbox: mpsc::Sender<ChatMessage>,
    ) -> Result<ConnectOutcome, ConnectError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.session.is_connected() {
            info!(user_id = user_id.0, "chat: websocket client already connected");
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        self.stop_supervisor();
        lifecycle.registry.unsubscribe_all();
        lifecycle.policy.reset();
        lifecycle.identity = Some(Identity { user_id, inbox });

        match self.establish(&mut lifecycle).await {
            Ok(termination) => {
                info!(user_id = user_id.0, "chat: connected");
                self.start_supervisor(Some(termination));
                Ok(ConnectOutcome::Connected)
            }
            Err(ConnectError::Auth(err)) => {
                error!(user_id = user_id.0, error = %err, "chat: connect refused, credential must be refreshed");
                self.teardown(&mut lifecycle).await;
                Err(err.into())
            }
            Err(ConnectError::Transport(err)) => {
                warn!(user_id = user_id.0, error = %err, "chat: connect failed, retrying in background");
                self.state.send_replace(ConnectionState::Reconnecting);
                self.start_supervisor(None);
                Ok(ConnectOutcome::Retrying)
            }
        }
    }

    /// Publishes `text` to the peer without waiting for acknowledgement.
    pub async fn send(
        &self,
        text: &str,
        receiver_id: UserId,
        sender_id: UserId,
        conversation_token: &ConversationToken,
    ) -> Result<SendOutcome, PublishError> {
        let message =
            match OutboundMessage::new(text, receiver_id, sender_id, conversation_token.clone()) {
                Ok(message) => message,
                Err(ContentError::Empty) => {
                    debug!("chat: empty message not sent");
                    return Ok(SendOutcome::Skipped(SkipReason::EmptyText));
                }
                Err(err @ ContentError::TooLong { .. }) => {
                    warn!(error = %err, "chat: message not sent");
                    return Ok(SendOutcome::Skipped(SkipReason::TooLong));
                }
            };

        if !self.session.is_connected() {
            warn!(receiver_id = receiver_id.0, "chat: websocket client not connected, message not sent");
            return Ok(SendOutcome::Skipped(SkipReason::NotConnected));
        }

        let body =
            serde_json::to_string(&message).map_err(|err| PublishError::Encode(err.to_string()))?;
        match self
            .session
            .publish(&self.settings.send_destination, body)
            .await
        {
            Ok(()) => Ok(SendOutcome::Published),
            Err(PublishError::NotConnected) => {
                warn!(receiver_id = receiver_id.0, "chat: connection dropped before send");
                Ok(SendOutcome::Skipped(SkipReason::NotConnected))
            }
            Err(err) => {
                warn!(receiver_id = receiver_id.0, error = %err, "chat: publish failed");
                Err(err)
            }
        }
    }

    /// Tears everything down and cancels any pending reconnect. Idempotent.
    pub async fn disconnect(&self) {
        self.stop_supervisor();
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.identity.is_none() && !self.session.is_connected() {
            debug!("chat: websocket client is not connected");
        } else {
            info!("chat: disconnecting");
        }
        self.teardown(&mut lifecycle).await;
    }

    async fn establish(&self, lifecycle: &mut Lifecycle) -> Result<TerminationSignal, ConnectError> {
        let Some((user_id, inbox)) = lifecycle
            .identity
            .as_ref()
            .map(|identity| (identity.user_id, identity.inbox.clone()))
        else {
            return Err(TransportError::Closed.into());
        };

        self.state.send_replace(ConnectionState::Connecting);
        let credential = self
            .credentials
            .credential()
            .await
            .ok_or(AuthError::MissingCredential)?;
        let termination = self.session.connect(&credential).await?;

        let subscribed = match lifecycle.registry.restore(&self.session).await {
            Ok(_) => lifecycle
                .registry
                .subscribe(user_id, inbox, &self.session)
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = subscribed {
            self.session.disconnect().await;
            return Err(match err {
                PublishError::Transport(err) => err.into(),
                other => TransportError::Protocol(other.to_string()).into(),
            });
        }

        lifecycle.policy.reset();
        self.state.send_replace(ConnectionState::Connected);
        Ok(termination)
    }

    async fn teardown(&self, lifecycle: &mut Lifecycle) {
        lifecycle.identity = None;
        lifecycle.registry.unsubscribe_all();
        lifecycle.policy.reset();
        self.session.disconnect().await;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn start_supervisor(self: &Arc<Self>, termination: Option<TerminationSignal>) {
        let handle = tokio::spawn(supervise(Arc::downgrade(self), termination));
        let previous = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_supervisor(&self) {
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.stop_supervisor();
    }
}

/// Waits for the live connection to end, then reconnects with backoff until
/// it succeeds, the credential is rejected or the attempt budget runs out.
async fn supervise(weak: Weak<MessageChannel>, mut termination: Option<TerminationSignal>) {
    loop {
        if let Some(signal) = termination.take() {
            let ended = signal.wait().await;
            let reason = match ended {
                Termination::Released => return,
                Termination::Closed(reason) => {
                    reason.unwrap_or_else(|| "connection closed".to_string())
                }
                Termination::Errored(reason) => reason,
            };
            let Some(channel) = weak.upgrade() else {
                return;
            };
            let mut lifecycle = channel.lifecycle.lock().await;
            if lifecycle.identity.is_none() {
                return;
            }
            lifecycle.registry.detach();
            warn!(reason = %reason, "chat: websocket closed");
            channel.emit(ChannelEvent::ConnectionLost { reason });
        }

        let delay = {
            let Some(channel) = weak.upgrade() else {
                return;
            };
            let mut lifecycle = channel.lifecycle.lock().await;
            if lifecycle.identity.is_none() {
                return;
            }
            match lifecycle.policy.next_delay() {
                Some(delay) => {
                    let attempt = lifecycle.policy.attempts();
                    channel.state.send_replace(ConnectionState::Reconnecting);
                    info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "chat: attempting to reconnect"
                    );
                    channel.emit(ChannelEvent::ReconnectScheduled { attempt, delay });
                    delay
                }
                None => {
                    let attempts = lifecycle.policy.attempts();
                    warn!(attempts, "chat: reconnect attempts exhausted");
                    channel.teardown(&mut lifecycle).await;
                    channel.emit(ChannelEvent::ReconnectAbandoned { attempts });
                    return;
                }
            }
        };

        tokio::time::sleep(delay).await;

        let Some(channel) = weak.upgrade() else {
            return;
        };
        let mut lifecycle = channel.lifecycle.lock().await;
        if lifecycle.identity.is_none() {
            return;
        }
        match channel.establish(&mut lifecycle).await {
            Ok(signal) => {
                info!("chat: reconnected");
                channel.emit(ChannelEvent::Reconnected);
                termination = Some(signal);
            }
            Err(ConnectError::Auth(err)) => {
                error!(error = %err, "chat: reconnect refused, giving up until credential is refreshed");
                channel.teardown(&mut lifecycle).await;
                channel.emit(ChannelEvent::AuthRejected {
                    reason: err.to_string(),
                });
                return;
            }
            Err(ConnectError::Transport(err)) => {
                warn!(error = %err, "chat: reconnect attempt failed");
                channel.state.send_replace(ConnectionState::Reconnecting);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;

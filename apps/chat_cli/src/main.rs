use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::load_settings, unread::NOTIFICATION_TITLE, ChannelEvent, ConversationView,
    CredentialProvider, HistoryReconciler, HttpMessageStore, LiveUpdate, MessageChannel,
    MessageStore, SendOutcome, StaticCredential, SystemClock, TracingNotifier, TransportSession,
    UnreadAggregator, UnreadEvent, WebSocketConnector,
};
use shared::{
    domain::{ConversationToken, UserId},
    protocol::ChatMessage,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{broadcast::error::RecvError, mpsc},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Counseling chat client")]
struct Cli {
    /// Bearer token for the broker and the message API.
    #[arg(long, env = "CHAT_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Overrides `server_url` from client.toml and the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a conversation and send stdin lines to the peer.
    Chat {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        peer_id: i64,
        /// Conversation token sent with every message. Defaults to the user id.
        #[arg(long)]
        chat_token: Option<String>,
        /// Chat as the counselor; incoming messages come from a student.
        #[arg(long)]
        counselor: bool,
    },
    /// Watch unread messages addressed to a counselor.
    Watch {
        #[arg(long)]
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    let credentials: Arc<dyn CredentialProvider> = Arc::new(match cli.token {
        Some(token) => StaticCredential::new(token),
        None => StaticCredential::none(),
    });
    let store: Arc<dyn MessageStore> = Arc::new(HttpMessageStore::new(
        settings.server_url.clone(),
        Arc::clone(&credentials),
    ));

    match cli.command {
        Command::Chat {
            user_id,
            peer_id,
            chat_token,
            counselor,
        } => {
            let me = UserId(user_id);
            let peer = UserId(peer_id);
            let token = match chat_token {
                Some(raw) => ConversationToken::new(raw),
                None => ConversationToken::from(me),
            };

            let mut view = ConversationView::new(me, peer, Arc::new(TracingNotifier));
            if counselor {
                view = view.with_incoming_title(NOTIFICATION_TITLE);
            }
            match HistoryReconciler::new(store)
                .load(view.self_id(), view.peer_id())
                .await
            {
                Ok(history) => view.replace_history(history),
                Err(err) => warn!(error = %err, "chat: history unavailable"),
            }
            for message in view.messages() {
                print_message(view.self_id(), message);
            }

            let broker_url = settings.broker_url()?;
            info!(broker = %broker_url, "chat: connecting");
            let session = TransportSession::new(
                Arc::new(WebSocketConnector::new(broker_url)),
                settings.transport_settings(),
            );
            let channel = MessageChannel::new(session, credentials, settings.channel_settings());
            let (inbox_tx, mut inbox) = mpsc::channel(settings.inbox_capacity);
            let outcome = channel
                .connect(me, inbox_tx)
                .await
                .context("failed to connect to the message broker")?;
            info!(?outcome, "chat: ready, type a message and press enter");

            let mut events = channel.subscribe_events();
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Some(line) = line? else { break };
                        if line.trim() == "/quit" {
                            break;
                        }
                        let sent = channel.send(&line, view.peer_id(), view.self_id(), &token).await;
                        match sent {
                            Ok(SendOutcome::Published) => view.mark_read(),
                            Ok(SendOutcome::Skipped(reason)) => println!("! not sent: {reason:?}"),
                            Err(err) => println!("! send failed: {err}"),
                        }
                    }
                    Some(message) = inbox.recv() => {
                        if view.push_live(message.clone()) != LiveUpdate::Ignored {
                            print_message(view.self_id(), &message);
                        }
                    }
                    event = events.recv() => match event {
                        Ok(event) => print_channel_event(&event),
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            channel.disconnect().await;
        }
        Command::Watch { user_id } => {
            let aggregator = UnreadAggregator::new(
                UserId(user_id),
                store,
                Arc::new(TracingNotifier),
                Arc::new(SystemClock),
                settings.unread_settings(),
            );
            let mut events = aggregator.subscribe_events();
            let poller = aggregator.spawn();
            info!(receiver_id = %aggregator.receiver_id(), "watch: polling unread messages");

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(UnreadEvent::NewMessages { messages, unread }) => {
                            for message in &messages {
                                println!("[{}] {}: {}", message.timestamp, message.sender_id, message.content);
                            }
                            println!("{unread} unread");
                        }
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "unread: events skipped"),
                        Err(RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            poller.stop();
        }
    }

    Ok(())
}

fn print_message(me: UserId, message: &ChatMessage) {
    let who = if message.sender_id == me {
        "me".to_string()
    } else {
        message.sender_id.to_string()
    };
    println!("[{}] {who}: {}", message.timestamp, message.content);
}

fn print_channel_event(event: &ChannelEvent) {
    match event {
        ChannelEvent::ConnectionLost { reason } => println!("! connection lost: {reason}"),
        ChannelEvent::ReconnectScheduled { attempt, delay } => {
            println!("! reconnecting in {}s (attempt {attempt})", delay.as_secs())
        }
        ChannelEvent::Reconnected => println!("! reconnected"),
        ChannelEvent::AuthRejected { reason } => println!("! sign in again: {reason}"),
        ChannelEvent::ReconnectAbandoned { attempts } => {
            println!("! gave up after {attempts} attempts")
        }
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::events::{EventStream, StreamRequest, SwapEvent, parse_notification};
use crate::error::SwapError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(15);
const EVENT_BUFFER: usize = 256;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
enum Command {
    Subscribe(String, Vec<String>),
    Unsubscribe(String, Vec<String>),
}

enum SessionEnd {
    Shutdown,
    Disconnected(String),
}

/// Websocket event stream. Reconnects with capped backoff and replays every
/// live subscription after a reconnect.
#[derive(Debug, Clone)]
pub struct WsEventStream {
    commands: mpsc::UnboundedSender<Command>,
}

impl WsEventStream {
    /// Spawns the connection task. The task stops once both the handle and
    /// the returned receiver are dropped.
    pub fn connect(url: impl Into<String>) -> (Self, mpsc::Receiver<SwapEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run(url.into(), command_rx, event_tx));
        (Self { commands }, event_rx)
    }

    fn send(&self, command: Command) -> Result<(), SwapError> {
        self.commands
            .send(command)
            .map_err(|_| SwapError::Transport("event stream task stopped".to_string()))
    }
}

#[async_trait]
impl EventStream for WsEventStream {
    async fn subscribe(&self, channel: &str, swap_ids: &[String]) -> Result<(), SwapError> {
        self.send(Command::Subscribe(channel.to_string(), swap_ids.to_vec()))
    }

    async fn unsubscribe(&self, channel: &str, swap_ids: &[String]) -> Result<(), SwapError> {
        self.send(Command::Unsubscribe(channel.to_string(), swap_ids.to_vec()))
    }
}

async fn run(
    url: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<SwapEvent>,
) {
    let mut subscriptions: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match connect_async(url.as_str()).await {
            Ok((mut socket, _)) => {
                tracing::info!(%url, "event stream connected");
                backoff = INITIAL_BACKOFF;
                match session(&mut socket, &mut commands, &events, &mut subscriptions).await {
                    SessionEnd::Shutdown => {
                        let _ = socket.close(None).await;
                        return;
                    }
                    SessionEnd::Disconnected(reason) => {
                        tracing::warn!(%url, %reason, "event stream disconnected");
                    }
                }
            }
            Err(err) => tracing::warn!(%url, error = %err, "connect event stream"),
        }

        if events.is_closed() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn session(
    socket: &mut Socket,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::Sender<SwapEvent>,
    subscriptions: &mut BTreeMap<String, BTreeSet<String>>,
) -> SessionEnd {
    for (channel, ids) in subscriptions.iter() {
        if ids.is_empty() {
            continue;
        }
        let ids: Vec<String> = ids.iter().cloned().collect();
        if let Err(err) = send_request(socket, "subscribe", channel, &ids).await {
            return SessionEnd::Disconnected(err.to_string());
        }
        tracing::debug!(%channel, count = ids.len(), "resubscribed");
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    return SessionEnd::Shutdown;
                };
                let result = match command {
                    Command::Subscribe(channel, ids) => {
                        subscriptions
                            .entry(channel.clone())
                            .or_default()
                            .extend(ids.iter().cloned());
                        send_request(socket, "subscribe", &channel, &ids).await
                    }
                    Command::Unsubscribe(channel, ids) => {
                        if let Some(tracked) = subscriptions.get_mut(&channel) {
                            for id in &ids {
                                tracked.remove(id);
                            }
                        }
                        send_request(socket, "unsubscribe", &channel, &ids).await
                    }
                };
                if let Err(err) = result {
                    return SessionEnd::Disconnected(err.to_string());
                }
            }
            frame = socket.next() => {
                match frame {
                    None => return SessionEnd::Disconnected("stream ended".to_string()),
                    Some(Err(err)) => return SessionEnd::Disconnected(err.to_string()),
                    Some(Ok(Message::Close(_))) => {
                        return SessionEnd::Disconnected("closed by server".to_string());
                    }
                    Some(Ok(Message::Text(text))) => match parse_notification(&text) {
                        Ok(batch) => {
                            for event in batch {
                                if events.send(event).await.is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                        }
                        Err(err) => tracing::debug!(error = %err, "skipping undecodable frame"),
                    },
                    Some(Ok(_)) => {}
                }
            }
            _ = ping.tick() => {
                if let Err(err) = socket.send(Message::Ping(Vec::new())).await {
                    return SessionEnd::Disconnected(err.to_string());
                }
            }
        }
    }
}

async fn send_request(
    socket: &mut Socket,
    op: &str,
    channel: &str,
    swap_ids: &[String],
) -> Result<(), SwapError> {
    let payload = serde_json::to_string(&StreamRequest {
        op,
        channel,
        args: swap_ids,
    })?;
    socket.send(Message::Text(payload.into())).await?;
    Ok(())
}

//! Owned realtime connection for talking to a chat server.
//!
//! A `ChatClient` holds exactly one WebSocket. Incoming events are fanned out
//! to `EventSubscription` handles; dropping a handle unsubscribes it, and
//! `close()` (or dropping the client) tears the socket down.

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, warn};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::messages::{ClientEvent, Message, ServerEvent};

const NOTICE_BUFFER: usize = 256;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNotice {
    Event(ServerEvent),
    /// The transport failed. The connection is unusable afterwards.
    ConnectError(String),
    Closed,
}

pub struct ChatClient {
    base_url: String,
    http: reqwest::Client,
    outbound: mpsc::UnboundedSender<WsMessage>,
    notices: broadcast::Sender<ClientNotice>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ChatClient {
    /// Connects to the server at `base_url` (e.g. `http://127.0.0.1:2052`).
    /// The returned subscription sees every event, including the server's
    /// `connection` acknowledgement.
    pub async fn connect(base_url: &str) -> Result<(Self, EventSubscription), ClientError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let (stream, _) = connect_async(socket_url(&base_url)).await?;
        let (mut ws_tx, mut ws_rx) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = ws_tx.send(msg).await {
                    warn!("Failed to send to chat server: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let (notices, first) = broadcast::channel(NOTICE_BUFFER);
        let reader_notices = notices.clone();
        let reader = tokio::spawn(async move {
            while let Some(result) = ws_rx.next().await {
                match result {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<ServerEvent>(text.as_str()) {
                            Ok(event) => {
                                let _ = reader_notices.send(ClientNotice::Event(event));
                            }
                            Err(e) => warn!("Ignoring unrecognised server frame: {}", e),
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!("Socket connection error: {}", e);
                        let _ = reader_notices.send(ClientNotice::ConnectError(e.to_string()));
                        break;
                    }
                }
            }
            let _ = reader_notices.send(ClientNotice::Closed);
        });

        let client = ChatClient {
            base_url,
            http: reqwest::Client::new(),
            outbound,
            notices,
            reader,
            writer,
        };
        Ok((client, EventSubscription { receiver: first }))
    }

    /// Starts receiving notices from this point on.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.notices.subscribe(),
        }
    }

    pub fn join(&self, display_name: &str) -> Result<(), ClientError> {
        self.emit(&ClientEvent::Join(Some(display_name.to_string())))
    }

    /// Sends chat text. Blank text is skipped locally and never reaches the server.
    pub fn send_chat(&self, username: &str, text: &str) -> Result<bool, ClientError> {
        if text.trim().is_empty() {
            return Ok(false);
        }
        self.emit(&ClientEvent::ChatMessage {
            username: Some(username.to_string()),
            message: text.to_string(),
        })?;
        Ok(true)
    }

    pub fn leave(&self) -> Result<(), ClientError> {
        self.emit(&ClientEvent::Leave)
    }

    pub fn emit(&self, event: &ClientEvent) -> Result<(), ClientError> {
        let text = serde_json::to_string(event)?;
        self.outbound
            .send(WsMessage::text(text))
            .map_err(|_| ClientError::Closed)
    }

    /// The server's history, or an empty list if it cannot be fetched.
    pub async fn fetch_history(&self) -> Vec<Message> {
        fetch_history(&self.http, &self.base_url).await
    }

    /// Sends a close frame and waits for the socket tasks to finish.
    pub async fn close(self) {
        let ChatClient {
            outbound,
            reader,
            writer,
            ..
        } = self;
        let _ = outbound.send(WsMessage::Close(None));
        drop(outbound);
        let _ = writer.await;
        let _ = reader.await;
    }

    /// Drops the socket without a closing handshake.
    pub fn abort(self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// Fetches `GET /messages`; failures are logged and yield an empty history.
pub async fn fetch_history(http: &reqwest::Client, base_url: &str) -> Vec<Message> {
    let url = format!("{}/messages", base_url.trim_end_matches('/'));
    let response = match http.get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to fetch messages: {}", e);
            return Vec::new();
        }
    };
    if !response.status().is_success() {
        error!("Failed to fetch messages: HTTP {}", response.status());
        return Vec::new();
    }
    match response.json::<Vec<Message>>().await {
        Ok(messages) => messages,
        Err(e) => {
            error!("Failed to decode messages: {}", e);
            Vec::new()
        }
    }
}

fn socket_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}/socket")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}/socket")
    } else {
        format!("{base_url}/socket")
    }
}

/// Receives client notices until dropped.
pub struct EventSubscription {
    receiver: broadcast::Receiver<ClientNotice>,
}

impl EventSubscription {
    /// Next notice, or `None` once the client is gone.
    pub async fn next(&mut self) -> Option<ClientNotice> {
        loop {
            match self.receiver.recv().await {
                Ok(notice) => return Some(notice),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Subscriber lagged, skipped {} notices", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next server event, skipping transport notices. `None` once the connection ends.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        loop {
            match self.next().await? {
                ClientNotice::Event(event) => return Some(event),
                ClientNotice::ConnectError(_) => {}
                ClientNotice::Closed => return None,
            }
        }
    }
}

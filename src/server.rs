use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::broadcast::BroadcastHub;
use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::gateway::{ConnectionGateway, ConnectionState};
use crate::history::{self, HistoryEndpoint};
use crate::messages::ClientEvent;
use crate::presence::PresenceRegistry;
use crate::store::{JsonLinesLog, MessageStore};

pub struct Server {
    config: ServerConfig,
    gateway: Arc<ConnectionGateway>,
    history: Arc<HistoryEndpoint>,
}

impl Server {
    /// Opens the message store described by `config` and wires the components together.
    pub async fn new(config: ServerConfig) -> Result<Self, ChatError> {
        let store = match &config.history_path {
            Some(path) => {
                info!("Persisting history to {}", path.display());
                let log = JsonLinesLog::open(path).await?;
                MessageStore::open(Box::new(log), config.history_capacity).await?
            }
            None => MessageStore::in_memory(config.history_capacity),
        };
        let store = Arc::new(store);

        let gateway = ConnectionGateway::new(
            Arc::clone(&store),
            Arc::new(PresenceRegistry::new()),
            BroadcastHub::new(config.outbound_capacity),
            config.gateway_settings(),
        );

        Ok(Server {
            history: Arc::new(HistoryEndpoint::new(store)),
            gateway: Arc::new(gateway),
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<ConnectionGateway> {
        &self.gateway
    }

    /// `GET /messages`, the `/socket` realtime channel, and static files.
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone + Send + Sync + 'static {
        let server = Arc::clone(self);
        let ws_route = warp::path("socket")
            .and(warp::path::end())
            .and(warp::ws())
            .map(move |ws: Ws| {
                let server = Arc::clone(&server);
                ws.on_upgrade(move |socket| async move {
                    server.handle_connection(socket).await;
                })
            });

        let static_files = warp::fs::dir(self.config.static_dir.clone());

        history::routes(Arc::clone(&self.history))
            .or(ws_route)
            .or(static_files)
            .with(warp::cors().allow_any_origin())
            .with(warp::log("chat_relay::http"))
    }

    /// Drives one realtime connection until the client goes away.
    pub async fn handle_connection(&self, ws: WebSocket) {
        let (mut session, mut events) = match self.gateway.connect() {
            Ok(connection) => connection,
            Err(e) => {
                error!("Refusing connection: {}", e);
                let _ = ws.close().await;
                return;
            }
        };
        let connection_id = session.id();
        let eviction = events.eviction();
        let (mut ws_tx, mut ws_rx) = ws.split();

        let writer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let text = match serde_json::to_string(&*event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode event for {}: {}", connection_id, e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    warn!("Failed to send to {}: {}", connection_id, e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        loop {
            let result = tokio::select! {
                () = eviction.wait() => {
                    // The writer may be stuck on a peer that stopped reading.
                    warn!("Closing {}: it fell too far behind", connection_id);
                    writer.abort();
                    break;
                }
                next = ws_rx.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("WebSocket error on {}: {}", connection_id, e);
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            if msg.is_ping() || msg.is_pong() {
                continue;
            }

            let outcome = match msg.to_str() {
                Ok(text) => match serde_json::from_str::<ClientEvent>(text) {
                    Ok(event) => self.gateway.handle(&mut session, event).await.map(|_| ()),
                    Err(e) => Err(ChatError::Validation(format!("malformed event: {e}"))),
                },
                Err(()) => Err(ChatError::Validation(
                    "binary frames are not supported".to_string(),
                )),
            };
            if let Err(e) = outcome {
                self.gateway.reject(&session, &e);
            }
            if *session.state() == ConnectionState::Disconnected {
                break;
            }
        }

        self.gateway.disconnect(&mut session).await;
    }

    /// Binds `addr` (port 0 picks a free one) and returns the bound address
    /// with the future that serves it. TLS settings are not applied here.
    pub fn bind(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<(SocketAddr, impl Future<Output = ()> + 'static), ChatError> {
        let (bound, serving) = warp::serve(self.routes()).try_bind_ephemeral(addr)?;
        Ok((bound, serving))
    }

    /// Serves until the process exits, over TLS when configured.
    pub async fn run(self: Arc<Self>) -> Result<(), ChatError> {
        let addr = self.config.bind_addr;
        match &self.config.tls {
            Some(tls) => {
                info!("Starting secure server (HTTPS/WSS) on {}", addr);
                warp::serve(self.routes())
                    .tls()
                    .cert_path(&tls.cert_path)
                    .key_path(&tls.key_path)
                    .run(addr)
                    .await;
            }
            None => {
                let (bound, serving) = self.bind(addr)?;
                info!("Chat server listening on {}", bound);
                serving.await;
            }
        }
        Ok(())
    }
}

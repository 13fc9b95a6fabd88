//! Realtime chat relay: an ordered message log, presence tracking and
//! best-effort fan-out to every connected WebSocket client.
//!
//! ```text
//! client ──ws /socket──▶ ConnectionGateway ──▶ PresenceRegistry
//!                              │
//!                              ├──▶ MessageStore ──▶ MessageLog (memory | JSON lines)
//!                              │         ▲
//!                              ▼         └── HistoryEndpoint ◀── GET /messages
//!                        BroadcastHub ──▶ every subscribed connection
//! ```

pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod history;
pub mod messages;
pub mod presence;
pub mod server;
pub mod store;

pub use broadcast::{BroadcastHub, Delivery, Eviction, Subscription};
pub use client::{ChatClient, ClientError, ClientNotice, EventSubscription};
pub use config::{load_config, ServerConfig};
pub use error::ChatError;
pub use gateway::{ConnectionGateway, ConnectionState, GatewaySettings, Session};
pub use history::HistoryEndpoint;
pub use messages::{ClientEvent, Message, MessageKind, ServerEvent};
pub use presence::{ConnectionId, Participant, PresenceRegistry};
pub use server::Server;
pub use store::{JsonLinesLog, MemoryLog, MessageLog, MessageStore};

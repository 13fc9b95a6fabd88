//! Per-connection protocol handling.
//!
//! A connection moves `Connecting -> Joined -> Disconnected`. `leave` returns
//! a joined connection to `Connecting` so it may join again; `Disconnected`
//! is terminal. A connection the hub evicts for falling behind leaves
//! presence straight away and is treated as disconnected from then on.

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::broadcast::{BroadcastHub, Subscription};
use crate::error::ChatError;
use crate::messages::{ClientEvent, Message, ServerEvent};
use crate::presence::{ConnectionId, PresenceRegistry};
use crate::store::MessageStore;

pub const DEFAULT_MAX_MESSAGE_LEN: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Longest accepted chat text and display name, in characters.
    pub max_message_len: usize,
    /// Emit a "<name> left" notice when a joined participant goes away.
    pub announce_leave: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            announce_leave: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Joined { display_name: String },
    Disconnected,
}

/// Protocol state of one live connection.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    state: ConnectionState,
}

impl Session {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn display_name(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Joined { display_name } => Some(display_name),
            _ => None,
        }
    }
}

pub struct ConnectionGateway {
    store: Arc<MessageStore>,
    presence: Arc<PresenceRegistry>,
    hub: BroadcastHub,
    settings: GatewaySettings,
}

impl ConnectionGateway {
    pub fn new(
        store: Arc<MessageStore>,
        presence: Arc<PresenceRegistry>,
        hub: BroadcastHub,
        settings: GatewaySettings,
    ) -> Self {
        ConnectionGateway {
            store,
            presence,
            hub,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// Accepts a transport-level connection. The subscription carries every
    /// event addressed to it, starting with the `connection` acknowledgement.
    pub fn connect(&self) -> Result<(Session, Subscription), ChatError> {
        let id = ConnectionId::new();
        let subscription = self.hub.subscribe(id)?;
        self.hub.send_to(&id, ServerEvent::Connected { connection_id: id });
        info!("Connection {} opened", id);

        Ok((
            Session {
                id,
                state: ConnectionState::Connecting,
            },
            subscription,
        ))
    }

    /// Applies one client event. Returns the message it stored, if any.
    pub async fn handle(
        &self,
        session: &mut Session,
        event: ClientEvent,
    ) -> Result<Option<Message>, ChatError> {
        if session.state != ConnectionState::Disconnected {
            if let Err(e) = self.ensure_subscribed(session) {
                self.disconnect(session).await;
                return Err(e);
            }
        }

        match event {
            ClientEvent::Join(name) => self.join(session, name.as_deref()).await.map(Some),
            ClientEvent::ChatMessage { message, .. } => self.chat(session, &message).await,
            ClientEvent::Leave => self.leave(session).await.map(|_| None),
        }
    }

    pub async fn join(
        &self,
        session: &mut Session,
        display_name: Option<&str>,
    ) -> Result<Message, ChatError> {
        match &session.state {
            ConnectionState::Connecting => {}
            ConnectionState::Joined { display_name } => {
                return Err(ChatError::Protocol(format!(
                    "already joined as {display_name}"
                )));
            }
            ConnectionState::Disconnected => {
                return Err(ChatError::Protocol("connection is closed".to_string()));
            }
        }
        self.ensure_subscribed(session)?;
        if let Some(name) = display_name {
            self.check_len("display name", name.trim())?;
        }

        let participant = match self.presence.register(session.id, display_name).await {
            Ok(participant) => participant,
            Err(e) => {
                error!("Rejecting join on {}: {}", session.id, e);
                return Err(e);
            }
        };

        let notice = match self
            .store
            .append_system_notice(&format!("{} joined", participant.display_name))
            .await
        {
            Ok(notice) => notice,
            Err(e) => {
                self.presence.unregister(&session.id).await;
                return Err(e);
            }
        };

        self.fan_out(ServerEvent::UserJoined(notice.clone())).await;
        info!("{} joined as {}", session.id, participant.display_name);
        session.state = ConnectionState::Joined {
            display_name: participant.display_name,
        };
        Ok(notice)
    }

    /// Stores and broadcasts chat text. Blank text is dropped silently.
    pub async fn chat(&self, session: &Session, text: &str) -> Result<Option<Message>, ChatError> {
        let display_name = match &session.state {
            ConnectionState::Joined { display_name } => display_name,
            ConnectionState::Connecting => {
                return Err(ChatError::Protocol(
                    "must join before sending chat messages".to_string(),
                ));
            }
            ConnectionState::Disconnected => {
                return Err(ChatError::Protocol("connection is closed".to_string()));
            }
        };
        self.ensure_subscribed(session)?;

        if text.trim().is_empty() {
            debug!("Ignoring blank chat message from {}", session.id);
            return Ok(None);
        }
        self.check_len("message", text)?;

        let message = self.store.append(display_name, text).await?;
        self.fan_out(ServerEvent::ChatMessage(message.clone())).await;
        Ok(Some(message))
    }

    /// Leaves presence but keeps the connection open. A no-op unless joined.
    pub async fn leave(&self, session: &mut Session) -> Result<(), ChatError> {
        match std::mem::replace(&mut session.state, ConnectionState::Connecting) {
            ConnectionState::Joined { display_name } => {
                self.depart(session.id, &display_name).await;
                Ok(())
            }
            ConnectionState::Connecting => Ok(()),
            ConnectionState::Disconnected => {
                session.state = ConnectionState::Disconnected;
                Err(ChatError::Protocol("connection is closed".to_string()))
            }
        }
    }

    /// Tears the connection down. Safe to call more than once.
    pub async fn disconnect(&self, session: &mut Session) {
        let previous = std::mem::replace(&mut session.state, ConnectionState::Disconnected);
        if previous == ConnectionState::Disconnected {
            return;
        }

        self.hub.unsubscribe(&session.id);
        if let ConnectionState::Joined { display_name } = previous {
            self.depart(session.id, &display_name).await;
        }
        info!("Connection {} closed", session.id);
    }

    /// Reports an error to the offending connection only.
    pub fn reject(&self, session: &Session, err: &ChatError) {
        warn!("Event from {} rejected: {}", session.id, err);
        self.hub.send_to(
            &session.id,
            ServerEvent::Error {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        );
    }

    /// The hub drops a connection that falls behind; after that nothing it
    /// sends is accepted.
    fn ensure_subscribed(&self, session: &Session) -> Result<(), ChatError> {
        if self.hub.is_subscribed(&session.id) {
            Ok(())
        } else {
            Err(ChatError::Protocol(
                "connection was dropped for falling behind".to_string(),
            ))
        }
    }

    fn check_len(&self, what: &str, text: &str) -> Result<(), ChatError> {
        let len = text.chars().count();
        if len > self.settings.max_message_len {
            return Err(ChatError::Validation(format!(
                "{what} is {len} characters, limit is {}",
                self.settings.max_message_len
            )));
        }
        Ok(())
    }

    /// Publishes `event`, then retires every participant evicted along the
    /// way. Their leave notices may evict others in turn.
    async fn fan_out(&self, event: ServerEvent) {
        let mut evicted = self.hub.publish(event).evicted;
        while let Some(id) = evicted.pop() {
            let Some(participant) = self.presence.unregister(&id).await else {
                continue;
            };
            warn!(
                "{} ({}) dropped after its outbound queue overflowed",
                participant.display_name, id
            );
            if let Some(notice) = self.leave_notice(id, &participant.display_name).await {
                evicted.extend(self.hub.publish(ServerEvent::UserLeft(notice)).evicted);
            }
        }
    }

    /// Removes a participant. Does nothing if it was already removed.
    async fn depart(&self, id: ConnectionId, display_name: &str) {
        if self.presence.unregister(&id).await.is_none() {
            return;
        }
        info!("{} ({}) left", display_name, id);
        if let Some(notice) = self.leave_notice(id, display_name).await {
            self.fan_out(ServerEvent::UserLeft(notice)).await;
        }
    }

    async fn leave_notice(&self, id: ConnectionId, display_name: &str) -> Option<Message> {
        if !self.settings.announce_leave {
            return None;
        }
        match self
            .store
            .append_system_notice(&format!("{display_name} left"))
            .await
        {
            Ok(notice) => Some(notice),
            Err(e) => {
                error!("Failed to record leave notice for {}: {}", id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageKind;
    use crate::store::DEFAULT_HISTORY_CAPACITY;

    fn gateway_with(settings: GatewaySettings) -> ConnectionGateway {
        ConnectionGateway::new(
            Arc::new(MessageStore::in_memory(DEFAULT_HISTORY_CAPACITY)),
            Arc::new(PresenceRegistry::new()),
            BroadcastHub::new(16),
            settings,
        )
    }

    fn gateway() -> ConnectionGateway {
        gateway_with(GatewaySettings::default())
    }

    /// Connects and discards the `connection` acknowledgement.
    fn connect(gateway: &ConnectionGateway) -> (Session, Subscription) {
        let (session, mut events) = gateway.connect().unwrap();
        assert!(matches!(
            events.try_recv().as_deref(),
            Some(ServerEvent::Connected { .. })
        ));
        (session, events)
    }

    #[tokio::test]
    async fn join_records_and_broadcasts_notice() {
        let gateway = gateway();
        let (mut alice, mut alice_events) = connect(&gateway);
        let (_bob, mut bob_events) = connect(&gateway);

        let notice = gateway.join(&mut alice, Some("Alice")).await.unwrap();
        assert_eq!(notice.id, 1);
        assert_eq!(notice.kind, MessageKind::Info);
        assert_eq!(notice.text, "Alice joined");
        assert_eq!(alice.display_name(), Some("Alice"));

        let expected = ServerEvent::UserJoined(notice.clone());
        assert_eq!(*alice_events.recv().await.unwrap(), expected);
        assert_eq!(*bob_events.recv().await.unwrap(), expected);
        assert_eq!(gateway.store().snapshot().await, vec![notice]);
        assert_eq!(gateway.presence().len().await, 1);
    }

    #[tokio::test]
    async fn empty_join_name_is_anonymous() {
        let gateway = gateway();
        let (mut session, _events) = connect(&gateway);

        let notice = gateway.join(&mut session, Some("")).await.unwrap();
        assert_eq!(notice.text, "Anonymous joined");
        assert_eq!(session.display_name(), Some("Anonymous"));
    }

    #[tokio::test]
    async fn chat_before_join_is_a_protocol_error() {
        let gateway = gateway();
        let (session, mut events) = connect(&gateway);

        let err = gateway.chat(&session, "hello?").await.unwrap_err();
        assert!(matches!(err, ChatError::Protocol(_)));
        assert!(gateway.store().is_empty().await);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn chat_is_stored_and_echoed_to_sender() {
        let gateway = gateway();
        let (mut alice, mut alice_events) = connect(&gateway);
        let (_bob, mut bob_events) = connect(&gateway);
        gateway.join(&mut alice, Some("Alice")).await.unwrap();
        alice_events.recv().await.unwrap();
        bob_events.recv().await.unwrap();

        let event = ClientEvent::ChatMessage {
            username: Some("Alice".into()),
            message: "hi".into(),
        };
        let message = gateway.handle(&mut alice, event).await.unwrap().unwrap();
        assert_eq!(message.id, 2);
        assert_eq!(message.kind, MessageKind::Chat);
        assert_eq!(message.text, "hi");
        assert_eq!(message.username.as_deref(), Some("Alice"));

        let expected = ServerEvent::ChatMessage(message);
        assert_eq!(*alice_events.recv().await.unwrap(), expected);
        assert_eq!(*bob_events.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn author_is_the_joined_name() {
        let gateway = gateway();
        let (mut alice, _events) = connect(&gateway);
        gateway.join(&mut alice, Some("Alice")).await.unwrap();

        let event = ClientEvent::ChatMessage {
            username: Some("Mallory".into()),
            message: "it was me".into(),
        };
        let message = gateway.handle(&mut alice, event).await.unwrap().unwrap();
        assert_eq!(message.username.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn blank_chat_is_ignored_silently() {
        let gateway = gateway();
        let (mut alice, mut events) = connect(&gateway);
        gateway.join(&mut alice, Some("Alice")).await.unwrap();
        events.recv().await.unwrap();

        for text in ["", "   "] {
            assert_eq!(gateway.chat(&alice, text).await.unwrap(), None);
        }
        assert_eq!(gateway.store().len().await, 1);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn oversized_chat_is_rejected() {
        let gateway = gateway_with(GatewaySettings {
            max_message_len: 5,
            announce_leave: true,
        });
        let (mut alice, _events) = connect(&gateway);
        gateway.join(&mut alice, Some("Alice")).await.unwrap();

        assert!(gateway.chat(&alice, "héllo").await.unwrap().is_some());
        let err = gateway.chat(&alice, "too long").await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert_eq!(gateway.store().len().await, 2);
    }

    #[tokio::test]
    async fn second_join_is_rejected() {
        let gateway = gateway();
        let (mut alice, _events) = connect(&gateway);
        gateway.join(&mut alice, Some("Alice")).await.unwrap();

        let err = gateway.join(&mut alice, Some("Alice again")).await.unwrap_err();
        assert!(matches!(err, ChatError::Protocol(_)));
        assert_eq!(alice.display_name(), Some("Alice"));
    }

    #[tokio::test]
    async fn disconnect_announces_leave_once() {
        let gateway = gateway();
        let (mut alice, _alice_events) = connect(&gateway);
        let (_bob, mut bob_events) = connect(&gateway);
        gateway.join(&mut alice, Some("Alice")).await.unwrap();
        bob_events.recv().await.unwrap();

        gateway.disconnect(&mut alice).await;
        gateway.disconnect(&mut alice).await;

        assert_eq!(*alice.state(), ConnectionState::Disconnected);
        assert!(gateway.presence().is_empty().await);
        assert!(!gateway.hub().is_subscribed(&alice.id()));

        match &*bob_events.recv().await.unwrap() {
            ServerEvent::UserLeft(notice) => assert_eq!(notice.text, "Alice left"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(bob_events.try_recv().is_none());

        let err = gateway.chat(&alice, "still here?").await.unwrap_err();
        assert!(matches!(err, ChatError::Protocol(_)));
    }

    #[tokio::test]
    async fn leave_notice_can_be_disabled() {
        let gateway = gateway_with(GatewaySettings {
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            announce_leave: false,
        });
        let (mut alice, _events) = connect(&gateway);
        gateway.join(&mut alice, Some("Alice")).await.unwrap();

        gateway.disconnect(&mut alice).await;
        assert_eq!(gateway.store().len().await, 1);
    }

    #[tokio::test]
    async fn leave_allows_rejoining() {
        let gateway = gateway();
        let (mut alice, _events) = connect(&gateway);
        gateway.join(&mut alice, Some("Alice")).await.unwrap();

        gateway.handle(&mut alice, ClientEvent::Leave).await.unwrap();
        assert_eq!(*alice.state(), ConnectionState::Connecting);
        assert!(gateway.presence().is_empty().await);

        let notice = gateway.join(&mut alice, Some("Alicia")).await.unwrap();
        assert_eq!(notice.text, "Alicia joined");
    }

    #[tokio::test]
    async fn reject_reaches_only_the_offender() {
        let gateway = gateway();
        let (alice, mut alice_events) = connect(&gateway);
        let (_bob, mut bob_events) = connect(&gateway);

        let err = gateway.chat(&alice, "hi").await.unwrap_err();
        gateway.reject(&alice, &err);

        match &*alice_events.recv().await.unwrap() {
            ServerEvent::Error { kind, .. } => assert_eq!(kind, "protocol"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(bob_events.try_recv().is_none());
    }

    #[tokio::test]
    async fn long_display_name_is_rejected() {
        let gateway = gateway_with(GatewaySettings {
            max_message_len: 5,
            announce_leave: true,
        });
        let (mut session, mut events) = connect(&gateway);

        let err = gateway
            .join(&mut session, Some("Bartholomew"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert_eq!(*session.state(), ConnectionState::Connecting);
        assert!(gateway.presence().is_empty().await);
        assert!(gateway.store().is_empty().await);
        assert!(events.try_recv().is_none());

        let notice = gateway.join(&mut session, Some("  Bart  ")).await.unwrap();
        assert_eq!(notice.text, "Bart joined");
    }

    #[tokio::test]
    async fn overflowing_participant_is_removed_from_presence() {
        let store = Arc::new(MessageStore::in_memory(DEFAULT_HISTORY_CAPACITY));
        let gateway = ConnectionGateway::new(
            Arc::clone(&store),
            Arc::new(PresenceRegistry::new()),
            BroadcastHub::new(2),
            GatewaySettings::default(),
        );

        // Never read: the ack and its own join notice fill the queue.
        let (mut slow, mut slow_events) = gateway.connect().unwrap();
        gateway.join(&mut slow, Some("Slow")).await.unwrap();

        let (mut steady, mut steady_events) = connect(&gateway);
        gateway.join(&mut steady, Some("Other")).await.unwrap();

        assert!(!gateway.hub().is_subscribed(&slow.id()));
        let active = gateway.presence().list_active().await;
        let names: Vec<&str> = active.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, ["Other"]);

        match &*steady_events.recv().await.unwrap() {
            ServerEvent::UserJoined(notice) => assert_eq!(notice.text, "Other joined"),
            other => panic!("unexpected event {other:?}"),
        }
        match &*steady_events.recv().await.unwrap() {
            ServerEvent::UserLeft(notice) => assert_eq!(notice.text, "Slow left"),
            other => panic!("unexpected event {other:?}"),
        }

        let err = gateway.chat(&slow, "anyone?").await.unwrap_err();
        assert!(matches!(err, ChatError::Protocol(_)));
        let event = ClientEvent::ChatMessage {
            username: None,
            message: "hello?".into(),
        };
        let err = gateway.handle(&mut slow, event).await.unwrap_err();
        assert!(matches!(err, ChatError::Protocol(_)));
        assert_eq!(*slow.state(), ConnectionState::Disconnected);

        // Already announced; the final disconnect adds nothing.
        gateway.disconnect(&mut slow).await;
        let texts: Vec<String> = store.snapshot().await.into_iter().map(|m| m.text).collect();
        assert_eq!(texts, ["Slow joined", "Other joined", "Slow left"]);
        assert!(steady_events.try_recv().is_none());

        // The queued events are still delivered, then the stream ends.
        assert!(matches!(
            slow_events.recv().await.as_deref(),
            Some(ServerEvent::Connected { .. })
        ));
        assert!(matches!(
            slow_events.recv().await.as_deref(),
            Some(ServerEvent::UserJoined(_))
        ));
        assert!(slow_events.recv().await.is_none());
    }
}

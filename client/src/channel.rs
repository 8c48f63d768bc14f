use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::model::{ChatMessage, Occupant};

// ── Wire contract ───────────────────────────────────────────────────

/// Outbound: the session's identity entering a room.
pub const JOINED_ROOM: &str = "joined_room";
/// Outbound: a chat message typed by the user.
pub const SEND_MESSAGE: &str = "send_message";
/// Inbound: a message from any participant (including ourselves).
pub const MESSAGE: &str = "message";
/// Inbound: the current occupant list, or part of it.
pub const ROOM_USERS: &str = "room_users";

/// One named event on the bidirectional channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    pub payload: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// An already-connected event transport. The session never opens one; it
/// only emits on it, reads from it, and closes it when the session ends.
#[async_trait]
pub trait Transport: Send {
    async fn emit(&mut self, frame: Frame) -> Result<(), ChannelError>;

    /// Next inbound frame, or `None` once the remote side has gone away.
    async fn next_frame(&mut self) -> Option<Frame>;

    async fn close(&mut self);
}

/// Events the client emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    JoinedRoom { username: String, room: String },
    SendMessage(String),
}

impl ClientEvent {
    pub fn into_frame(self) -> Frame {
        match self {
            ClientEvent::JoinedRoom { username, room } => {
                Frame::new(JOINED_ROOM, json!({ "username": username, "room": room }))
            }
            ClientEvent::SendMessage(body) => Frame::new(SEND_MESSAGE, Value::String(body)),
        }
    }
}

/// Events the client understands.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Message(ChatMessage),
    RoomUsers(Vec<Occupant>),
}

impl ServerEvent {
    /// Decode a frame. Unknown event names yield `Ok(None)`.
    pub fn decode(frame: Frame) -> Result<Option<Self>, ChannelError> {
        let Frame { event, payload } = frame;
        let malformed = |e: serde_json::Error| ChannelError::MalformedPayload {
            event: event.clone(),
            reason: e.to_string(),
        };
        match event.as_str() {
            MESSAGE => serde_json::from_value(payload)
                .map(|m| Some(ServerEvent::Message(m)))
                .map_err(malformed),
            ROOM_USERS => serde_json::from_value(payload)
                .map(|list| Some(ServerEvent::RoomUsers(list)))
                .map_err(malformed),
            _ => Ok(None),
        }
    }
}

// ── Adapter ─────────────────────────────────────────────────────────

type MessageHandler = Box<dyn FnMut(ChatMessage) + Send>;
type RosterHandler = Box<dyn FnMut(Vec<Occupant>) + Send>;

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A known event was decoded and handed to every registered handler.
    Delivered,
    /// Malformed payload, dropped.
    Dropped,
    /// Event name the client does not handle.
    Ignored,
}

/// Owns one transport for the lifetime of one session.
///
/// Handlers accumulate: registering twice means both run. `release()` detaches
/// every handler and closes the transport; nothing is delivered afterwards.
pub struct LiveChannel<T: Transport> {
    transport: T,
    message_handlers: Vec<MessageHandler>,
    roster_handlers: Vec<RosterHandler>,
    announced: bool,
    released: bool,
    dropped: usize,
}

impl<T: Transport> LiveChannel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            message_handlers: Vec::new(),
            roster_handlers: Vec::new(),
            announced: false,
            released: false,
            dropped: 0,
        }
    }

    pub fn on_message(&mut self, handler: impl FnMut(ChatMessage) + Send + 'static) {
        self.message_handlers.push(Box::new(handler));
    }

    pub fn on_roster_update(&mut self, handler: impl FnMut(Vec<Occupant>) + Send + 'static) {
        self.roster_handlers.push(Box::new(handler));
    }

    /// Emit `joined_room`. Once per channel; register handlers first so an
    /// immediate reply has somewhere to go.
    pub async fn announce_join(&mut self, username: &str, room: &str) -> Result<(), ChannelError> {
        if self.released {
            return Err(ChannelError::Released);
        }
        if self.announced {
            return Err(ChannelError::AlreadyAnnounced);
        }
        if self.message_handlers.is_empty() && self.roster_handlers.is_empty() {
            warn!(%room, "announcing join with no handlers registered");
        }
        let event = ClientEvent::JoinedRoom {
            username: username.to_string(),
            room: room.to_string(),
        };
        self.transport.emit(event.into_frame()).await?;
        self.announced = true;
        info!(%username, %room, "join announced");
        Ok(())
    }

    /// Emit `send_message` with `body` as-is. There is no local echo.
    pub async fn send(&mut self, body: &str) -> Result<(), ChannelError> {
        if self.released {
            return Err(ChannelError::Released);
        }
        self.transport
            .emit(ClientEvent::SendMessage(body.to_string()).into_frame())
            .await
    }

    /// Wait for one inbound frame and deliver it.
    ///
    /// Returns `None` after release or once the transport has ended.
    pub async fn dispatch_next(&mut self) -> Option<Dispatch> {
        if self.released {
            return None;
        }
        let frame = self.transport.next_frame().await?;
        if self.released {
            return None;
        }
        let event_name = frame.event.clone();
        match ServerEvent::decode(frame) {
            Ok(Some(ServerEvent::Message(msg))) => {
                debug!(author = %msg.author, "message received");
                for handler in &mut self.message_handlers {
                    handler(msg.clone());
                }
                Some(Dispatch::Delivered)
            }
            Ok(Some(ServerEvent::RoomUsers(list))) => {
                debug!(count = list.len(), "roster update received");
                for handler in &mut self.roster_handlers {
                    handler(list.clone());
                }
                Some(Dispatch::Delivered)
            }
            Ok(None) => {
                debug!(event = %event_name, "ignoring unhandled event");
                Some(Dispatch::Ignored)
            }
            Err(e) => {
                self.dropped += 1;
                warn!(error = %e, "dropping inbound event");
                Some(Dispatch::Dropped)
            }
        }
    }

    /// Detach all handlers and close the transport. Safe to call repeatedly.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.message_handlers.clear();
        self.roster_handlers.clear();
        self.transport.close().await;
        info!(dropped = self.dropped, "channel released");
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Inbound events discarded because their payload did not decode.
    pub fn dropped_events(&self) -> usize {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::test_support::memory_transport;

    #[test]
    fn test_client_event_frames() {
        let join = ClientEvent::JoinedRoom {
            username: "alice".into(),
            room: "lobby".into(),
        }
        .into_frame();
        assert_eq!(join.event, JOINED_ROOM);
        assert_eq!(join.payload, json!({ "username": "alice", "room": "lobby" }));

        let send = ClientEvent::SendMessage("  hi  ".into()).into_frame();
        assert_eq!(send, Frame::new(SEND_MESSAGE, json!("  hi  ")));
    }

    #[test]
    fn test_decode_server_events() {
        let msg = ServerEvent::decode(Frame::new(
            MESSAGE,
            json!({ "username": "bob", "message": "yo", "sent_at": "2024-01-01T00:00:00Z" }),
        ))
        .unwrap();
        assert!(matches!(msg, Some(ServerEvent::Message(m)) if m.author == "bob" && m.body == "yo"));

        let users = ServerEvent::decode(Frame::new(ROOM_USERS, json!([{ "id": 1 }]))).unwrap();
        assert!(matches!(users, Some(ServerEvent::RoomUsers(list)) if list.len() == 1));

        assert_eq!(ServerEvent::decode(Frame::new("typing", json!({}))).unwrap(), None);
    }

    #[test]
    fn test_decode_malformed_payload() {
        let err = ServerEvent::decode(Frame::new(MESSAGE, json!("just text"))).unwrap_err();
        assert!(matches!(err, ChannelError::MalformedPayload { event, .. } if event == MESSAGE));
    }

    #[tokio::test]
    async fn test_handlers_accumulate() {
        let (transport, remote) = memory_transport();
        let mut channel = LiveChannel::new(transport);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            channel.on_message(move |m| seen.lock().unwrap().push(format!("{tag}:{}", m.body)));
        }

        remote.push_message("bob", "hi", "2024-01-01T00:00:00Z");
        assert_eq!(channel.dispatch_next().await, Some(Dispatch::Delivered));
        assert_eq!(*seen.lock().unwrap(), vec!["first:hi", "second:hi"]);
    }

    #[tokio::test]
    async fn test_malformed_event_is_dropped_not_fatal() {
        let (transport, remote) = memory_transport();
        let mut channel = LiveChannel::new(transport);
        let count = Arc::new(Mutex::new(0usize));
        let c = count.clone();
        channel.on_roster_update(move |list| *c.lock().unwrap() += list.len());

        remote.push(ROOM_USERS, json!([{ "username": "no-id" }]));
        remote.push(ROOM_USERS, json!([{ "id": 1 }, { "id": 2 }]));

        assert_eq!(channel.dispatch_next().await, Some(Dispatch::Dropped));
        assert_eq!(channel.dispatch_next().await, Some(Dispatch::Delivered));
        assert_eq!(*count.lock().unwrap(), 2);
        assert_eq!(channel.dropped_events(), 1);
    }

    #[tokio::test]
    async fn test_unknown_event_ignored() {
        let (transport, remote) = memory_transport();
        let mut channel = LiveChannel::new(transport);
        remote.push("typing", json!({ "username": "bob" }));
        assert_eq!(channel.dispatch_next().await, Some(Dispatch::Ignored));
        assert_eq!(channel.dropped_events(), 0);
    }

    #[tokio::test]
    async fn test_announce_join_once() {
        let (transport, mut remote) = memory_transport();
        let mut channel = LiveChannel::new(transport);
        channel.on_message(|_| {});

        channel.announce_join("alice", "lobby").await.unwrap();
        assert_eq!(
            channel.announce_join("alice", "lobby").await,
            Err(ChannelError::AlreadyAnnounced)
        );

        let sent = remote.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, JOINED_ROOM);
    }

    #[tokio::test]
    async fn test_send_forwards_body_unmodified() {
        let (transport, mut remote) = memory_transport();
        let mut channel = LiveChannel::new(transport);
        channel.send("  hello world ").await.unwrap();
        assert_eq!(remote.sent(), vec![Frame::new(SEND_MESSAGE, json!("  hello world "))]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (transport, remote) = memory_transport();
        let mut channel = LiveChannel::new(transport);
        channel.on_message(|_| panic!("handler must not run after release"));

        channel.release().await;
        channel.release().await;

        assert!(channel.is_released());
        assert!(remote.is_closed());
        remote.push_message("bob", "late", "2024-01-01T00:00:00Z");
        assert_eq!(channel.dispatch_next().await, None);
        assert_eq!(channel.send("x").await, Err(ChannelError::Released));
        assert_eq!(
            channel.announce_join("alice", "lobby").await,
            Err(ChannelError::Released)
        );
    }

    #[tokio::test]
    async fn test_transport_end_yields_none() {
        let (transport, remote) = memory_transport();
        let mut channel = LiveChannel::new(transport);
        remote.hang_up();
        assert_eq!(channel.dispatch_next().await, None);
    }
}

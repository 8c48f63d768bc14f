//! In-memory collaborators for exercising a session without a network.
//!
//! - [`memory_transport`] returns a [`MemoryTransport`] to hand to a session
//!   and a [`RemoteEnd`] that plays the server: it injects inbound frames and
//!   observes what the session emitted.
//! - [`StaticHistory`] answers every history request with a fixed result.
//! - [`PendingHistory`] holds the request open until its [`HistoryGate`] is
//!   resolved, for exercising leave-while-loading.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::channel::{Frame, MESSAGE, ROOM_USERS, Transport};
use crate::error::{ChannelError, HistoryError};
use crate::history::HistorySource;
use crate::model::ChatMessage;

// ── Transport ───────────────────────────────────────────────────────

/// Session side of an in-memory channel.
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
}

/// Server side of an in-memory channel.
pub struct RemoteEnd {
    inbound: mpsc::UnboundedSender<Frame>,
    outbound: mpsc::UnboundedReceiver<Frame>,
    closed: Arc<AtomicBool>,
}

pub fn memory_transport() -> (MemoryTransport, RemoteEnd) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        MemoryTransport {
            inbound: in_rx,
            outbound: out_tx,
            closed: closed.clone(),
        },
        RemoteEnd {
            inbound: in_tx,
            outbound: out_rx,
            closed,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn emit(&mut self, frame: Frame) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.outbound.send(frame).map_err(|_| ChannelError::Closed)
    }

    async fn next_frame(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.inbound.close();
    }
}

impl RemoteEnd {
    /// Queue an inbound frame. Returns false once the session side has closed.
    pub fn push(&self, event: &str, payload: Value) -> bool {
        self.inbound.send(Frame::new(event, payload)).is_ok()
    }

    /// Queue a live `message` event in its wire shape.
    pub fn push_message(&self, username: &str, message: &str, sent_at: &str) -> bool {
        self.push(
            MESSAGE,
            json!({ "username": username, "message": message, "sent_at": sent_at }),
        )
    }

    pub fn push_room_users(&self, users: Value) -> bool {
        self.push(ROOM_USERS, users)
    }

    /// Drain every frame the session has emitted so far.
    pub fn sent(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop the server side; the session sees the transport end.
    pub fn hang_up(self) {}
}

// ── History sources ─────────────────────────────────────────────────

/// Answers every request with the same result and counts calls.
pub struct StaticHistory {
    result: Result<Vec<ChatMessage>, HistoryError>,
    calls: AtomicUsize,
}

impl StaticHistory {
    pub fn ok(messages: Vec<ChatMessage>) -> Self {
        Self {
            result: Ok(messages),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn err(error: HistoryError) -> Self {
        Self {
            result: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl HistorySource for StaticHistory {
    async fn load_history(&self, _room: &str) -> Result<Vec<ChatMessage>, HistoryError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        self.result.clone()
    }
}

/// A history request that stays in flight until the gate is resolved.
pub struct PendingHistory {
    rx: Mutex<Option<oneshot::Receiver<Result<Vec<ChatMessage>, HistoryError>>>>,
}

/// Completes the matching [`PendingHistory`] request.
pub struct HistoryGate {
    tx: oneshot::Sender<Result<Vec<ChatMessage>, HistoryError>>,
}

impl PendingHistory {
    pub fn new() -> (Self, HistoryGate) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            HistoryGate { tx },
        )
    }
}

impl HistoryGate {
    /// Deliver the result. Returns false if the request was already abandoned.
    pub fn resolve(self, result: Result<Vec<ChatMessage>, HistoryError>) -> bool {
        self.tx.send(result).is_ok()
    }
}

#[async_trait]
impl HistorySource for PendingHistory {
    async fn load_history(&self, _room: &str) -> Result<Vec<ChatMessage>, HistoryError> {
        let rx = self.rx.lock().await.take();
        match rx {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(HistoryError::Transport("history gate dropped".into()))),
            None => Err(HistoryError::Transport("history already requested".into())),
        }
    }
}

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{LiveChannel, Transport};
use crate::error::{HistoryError, SessionError};
use crate::history::HistorySource;
use crate::model::{ChatMessage, Occupant, Roster, append_messages, merge_roster};

/// Unique identifier for one mounted room session (log correlation only).
pub type SessionId = Uuid;

/// Lifecycle of a session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Initializing,
    Active,
    Closed,
}

/// What to do when history fails for a reason other than authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryPolicy {
    /// Join anyway with an empty timeline.
    #[default]
    Lenient,
    /// Refuse to join.
    Strict,
}

/// Signals for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// Identity may not view the room; navigate away. Sent at most once.
    Redirect,
    /// The session reached `Closed`. Sent at most once.
    Closed,
    /// History could not be loaded; the session continued without it.
    HistoryUnavailable(HistoryError),
}

/// Read-only view of a session, republished after every mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomSnapshot {
    pub state: SessionState,
    pub timeline: Vec<ChatMessage>,
    pub roster: Roster,
}

/// Unmount signal that can fire from outside the session, including while
/// `start()` is still waiting on history.
#[derive(Debug, Clone)]
pub struct LeaveHandle {
    token: CancellationToken,
}

impl LeaveHandle {
    pub fn leave(&self) {
        self.token.cancel();
    }
}

/// Live updates forwarded from channel handlers into the controller.
enum LiveUpdate {
    Message(ChatMessage),
    Roster(Vec<Occupant>),
}

/// Controller for one `(room, username)` session.
///
/// All mutation happens on the task that drives it; channel handlers only
/// forward into an internal queue that is drained after each dispatch.
///
/// Call [`leave`](Self::leave) (or fire a [`LeaveHandle`] and drive the
/// session once more) before dropping it. Dropping an open session skips
/// `Transport::close()`; the transport is only dropped, so any graceful
/// shutdown it needs never runs.
pub struct RoomSession<H, T: Transport> {
    id: SessionId,
    room: String,
    username: String,
    policy: HistoryPolicy,
    state: SessionState,
    history: H,
    channel: LiveChannel<T>,
    timeline: Vec<ChatMessage>,
    roster: Roster,
    live_tx: mpsc::UnboundedSender<LiveUpdate>,
    live_rx: mpsc::UnboundedReceiver<LiveUpdate>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    snapshot: watch::Sender<RoomSnapshot>,
    cancel: CancellationToken,
}

impl<H: HistorySource, T: Transport> RoomSession<H, T> {
    /// Create a session in `Initializing`. The transport is owned exclusively
    /// by this session and closed when it ends.
    pub fn new(
        room: impl Into<String>,
        username: impl Into<String>,
        history: H,
        transport: T,
        policy: HistoryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SessionNotice>) {
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(RoomSnapshot::default());

        let session = Self {
            id: Uuid::new_v4(),
            room: room.into(),
            username: username.into(),
            policy,
            state: SessionState::Initializing,
            history,
            channel: LiveChannel::new(transport),
            timeline: Vec::new(),
            roster: Roster::new(),
            live_tx,
            live_rx,
            notices: notice_tx,
            snapshot,
            cancel: CancellationToken::new(),
        };
        (session, notice_rx)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Load history, subscribe to live events, then announce the join.
    ///
    /// `Unauthorized` closes the session and emits one `Redirect`. Other
    /// history failures follow the session's [`HistoryPolicy`]. A leave that
    /// fires while history is loading wins; the late result is discarded.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Closed => return Err(SessionError::SessionClosed),
            SessionState::Active => return Err(SessionError::AlreadyStarted),
            SessionState::Initializing => {}
        }

        info!(session = %self.id, room = %self.room, username = %self.username, "starting room session");

        let loaded = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.history.load_history(&self.room) => Some(result),
        };

        let Some(result) = loaded.filter(|_| !self.cancel.is_cancelled()) else {
            debug!(session = %self.id, "left while history was loading");
            self.close().await;
            return Err(SessionError::SessionClosed);
        };

        let initial = match result {
            Ok(messages) => messages,
            Err(e) if e.is_fatal() => {
                warn!(session = %self.id, room = %self.room, error = %e, "not authorized for room, redirecting");
                self.notify(SessionNotice::Redirect);
                self.close().await;
                return Err(SessionError::Unauthorized);
            }
            Err(e) if self.policy == HistoryPolicy::Strict => {
                warn!(session = %self.id, error = %e, "history unavailable, refusing to join");
                self.close().await;
                return Err(SessionError::History(e));
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "history unavailable, joining with empty timeline");
                self.notify(SessionNotice::HistoryUnavailable(e));
                Vec::new()
            }
        };

        self.timeline = append_messages(std::mem::take(&mut self.timeline), initial);
        self.subscribe_live();
        self.state = SessionState::Active;
        self.publish();

        if let Err(e) = self.channel.announce_join(&self.username, &self.room).await {
            warn!(session = %self.id, error = %e, "failed to announce join");
            self.close().await;
            return Err(e.into());
        }

        info!(session = %self.id, history = self.timeline.len(), "room session active");
        Ok(())
    }

    /// Wait for one inbound event and apply it.
    ///
    /// Returns `Ok(false)` once the session is closed, whether by leave or
    /// because the transport went away.
    pub async fn process_next(&mut self) -> Result<bool, SessionError> {
        match self.state {
            SessionState::Initializing => return Err(SessionError::NotStarted),
            SessionState::Closed => return Ok(false),
            SessionState::Active => {}
        }

        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            dispatched = self.channel.dispatch_next() => Some(dispatched),
        };

        match next {
            None => {
                self.close().await;
                Ok(false)
            }
            Some(None) => {
                warn!(session = %self.id, "channel disconnected");
                self.close().await;
                Ok(false)
            }
            Some(Some(_)) => {
                self.apply_live_updates();
                Ok(true)
            }
        }
    }

    /// Drive the session until it closes.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        while self.process_next().await? {}
        Ok(())
    }

    /// Send a message. Whitespace-only text is silently dropped; anything
    /// else goes out unmodified. The message shows up in the timeline only
    /// when the server echoes it back.
    pub async fn send(&mut self, text: &str) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            self.close().await;
        }
        match self.state {
            SessionState::Closed => return Err(SessionError::SessionClosed),
            SessionState::Initializing => return Err(SessionError::NotStarted),
            SessionState::Active => {}
        }
        if text.trim().is_empty() {
            debug!(session = %self.id, "dropping empty message");
            return Ok(());
        }
        self.channel.send(text).await?;
        Ok(())
    }

    /// End the session. Releases the channel once; later calls do nothing.
    pub async fn leave(&mut self) {
        self.cancel.cancel();
        self.close().await;
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn timeline(&self) -> &[ChatMessage] {
        &self.timeline
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn leave_handle(&self) -> LeaveHandle {
        LeaveHandle {
            token: self.cancel.clone(),
        }
    }

    /// Inbound events the channel discarded as malformed.
    pub fn dropped_events(&self) -> usize {
        self.channel.dropped_events()
    }

    // ── Internals ───────────────────────────────────────────────────

    fn subscribe_live(&mut self) {
        let tx = self.live_tx.clone();
        self.channel.on_message(move |msg| {
            let _ = tx.send(LiveUpdate::Message(msg));
        });
        let tx = self.live_tx.clone();
        self.channel.on_roster_update(move |list| {
            let _ = tx.send(LiveUpdate::Roster(list));
        });
    }

    fn apply_live_updates(&mut self) {
        let mut changed = false;
        while let Ok(update) = self.live_rx.try_recv() {
            match update {
                LiveUpdate::Message(msg) => {
                    self.timeline = append_messages(std::mem::take(&mut self.timeline), [msg]);
                }
                LiveUpdate::Roster(list) => {
                    self.roster = merge_roster(std::mem::take(&mut self.roster), &list);
                }
            }
            changed = true;
        }
        if changed {
            self.publish();
        }
    }

    async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.channel.release().await;
        while self.live_rx.try_recv().is_ok() {}
        self.publish();
        self.notify(SessionNotice::Closed);
        info!(session = %self.id, room = %self.room, "room session closed");
    }

    fn publish(&self) {
        self.snapshot.send_replace(RoomSnapshot {
            state: self.state,
            timeline: self.timeline.clone(),
            roster: self.roster.clone(),
        });
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }
}

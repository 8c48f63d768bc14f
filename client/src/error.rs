use thiserror::Error;

/// Why the historical fetch for a room did not produce a timeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    /// The server answered 403: the current identity may not view this room.
    #[error("not authorized to view this room")]
    Unauthorized,

    /// Any other non-success HTTP status.
    #[error("history fetch failed with status {0}")]
    Fetch(u16),

    /// The body was not an array of messages.
    #[error("history body could not be decoded: {0}")]
    Decode(String),

    /// The request never produced a status (connection refused, timeout, ...).
    #[error("history request failed: {0}")]
    Transport(String),
}

impl HistoryError {
    /// Only `Unauthorized` ends a session; everything else degrades to an empty history.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HistoryError::Unauthorized)
    }
}

/// Errors raised by the live channel adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel has been released")]
    Released,

    #[error("join already announced for this session")]
    AlreadyAnnounced,

    /// The underlying transport refused the frame (connection gone).
    #[error("transport closed")]
    Closed,

    #[error("malformed {event} payload: {reason}")]
    MalformedPayload { event: String, reason: String },
}

/// Errors that cross from the session controller to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session has reached `Closed`; it cannot send or be restarted.
    #[error("session is closed")]
    SessionClosed,

    #[error("not authorized to join this room")]
    Unauthorized,

    #[error("session has not been started")]
    NotStarted,

    #[error("session already started")]
    AlreadyStarted,

    /// History failure under the strict policy.
    #[error(transparent)]
    History(HistoryError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

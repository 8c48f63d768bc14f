use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::HistoryError;
use crate::model::ChatMessage;

/// Placeholder substituted with the encoded room name in a history path.
pub const ROOM_PLACEHOLDER: &str = "{room}";

/// Default history path, relative to the server base URL.
pub const DEFAULT_HISTORY_PATH: &str = "/chat/{room}";

/// One-shot source of a room's message history.
///
/// Implementations perform a single request per call and never retry. They
/// must not touch session state; the controller applies the result.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn load_history(&self, room: &str) -> Result<Vec<ChatMessage>, HistoryError>;
}

/// Classify a history response by status, then decode the body.
///
/// 403 is the distinguished authorization failure; any other non-2xx is a
/// generic fetch failure carrying its status.
pub fn classify_response(status: u16, body: &[u8]) -> Result<Vec<ChatMessage>, HistoryError> {
    if status == 403 {
        return Err(HistoryError::Unauthorized);
    }
    if !(200..300).contains(&status) {
        return Err(HistoryError::Fetch(status));
    }
    serde_json::from_slice(body).map_err(|e| HistoryError::Decode(e.to_string()))
}

/// Build the history URL for `room`: base URL + path template, room percent-encoded.
pub fn history_url(base_url: &str, path_template: &str, room: &str) -> String {
    let path = path_template.replace(ROOM_PLACEHOLDER, &urlencoding::encode(room));
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// History loader backed by a plain HTTP `GET`.
#[derive(Debug, Clone)]
pub struct HttpHistoryLoader {
    client: reqwest::Client,
    base_url: String,
    path_template: String,
}

impl HttpHistoryLoader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            path_template: DEFAULT_HISTORY_PATH.to_string(),
        }
    }

    #[must_use]
    pub fn with_path_template(mut self, template: impl Into<String>) -> Self {
        self.path_template = template.into();
        self
    }

    /// Bound each request. Without this the fetch may wait indefinitely.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        self
    }

    pub fn url_for(&self, room: &str) -> String {
        history_url(&self.base_url, &self.path_template, room)
    }
}

#[async_trait]
impl HistorySource for HttpHistoryLoader {
    async fn load_history(&self, room: &str) -> Result<Vec<ChatMessage>, HistoryError> {
        let url = self.url_for(room);
        debug!(%room, %url, "fetching room history");

        let resp = self.client.get(&url).send().await.map_err(|e| {
            warn!(%room, error = %e, "history request failed");
            HistoryError::Transport(e.to_string())
        })?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| HistoryError::Transport(e.to_string()))?;

        let result = classify_response(status, &body);
        match &result {
            Ok(messages) => debug!(%room, count = messages.len(), "history loaded"),
            Err(e) => warn!(%room, status, error = %e, "history unavailable"),
        }
        result
    }
}

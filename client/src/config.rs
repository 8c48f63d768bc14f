use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::history::{DEFAULT_HISTORY_PATH, HttpHistoryLoader};
use crate::session::HistoryPolicy;

/// Top-level client configuration, loaded from roomchat.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerSection,
    pub session: SessionSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Base URL of the chat server (history and live channel share it).
    pub url: String,
    /// History resource path; `{room}` is replaced by the encoded room name.
    pub history_path: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000".into(),
            history_path: DEFAULT_HISTORY_PATH.into(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SessionSection {
    pub history_policy: HistoryPolicy,
    /// Per-request timeout for the history fetch. Unset means wait forever.
    pub request_timeout_secs: Option<u64>,
}

impl ClientConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            Self::parse(&contents).with_context(|| format!("failed to parse config file {path}"))?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROOMCHAT_SERVER_URL") {
            self.server.url = v;
        }
        if let Some(v) = var("ROOMCHAT_HISTORY_PATH") {
            self.server.history_path = v;
        }
        if let Some(v) = var("ROOMCHAT_HISTORY_POLICY") {
            match v.to_ascii_lowercase().as_str() {
                "strict" => self.session.history_policy = HistoryPolicy::Strict,
                "lenient" => self.session.history_policy = HistoryPolicy::Lenient,
                _ => {}
            }
        }
        if let Some(v) = var("ROOMCHAT_REQUEST_TIMEOUT_SECS")
            && let Ok(secs) = v.parse()
        {
            self.session.request_timeout_secs = Some(secs);
        }
    }

    /// Build the HTTP history loader described by this config.
    pub fn history_loader(&self) -> HttpHistoryLoader {
        let loader = HttpHistoryLoader::new(self.server.url.clone())
            .with_path_template(self.server.history_path.clone());
        match self.session.request_timeout_secs {
            Some(secs) => loader.with_timeout(Duration::from_secs(secs)),
            None => loader,
        }
    }
}

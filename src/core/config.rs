//! Client configuration

use std::path::Path;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::{Disposition, Protocols, Scope, ShareMode};

/// Defaults applied when opening contexts and sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Scope requested when establishing a context
    pub scope: Scope,

    /// Sharing mode for card connections
    pub share_mode: ShareMode,

    /// Preferred protocols for card communication
    pub protocols: Protocols,

    /// What to do with the card when a session ends
    pub disposition: Disposition,

    /// Per-round wait used by reader monitoring
    pub poll_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scope: Scope::User,
            share_mode: ShareMode::Shared,
            protocols: Protocols::ANY,
            disposition: Disposition::Leave,
            poll_timeout_ms: 1000,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse client configuration")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub const fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub const fn with_share_mode(mut self, mode: ShareMode) -> Self {
        self.share_mode = mode;
        self
    }

    pub const fn with_protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = protocols;
        self
    }

    pub const fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    pub const fn with_poll_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.poll_timeout_ms = timeout_ms;
        self
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

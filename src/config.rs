use crate::coordinator::DEFAULT_THROTTLE;
use crate::error::ChatError;
use crate::model::ChatOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// client settings; every field has a default so a partial document works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatClientConfig {
    /// service root; `/chat` and `/chat/stream` are appended.
    pub base_url: String,
    /// use the streaming entry point.
    pub stream: bool,
    /// minimum spacing between visible updates while streaming.
    pub throttle_ms: u64,
    pub options: ChatOptions,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            stream: true,
            throttle_ms: DEFAULT_THROTTLE.as_millis() as u64,
            options: ChatOptions::default(),
        }
    }
}

impl ChatClientConfig {
    pub fn from_json(text: &str) -> Result<Self, ChatError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

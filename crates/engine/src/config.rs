use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:3000";
pub const DEFAULT_CHAT_PATH: &str = "/api/chat";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const ENV_PREFIX: &str = "RILL_";

/// Engine-level connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            chat_path: default_chat_path(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Loads settings from defaults, an optional JSON file, and `RILL_*`
    /// environment variables, in that precedence order.
    pub fn load(path: &Path) -> Self {
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<Self>() {
            Ok(config) => config.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to load engine config, using defaults"
                );
                Self::default()
            }
        }
    }

    pub fn normalized(mut self) -> Self {
        self.endpoint = self.endpoint.trim().trim_end_matches('/').to_string();
        if self.endpoint.is_empty() {
            self.endpoint = default_endpoint();
        }

        self.chat_path = self.chat_path.trim().to_string();
        if self.chat_path.is_empty() {
            self.chat_path = default_chat_path();
        }
        if !self.chat_path.starts_with('/') {
            self.chat_path.insert(0, '/');
        }

        if self.connect_timeout_ms == 0 {
            self.connect_timeout_ms = default_connect_timeout_ms();
        }

        self
    }

    pub fn chat_url(&self) -> String {
        format!("{}{}", self.endpoint, self.chat_path)
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_chat_path() -> String {
    DEFAULT_CHAT_PATH.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

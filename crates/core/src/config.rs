use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::relay::{
    DEFAULT_CHANNEL_DEPTH, DEFAULT_CHUNK_BYTES, DEFAULT_CHUNK_TIMEOUT_SECS, RelayOptions,
};
use crate::upstream::telegram_mtproto::TelegramMtProtoConfig;
use crate::{Error, Result};

pub const MIN_CHUNK_BYTES: u32 = 64 * 1024;
pub const MAX_CHUNK_BYTES: u32 = 64 * 1024 * 1024;
pub const DEFAULT_PORT: u16 = 5000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: Server,
    pub telegram: Telegram,
    pub relay: Relay,
    pub log: Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub listen: String,
    pub auth_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Telegram {
    pub api_id: i32,
    pub api_hash: String,
    pub bot_token: String,
    /// Base64 of a saved MTProto session.
    pub session: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Relay {
    pub chunk_bytes: u32,
    pub chunk_timeout_secs: u64,
    pub channel_depth: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Log {
    pub format: LogFormat,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{DEFAULT_PORT}"),
            auth_token: String::new(),
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES as u32,
            chunk_timeout_secs: DEFAULT_CHUNK_TIMEOUT_SECS,
            channel_depth: DEFAULT_CHANNEL_DEPTH,
        }
    }
}

impl Settings {
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            chunk_bytes: self.relay.chunk_bytes as usize,
            chunk_timeout: Duration::from_secs(self.relay.chunk_timeout_secs),
            channel_depth: self.relay.channel_depth,
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .trim()
            .parse()
            .map_err(|e| Error::InvalidConfig {
                message: format!("server.listen is not a socket address ({e}): {}", self.server.listen),
            })
    }

    /// Credentials for the MTProto session, or the reason they are unusable.
    ///
    /// Missing credentials are not a startup error: the gateway still serves and reports
    /// the session as unavailable.
    pub fn mtproto_config(&self) -> std::result::Result<TelegramMtProtoConfig, String> {
        let t = &self.telegram;
        if t.api_id <= 0 || t.api_hash.trim().is_empty() {
            return Err("telegram.api_id / telegram.api_hash are not configured".to_string());
        }

        let session = match t.session.trim() {
            "" => None,
            b64 => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(b64.as_bytes())
                    .map_err(|e| format!("telegram.session is not valid base64: {e}"))?,
            ),
        };
        let bot_token = Some(t.bot_token.trim().to_string()).filter(|s| !s.is_empty());

        if session.is_none() && bot_token.is_none() {
            return Err("neither telegram.session nor telegram.bot_token is configured".to_string());
        }

        Ok(TelegramMtProtoConfig {
            api_id: t.api_id,
            api_hash: t.api_hash.trim().to_string(),
            bot_token,
            session,
        })
    }
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    toml::from_str(text)
}

/// Reads the optional config file, then layers environment overrides on top.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let mut settings = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| Error::ConfigFile {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            parse_settings(&text).map_err(|e| Error::ConfigFile {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        }
        None => Settings::default(),
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
    Ok(settings)
}

pub fn apply_env_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = var("SECRET_AUTH_TOKEN") {
        settings.server.auth_token = v;
    }
    if let Some(v) = var("PORT") {
        let port: u16 = v.trim().parse().map_err(|_| Error::InvalidConfig {
            message: format!("PORT is not a port number: {v}"),
        })?;
        settings.server.listen = format!("0.0.0.0:{port}");
    }
    if let Some(v) = var("TGRELAY_LISTEN") {
        settings.server.listen = v;
    }
    if let Some(v) = var("API_ID") {
        settings.telegram.api_id = v.trim().parse().map_err(|_| Error::InvalidConfig {
            message: format!("API_ID is not an integer: {v}"),
        })?;
    }
    if let Some(v) = var("API_HASH") {
        settings.telegram.api_hash = v;
    }
    if let Some(v) = var("BOT_TOKEN") {
        settings.telegram.bot_token = v;
    }
    if let Some(v) = var("TGRELAY_SESSION") {
        settings.telegram.session = v;
    }
    if let Some(v) = var("TGRELAY_LOG_FORMAT") {
        settings.log.format = match v.trim().to_ascii_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                return Err(Error::InvalidConfig {
                    message: format!("TGRELAY_LOG_FORMAT must be \"text\" or \"json\" (got {other})"),
                });
            }
        };
    }
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.server.auth_token.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "server.auth_token (SECRET_AUTH_TOKEN) must be set".to_string(),
        });
    }

    settings.listen_addr()?;

    let chunk = settings.relay.chunk_bytes;
    if !(MIN_CHUNK_BYTES..=MAX_CHUNK_BYTES).contains(&chunk) {
        return Err(Error::InvalidConfig {
            message: format!(
                "relay.chunk_bytes must be within {MIN_CHUNK_BYTES}..={MAX_CHUNK_BYTES} (got {chunk})"
            ),
        });
    }
    if settings.relay.chunk_timeout_secs == 0 {
        return Err(Error::InvalidConfig {
            message: "relay.chunk_timeout_secs must be >= 1".to_string(),
        });
    }
    if settings.relay.channel_depth == 0 {
        return Err(Error::InvalidConfig {
            message: "relay.channel_depth must be >= 1".to_string(),
        });
    }

    Ok(())
}

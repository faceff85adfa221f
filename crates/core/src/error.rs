use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("config file unreadable: {path:?}: {message}")]
    ConfigFile { path: PathBuf, message: String },

    #[error("telegram session error: {message}")]
    Telegram { message: String },

    /// Setup that cannot succeed without a configuration change.
    #[error("telegram session setup error: {message}")]
    SessionSetup { message: String },
}

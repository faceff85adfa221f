pub mod auth;
pub mod config;
mod error;
pub mod link;
pub mod locator;
pub mod log;
pub mod range;
pub mod relay;
pub mod session;
pub mod upstream;

pub const APP_NAME: &str = "tgrelay";

pub use auth::AccessToken;
pub use error::{Error, Result};
pub use link::{ChatIdentifier, MediaReference, ParseError, resolve};
pub use locator::{LocateError, MediaDescriptor, locate};
pub use range::{ByteRange, Negotiated, RangeError, negotiate};
pub use relay::{ByteSink, RelayOptions, SinkClosed, StreamError, StreamSession, stream};
pub use session::{SessionSlot, SessionStatus, SessionUnavailable, connect_with_backoff};
pub use upstream::telegram_mtproto::{TelegramMtProtoConfig, TelegramMtProtoSession};
pub use upstream::{
    ContentHandle, InMemoryUpstream, UpstreamError, UpstreamMedia, UpstreamMessage,
    UpstreamSession,
};

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::link::ChatIdentifier;

pub mod telegram_mtproto;

/// Opaque reference to one remote media object.
///
/// Only the session that issued a handle can read through it. Handles live in memory for
/// the duration of a request and are never serialized; they may embed short-lived access
/// grants.
#[derive(Clone)]
pub struct ContentHandle(Arc<dyn Any + Send + Sync>);

impl ContentHandle {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for ContentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentHandle(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamMedia {
    pub handle: ContentHandle,
    pub size_bytes: u64,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpstreamMessage {
    pub media: Option<UpstreamMedia>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("access denied: {message}")]
    Forbidden { message: String },

    #[error("chat not found: {message}")]
    ChatNotFound { message: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("telegram rpc error {code} {name}")]
    Rpc { code: i32, name: String },

    #[error("content handle was not issued by {provider}")]
    ForeignHandle { provider: String },

    #[error("{message}")]
    Other { message: String },
}

/// Narrow contract the relay core needs from a connected messaging-platform session.
///
/// Implementations are shared by every in-flight request and must accept concurrent calls.
pub trait UpstreamSession: Send + Sync {
    fn provider(&self) -> &str;

    /// Fetches one message. `Ok(None)` means the platform returned no message for the id.
    fn fetch_message<'a>(
        &'a self,
        chat: &'a ChatIdentifier,
        message_id: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UpstreamMessage>, UpstreamError>> + Send + 'a>>;

    /// Reads up to `max_length` bytes starting at `offset`.
    ///
    /// Returning fewer bytes than requested is allowed; an empty result means there is
    /// nothing more to read at `offset`.
    fn read_media_chunk<'a>(
        &'a self,
        handle: &'a ContentHandle,
        offset: u64,
        max_length: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, UpstreamError>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
enum StoredMessage {
    Text,
    Media {
        bytes: Bytes,
        advertised_size: u64,
        file_name: Option<String>,
        mime_type: Option<String>,
    },
}

#[derive(Debug)]
struct MemoryObject {
    bytes: Bytes,
}

/// In-process session backed by a message table. Used by tests and local demos.
#[derive(Debug, Default)]
pub struct InMemoryUpstream {
    message_fetches: AtomicUsize,
    chunk_requests: AtomicUsize,
    messages: Mutex<HashMap<(ChatIdentifier, i32), StoredMessage>>,
    forbidden: Mutex<HashSet<ChatIdentifier>>,
    read_offsets: Mutex<Vec<u64>>,
    read_cap: Option<usize>,
    read_delay: Option<Duration>,
    fail_reads_from: Option<u64>,
}

impl InMemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps every chunk read at `cap` bytes, whatever the caller asked for.
    pub fn with_read_cap(mut self, cap: usize) -> Self {
        self.read_cap = Some(cap);
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Fails every chunk read whose offset is at or past `offset`.
    pub fn with_failing_reads_from(mut self, offset: u64) -> Self {
        self.fail_reads_from = Some(offset);
        self
    }

    pub async fn insert_media(
        &self,
        chat: ChatIdentifier,
        message_id: i32,
        bytes: impl Into<Bytes>,
        file_name: Option<&str>,
        mime_type: Option<&str>,
    ) {
        let bytes = bytes.into();
        let advertised_size = bytes.len() as u64;
        self.insert_media_with_size(chat, message_id, bytes, advertised_size, file_name, mime_type)
            .await;
    }

    /// Stores media whose declared size differs from the bytes actually available.
    pub async fn insert_media_with_size(
        &self,
        chat: ChatIdentifier,
        message_id: i32,
        bytes: impl Into<Bytes>,
        advertised_size: u64,
        file_name: Option<&str>,
        mime_type: Option<&str>,
    ) {
        self.messages.lock().await.insert(
            (chat, message_id),
            StoredMessage::Media {
                bytes: bytes.into(),
                advertised_size,
                file_name: file_name.map(str::to_string),
                mime_type: mime_type.map(str::to_string),
            },
        );
    }

    pub async fn insert_text(&self, chat: ChatIdentifier, message_id: i32) {
        self.messages
            .lock()
            .await
            .insert((chat, message_id), StoredMessage::Text);
    }

    pub async fn forbid(&self, chat: ChatIdentifier) {
        self.forbidden.lock().await.insert(chat);
    }

    pub async fn read_offsets(&self) -> Vec<u64> {
        self.read_offsets.lock().await.clone()
    }

    pub fn chunk_request_count(&self) -> usize {
        self.chunk_requests.load(Ordering::Relaxed)
    }

    pub fn message_fetch_count(&self) -> usize {
        self.message_fetches.load(Ordering::Relaxed)
    }
}

impl UpstreamSession for InMemoryUpstream {
    fn provider(&self) -> &str {
        "test.mem"
    }

    fn fetch_message<'a>(
        &'a self,
        chat: &'a ChatIdentifier,
        message_id: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UpstreamMessage>, UpstreamError>> + Send + 'a>>
    {
        Box::pin(async move {
            self.message_fetches.fetch_add(1, Ordering::Relaxed);

            if self.forbidden.lock().await.contains(chat) {
                return Err(UpstreamError::Forbidden {
                    message: format!("not a participant of {chat}"),
                });
            }

            let stored = self
                .messages
                .lock()
                .await
                .get(&(chat.clone(), message_id))
                .cloned();

            Ok(stored.map(|stored| UpstreamMessage {
                media: match stored {
                    StoredMessage::Text => None,
                    StoredMessage::Media {
                        bytes,
                        advertised_size,
                        file_name,
                        mime_type,
                    } => Some(UpstreamMedia {
                        handle: ContentHandle::new(MemoryObject { bytes }),
                        size_bytes: advertised_size,
                        file_name,
                        mime_type,
                    }),
                },
            }))
        })
    }

    fn read_media_chunk<'a>(
        &'a self,
        handle: &'a ContentHandle,
        offset: u64,
        max_length: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, UpstreamError>> + Send + 'a>> {
        Box::pin(async move {
            self.chunk_requests.fetch_add(1, Ordering::Relaxed);
            self.read_offsets.lock().await.push(offset);

            if let Some(delay) = self.read_delay {
                tokio::time::sleep(delay).await;
            }

            if let Some(from) = self.fail_reads_from
                && offset >= from
            {
                return Err(UpstreamError::Other {
                    message: format!("injected read failure at offset {offset}"),
                });
            }

            let object =
                handle
                    .downcast_ref::<MemoryObject>()
                    .ok_or_else(|| UpstreamError::ForeignHandle {
                        provider: self.provider().to_string(),
                    })?;

            let len = object.bytes.len() as u64;
            if offset >= len {
                return Ok(Bytes::new());
            }

            let mut want = max_length;
            if let Some(cap) = self.read_cap {
                want = want.min(cap);
            }
            let start = offset as usize;
            let end = (offset.saturating_add(want as u64)).min(len) as usize;
            Ok(object.bytes.slice(start..end))
        })
    }
}

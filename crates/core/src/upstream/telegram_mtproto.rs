use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use bytes::{Bytes, BytesMut};
use grammers_client::client::files::MAX_CHUNK_SIZE;
use grammers_client::grammers_tl_types as tl;
use grammers_client::session::defs::{PeerAuth, PeerId, PeerRef};
use grammers_client::session::storages::TlSession;
use grammers_client::types::{Media, Peer};
use grammers_client::{Client, InvocationError};
use grammers_mtsender::SenderPool;
use tokio::time::{Duration, timeout};

use super::{ContentHandle, UpstreamError, UpstreamMedia, UpstreamMessage, UpstreamSession};
use crate::link::{ChatIdentifier, PRIVATE_CHANNEL_ID_OFFSET};
use crate::{Error, Result};

const CONNECT_IS_AUTHORIZED_TIMEOUT_SECS: u64 = 120;
const CONNECT_BOT_SIGN_IN_TIMEOUT_SECS: u64 = 120;
const RESOLVE_CHAT_TIMEOUT_SECS: u64 = 60;
const GET_MESSAGE_TIMEOUT_SECS: u64 = 60;

const FORBIDDEN_RPC_ERRORS: &[&str] = &[
    "CHANNEL_PRIVATE",
    "CHANNEL_INVALID",
    "CHAT_FORBIDDEN",
    "CHAT_ADMIN_REQUIRED",
    "USER_NOT_PARTICIPANT",
];

const NOT_FOUND_RPC_ERRORS: &[&str] = &[
    "USERNAME_NOT_OCCUPIED",
    "USERNAME_INVALID",
    "MSG_ID_INVALID",
    "PEER_ID_INVALID",
];

#[derive(Debug, Clone)]
pub struct TelegramMtProtoConfig {
    pub api_id: i32,
    pub api_hash: String,
    pub bot_token: Option<String>,
    pub session: Option<Vec<u8>>,
}

/// Process-wide MTProto connection.
///
/// The grammers client multiplexes concurrent invocations over its sender pool, so one
/// instance serves every request. Resolved peers are cached for the life of the session.
pub struct TelegramMtProtoSession {
    client: Client,
    peers: RwLock<HashMap<ChatIdentifier, Peer>>,
}

impl TelegramMtProtoSession {
    pub async fn connect(config: TelegramMtProtoConfig) -> Result<Self> {
        let session = match config.session {
            Some(bytes) if !bytes.is_empty() => {
                TlSession::load(&bytes).map_err(|e| Error::SessionSetup {
                    message: format!("session load failed: {e}"),
                })?
            }
            _ => TlSession::new(),
        };
        let session = Arc::new(session);

        let pool = SenderPool::new(session, config.api_id);
        let client = Client::new(&pool);
        let SenderPool { runner, .. } = pool;
        tokio::spawn(runner.run());

        let authorized = timeout(
            Duration::from_secs(CONNECT_IS_AUTHORIZED_TIMEOUT_SECS),
            client.is_authorized(),
        )
        .await
        .map_err(|_| Error::Telegram {
            message: format!(
                "is_authorized timed out after {CONNECT_IS_AUTHORIZED_TIMEOUT_SECS}s (check network / MTProto reachability)"
            ),
        })?
        .map_err(|e| Error::Telegram {
            message: format!("is_authorized failed: {e}"),
        })?;

        if !authorized {
            let bot_token = config.bot_token.as_deref().ok_or_else(|| Error::SessionSetup {
                message: "session is not authorized and no bot token is configured".to_string(),
            })?;
            timeout(
                Duration::from_secs(CONNECT_BOT_SIGN_IN_TIMEOUT_SECS),
                client.bot_sign_in(bot_token, &config.api_hash),
            )
            .await
            .map_err(|_| Error::Telegram {
                message: format!(
                    "bot_sign_in timed out after {CONNECT_BOT_SIGN_IN_TIMEOUT_SECS}s (check network / MTProto reachability)"
                ),
            })?
            .map_err(|e| Error::Telegram {
                message: format!("bot_sign_in failed: {e}"),
            })?;
        }

        tracing::info!(
            event = "upstream.authorized",
            signed_in_as_bot = !authorized,
            "upstream.authorized"
        );

        Ok(Self {
            client,
            peers: RwLock::new(HashMap::new()),
        })
    }

    async fn resolve_chat(&self, chat: &ChatIdentifier) -> std::result::Result<Peer, UpstreamError> {
        if let Some(peer) = self.peers.read().ok().and_then(|p| p.get(chat).cloned()) {
            return Ok(peer);
        }

        let peer = timeout(
            Duration::from_secs(RESOLVE_CHAT_TIMEOUT_SECS),
            self.resolve_chat_uncached(chat),
        )
        .await
        .map_err(|_| UpstreamError::Timeout {
            operation: "resolve_chat",
            secs: RESOLVE_CHAT_TIMEOUT_SECS,
        })??;

        if let Ok(mut peers) = self.peers.write() {
            peers.insert(chat.clone(), peer.clone());
        }
        Ok(peer)
    }

    async fn resolve_chat_uncached(
        &self,
        chat: &ChatIdentifier,
    ) -> std::result::Result<Peer, UpstreamError> {
        match chat {
            ChatIdentifier::Username(username) => self
                .client
                .resolve_username(username)
                .await
                .map_err(|e| classify("resolve_username", e))?
                .ok_or_else(|| UpstreamError::ChatNotFound {
                    message: format!("@{username}"),
                }),
            ChatIdentifier::Channel(dialog_id) => {
                // Bot API style dialog id -> PeerRef with ambient authority (access_hash=0).
                let dialog_id = *dialog_id;
                let peer_ref = if dialog_id > 0 {
                    PeerRef {
                        id: PeerId::user(dialog_id),
                        auth: PeerAuth::default(),
                    }
                } else if dialog_id <= -(PRIVATE_CHANNEL_ID_OFFSET + 1) {
                    let bare = -dialog_id - PRIVATE_CHANNEL_ID_OFFSET;
                    PeerRef {
                        id: PeerId::channel(bare),
                        auth: PeerAuth::default(),
                    }
                } else {
                    PeerRef {
                        id: PeerId::chat(-dialog_id),
                        auth: PeerAuth::default(),
                    }
                };

                self.client
                    .resolve_peer(peer_ref)
                    .await
                    .map_err(|e| classify("resolve_peer", e))
            }
        }
    }
}

impl UpstreamSession for TelegramMtProtoSession {
    fn provider(&self) -> &str {
        "telegram.mtproto"
    }

    fn fetch_message<'a>(
        &'a self,
        chat: &'a ChatIdentifier,
        message_id: i32,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Option<UpstreamMessage>, UpstreamError>> + Send + 'a>>
    {
        Box::pin(async move {
            let peer = self.resolve_chat(chat).await?;

            let mut msgs = timeout(
                Duration::from_secs(GET_MESSAGE_TIMEOUT_SECS),
                self.client.get_messages_by_id(&peer, &[message_id]),
            )
            .await
            .map_err(|_| UpstreamError::Timeout {
                operation: "get_messages_by_id",
                secs: GET_MESSAGE_TIMEOUT_SECS,
            })?
            .map_err(|e| classify("get_messages_by_id", e))?;

            let Some(msg) = msgs.pop().flatten() else {
                return Ok(None);
            };

            Ok(Some(UpstreamMessage {
                media: msg.media().and_then(describe_media),
            }))
        })
    }

    fn read_media_chunk<'a>(
        &'a self,
        handle: &'a ContentHandle,
        offset: u64,
        max_length: usize,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Bytes, UpstreamError>> + Send + 'a>> {
        Box::pin(async move {
            let media =
                handle
                    .downcast_ref::<Media>()
                    .ok_or_else(|| UpstreamError::ForeignHandle {
                        provider: self.provider().to_string(),
                    })?;

            let chunk_size = MAX_CHUNK_SIZE as usize;
            let (skip, mut head) = chunk_grid_position(offset, chunk_size)?;

            let mut download = self
                .client
                .iter_download(media)
                .chunk_size(MAX_CHUNK_SIZE)
                .skip_chunks(skip);

            let mut out = BytesMut::with_capacity(max_length);
            while out.len() < max_length {
                let Some(part) = download
                    .next()
                    .await
                    .map_err(|e| classify("download next", e))?
                else {
                    break;
                };
                let last = part.len() < chunk_size;

                if head >= part.len() {
                    if last {
                        break;
                    }
                    head -= part.len();
                    continue;
                }

                let part = &part[head..];
                head = 0;
                let take = part.len().min(max_length - out.len());
                out.extend_from_slice(&part[..take]);

                if last {
                    break;
                }
            }

            Ok(out.freeze())
        })
    }
}

fn describe_media(media: Media) -> Option<UpstreamMedia> {
    let (size_bytes, file_name, mime_type) = {
        let Media::Document(doc) = &media else {
            return None;
        };
        let tl::enums::Document::Document(d) = doc.raw.document.as_ref()? else {
            return None;
        };

        let file_name = d.attributes.iter().find_map(|attr| match attr {
            tl::enums::DocumentAttribute::Filename(f) => Some(f.file_name.clone()),
            _ => None,
        });
        let mime_type = Some(d.mime_type.clone()).filter(|m| !m.trim().is_empty());
        (u64::try_from(d.size).ok()?, file_name, mime_type)
    };

    Some(UpstreamMedia {
        handle: ContentHandle::new(media),
        size_bytes,
        file_name,
        mime_type,
    })
}

/// upload.getFile only serves offsets on the chunk grid: returns the whole chunks to skip
/// and the bytes to drop from the head of the first one.
fn chunk_grid_position(
    offset: u64,
    chunk_size: usize,
) -> std::result::Result<(i32, usize), UpstreamError> {
    let chunk_size = chunk_size as u64;
    let skip = i32::try_from(offset / chunk_size).map_err(|_| UpstreamError::Other {
        message: format!("offset out of range: {offset}"),
    })?;
    Ok((skip, (offset % chunk_size) as usize))
}

fn classify(operation: &str, err: InvocationError) -> UpstreamError {
    match &err {
        InvocationError::Rpc(rpc) => classify_rpc(operation, rpc.code, &rpc.name),
        _ => UpstreamError::Other {
            message: format!("{operation} failed: {err}"),
        },
    }
}

fn classify_rpc(operation: &str, code: i32, name: &str) -> UpstreamError {
    if FORBIDDEN_RPC_ERRORS.contains(&name) {
        UpstreamError::Forbidden {
            message: format!("{operation}: {name}"),
        }
    } else if NOT_FOUND_RPC_ERRORS.contains(&name) {
        UpstreamError::ChatNotFound {
            message: format!("{operation}: {name}"),
        }
    } else {
        UpstreamError::Rpc {
            code,
            name: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_map_onto_the_download_grid() {
        let chunk = 512 * 1024;
        assert_eq!(chunk_grid_position(0, chunk).unwrap(), (0, 0));
        assert_eq!(chunk_grid_position(100, chunk).unwrap(), (0, 100));
        assert_eq!(chunk_grid_position(chunk as u64, chunk).unwrap(), (1, 0));
        assert_eq!(
            chunk_grid_position(3 * chunk as u64 + 7, chunk).unwrap(),
            (3, 7)
        );
        assert!(chunk_grid_position(u64::MAX, chunk).is_err());
    }

    #[test]
    fn rpc_errors_are_classified_by_name() {
        assert!(matches!(
            classify_rpc("get_messages_by_id", 400, "CHANNEL_PRIVATE"),
            UpstreamError::Forbidden { .. }
        ));
        assert!(matches!(
            classify_rpc("resolve_username", 400, "USERNAME_NOT_OCCUPIED"),
            UpstreamError::ChatNotFound { .. }
        ));
        match classify_rpc("download next", 420, "FLOOD_WAIT") {
            UpstreamError::Rpc { code, name } => {
                assert_eq!(code, 420);
                assert_eq!(name, "FLOOD_WAIT");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}

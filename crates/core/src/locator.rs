use crate::link::{ChatIdentifier, MediaReference};
use crate::upstream::{ContentHandle, UpstreamError, UpstreamSession};

pub const DEFAULT_MIME_TYPE: &str = "video/mp4";

#[derive(Debug, Clone)]
pub struct MediaDescriptor {
    pub content_handle: ContentHandle,
    pub size_bytes: u64,
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("message not found: {message}")]
    NotFound { message: String },

    #[error("message {message_id} does not contain a video or document")]
    NoMedia { message_id: i32 },

    #[error(
        "access denied: the session is not a participant of the chat or the chat id is wrong ({message})"
    )]
    Forbidden { message: String },

    #[error("upstream error: {0}")]
    Upstream(UpstreamError),
}

/// Fetches the message behind `reference` and describes its media.
pub async fn locate(
    session: &dyn UpstreamSession,
    reference: &MediaReference,
) -> Result<MediaDescriptor, LocateError> {
    let message = session
        .fetch_message(&reference.chat, reference.message_id)
        .await
        .map_err(|e| match e {
            UpstreamError::Forbidden { message } => LocateError::Forbidden { message },
            UpstreamError::ChatNotFound { message } => LocateError::NotFound { message },
            other => LocateError::Upstream(other),
        })?
        .ok_or_else(|| LocateError::NotFound {
            message: format!("chat={} msg_id={}", reference.chat, reference.message_id),
        })?;

    let media = message.media.ok_or(LocateError::NoMedia {
        message_id: reference.message_id,
    })?;

    let file_name = media
        .file_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| default_file_name(reference));
    let mime_type = media
        .mime_type
        .or_else(|| {
            mime_guess::from_path(&file_name)
                .first()
                .map(|m| m.essence_str().to_string())
        })
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

    tracing::debug!(
        event = "media.located",
        provider = session.provider(),
        chat = %reference.chat,
        msg_id = reference.message_id,
        size = media.size_bytes,
        mime = %mime_type,
        "media.located"
    );

    Ok(MediaDescriptor {
        content_handle: media.handle,
        size_bytes: media.size_bytes,
        file_name,
        mime_type,
    })
}

fn default_file_name(reference: &MediaReference) -> String {
    let chat = match &reference.chat {
        ChatIdentifier::Channel(id) => id.to_string(),
        ChatIdentifier::Username(name) => name.clone(),
    };
    format!("video-{chat}-{}.mp4", reference.message_id)
}

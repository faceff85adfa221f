use axum::Json;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tg_relay_core::relay::{self, StreamSession};
use tg_relay_core::{MediaDescriptor, Negotiated, RangeError, locate, negotiate, resolve};
use tracing::info;

use crate::api_error::ApiError;
use crate::app::AppState;

const ENDPOINT_STREAM: &str = "/stream-telegram-video?url=<telegram_link>&token=<auth_token>";
const ENDPOINT_DOWNLOAD: &str = "/download-telegram-video?url=<telegram_link>&token=<auth_token>";

#[derive(Debug, Deserialize)]
pub struct MediaQuery {
    url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Inline,
    Attachment,
}

impl Delivery {
    fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "stream",
            Self::Attachment => "download",
        }
    }
}

pub async fn index(State(state): State<AppState>) -> Json<serde_json::Value> {
    let session = state.session.status();
    Json(json!({
        "status": format!("{} is running", tg_relay_core::APP_NAME),
        "session": {
            "state": session.state,
            "provider": session.provider,
            "reason": session.reason,
        },
        "endpoints": {
            "stream": ENDPOINT_STREAM,
            "download": ENDPOINT_DOWNLOAD,
        },
        "url_format": [
            "https://t.me/c/<channel_id>/<message_id>",
            "https://t.me/<username>/<message_id>",
        ],
        "notes": [
            "The 'token' parameter must match SECRET_AUTH_TOKEN.",
            "The Telegram account or bot must be a member of the channel.",
            "The stream endpoint honors HTTP Range requests.",
        ],
    }))
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn readyz(State(state): State<AppState>) -> Response {
    let status = state.session.status();
    if status.is_ready() {
        return Json(json!({ "ready": true, "provider": status.provider })).into_response();
    }
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "ready": false, "state": status.state, "reason": status.reason })),
    )
        .into_response()
}

pub async fn stream_video(
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<MediaQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    relay_media(&state, &method, query, range, Delivery::Inline).await
}

/// Full-object download. Range headers are ignored; the whole file is always sent.
pub async fn download_video(
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<MediaQuery>,
) -> Result<Response, ApiError> {
    relay_media(&state, &method, query, None, Delivery::Attachment).await
}

/// HEAD requests stop after range negotiation: headers only, no upstream reads.
async fn relay_media(
    state: &AppState,
    method: &Method,
    query: MediaQuery,
    range_header: Option<&str>,
    delivery: Delivery,
) -> Result<Response, ApiError> {
    if !state.token.verify(query.token.as_deref()) {
        return Err(ApiError::Unauthorized);
    }

    let url = query
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or(ApiError::MissingUrl)?;
    let reference = resolve(url)?;

    let session = state.session.session()?;
    let media = locate(session.as_ref(), &reference).await?;

    let negotiated = match negotiate(range_header, media.size_bytes) {
        Ok(n) => n,
        Err(RangeError::Empty) => return Ok(empty_response(&media, delivery)),
        Err(e) => return Err(ApiError::Range(e)),
    };

    if *method == Method::HEAD {
        return Ok(media_response(Body::empty(), &negotiated, &media, delivery));
    }

    let job = StreamSession::new(media.content_handle.clone(), negotiated.range);
    info!(
        event = "stream.start",
        stream_id = %job.stream_id,
        delivery = delivery.as_str(),
        chat = %reference.chat,
        msg_id = reference.message_id,
        start = negotiated.range.start,
        end = negotiated.range.end,
        size = media.size_bytes,
        partial = negotiated.partial,
        "stream.start"
    );

    let rx = relay::spawn(session, job, state.relay);
    let body = Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));

    Ok(media_response(body, &negotiated, &media, delivery))
}

fn media_response(
    body: Body,
    negotiated: &Negotiated,
    media: &MediaDescriptor,
    delivery: Delivery,
) -> Response {
    let mut res = Response::new(body);
    *res.status_mut() = status_of(negotiated);
    set_media_headers(res.headers_mut(), media, negotiated.content_length(), delivery);
    if let Some(v) = negotiated
        .content_range()
        .and_then(|v| HeaderValue::from_str(&v).ok())
    {
        res.headers_mut().insert(header::CONTENT_RANGE, v);
    }
    res
}

fn status_of(negotiated: &Negotiated) -> StatusCode {
    StatusCode::from_u16(negotiated.status()).unwrap_or(StatusCode::OK)
}

fn empty_response(media: &MediaDescriptor, delivery: Delivery) -> Response {
    let mut res = Response::new(Body::empty());
    set_media_headers(res.headers_mut(), media, 0, delivery);
    res
}

fn set_media_headers(
    headers: &mut HeaderMap,
    media: &MediaDescriptor,
    content_length: u64,
    delivery: Delivery,
) {
    let content_type = HeaderValue::from_str(&media.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static(tg_relay_core::locator::DEFAULT_MIME_TYPE));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));

    match delivery {
        Delivery::Inline => {
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }
        Delivery::Attachment => {
            if let Ok(v) = HeaderValue::from_str(&content_disposition(&media.file_name)) {
                headers.insert(header::CONTENT_DISPOSITION, v);
            }
        }
    }

    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
}

fn content_disposition(file_name: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_file_name(file_name),
        urlencoding::encode(file_name)
    )
}

fn ascii_file_name(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match sanitized.trim() {
        "" => "download".to_string(),
        s => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_keeps_utf8_name_and_ascii_fallback() {
        assert_eq!(
            content_disposition("клип \"1\".mp4"),
            "attachment; filename=\"____ _1_.mp4\"; filename*=UTF-8''%D0%BA%D0%BB%D0%B8%D0%BF%20%221%22.mp4"
        );
        assert_eq!(
            content_disposition("video-@news-5.mp4"),
            "attachment; filename=\"video-_news-5.mp4\"; filename*=UTF-8''video-%40news-5.mp4"
        );
    }

    #[test]
    fn blank_ascii_fallback_gets_a_placeholder() {
        assert_eq!(ascii_file_name("/"), "_");
        assert_eq!(ascii_file_name("  "), "download");
    }
}

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tg_relay_core::{LocateError, ParseError, RangeError, SessionUnavailable};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized access. Invalid or missing 'token' parameter.")]
    Unauthorized,

    #[error("Missing 'url' parameter.")]
    MissingUrl,

    #[error(
        "Invalid Telegram URL format. Use https://t.me/c/<channel_id>/<message_id> or https://t.me/<username>/<message_id> ({0})"
    )]
    InvalidUrl(#[from] ParseError),

    #[error("Telegram session is not available: {}", .0.reason)]
    Unavailable(#[from] SessionUnavailable),

    #[error("{0}")]
    Locate(#[from] LocateError),

    #[error("{0}")]
    Range(RangeError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::MissingUrl | Self::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Locate(LocateError::Forbidden { .. }) => StatusCode::FORBIDDEN,
            Self::Locate(LocateError::NotFound { .. } | LocateError::NoMedia { .. }) => {
                StatusCode::NOT_FOUND
            }
            Self::Locate(LocateError::Upstream(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Range(_) => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(event = "http.error", status = status.as_u16(), error = %message, "http.error");
        } else {
            tracing::debug!(event = "http.rejected", status = status.as_u16(), error = %message, "http.rejected");
        }

        let mut res = (status, Json(serde_json::json!({ "error": message }))).into_response();
        if let Self::Range(e) = &self {
            if let Some(v) = e
                .content_range()
                .and_then(|v| HeaderValue::from_str(&v).ok())
            {
                res.headers_mut().insert(header::CONTENT_RANGE, v);
            }
        }
        res
    }
}

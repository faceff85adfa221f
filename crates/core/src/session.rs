use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Duration, sleep};

use crate::{Error, Result};
use crate::upstream::UpstreamSession;

const CONNECT_BACKOFF_INITIAL_SECS: u64 = 1;
const CONNECT_BACKOFF_MAX_SECS: u64 = 60;

#[derive(Clone)]
pub enum SessionState {
    Connecting,
    Ready(Arc<dyn UpstreamSession>),
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: &'static str,
    pub provider: Option<String>,
    pub reason: Option<String>,
}

impl SessionStatus {
    pub fn is_ready(&self) -> bool {
        self.state == "ready"
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream session unavailable: {reason}")]
pub struct SessionUnavailable {
    pub reason: String,
}

/// Holder of the process-wide upstream session.
///
/// Built once at startup and shared by every request handler. Requests check it on every
/// call, so a failed or pending connect surfaces as [`SessionUnavailable`] instead of a
/// crash.
pub struct SessionSlot {
    tx: watch::Sender<SessionState>,
}

impl SessionSlot {
    pub fn connecting() -> Self {
        Self::with_state(SessionState::Connecting)
    }

    pub fn ready(session: Arc<dyn UpstreamSession>) -> Self {
        Self::with_state(SessionState::Ready(session))
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::with_state(SessionState::Unavailable {
            reason: reason.into(),
        })
    }

    fn with_state(state: SessionState) -> Self {
        let (tx, _rx) = watch::channel(state);
        Self { tx }
    }

    pub fn set_ready(&self, session: Arc<dyn UpstreamSession>) {
        self.tx.send_replace(SessionState::Ready(session));
    }

    pub fn set_unavailable(&self, reason: impl Into<String>) {
        self.tx.send_replace(SessionState::Unavailable {
            reason: reason.into(),
        });
    }

    pub fn session(&self) -> std::result::Result<Arc<dyn UpstreamSession>, SessionUnavailable> {
        match &*self.tx.borrow() {
            SessionState::Ready(session) => Ok(Arc::clone(session)),
            SessionState::Connecting => Err(SessionUnavailable {
                reason: "telegram session is still connecting".to_string(),
            }),
            SessionState::Unavailable { reason } => Err(SessionUnavailable {
                reason: reason.clone(),
            }),
        }
    }

    pub fn status(&self) -> SessionStatus {
        match &*self.tx.borrow() {
            SessionState::Ready(session) => SessionStatus {
                state: "ready",
                provider: Some(session.provider().to_string()),
                reason: None,
            },
            SessionState::Connecting => SessionStatus {
                state: "connecting",
                provider: None,
                reason: None,
            },
            SessionState::Unavailable { reason } => SessionStatus {
                state: "unavailable",
                provider: None,
                reason: Some(reason.clone()),
            },
        }
    }
}

/// Connects until it succeeds, backing off exponentially between attempts.
///
/// Every failure is recorded in the slot so requests see why the session is missing.
/// [`Error::SessionSetup`] is terminal: the slot stays unavailable and no retry is made.
pub async fn connect_with_backoff<F, Fut>(slot: Arc<SessionSlot>, mut connect: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Arc<dyn UpstreamSession>>>,
{
    let mut backoff = Duration::from_secs(CONNECT_BACKOFF_INITIAL_SECS);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(session) => {
                tracing::info!(
                    event = "upstream.connect",
                    provider = session.provider(),
                    attempt,
                    "upstream.connect"
                );
                slot.set_ready(session);
                return;
            }
            Err(e @ Error::SessionSetup { .. }) => {
                tracing::error!(
                    event = "upstream.connect_abandoned",
                    attempt,
                    error = %e,
                    "upstream.connect_abandoned"
                );
                slot.set_unavailable(format!("telegram session cannot be established: {e}"));
                return;
            }
            Err(e) => {
                tracing::warn!(
                    event = "upstream.connect_failed",
                    attempt,
                    retry_in_secs = backoff.as_secs(),
                    error = %e,
                    "upstream.connect_failed"
                );
                slot.set_unavailable(format!(
                    "telegram session failed to connect: {e} (attempt {attempt}, retrying in {}s)",
                    backoff.as_secs()
                ));
                sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(CONNECT_BACKOFF_MAX_SECS));
            }
        }
    }
}

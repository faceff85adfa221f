use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::range::ByteRange;
use crate::upstream::{ContentHandle, UpstreamError, UpstreamSession};

pub const DEFAULT_CHUNK_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_CHUNK_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CHANNEL_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Largest read issued to the upstream session per step.
    pub chunk_bytes: usize,
    /// Bound on each individual upstream read.
    pub chunk_timeout: Duration,
    /// Chunks buffered between the upstream reader and the client writer.
    pub channel_depth: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            chunk_timeout: Duration::from_secs(DEFAULT_CHUNK_TIMEOUT_SECS),
            channel_depth: DEFAULT_CHANNEL_DEPTH,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("upstream read failed at offset {offset}: {source}")]
    Upstream {
        offset: u64,
        #[source]
        source: UpstreamError,
    },

    #[error("upstream read at offset {offset} timed out after {after:?}")]
    Timeout { offset: u64, after: Duration },

    #[error("upstream ended early at offset {offset} ({delivered} of {expected} bytes relayed)")]
    ShortRead {
        offset: u64,
        delivered: u64,
        expected: u64,
    },

    #[error("client went away after {delivered} bytes")]
    SinkClosed { delivered: u64 },
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("sink closed")]
pub struct SinkClosed;

/// Destination of relayed bytes, normally the body of an HTTP response.
pub trait ByteSink: Send + Sync {
    fn write_chunk<'a>(
        &'a mut self,
        chunk: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkClosed>> + Send + 'a>>;

    /// Resolves once the receiving side is gone.
    fn closed<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Relays `range` of the object behind `handle` into `sink`, one upstream read at a time.
///
/// Reads are issued strictly in offset order and each is written before the next one
/// starts. The loop ends when the range is complete, the upstream stops producing bytes,
/// an upstream read fails or times out, or the sink goes away; an in-flight read is
/// dropped as soon as the sink closes. Returns the number of bytes written.
pub async fn stream(
    session: &dyn UpstreamSession,
    handle: &ContentHandle,
    range: ByteRange,
    sink: &mut dyn ByteSink,
    options: &RelayOptions,
) -> Result<u64, StreamError> {
    let expected = range.len();
    let chunk_bytes = options.chunk_bytes.max(1) as u64;
    let mut delivered = 0u64;

    while delivered < expected {
        let offset = range.start + delivered;
        let want = chunk_bytes.min(expected - delivered) as usize;

        let read = tokio::time::timeout(
            options.chunk_timeout,
            session.read_media_chunk(handle, offset, want),
        );
        let chunk = tokio::select! {
            biased;
            _ = sink.closed() => return Err(StreamError::SinkClosed { delivered }),
            res = read => match res {
                Err(_) => {
                    return Err(StreamError::Timeout {
                        offset,
                        after: options.chunk_timeout,
                    });
                }
                Ok(Err(source)) => return Err(StreamError::Upstream { offset, source }),
                Ok(Ok(chunk)) => chunk,
            },
        };

        if chunk.is_empty() {
            return Err(StreamError::ShortRead {
                offset,
                delivered,
                expected,
            });
        }

        let chunk = if chunk.len() > want {
            chunk.slice(..want)
        } else {
            chunk
        };
        let n = chunk.len() as u64;

        sink.write_chunk(chunk)
            .await
            .map_err(|_| StreamError::SinkClosed { delivered })?;
        delivered += n;
    }

    Ok(delivered)
}

pub type RelayItem = Result<Bytes, std::io::Error>;

/// Sink feeding a bounded channel; the receiver is the response body.
pub struct ChannelSink {
    tx: mpsc::Sender<RelayItem>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<RelayItem>) -> Self {
        Self { tx }
    }

    /// Pushes a terminal error so the body ends abnormally instead of looking complete.
    async fn fail(&self, err: &StreamError) {
        let _ = self
            .tx
            .send(Err(std::io::Error::other(err.to_string())))
            .await;
    }
}

impl ByteSink for ChannelSink {
    fn write_chunk<'a>(
        &'a mut self,
        chunk: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkClosed>> + Send + 'a>> {
        Box::pin(async move { self.tx.send(Ok(chunk)).await.map_err(|_| SinkClosed) })
    }

    fn closed<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.tx.closed())
    }
}

/// One relay job: the object to read and the interval to serve.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub stream_id: Uuid,
    pub handle: ContentHandle,
    pub range: ByteRange,
}

impl StreamSession {
    pub fn new(handle: ContentHandle, range: ByteRange) -> Self {
        Self {
            stream_id: Uuid::new_v4(),
            handle,
            range,
        }
    }
}

/// Starts relaying on its own task and returns the consuming end.
///
/// Dropping the receiver cancels the relay, including any upstream read in flight.
pub fn spawn(
    session: Arc<dyn UpstreamSession>,
    job: StreamSession,
    options: RelayOptions,
) -> mpsc::Receiver<RelayItem> {
    let (tx, rx) = mpsc::channel(options.channel_depth.max(1));

    tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        let stream_id = job.stream_id;
        let started = std::time::Instant::now();
        debug!(
            event = "stream.relay_start",
            %stream_id,
            start = job.range.start,
            end = job.range.end,
            "stream.relay_start"
        );

        let res = stream(session.as_ref(), &job.handle, job.range, &mut sink, &options).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match res {
            Ok(bytes) => {
                info!(
                    event = "stream.finish",
                    %stream_id,
                    bytes,
                    elapsed_ms,
                    "stream.finish"
                );
            }
            Err(StreamError::SinkClosed { delivered }) => {
                info!(
                    event = "stream.client_gone",
                    %stream_id,
                    delivered,
                    elapsed_ms,
                    "stream.client_gone"
                );
            }
            Err(e @ StreamError::ShortRead { .. }) => {
                warn!(
                    event = "stream.short_read",
                    %stream_id,
                    error = %e,
                    elapsed_ms,
                    "stream.short_read"
                );
                sink.fail(&e).await;
            }
            Err(e) => {
                error!(
                    event = "stream.failed",
                    %stream_id,
                    error = %e,
                    elapsed_ms,
                    "stream.failed"
                );
                sink.fail(&e).await;
            }
        }
    });

    rx
}

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tg_relay_core::relay::{self, StreamSession};
use tg_relay_core::{
    ByteRange, ByteSink, ChatIdentifier, ContentHandle, InMemoryUpstream, MediaReference,
    RelayOptions, SinkClosed, StreamError, UpstreamError, UpstreamMessage, UpstreamSession,
    locate, negotiate, stream,
};

fn fixture(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn chat() -> ChatIdentifier {
    ChatIdentifier::Channel(-1000000000123)
}

fn options(chunk_bytes: usize) -> RelayOptions {
    RelayOptions {
        chunk_bytes,
        ..RelayOptions::default()
    }
}

#[derive(Default)]
struct VecSink {
    received: Vec<u8>,
    writes: usize,
    disconnect_after: Option<usize>,
}

impl VecSink {
    fn disconnecting_after(bytes: usize) -> Self {
        Self {
            disconnect_after: Some(bytes),
            ..Self::default()
        }
    }

    fn gone(&self) -> bool {
        self.disconnect_after
            .is_some_and(|limit| self.received.len() >= limit)
    }
}

impl ByteSink for VecSink {
    fn write_chunk<'a>(
        &'a mut self,
        chunk: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkClosed>> + Send + 'a>> {
        Box::pin(async move {
            if self.gone() {
                return Err(SinkClosed);
            }
            self.writes += 1;
            self.received.extend_from_slice(&chunk);
            Ok(())
        })
    }

    fn closed<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        let gone = self.gone();
        Box::pin(async move {
            if !gone {
                std::future::pending::<()>().await;
            }
        })
    }
}

/// Session whose reads at or past `stall_from` never complete.
struct StallingUpstream {
    inner: InMemoryUpstream,
    stall_from: u64,
}

impl UpstreamSession for StallingUpstream {
    fn provider(&self) -> &str {
        self.inner.provider()
    }

    fn fetch_message<'a>(
        &'a self,
        chat: &'a ChatIdentifier,
        message_id: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UpstreamMessage>, UpstreamError>> + Send + 'a>>
    {
        self.inner.fetch_message(chat, message_id)
    }

    fn read_media_chunk<'a>(
        &'a self,
        handle: &'a ContentHandle,
        offset: u64,
        max_length: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, UpstreamError>> + Send + 'a>> {
        Box::pin(async move {
            if offset >= self.stall_from {
                std::future::pending::<()>().await;
            }
            self.inner.read_media_chunk(handle, offset, max_length).await
        })
    }
}

/// Sink whose client disconnects after a fixed delay, while a read may be in flight.
struct TimedDisconnectSink {
    after: Duration,
}

impl ByteSink for TimedDisconnectSink {
    fn write_chunk<'a>(
        &'a mut self,
        _chunk: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkClosed>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn closed<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(tokio::time::sleep(self.after))
    }
}

async fn upstream_with(bytes: Vec<u8>) -> (InMemoryUpstream, tg_relay_core::MediaDescriptor) {
    let upstream = InMemoryUpstream::new();
    upstream
        .insert_media(chat(), 1, bytes, Some("fixture.mp4"), Some("video/mp4"))
        .await;
    let media = locate(
        &upstream,
        &MediaReference {
            chat: chat(),
            message_id: 1,
        },
    )
    .await
    .unwrap();
    (upstream, media)
}

#[tokio::test]
async fn full_object_is_relayed_byte_for_byte() {
    let source = fixture(10_007);
    let (upstream, media) = upstream_with(source.clone()).await;

    let negotiated = negotiate(None, media.size_bytes).unwrap();
    assert_eq!(negotiated.content_length(), source.len() as u64);

    let mut sink = VecSink::default();
    let sent = stream(
        &upstream,
        &media.content_handle,
        negotiated.range,
        &mut sink,
        &options(1000),
    )
    .await
    .unwrap();

    assert_eq!(sent, source.len() as u64);
    assert_eq!(sink.received, source);
    assert_eq!(sink.writes, 11);
}

#[tokio::test]
async fn range_yields_exact_slice() {
    let source = fixture(5000);
    let (upstream, media) = upstream_with(source.clone()).await;

    for (header, start, end) in [
        ("bytes=0-99", 0usize, 99usize),
        ("bytes=500-", 500, 4999),
        ("bytes=1234-1234", 1234, 1234),
        ("bytes=-10", 4990, 4999),
    ] {
        let negotiated = negotiate(Some(header), media.size_bytes).unwrap();
        let mut sink = VecSink::default();
        let sent = stream(
            &upstream,
            &media.content_handle,
            negotiated.range,
            &mut sink,
            &options(333),
        )
        .await
        .unwrap();

        assert_eq!(sent, (end - start + 1) as u64, "{header}");
        assert_eq!(sink.received, &source[start..=end], "{header}");
    }
}

#[tokio::test]
async fn reads_are_issued_in_increasing_offset_order() {
    let source = fixture(1000);
    let (upstream, media) = upstream_with(source.clone()).await;
    let upstream = upstream.with_read_cap(7);

    let mut sink = VecSink::default();
    stream(
        &upstream,
        &media.content_handle,
        ByteRange { start: 10, end: 999 },
        &mut sink,
        &options(100),
    )
    .await
    .unwrap();

    assert_eq!(sink.received, &source[10..]);
    let offsets = upstream.read_offsets().await;
    assert_eq!(offsets.first(), Some(&10));
    assert!(offsets.windows(2).all(|w| w[1] == w[0] + 7));
}

#[tokio::test]
async fn disconnect_stops_further_upstream_reads() {
    let (upstream, media) = upstream_with(fixture(1000)).await;

    let mut sink = VecSink::disconnecting_after(250);
    let err = stream(
        &upstream,
        &media.content_handle,
        ByteRange { start: 0, end: 999 },
        &mut sink,
        &options(100),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StreamError::SinkClosed { delivered: 300 }));
    assert_eq!(sink.received.len(), 300);
    assert_eq!(upstream.chunk_request_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_the_read_in_flight() {
    let (upstream, media) = upstream_with(fixture(1000)).await;
    let upstream = upstream.with_read_delay(Duration::from_secs(30));

    let started = tokio::time::Instant::now();
    let mut sink = TimedDisconnectSink {
        after: Duration::from_secs(1),
    };
    let err = stream(
        &upstream,
        &media.content_handle,
        ByteRange { start: 0, end: 999 },
        &mut sink,
        &options(100),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StreamError::SinkClosed { delivered: 0 }));
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(upstream.chunk_request_count(), 1);
}

#[tokio::test]
async fn short_upstream_ends_the_stream() {
    let upstream = InMemoryUpstream::new();
    upstream
        .insert_media_with_size(chat(), 2, fixture(150), 300, None, None)
        .await;
    let media = locate(
        &upstream,
        &MediaReference {
            chat: chat(),
            message_id: 2,
        },
    )
    .await
    .unwrap();
    assert_eq!(media.size_bytes, 300);

    let mut sink = VecSink::default();
    let err = stream(
        &upstream,
        &media.content_handle,
        ByteRange { start: 0, end: 299 },
        &mut sink,
        &options(100),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        StreamError::ShortRead {
            offset: 150,
            delivered: 150,
            expected: 300
        }
    ));
    assert_eq!(sink.received, fixture(150));
}

#[tokio::test(start_paused = true)]
async fn stalled_upstream_read_times_out() {
    let (upstream, media) = upstream_with(fixture(100)).await;
    let upstream = upstream.with_read_delay(Duration::from_secs(120));

    let mut sink = VecSink::default();
    let err = stream(
        &upstream,
        &media.content_handle,
        ByteRange { start: 0, end: 99 },
        &mut sink,
        &RelayOptions {
            chunk_bytes: 64,
            chunk_timeout: Duration::from_secs(5),
            channel_depth: 1,
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        StreamError::Timeout { offset: 0, after } if after == Duration::from_secs(5)
    ));
    assert!(sink.received.is_empty());
}

#[tokio::test(start_paused = true)]
async fn sub_second_timeout_is_reported_exactly() {
    let (upstream, media) = upstream_with(fixture(100)).await;
    let upstream = upstream.with_read_delay(Duration::from_secs(1));

    let mut sink = VecSink::default();
    let err = stream(
        &upstream,
        &media.content_handle,
        ByteRange { start: 0, end: 99 },
        &mut sink,
        &RelayOptions {
            chunk_bytes: 64,
            chunk_timeout: Duration::from_millis(250),
            channel_depth: 1,
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        StreamError::Timeout { offset: 0, after } if after == Duration::from_millis(250)
    ));
    assert!(err.to_string().contains("250ms"), "{err}");
}

#[tokio::test]
async fn upstream_failure_mid_stream_is_reported() {
    let (upstream, media) = upstream_with(fixture(1000)).await;
    let upstream = upstream.with_failing_reads_from(400);

    let mut sink = VecSink::default();
    let err = stream(
        &upstream,
        &media.content_handle,
        ByteRange { start: 0, end: 999 },
        &mut sink,
        &options(200),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StreamError::Upstream { offset: 400, .. }));
    assert_eq!(sink.received.len(), 400);
}

#[tokio::test]
async fn spawned_relay_delivers_through_the_channel() {
    let source = fixture(4096);
    let (upstream, media) = upstream_with(source.clone()).await;
    let upstream: Arc<dyn UpstreamSession> = Arc::new(upstream);

    let job = StreamSession::new(media.content_handle, ByteRange { start: 96, end: 4095 });
    let mut rx = relay::spawn(upstream, job, options(512));

    let mut received = Vec::new();
    while let Some(item) = rx.recv().await {
        received.extend_from_slice(&item.unwrap());
    }
    assert_eq!(received, &source[96..]);
}

#[tokio::test]
async fn spawned_relay_ends_body_with_error_on_upstream_failure() {
    let (upstream, media) = upstream_with(fixture(1000)).await;
    let upstream: Arc<dyn UpstreamSession> = Arc::new(upstream.with_failing_reads_from(200));

    let job = StreamSession::new(media.content_handle, ByteRange { start: 0, end: 999 });
    let mut rx = relay::spawn(upstream, job, options(100));

    let mut ok_bytes = 0;
    let mut saw_error = false;
    while let Some(item) = rx.recv().await {
        match item {
            Ok(chunk) => ok_bytes += chunk.len(),
            Err(_) => saw_error = true,
        }
    }
    assert_eq!(ok_bytes, 200);
    assert!(saw_error);
}

#[tokio::test]
async fn dropping_the_receiver_stops_the_relay() {
    let (upstream, media) = upstream_with(fixture(100_000)).await;
    let upstream = Arc::new(upstream);

    let job = StreamSession::new(media.content_handle, ByteRange { start: 0, end: 99_999 });
    let mut rx = relay::spawn(
        Arc::clone(&upstream) as Arc<dyn UpstreamSession>,
        job,
        RelayOptions {
            chunk_bytes: 100,
            channel_depth: 1,
            ..RelayOptions::default()
        },
    );

    assert!(rx.recv().await.unwrap().is_ok());
    drop(rx);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = upstream.chunk_request_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(upstream.chunk_request_count(), settled);
    assert!(settled < 1000);
}

#[tokio::test(start_paused = true)]
async fn stalled_session_does_not_hold_up_another() {
    let source = fixture(1000);
    let (upstream, media) = upstream_with(source.clone()).await;
    let upstream: Arc<dyn UpstreamSession> = Arc::new(StallingUpstream {
        inner: upstream,
        stall_from: 500,
    });
    let options = RelayOptions {
        chunk_bytes: 100,
        chunk_timeout: Duration::from_secs(5),
        channel_depth: 1,
    };

    let stalled = StreamSession::new(
        media.content_handle.clone(),
        ByteRange { start: 500, end: 999 },
    );
    let healthy = StreamSession::new(media.content_handle, ByteRange { start: 0, end: 499 });
    let mut stalled_rx = relay::spawn(Arc::clone(&upstream), stalled, options);
    let mut healthy_rx = relay::spawn(upstream, healthy, options);

    let started = tokio::time::Instant::now();
    let mut received = Vec::new();
    while let Some(item) = healthy_rx.recv().await {
        received.extend_from_slice(&item.unwrap());
    }
    assert_eq!(received, &source[..500]);
    assert!(started.elapsed() < Duration::from_secs(5));

    let item = stalled_rx.recv().await.unwrap();
    assert!(item.is_err());
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(stalled_rx.recv().await.is_none());
}

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use frame_capture::{CaptureError, Direction, FrameContext, FrameSink};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Largest chunk a pump reads (and therefore captures) in one go.
pub const BUFFER_SIZE: usize = 4096;

/// Something the relay can tear down.
pub trait Close {
    fn close(&self);
}

/// Close handle for one relayed connection.
///
/// Closing cancels any read from or write to the connection that either pump
/// is waiting on. The socket itself is released once both pumps have dropped
/// their halves.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCloser {
    token: CancellationToken,
}

impl ConnectionCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }
}

impl Close for ConnectionCloser {
    fn close(&self) {
        self.token.cancel();
    }
}

/// Shared state of one session: the closed flag, behind the session lock.
///
/// The same lock serialises sink delivery for both directions, so two frames
/// of one session are never delivered at the same time.
#[derive(Debug, Default)]
pub struct SessionState {
    closed: Mutex<bool>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        *self.lock()
    }

    /// Mark the session closed and return the previous state.
    ///
    /// `conn` is closed only on the first call, so however many times the
    /// pumps race into their error paths a connection is closed at most once.
    pub fn set_closed<C: Close + ?Sized>(&self, conn: Option<&C>) -> bool {
        let mut closed = self.lock();
        let old = *closed;
        *closed = true;
        if !old {
            if let Some(conn) = conn {
                conn.close();
            }
        }
        old
    }

    /// Deliver one chunk to `sink` as a single frame, under the session lock.
    pub fn deliver(
        &self,
        sink: &dyn FrameSink,
        ctx: &FrameContext,
        data: &[u8],
    ) -> Result<(), CaptureError> {
        let _guard = self.lock();
        sink.write_frame(ctx, &[data])
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Relays bytes between a client and an upstream server, mirroring every
/// chunk into the sink for its direction.
///
/// The relay never reports errors. Callers see the session end only through
/// its connections closing.
pub struct Relay<C, S> {
    id: u64,
    client: C,
    server: S,
    from_client: Arc<dyn FrameSink>,
    from_server: Arc<dyn FrameSink>,
}

impl<C, S> Relay<C, S>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        client: C,
        server: S,
        id: u64,
        from_client: Arc<dyn FrameSink>,
        from_server: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            id,
            client,
            server,
            from_client,
            from_server,
        }
    }

    /// Spawn the two pumps and return immediately.
    ///
    /// Must be called from within a Tokio runtime. The returned handle can be
    /// dropped; the pumps keep running until the session ends.
    pub fn run(self) -> RelayHandle {
        let state = Arc::new(SessionState::new());
        let client_closer = ConnectionCloser::new();
        let server_closer = ConnectionCloser::new();

        let (client_read, client_write) = tokio::io::split(self.client);
        let (server_read, server_write) = tokio::io::split(self.server);

        tracing::debug!(session_id = self.id, "relay starting");

        let client_to_server = tokio::spawn(
            Pump {
                ctx: FrameContext::new(self.id, Direction::ClientToServer),
                from: client_read,
                from_closer: client_closer.clone(),
                to: server_write,
                to_closer: server_closer.clone(),
                sink: self.from_client,
                state: Arc::clone(&state),
            }
            .run(),
        );

        let server_to_client = tokio::spawn(
            Pump {
                ctx: FrameContext::new(self.id, Direction::ServerToClient),
                from: server_read,
                from_closer: server_closer,
                to: client_write,
                to_closer: client_closer,
                sink: self.from_server,
                state: Arc::clone(&state),
            }
            .run(),
        );

        RelayHandle {
            id: self.id,
            state,
            client_to_server,
            server_to_client,
        }
    }
}

/// Handle to a running relay.
#[derive(Debug)]
pub struct RelayHandle {
    id: u64,
    state: Arc<SessionState>,
    client_to_server: JoinHandle<()>,
    server_to_client: JoinHandle<()>,
}

impl RelayHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Wait for both pumps to exit.
    pub async fn join(self) {
        let _ = self.client_to_server.await;
        let _ = self.server_to_client.await;
    }
}

/// What a pump does after one read/write round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    /// Both sides fine; read again.
    Continue,
    /// Read ended, peer still reachable: close the destination.
    ClosePeer,
    /// Peer unreachable: close the source and stop receiving.
    CloseSource,
    /// Both sides failed; someone else already tore the session down.
    MarkClosed,
}

/// `write_failed` is only true when a write was attempted and failed.
fn settle(read_failed: bool, write_failed: bool) -> Settle {
    match (read_failed, write_failed) {
        (false, false) => Settle::Continue,
        (true, false) => Settle::ClosePeer,
        (false, true) => Settle::CloseSource,
        (true, true) => Settle::MarkClosed,
    }
}

fn closed_by_relay() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed by relay")
}

/// One direction of a relay.
struct Pump<R, W> {
    ctx: FrameContext,
    from: R,
    from_closer: ConnectionCloser,
    to: W,
    to_closer: ConnectionCloser,
    sink: Arc<dyn FrameSink>,
    state: Arc<SessionState>,
}

impl<R, W> Pump<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(mut self) {
        let session_id = self.ctx.session_id;
        let direction = self.ctx.direction;
        let mut buffer = vec![0u8; BUFFER_SIZE];

        loop {
            // Either connection closing ends the pump, so the halves it owns
            // are dropped and the socket is released.
            let read = tokio::select! {
                biased;
                _ = self.from_closer.closed() => Err(closed_by_relay()),
                _ = self.to_closer.closed() => Err(closed_by_relay()),
                read = self.from.read(&mut buffer) => read,
            };

            // Clean end-of-stream and read errors take the same path.
            let (n, read_failed) = match read {
                Ok(0) => {
                    tracing::debug!(session_id, %direction, "end of stream");
                    (0, true)
                }
                Ok(n) => (n, false),
                Err(err) => {
                    tracing::debug!(session_id, %direction, %err, "read failed");
                    (0, true)
                }
            };

            let mut write_failed = false;
            if n > 0 {
                let chunk = &buffer[..n];
                if let Err(err) = self.state.deliver(self.sink.as_ref(), &self.ctx, chunk) {
                    tracing::trace!(session_id, %direction, %err, "frame not captured");
                }

                let written = tokio::select! {
                    biased;
                    _ = self.to_closer.closed() => Err(closed_by_relay()),
                    written = self.to.write_all(chunk) => written,
                };
                if let Err(err) = written {
                    tracing::debug!(session_id, %direction, %err, "write failed");
                    write_failed = true;
                }
            }

            match settle(read_failed, write_failed) {
                Settle::Continue => continue,
                Settle::ClosePeer => {
                    if !self.state.set_closed(Some(&self.to_closer)) {
                        let _ = self.to.shutdown().await;
                    }
                }
                Settle::CloseSource => {
                    self.state.set_closed(Some(&self.from_closer));
                }
                Settle::MarkClosed => {
                    self.state.set_closed::<ConnectionCloser>(None);
                }
            }
            break;
        }

        tracing::debug!(session_id, %direction, "pump finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;

    use frame_capture::sink_fn;
    use tokio::io::{duplex, DuplexStream, ReadBuf};
    use tokio::time::timeout;

    type Frames = Arc<Mutex<Vec<(FrameContext, Vec<u8>)>>>;

    fn collecting_sink() -> (Frames, Arc<dyn FrameSink>) {
        let frames: Frames = Arc::default();
        let captured = Arc::clone(&frames);
        let sink = sink_fn(move |ctx: &FrameContext, data: &[&[u8]]| {
            captured.lock().unwrap().push((*ctx, data.concat()));
            Ok(())
        });
        (frames, Arc::new(sink))
    }

    /// `(test client end, relay client end, relay server end, test server end)`
    fn pipes() -> (DuplexStream, DuplexStream, DuplexStream, DuplexStream) {
        let (client, client_proxy) = duplex(64 * 1024);
        let (server_proxy, server) = duplex(64 * 1024);
        (client, client_proxy, server_proxy, server)
    }

    #[derive(Default)]
    struct CountingCloser(AtomicUsize);

    impl Close for CountingCloser {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Fails every read; swallows every write.
    struct BrokenReader;

    impl AsyncRead for BrokenReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
        }
    }

    impl AsyncWrite for BrokenReader {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Never yields data; every write fails.
    struct DeadUpstream;

    impl AsyncRead for DeadUpstream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for DeadUpstream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    // -----------------------------------------------------------------------
    // SessionState
    // -----------------------------------------------------------------------

    #[test]
    fn set_closed_closes_exactly_once() {
        let state = SessionState::new();
        let conn = CountingCloser::default();

        assert!(!state.set_closed(Some(&conn)));
        assert!(state.set_closed(Some(&conn)));
        assert!(state.set_closed::<CountingCloser>(None));
        assert!(state.set_closed(Some(&conn)));

        assert_eq!(conn.0.load(Ordering::SeqCst), 1);
        assert!(state.is_closed());
    }

    #[test]
    fn set_closed_without_connection_still_latches() {
        let state = SessionState::new();
        let conn = CountingCloser::default();

        assert!(!state.set_closed::<CountingCloser>(None));
        assert!(state.set_closed(Some(&conn)));

        assert_eq!(conn.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn racing_set_closed_calls_close_once() {
        let state = Arc::new(SessionState::new());
        let conn = Arc::new(CountingCloser::default());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let state = Arc::clone(&state);
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || state.set_closed(Some(conn.as_ref())))
            })
            .collect();
        let firsts = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|was_closed| !was_closed)
            .count();

        assert_eq!(firsts, 1);
        assert_eq!(conn.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn settle_follows_the_error_table() {
        assert_eq!(settle(false, false), Settle::Continue);
        assert_eq!(settle(true, false), Settle::ClosePeer);
        assert_eq!(settle(false, true), Settle::CloseSource);
        assert_eq!(settle(true, true), Settle::MarkClosed);
    }

    #[test]
    fn connection_closer_is_shared_between_clones() {
        let closer = ConnectionCloser::new();
        let other = closer.clone();
        assert!(!other.is_closed());
        closer.close();
        closer.close();
        assert!(other.is_closed());
    }

    // -----------------------------------------------------------------------
    // Relay
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn relays_and_captures_both_directions() {
        let (mut client, client_proxy, server_proxy, mut server) = pipes();
        let (frames, sink) = collecting_sink();

        let handle = Relay::new(client_proxy, server_proxy, 5, Arc::clone(&sink), sink).run();
        assert_eq!(handle.id(), 5);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        let frames = frames.lock().unwrap().clone();
        assert_eq!(
            frames,
            vec![
                (FrameContext::new(5, Direction::ClientToServer), b"ping".to_vec()),
                (FrameContext::new(5, Direction::ServerToClient), b"pong".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn client_eof_closes_upstream_and_ends_session() {
        let (client, client_proxy, server_proxy, mut server) = pipes();
        let (_frames, sink) = collecting_sink();

        let handle = Relay::new(client_proxy, server_proxy, 0, Arc::clone(&sink), sink).run();
        drop(client);

        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), server.read_to_end(&mut rest))
            .await
            .expect("upstream never saw end of stream")
            .unwrap();
        assert!(rest.is_empty());
        assert!(handle.is_closed());

        timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("pumps did not finish");
    }

    #[tokio::test]
    async fn upstream_eof_closes_client() {
        let (mut client, client_proxy, server_proxy, mut server) = pipes();
        let (_frames, sink) = collecting_sink();

        let handle = Relay::new(client_proxy, server_proxy, 0, Arc::clone(&sink), sink).run();
        server.write_all(b"bye\n").await.unwrap();
        drop(server);

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .expect("client never saw end of stream")
            .unwrap();
        assert_eq!(received, b"bye\n");

        timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("pumps did not finish");
    }

    // A read error is handled exactly like a clean end of stream; the two are
    // deliberately not told apart.
    #[tokio::test]
    async fn read_error_is_treated_like_end_of_stream() {
        let (server_proxy, mut server) = duplex(1024);
        let (frames, sink) = collecting_sink();

        let handle = Relay::new(BrokenReader, server_proxy, 0, Arc::clone(&sink), sink).run();

        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), server.read_to_end(&mut rest))
            .await
            .expect("upstream never saw end of stream")
            .unwrap();
        assert!(rest.is_empty());

        timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("pumps did not finish");
        assert!(frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_upstream_write_closes_client() {
        let (mut client, client_proxy) = duplex(1024);
        let (frames, sink) = collecting_sink();

        let handle = Relay::new(client_proxy, DeadUpstream, 2, Arc::clone(&sink), sink).run();
        client.write_all(b"x").await.unwrap();

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .expect("client never saw end of stream")
            .unwrap();
        assert!(received.is_empty());
        assert!(handle.is_closed());

        timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("pumps did not finish");

        // The chunk is captured before the write is attempted.
        let frames = frames.lock().unwrap().clone();
        assert_eq!(
            frames,
            vec![(FrameContext::new(2, Direction::ClientToServer), b"x".to_vec())]
        );
    }

    #[tokio::test]
    async fn failing_sink_does_not_stall_relay() {
        let (mut client, client_proxy, server_proxy, mut server) = pipes();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let sink: Arc<dyn FrameSink> = Arc::new(sink_fn(move |_: &FrameContext, _: &[&[u8]]| {
            counted.fetch_add(1, Ordering::SeqCst);
            Err(CaptureError::ConsumerClosed)
        }));

        let _handle = Relay::new(client_proxy, server_proxy, 0, Arc::clone(&sink), sink).run();

        client.write_all(b"still flowing").await.unwrap();
        let mut buf = [0u8; 13];
        timeout(Duration::from_secs(5), server.read_exact(&mut buf))
            .await
            .expect("relay stalled")
            .unwrap();
        assert_eq!(&buf, b"still flowing");
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn large_transfer_is_split_into_bounded_frames() {
        let (mut client, client_proxy, server_proxy, mut server) = pipes();
        let (frames, sink) = collecting_sink();

        let _handle = Relay::new(client_proxy, server_proxy, 0, Arc::clone(&sink), sink).run();

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                client.write_all(&payload).await.unwrap();
                client
            })
        };

        let mut received = vec![0u8; payload.len()];
        timeout(Duration::from_secs(5), server.read_exact(&mut received))
            .await
            .expect("transfer stalled")
            .unwrap();
        let _client = writer.await.unwrap();
        assert_eq!(received, payload);

        let frames = frames.lock().unwrap().clone();
        assert!(frames.iter().all(|(_, bytes)| bytes.len() <= BUFFER_SIZE));
        let captured: Vec<u8> = frames.into_iter().flat_map(|(_, bytes)| bytes).collect();
        assert_eq!(captured, payload);
    }
}

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use frame_capture::{default_frame_sinks, FrameSink};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::relay::Relay;

/// A source of incoming client connections.
#[async_trait]
pub trait Acceptor: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Opens the upstream connection for each accepted client.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, remote: &str) -> io::Result<Self::Stream>;
}

/// Dials upstream over plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, remote: &str) -> io::Result<TcpStream> {
        TcpStream::connect(remote).await
    }
}

/// What the dispatch loop does when the upstream dial fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialFailurePolicy {
    /// Log, stop the loop and return the error.
    #[default]
    Stop,
    /// Log, drop the client connection and keep accepting.
    Skip,
}

/// The pair of sinks every session's relay writes to. Frames carry their
/// session id, so one pair serves all sessions.
#[derive(Clone)]
pub struct FrameSinks {
    pub from_client: Arc<dyn FrameSink>,
    pub from_server: Arc<dyn FrameSink>,
}

impl FrameSinks {
    pub fn new(from_client: Arc<dyn FrameSink>, from_server: Arc<dyn FrameSink>) -> Self {
        Self {
            from_client,
            from_server,
        }
    }
}

/// Errors that end the dispatch loop.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to accept client connection: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to dial upstream {remote}: {source}")]
    Dial {
        remote: String,
        #[source]
        source: io::Error,
    },
}

/// Accepts clients, dials upstream for each and starts a [`Relay`] per pair.
///
/// The loop is sequential; all concurrency lives inside the relays. Session
/// ids start at 0 and go up by one per successfully dialed pair.
pub struct Dispatcher<D> {
    remote: String,
    dialer: D,
    sinks: FrameSinks,
    on_dial_error: DialFailurePolicy,
    next_id: u64,
}

impl<D: Dialer> Dispatcher<D> {
    pub fn new(remote: impl Into<String>, dialer: D, sinks: FrameSinks) -> Self {
        Self {
            remote: remote.into(),
            dialer,
            sinks,
            on_dial_error: DialFailurePolicy::default(),
            next_id: 0,
        }
    }

    pub fn with_dial_failure_policy(mut self, policy: DialFailurePolicy) -> Self {
        self.on_dial_error = policy;
        self
    }

    /// Id the next relayed session will get.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Run the loop until accepting fails, or dialing fails under
    /// [`DialFailurePolicy::Stop`]. Started relays are not waited for.
    pub async fn run<A: Acceptor>(&mut self, listener: &mut A) -> Result<(), DispatchError> {
        loop {
            let (client, peer) = listener.accept().await.map_err(DispatchError::Accept)?;

            let server = match self.dialer.dial(&self.remote).await {
                Ok(server) => server,
                Err(err) => {
                    match self.on_dial_error {
                        DialFailurePolicy::Stop => {
                            tracing::error!(%peer, remote = %self.remote, %err, "upstream dial failed");
                            return Err(DispatchError::Dial {
                                remote: self.remote.clone(),
                                source: err,
                            });
                        }
                        DialFailurePolicy::Skip => {
                            tracing::warn!(
                                %peer,
                                remote = %self.remote,
                                %err,
                                "upstream dial failed; dropping client"
                            );
                            continue;
                        }
                    }
                }
            };

            let session_id = self.next_id;
            self.next_id += 1;

            tracing::info!(session_id, %peer, remote = %self.remote, "session started");

            Relay::new(
                client,
                server,
                session_id,
                Arc::clone(&self.sinks.from_client),
                Arc::clone(&self.sinks.from_server),
            )
            .run();
        }
    }
}

/// Relay every connection accepted on `listener` to `remote`, writing the
/// classic tagged raw capture to `output`.
pub async fn sniff<W>(
    mut listener: TcpListener,
    remote: &str,
    output: W,
) -> Result<(), DispatchError>
where
    W: std::io::Write + Send + 'static,
{
    let (from_client, from_server) = default_frame_sinks(output);
    Dispatcher::new(remote, TcpDialer, FrameSinks::new(from_client, from_server))
        .run(&mut listener)
        .await
}

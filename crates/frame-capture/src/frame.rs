use std::fmt;

/// Which way a captured frame travelled through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client -> upstream server
    ClientToServer,
    /// Upstream server -> client
    ServerToClient,
}

impl Direction {
    /// `true` for bytes the client sent.
    pub fn from_client(self) -> bool {
        matches!(self, Direction::ClientToServer)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("client->server"),
            Direction::ServerToClient => f.write_str("server->client"),
        }
    }
}

/// Identifies the session and direction a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub session_id: u64,
    pub direction: Direction,
}

impl FrameContext {
    pub fn new(session_id: u64, direction: Direction) -> Self {
        Self {
            session_id,
            direction,
        }
    }
}

/// Errors a [`FrameSink`] can report for a single delivery.
///
/// The relay never acts on these; they exist so sinks and transformers can
/// short-circuit a frame and so tests can observe what went wrong.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to write captured frame: {0}")]
    Write(#[from] std::io::Error),

    #[error("capture output lock poisoned")]
    Poisoned,

    #[error("capture queue is full; frame dropped")]
    QueueFull,

    #[error("capture consumer has gone away")]
    ConsumerClosed,
}

/// Accepts one frame at a time: an ordered sequence of byte buffers that
/// together form a single read event on one direction of a session.
///
/// Implementations must treat the buffers as read-only and must not block
/// beyond the delivery itself, since the relay holds its session lock for
/// the duration of the call.
pub trait FrameSink: Send + Sync {
    fn write_frame(&self, ctx: &FrameContext, data: &[&[u8]]) -> Result<(), CaptureError>;
}

/// A [`FrameSink`] backed by a plain function or closure.
pub struct FnSink<F>(F);

/// Turn a closure into a [`FrameSink`].
pub fn sink_fn<F>(f: F) -> FnSink<F>
where
    F: Fn(&FrameContext, &[&[u8]]) -> Result<(), CaptureError> + Send + Sync,
{
    FnSink(f)
}

impl<F> FrameSink for FnSink<F>
where
    F: Fn(&FrameContext, &[&[u8]]) -> Result<(), CaptureError> + Send + Sync,
{
    fn write_frame(&self, ctx: &FrameContext, data: &[&[u8]]) -> Result<(), CaptureError> {
        (self.0)(ctx, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn direction_reports_origin() {
        assert!(Direction::ClientToServer.from_client());
        assert!(!Direction::ServerToClient.from_client());
        assert_eq!(Direction::ServerToClient.to_string(), "server->client");
    }

    #[test]
    fn closure_sink_receives_buffers_in_order() {
        let seen = Mutex::new(Vec::new());
        let sink = sink_fn(|ctx: &FrameContext, data: &[&[u8]]| {
            assert_eq!(ctx.session_id, 7);
            seen.lock().unwrap().push(data.concat());
            Ok(())
        });

        let ctx = FrameContext::new(7, Direction::ClientToServer);
        sink.write_frame(&ctx, &[&b"ab"[..], &b""[..], &b"cd"[..]])
            .unwrap();
        drop(sink);

        assert_eq!(seen.into_inner().unwrap(), vec![b"abcd".to_vec()]);
    }
}

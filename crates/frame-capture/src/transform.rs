use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::frame::{CaptureError, FrameContext, FrameSink};
use crate::http::{self, BLANK_LINE};

/// A decorator over a [`FrameSink`].
///
/// A transformer sees each frame before the sink it wraps and decides what,
/// if anything, to pass on. [`wrap`](Transform::wrap) turns a transformer
/// plus an inner sink into a new sink, so chains are built inside-out:
///
/// ```
/// use std::sync::Arc;
/// use frame_capture::{Preface, RawSink, SuppressHttpHeaders, Transform};
///
/// let raw = Arc::new(RawSink::new(Vec::<u8>::new()));
/// let tagged = Preface::tagged(">>>>>>").wrap(raw);
/// let sink = SuppressHttpHeaders.wrap(tagged);
/// # let _ = sink;
/// ```
///
/// Any closure with the right shape is a transformer; see [`transform_fn`].
pub trait Transform: Send + Sync + 'static {
    /// Handle one frame, delegating to `inner` as needed.
    fn write_through(
        &self,
        inner: &dyn FrameSink,
        ctx: &FrameContext,
        data: &[&[u8]],
    ) -> Result<(), CaptureError>;

    /// Put this transformer in front of `inner`.
    fn wrap(self, inner: Arc<dyn FrameSink>) -> Arc<dyn FrameSink>
    where
        Self: Sized,
    {
        Arc::new(Transformed {
            transform: self,
            inner,
        })
    }
}

impl<F> Transform for F
where
    F: Fn(&dyn FrameSink, &FrameContext, &[&[u8]]) -> Result<(), CaptureError>
        + Send
        + Sync
        + 'static,
{
    fn write_through(
        &self,
        inner: &dyn FrameSink,
        ctx: &FrameContext,
        data: &[&[u8]],
    ) -> Result<(), CaptureError> {
        self(inner, ctx, data)
    }
}

/// Pin a closure to the transformer signature so its argument lifetimes are
/// inferred correctly.
pub fn transform_fn<F>(f: F) -> F
where
    F: Fn(&dyn FrameSink, &FrameContext, &[&[u8]]) -> Result<(), CaptureError>
        + Send
        + Sync
        + 'static,
{
    f
}

/// The sink produced by [`Transform::wrap`].
struct Transformed<T> {
    transform: T,
    inner: Arc<dyn FrameSink>,
}

impl<T: Transform> FrameSink for Transformed<T> {
    fn write_frame(&self, ctx: &FrameContext, data: &[&[u8]]) -> Result<(), CaptureError> {
        self.transform
            .write_through(self.inner.as_ref(), ctx, data)
    }
}

// ---------------------------------------------------------------------------
// Preface
// ---------------------------------------------------------------------------

/// Prepends a per-frame preface and guarantees a trailing newline.
///
/// Every frame leaving this transformer starts with `preface(ctx)` and ends
/// with `\n`, which keeps raw capture output readable and greppable by
/// session and direction.
pub struct Preface<P> {
    preface: P,
}

impl<P> Preface<P>
where
    P: Fn(&FrameContext) -> Vec<u8> + Send + Sync + 'static,
{
    pub fn new(preface: P) -> Self {
        Self { preface }
    }
}

/// A preface built by [`Preface::tagged`].
pub type TaggedPreface = Preface<Box<dyn Fn(&FrameContext) -> Vec<u8> + Send + Sync>>;

impl TaggedPreface {
    /// Preface of the form `"<tag> <session-id>\n"`.
    pub fn tagged(tag: &'static str) -> Self {
        Self {
            preface: Box::new(move |ctx: &FrameContext| {
                format!("{tag} {}\n", ctx.session_id).into_bytes()
            }),
        }
    }
}

impl<P> Transform for Preface<P>
where
    P: Fn(&FrameContext) -> Vec<u8> + Send + Sync + 'static,
{
    fn write_through(
        &self,
        inner: &dyn FrameSink,
        ctx: &FrameContext,
        data: &[&[u8]],
    ) -> Result<(), CaptureError> {
        let preface = (self.preface)(ctx);

        let mut parts: Vec<&[u8]> = Vec::with_capacity(data.len() + 2);
        parts.push(preface.as_slice());
        parts.extend_from_slice(data);
        if !data.is_empty() && !ends_with_newline(data) {
            parts.push(b"\n");
        }

        inner.write_frame(ctx, &parts)
    }
}

/// Whether the bytes of the frame, taken as a whole, end with `\n`.
fn ends_with_newline(data: &[&[u8]]) -> bool {
    data.iter()
        .rev()
        .find(|buf| !buf.is_empty())
        .is_some_and(|buf| buf.ends_with(b"\n"))
}

// ---------------------------------------------------------------------------
// SuppressHttpHeaders
// ---------------------------------------------------------------------------

/// Replaces an HTTP/1.x header block with just its first line.
///
/// Frames whose first line does not look like an HTTP request or status line
/// pass through untouched. Detection only looks at the current frame; a
/// header block split across reads is not reassembled.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuppressHttpHeaders;

impl Transform for SuppressHttpHeaders {
    fn write_through(
        &self,
        inner: &dyn FrameSink,
        ctx: &FrameContext,
        data: &[&[u8]],
    ) -> Result<(), CaptureError> {
        let joined = data.concat();
        match http::split_first_line(&joined) {
            Some((first_line, rest)) => {
                let body = http::split_once(rest, BLANK_LINE)
                    .map(|(_, body)| body)
                    .unwrap_or_default();
                inner.write_frame(ctx, &[first_line, b"\n", body])
            }
            None => inner.write_frame(ctx, data),
        }
    }
}

// ---------------------------------------------------------------------------
// Toggle
// ---------------------------------------------------------------------------

/// Applies the wrapped transformer only while its switch is on.
///
/// Clones share the switch, so one [`ToggleHandle`] controls every chain
/// built from the same toggle.
#[derive(Debug, Clone)]
pub struct Toggle<T> {
    enabled: Arc<AtomicBool>,
    transform: T,
}

impl<T: Transform> Toggle<T> {
    pub fn new(transform: T, enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            transform,
        }
    }

    pub fn handle(&self) -> ToggleHandle {
        ToggleHandle {
            enabled: Arc::clone(&self.enabled),
        }
    }
}

impl<T: Transform> Transform for Toggle<T> {
    fn write_through(
        &self,
        inner: &dyn FrameSink,
        ctx: &FrameContext,
        data: &[&[u8]],
    ) -> Result<(), CaptureError> {
        if self.enabled.load(Ordering::Relaxed) {
            self.transform.write_through(inner, ctx, data)
        } else {
            inner.write_frame(ctx, data)
        }
    }
}

/// Switch for a [`Toggle`].
#[derive(Debug, Clone)]
pub struct ToggleHandle {
    enabled: Arc<AtomicBool>,
}

impl ToggleHandle {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Flip the switch and return the new state.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::Relaxed)
    }
}

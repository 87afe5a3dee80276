use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::frame::{CaptureError, FrameContext, FrameSink};
use crate::transform::{Preface, Transform};

/// Tag line prefix for client -> server frames in raw output.
pub const CLIENT_TAG: &str = ">>>>>>";
/// Tag line prefix for server -> client frames in raw output.
pub const SERVER_TAG: &str = "<<<<<<";

/// Writes every buffer of a frame straight to an underlying byte stream.
///
/// The stream is locked for the whole frame and flushed afterwards, so one
/// `RawSink` can be shared by any number of sessions without their frames
/// interleaving. A failed write aborts only the frame being written.
#[derive(Debug)]
pub struct RawSink<W> {
    output: Mutex<W>,
}

impl<W: Write + Send> RawSink<W> {
    pub fn new(output: W) -> Self {
        Self {
            output: Mutex::new(output),
        }
    }
}

impl<W: Write + Send> FrameSink for RawSink<W> {
    fn write_frame(&self, _ctx: &FrameContext, data: &[&[u8]]) -> Result<(), CaptureError> {
        let mut output = self.output.lock().map_err(|_| CaptureError::Poisoned)?;
        for buf in data {
            output.write_all(buf)?;
        }
        output.flush()?;
        Ok(())
    }
}

/// The classic pair of sinks: each direction tagged with its preface line and
/// written to one shared raw output.
///
/// Returns `(from_client, from_server)`.
pub fn default_frame_sinks<W>(output: W) -> (Arc<dyn FrameSink>, Arc<dyn FrameSink>)
where
    W: Write + Send + 'static,
{
    let raw: Arc<dyn FrameSink> = Arc::new(RawSink::new(output));
    let from_client = Preface::tagged(CLIENT_TAG).wrap(Arc::clone(&raw));
    let from_server = Preface::tagged(SERVER_TAG).wrap(raw);
    (from_client, from_server)
}

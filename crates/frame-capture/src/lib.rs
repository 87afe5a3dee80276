//! Frame capture for the tcp-sniffer relay.
//!
//! A relay hands every chunk it reads to a [`FrameSink`] as one *frame*: an
//! ordered list of byte buffers plus the session id and direction it came
//! from. Sinks come in two flavours:
//!
//! * [`RawSink`] writes the bytes to any [`std::io::Write`] as they are.
//! * [`RecordSink`] turns each frame into a [`CaptureRecord`] and hands it
//!   to a consumer, optionally a background task writing JSON lines.
//!
//! [`Transform`]s decorate a sink and compose into a chain:
//!
//! ```text
//! frame -> [SuppressHttpHeaders] -> [Preface] -> RawSink -> stdout
//! ```
//!
//! [`default_frame_sinks`] builds the usual raw pair, tagging client frames
//! with `">>>>>> <id>"` and server frames with `"<<<<<< <id>"`.

pub mod frame;
mod http;
pub mod memory;
pub mod raw;
pub mod record;
pub mod sink;
pub mod transform;
pub mod writer;

// Re-export primary public types at the crate root for convenience.
pub use frame::{sink_fn, CaptureError, Direction, FnSink, FrameContext, FrameSink};
pub use memory::MemoryOutput;
pub use raw::{default_frame_sinks, RawSink, CLIENT_TAG, SERVER_TAG};
pub use record::CaptureRecord;
pub use sink::RecordSink;
pub use transform::{
    transform_fn, Preface, SuppressHttpHeaders, TaggedPreface, Toggle, ToggleHandle, Transform,
};
pub use writer::{RecordWriteError, RecordWriter};

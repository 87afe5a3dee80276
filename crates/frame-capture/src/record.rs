use serde::{Deserialize, Serialize};

use crate::frame::FrameContext;
use crate::http::{self, BLANK_LINE};

/// Structured form of one captured frame, for consumers that want fields
/// rather than raw bytes.
///
/// Serialises as `{"id":0,"fromClient":true,"header":"...","body":"..."}`,
/// with `header` omitted when the frame does not look like HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub id: u64,
    #[serde(rename = "fromClient")]
    pub from_client: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub body: String,
}

impl CaptureRecord {
    /// Build a record from a frame's buffers.
    ///
    /// The frame is decoded as (lossy) UTF-8 with leading whitespace removed.
    /// When its first line is an HTTP/1.x request or status line, everything
    /// up to the first blank line becomes `header` and the rest `body`; an
    /// HTTP frame with no blank line is all header. Anything else lands in
    /// `body` untouched.
    pub fn from_frame(ctx: &FrameContext, data: &[&[u8]]) -> Self {
        let joined = data.concat();
        let trimmed = http::trim_leading_whitespace(&joined);

        let (header, body) = if http::split_first_line(trimmed).is_some() {
            match http::split_once(trimmed, BLANK_LINE) {
                Some((header, body)) => (Some(lossy(header)), lossy(body)),
                None => (Some(lossy(trimmed)), String::new()),
            }
        } else {
            (None, lossy(trimmed))
        };

        Self {
            id: ctx.session_id,
            from_client: ctx.direction.from_client(),
            header,
            body,
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

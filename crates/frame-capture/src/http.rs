//! Minimal byte-level helpers for spotting HTTP/1.x messages in a frame.
//!
//! Nothing here parses HTTP. A frame "looks like HTTP" when its first CRLF
//! terminated line mentions `HTTP/1.`, which covers both request lines
//! (`GET / HTTP/1.1`) and status lines (`HTTP/1.1 200 OK`).

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const BLANK_LINE: &[u8] = b"\r\n\r\n";
const VERSION_MARKER: &[u8] = b"HTTP/1.";

/// Position of the first occurrence of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split around the first occurrence of `separator`, dropping the separator.
pub(crate) fn split_once<'a>(data: &'a [u8], separator: &[u8]) -> Option<(&'a [u8], &'a [u8])> {
    find(data, separator).map(|pos| (&data[..pos], &data[pos + separator.len()..]))
}

/// Strip leading Unicode whitespace. Decoding stops at the first byte that is
/// not valid UTF-8.
pub(crate) fn trim_leading_whitespace(data: &[u8]) -> &[u8] {
    let mut rest = data;
    while let Some(ch) = leading_char(rest) {
        if !ch.is_whitespace() {
            break;
        }
        rest = &rest[ch.len_utf8()..];
    }
    rest
}

fn leading_char(data: &[u8]) -> Option<char> {
    let prefix = &data[..data.len().min(4)];
    let valid = match std::str::from_utf8(prefix) {
        Ok(text) => text,
        Err(err) => std::str::from_utf8(&prefix[..err.valid_up_to()]).ok()?,
    };
    valid.chars().next()
}

/// If `data` starts (after leading whitespace) with an HTTP/1.x first line,
/// return that line and everything after its CRLF.
pub(crate) fn split_first_line(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let (first, rest) = split_once(trim_leading_whitespace(data), CRLF)?;
    find(first, VERSION_MARKER).map(|_| (first, rest))
}

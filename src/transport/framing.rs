//! Response framing shared by every transport.
//!
//! Bytes from the link are accumulated in a [`FrameBuffer`]; a [`ResponseSpec`] decides
//! when a complete frame is present. Bytes beyond the frame stay buffered for the next
//! read, so a chunk that straddles two frames is never lost.

use crate::error::{AppResult, ControllerError};
use bytes::{Buf, Bytes, BytesMut};
use regex::bytes::Regex;

/// Largest frame accepted before the response is declared malformed.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Width of a big-endian length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixWidth {
    /// One byte
    U8,
    /// Two bytes
    U16,
    /// Four bytes
    U32,
}

impl PrefixWidth {
    fn len(self) -> usize {
        match self {
            PrefixWidth::U8 => 1,
            PrefixWidth::U16 => 2,
            PrefixWidth::U32 => 4,
        }
    }

    fn decode(self, bytes: &[u8]) -> usize {
        match self {
            PrefixWidth::U8 => bytes[0] as usize,
            PrefixWidth::U16 => u16::from_be_bytes([bytes[0], bytes[1]]) as usize,
            PrefixWidth::U32 => {
                u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
        }
    }
}

/// Expected shape of a response.
#[derive(Debug, Clone)]
pub enum ResponseSpec {
    /// Write-only command
    None,
    /// Exactly N bytes
    Exact(usize),
    /// Everything up to (and excluding) the delimiter
    Delimited(Bytes),
    /// Big-endian length prefix followed by that many bytes (prefix excluded)
    LengthPrefixed(PrefixWidth),
    /// The first match of the pattern; bytes before the match are discarded.
    ///
    /// Anchor the pattern on a terminator: an unanchored pattern can match a
    /// prefix of a response that has not fully arrived yet.
    Pattern(Regex),
}

impl ResponseSpec {
    /// Newline-delimited response. A trailing `\r` is left for the caller to trim.
    pub fn line() -> Self {
        Self::Delimited(Bytes::from_static(b"\n"))
    }

    /// Response terminated by `delimiter`.
    pub fn delimited(delimiter: impl AsRef<[u8]>) -> Self {
        Self::Delimited(Bytes::copy_from_slice(delimiter.as_ref()))
    }

    /// Response matching a byte regex.
    pub fn pattern(pattern: &str) -> AppResult<Self> {
        Regex::new(pattern)
            .map(Self::Pattern)
            .map_err(|e| ControllerError::InvalidArgument(format!("invalid pattern: {}", e)))
    }

    /// Whether a read follows the write.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Accumulates link bytes and yields complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// Empty buffer capped at [`MAX_FRAME_LEN`].
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    /// Empty buffer holding at most `max_len` bytes.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            max_len,
        }
    }

    /// Append bytes read from the link.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffered byte count.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Nothing buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Extract one frame if the buffer holds a complete one.
    ///
    /// Returns `Ok(None)` while more bytes are needed and a `Protocol` error once the
    /// frame can no longer fit within the maximum length.
    pub fn try_frame(&mut self, spec: &ResponseSpec) -> AppResult<Option<Bytes>> {
        match spec {
            ResponseSpec::None => Ok(Some(Bytes::new())),
            ResponseSpec::Exact(n) => {
                if *n > self.max_len {
                    return Err(self.oversized(*n));
                }
                if self.buf.len() >= *n {
                    Ok(Some(self.buf.split_to(*n).freeze()))
                } else {
                    Ok(None)
                }
            }
            ResponseSpec::Delimited(delimiter) => {
                if delimiter.is_empty() {
                    return Err(ControllerError::InvalidArgument(
                        "empty response delimiter".to_string(),
                    ));
                }
                match find(&self.buf, delimiter) {
                    Some(pos) => {
                        let frame = self.buf.split_to(pos).freeze();
                        self.buf.advance(delimiter.len());
                        Ok(Some(frame))
                    }
                    None if self.buf.len() > self.max_len => Err(self.oversized(self.buf.len())),
                    None => Ok(None),
                }
            }
            ResponseSpec::LengthPrefixed(width) => {
                let prefix = width.len();
                if self.buf.len() < prefix {
                    return Ok(None);
                }
                let body = width.decode(&self.buf[..prefix]);
                if body > self.max_len {
                    return Err(self.oversized(body));
                }
                if self.buf.len() < prefix + body {
                    return Ok(None);
                }
                self.buf.advance(prefix);
                Ok(Some(self.buf.split_to(body).freeze()))
            }
            ResponseSpec::Pattern(re) => {
                let bounds = re.find(&self.buf).map(|m| (m.start(), m.end()));
                match bounds {
                    Some((start, end)) => {
                        self.buf.advance(start);
                        Ok(Some(self.buf.split_to(end - start).freeze()))
                    }
                    None if self.buf.len() > self.max_len => Err(self.oversized(self.buf.len())),
                    None => Ok(None),
                }
            }
        }
    }

    fn oversized(&mut self, len: usize) -> ControllerError {
        self.buf.clear();
        ControllerError::Protocol(format!(
            "response frame of {} bytes exceeds limit of {} bytes",
            len, self.max_len
        ))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

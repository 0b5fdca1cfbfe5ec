//! Attribute frame codec.
//!
//! A frame is a sequence of `name=value` lines followed by one empty line.
//! Names and values are `%XX`-escaped so they can carry `%`, control bytes,
//! and newlines. Requests and replies each occupy exactly one frame; the
//! leading `request` attribute selects the handler, which then reads the
//! remaining body fields of the same frame in a fixed order.
//!
//! Reads are strict: the next attribute must carry exactly the requested
//! name. After a malformed body the handler can [`AttrReader::skip_to_end`]
//! to resynchronize on the frame terminator and keep the connection usable.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::proto::ATTR_REQUEST;

/// Upper bound on one attribute line; longer lines are refused.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum AttrError {
    #[error("connection closed in the middle of a request frame")]
    UnexpectedEof,
    #[error("expected attribute `{expected}`, got `{got}`")]
    UnexpectedAttribute { expected: &'static str, got: String },
    #[error("request frame ended before attribute `{expected}`")]
    TruncatedFrame { expected: &'static str },
    #[error("attribute line without `=` separator")]
    MissingSeparator,
    #[error("attribute `{name}` is not a number: {value:?}")]
    NotANumber { name: &'static str, value: String },
    #[error("malformed %-escape in attribute data")]
    BadEscape,
    #[error("attribute line too long ({observed_bytes} bytes)")]
    LineTooLong { observed_bytes: usize },
    #[error("expected end of frame, got attribute `{got}`")]
    ExpectedEnd { got: String },
    #[error("client stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AttrError {
    /// Whether this is a frame-level error the handler should answer with a
    /// BAD reply. I/O errors and truncation drop the connection instead.
    pub fn is_frame_error(&self) -> bool {
        !matches!(self, AttrError::Io(_) | AttrError::UnexpectedEof)
    }

    /// Whether the rest of the offending frame is still unread, so the
    /// handler must [`AttrReader::skip_to_end`] before the next request.
    pub fn needs_resync(&self) -> bool {
        self.is_frame_error() && !matches!(self, AttrError::TruncatedFrame { .. })
    }
}

enum Line {
    Pair { name: String, value: String },
    End,
    Eof,
}

/// Reads attribute frames from a client stream.
pub struct AttrReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> AttrReader<R> {
    pub fn wrapping(stream: R) -> Self {
        Self {
            inner: BufReader::new(stream),
            line: String::new(),
        }
    }

    async fn next_raw_line(&mut self) -> Result<Option<&str>, AttrError> {
        self.line.clear();
        let n = self.inner.read_line(&mut self.line).await?;
        if n == 0 {
            return Ok(None);
        }
        if self.line.len() > MAX_LINE_BYTES {
            return Err(AttrError::LineTooLong {
                observed_bytes: self.line.len(),
            });
        }
        let line = self.line.trim_end_matches(['\n', '\r']);
        Ok(Some(line))
    }

    async fn next_line(&mut self) -> Result<Line, AttrError> {
        let Some(line) = self.next_raw_line().await? else {
            return Ok(Line::Eof);
        };
        if line.is_empty() {
            return Ok(Line::End);
        }
        let (name, value) = line.split_once('=').ok_or(AttrError::MissingSeparator)?;
        Ok(Line::Pair {
            name: unescape(name)?,
            value: unescape(value)?,
        })
    }

    /// Reads the leading `request` attribute of the next frame.
    ///
    /// `Ok(None)` means the client closed the connection cleanly between
    /// frames.
    pub async fn read_request(&mut self) -> Result<Option<String>, AttrError> {
        match self.next_line().await? {
            Line::Eof => Ok(None),
            Line::End => Err(AttrError::TruncatedFrame {
                expected: ATTR_REQUEST,
            }),
            Line::Pair { name, value } if name == ATTR_REQUEST => Ok(Some(value)),
            Line::Pair { name, .. } => Err(AttrError::UnexpectedAttribute {
                expected: ATTR_REQUEST,
                got: name,
            }),
        }
    }

    /// Reads the next body attribute, which must carry exactly `name`.
    pub async fn read_string(&mut self, name: &'static str) -> Result<String, AttrError> {
        match self.next_line().await? {
            Line::Eof => Err(AttrError::UnexpectedEof),
            Line::End => Err(AttrError::TruncatedFrame { expected: name }),
            Line::Pair { name: got, value } if got == name => Ok(value),
            Line::Pair { name: got, .. } => Err(AttrError::UnexpectedAttribute {
                expected: name,
                got,
            }),
        }
    }

    pub async fn read_number(&mut self, name: &'static str) -> Result<i64, AttrError> {
        let value = self.read_string(name).await?;
        value
            .parse()
            .map_err(|_| AttrError::NotANumber { name, value })
    }

    /// Consumes the frame terminator.
    pub async fn expect_end(&mut self) -> Result<(), AttrError> {
        match self.next_line().await? {
            Line::End => Ok(()),
            Line::Eof => Err(AttrError::UnexpectedEof),
            Line::Pair { name, .. } => Err(AttrError::ExpectedEnd { got: name }),
        }
    }

    /// Consumes the remainder of the current frame, terminator included,
    /// tolerating lines the strict readers would refuse.
    pub async fn skip_to_end(&mut self) -> Result<(), AttrError> {
        loop {
            match self.next_raw_line().await? {
                None => return Err(AttrError::UnexpectedEof),
                Some("") => return Ok(()),
                Some(_) => continue,
            }
        }
    }
}

/// Buffers one reply frame and writes it with a single flush.
pub struct AttrWriter<W> {
    inner: W,
    buf: String,
}

impl<W: AsyncWrite + Unpin> AttrWriter<W> {
    pub fn wrapping(stream: W) -> Self {
        Self {
            inner: stream,
            buf: String::new(),
        }
    }

    pub fn write_string(&mut self, name: &str, value: &str) -> &mut Self {
        escape_into(name, &mut self.buf);
        self.buf.push('=');
        escape_into(value, &mut self.buf);
        self.buf.push('\n');
        self
    }

    pub fn write_number(&mut self, name: &str, value: i64) -> &mut Self {
        escape_into(name, &mut self.buf);
        self.buf.push('=');
        self.buf.push_str(&value.to_string());
        self.buf.push('\n');
        self
    }

    /// Appends the frame terminator and flushes the whole frame.
    pub async fn finish(&mut self) -> Result<(), AttrError> {
        self.buf.push('\n');
        self.inner.write_all(self.buf.as_bytes()).await?;
        self.inner.flush().await?;
        self.buf.clear();
        Ok(())
    }
}

fn needs_escape(byte: u8) -> bool {
    byte == b'%' || byte == b'=' || byte < 0x20 || byte == 0x7f
}

/// `%XX`-escapes `%`, `=`, and control bytes; everything else (multi-byte
/// UTF-8 sequences included) passes through verbatim.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    escape_into(raw, &mut out);
    out
}

fn escape_into(raw: &str, out: &mut String) {
    for byte in raw.bytes() {
        if needs_escape(byte) {
            out.push('%');
            out.push(char::from(HEX[usize::from(byte >> 4)]));
            out.push(char::from(HEX[usize::from(byte & 0x0f)]));
        } else {
            // Escaping only ASCII-range bytes keeps the output valid UTF-8.
            out.push(char::from(byte));
        }
    }
}

const HEX: [u8; 16] = *b"0123456789ABCDEF";

/// Reverses [`escape`]. Fails on dangling or non-hex `%` sequences and on
/// escapes that do not decode to valid UTF-8.
pub fn unescape(raw: &str) -> Result<String, AttrError> {
    if !raw.contains('%') {
        return Ok(raw.to_string());
    }
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.bytes();
    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            out.push(byte);
            continue;
        }
        let hi = bytes.next().ok_or(AttrError::BadEscape)?;
        let lo = bytes.next().ok_or(AttrError::BadEscape)?;
        let hi = hex_value(hi).ok_or(AttrError::BadEscape)?;
        let lo = hex_value(lo).ok_or(AttrError::BadEscape)?;
        out.push(hi << 4 | lo);
    }
    String::from_utf8(out).map_err(|_| AttrError::BadEscape)
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

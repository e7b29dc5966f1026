//! Frame codec for the JSON-RPC wire protocol.
//!
//! Two framings are spoken:
//! - `Content-Length: N\r\n\r\n` followed by exactly N bytes of JSON
//! - one JSON object per `\n`-terminated line (what most stdio servers emit)
//!
//! `Framing::Auto` decides from the first frame a peer sends and answers in
//! the same framing. Clones of a codec share that decision, so the reader and
//! writer halves of one split socket stay consistent.

use std::sync::{Arc, OnceLock};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use super::errors::FrameError;
use super::types::Message;

/// Default cap on a single frame body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Cap on the header block of a length-prefixed frame.
const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    ContentLength,
    Line,
    /// Detect from the first inbound frame; reply in kind.
    Auto,
}

impl std::str::FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "content_length" => Ok(Self::ContentLength),
            "line" => Ok(Self::Line),
            "auto" => Ok(Self::Auto),
            other => Err(format!(
                "unknown framing '{other}': expected 'line', 'content_length' or 'auto'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    framing: Framing,
    detected: Arc<OnceLock<Framing>>,
    max_frame_bytes: usize,
    skip_malformed_lines: bool,
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        let detected = Arc::new(OnceLock::new());
        if framing != Framing::Auto {
            let _ = detected.set(framing);
        }
        Self {
            framing,
            detected,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            skip_malformed_lines: false,
        }
    }

    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    /// In line mode, skip lines that are not protocol messages instead of
    /// failing. Backends commonly print banners to stdout.
    pub fn skip_malformed_lines(mut self) -> Self {
        self.skip_malformed_lines = true;
        self
    }

    /// Framing in effect, once known.
    pub fn active_framing(&self) -> Option<Framing> {
        self.detected.get().copied()
    }

    fn resolve(&self, src: &BytesMut) -> Option<Framing> {
        if let Some(framing) = self.detected.get() {
            return Some(*framing);
        }
        let first = src.iter().find(|b| !b.is_ascii_whitespace())?;
        let framing = if *first == b'{' || *first == b'[' {
            Framing::Line
        } else {
            Framing::ContentLength
        };
        tracing::debug!(framing = ?framing, "detected peer framing");
        Some(*self.detected.get_or_init(|| framing))
    }

    fn decode_content_length(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        // Tolerate stray line breaks between frames.
        let leading = src.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
        src.advance(leading);

        let Some(header_end) = find_subsequence(src, HEADER_TERMINATOR) else {
            // A finished first line that is no header means the peer is not
            // speaking this framing at all.
            if let Some(newline) = src.iter().position(|b| *b == b'\n') {
                let line = trim_ascii_whitespace(&src[..newline]);
                if !line.is_empty() && !line.contains(&b':') {
                    return Err(FrameError::Malformed {
                        reason: format!(
                            "expected a header line, got {:?}",
                            String::from_utf8_lossy(line)
                        ),
                    });
                }
            }
            if src.len() > MAX_HEADER_BYTES {
                return Err(FrameError::Malformed {
                    reason: format!("header block exceeds {MAX_HEADER_BYTES} bytes"),
                });
            }
            return Ok(None);
        };

        let header = std::str::from_utf8(&src[..header_end]).map_err(|_| FrameError::Malformed {
            reason: "header block is not valid UTF-8".into(),
        })?;

        let mut content_length = None;
        for line in header.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                return Err(FrameError::Malformed {
                    reason: format!("malformed header line: {line:?}"),
                });
            };
            if key.trim().eq_ignore_ascii_case("content-length") {
                let value = value.trim();
                let parsed = value.parse::<usize>().map_err(|_| FrameError::InvalidLength {
                    value: value.to_string(),
                })?;
                content_length = Some(parsed);
            }
        }

        let length = content_length.ok_or(FrameError::MissingLength)?;
        if length > self.max_frame_bytes {
            return Err(FrameError::Oversized {
                size: length,
                limit: self.max_frame_bytes,
            });
        }

        let body_start = header_end + HEADER_TERMINATOR.len();
        let frame_end = body_start + length;
        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }

        src.advance(body_start);
        let body = src.split_to(length);
        parse_message(&body).map(Some)
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        loop {
            let Some(newline) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_frame_bytes {
                    return Err(FrameError::Oversized {
                        size: src.len(),
                        limit: self.max_frame_bytes,
                    });
                }
                return Ok(None);
            };

            let raw = src.split_to(newline + 1);
            let line = trim_ascii_whitespace(&raw[..newline]);
            if line.is_empty() {
                continue;
            }
            if line.len() > self.max_frame_bytes {
                return Err(FrameError::Oversized {
                    size: line.len(),
                    limit: self.max_frame_bytes,
                });
            }

            match parse_message(line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) if self.skip_malformed_lines => {
                    tracing::debug!(error = %e, "skipping non-protocol output line");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        match self.resolve(src) {
            None if src.len() > self.max_frame_bytes => Err(FrameError::Oversized {
                size: src.len(),
                limit: self.max_frame_bytes,
            }),
            None => Ok(None),
            Some(Framing::Line) => self.decode_line(src),
            Some(_) => self.decode_content_length(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        let rest = trim_ascii_whitespace(src);
        if rest.is_empty() {
            src.clear();
            return Ok(None);
        }
        // A final line without its terminator is still a complete message.
        if self.active_framing() == Some(Framing::Line) {
            src.put_u8(b'\n');
            return self.decode_line(src);
        }
        Err(FrameError::Malformed {
            reason: format!("stream ended inside a frame ({} bytes pending)", src.len()),
        })
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = serde_json::to_vec(&item.to_value()).map_err(|e| FrameError::Malformed {
            reason: format!("failed to serialize message: {e}"),
        })?;
        if body.len() > self.max_frame_bytes {
            return Err(FrameError::Oversized {
                size: body.len(),
                limit: self.max_frame_bytes,
            });
        }

        match self.active_framing() {
            Some(Framing::Line) => {
                dst.reserve(body.len() + 1);
                dst.put_slice(&body);
                dst.put_u8(b'\n');
            }
            _ => {
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                dst.reserve(header.len() + body.len());
                dst.put_slice(header.as_bytes());
                dst.put_slice(&body);
            }
        }
        Ok(())
    }
}

fn parse_message(bytes: &[u8]) -> Result<Message, FrameError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| FrameError::Malformed {
            reason: format!("invalid JSON payload: {e}"),
        })?;
    Message::from_value(value)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

// ─── Tests ───────────────────────────────────────────────────────────────────

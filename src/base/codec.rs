// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incremental decoder for the three message kinds sharing one byte stream.
//!
//! Interleaved frames are recognized by the `0x24` magic byte; anything else
//! is an RTSP request or response delimited by a blank line and
//! `Content-Length`.

use bytes::{Buf, BytesMut};

use crate::error::FramingErrorKind;
use crate::hex::LimitedHex;

use super::{
    get_cseq, HeaderMap, InterleavedFrame, Message, Method, Request, Response, StatusCode,
    INTERLEAVED_MAGIC,
};

/// Longest accepted request line, status line, or single header line.
const MAX_LINE: usize = 4096;

/// Most headers accepted in one message.
const MAX_HEADERS: usize = 255;

/// Largest accepted `Content-Length`.
const MAX_BODY: usize = 256 * 1024;

/// Decodes RTSP messages. Tracks the stream position for error reporting.
pub(crate) struct Codec {
    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

impl Codec {
    pub(crate) fn new() -> Self {
        Codec { read_pos: 0 }
    }
}

/// An intermediate error type that exists because `FramedRead` expects the
/// codec's error type to implement `From<std::io::Error>`, and the public
/// [`crate::Error`] takes additional context.
#[derive(Debug)]
pub(crate) enum CodecError {
    Io(std::io::Error),
    Parse {
        kind: FramingErrorKind,
        description: String,
        pos: u64,
    },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e)
    }
}

impl Codec {
    fn err<T>(&self, kind: FramingErrorKind, description: String) -> Result<T, CodecError> {
        Err(CodecError::Parse {
            kind,
            description,
            pos: self.read_pos,
        })
    }

    fn parse_msg(&self, src: &mut BytesMut) -> Result<Option<(usize, Message)>, CodecError> {
        // Tolerate interstitial CRLF, as some peers send keepalive newlines
        // between messages.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }

        if src.is_empty() {
            return Ok(None);
        }

        if src[0] == INTERLEAVED_MAGIC {
            // Fast path for interleaved data, skipping the text-message
            // machinery entirely.
            if src.len() < 4 {
                return Ok(None);
            }
            let channel_id = src[1];
            let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut msg = src.split_to(len);
            msg.advance(4);
            return Ok(Some((
                len,
                Message::Frame(InterleavedFrame::from_channel(channel_id, msg.freeze())),
            )));
        }

        // Every method name and "RTSP/1.0" starts with an uppercase letter;
        // anything else is binary that lost its frame header.
        if !src[0].is_ascii_uppercase() {
            return self.err(
                FramingErrorKind::WrongMagic,
                format!(
                    "stream byte {:#04x} is neither an interleaved-frame magic nor the start \
                     of an RTSP message:\n{:#?}",
                    src[0],
                    LimitedHex::new(src, 64),
                ),
            );
        }

        let header_end = match find_double_crlf(src) {
            Some(i) => i,
            None => {
                if src.len() > MAX_LINE * (MAX_HEADERS + 1) {
                    return self.err(
                        FramingErrorKind::TooManyHeaders,
                        format!("no blank line within {} bytes", src.len()),
                    );
                }
                return Ok(None);
            }
        };

        let (first_line, headers) = self.parse_header_section(&src[..header_end])?;
        let content_length = match headers.get("Content-Length") {
            None => 0,
            Some(v) => match usize::from_str_radix(v.trim(), 10) {
                Ok(n) if n <= MAX_BODY => n,
                Ok(n) => {
                    return self.err(
                        FramingErrorKind::BodyTooLarge,
                        format!("Content-Length {} exceeds limit {}", n, MAX_BODY),
                    )
                }
                Err(_) => {
                    return self.err(
                        FramingErrorKind::BodyTooLarge,
                        format!("unparseable Content-Length {:?}", v),
                    )
                }
            },
        };

        let total = header_end + 4 + content_length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(total);
        raw.advance(header_end + 4);
        let body = raw.freeze();

        let msg = match first_line {
            FirstLine::Request { method, url } => Message::Request(Request {
                method,
                url,
                headers,
                body,
            }),
            FirstLine::Response { status, reason } => Message::Response(Response {
                status,
                reason,
                headers,
                body,
            }),
        };
        Ok(Some((total, msg)))
    }

    fn parse_header_section(&self, raw: &[u8]) -> Result<(FirstLine, HeaderMap), CodecError> {
        let mut lines = raw.split(|&b| b == b'\n');
        let first_line = match lines.next() {
            Some(l) => self.parse_first_line(trim_cr(l))?,
            None => {
                return self.err(
                    FramingErrorKind::InvalidRequestLine,
                    "empty message".to_owned(),
                )
            }
        };

        let mut headers = HeaderMap::new();
        let mut count = 0;
        for line in lines {
            let line = trim_cr(line);
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_LINE {
                return self.err(
                    FramingErrorKind::HeaderTooLong,
                    format!("{}-byte header line", line.len()),
                );
            }
            count += 1;
            if count > MAX_HEADERS {
                return self.err(
                    FramingErrorKind::TooManyHeaders,
                    format!("more than {} headers", MAX_HEADERS),
                );
            }
            let line = match std::str::from_utf8(line) {
                Ok(l) => l,
                Err(_) => {
                    return self.err(
                        FramingErrorKind::HeaderTooLong,
                        format!("non-UTF-8 header line:\n{:#?}", LimitedHex::new(line, 64)),
                    )
                }
            };
            let (name, value) = match line.split_once(':') {
                Some((n, v)) if !n.is_empty() => (n, v.trim()),
                _ => {
                    return self.err(
                        FramingErrorKind::HeaderTooLong,
                        format!("malformed header line {:?}", line),
                    )
                }
            };
            headers.add(name, value);
        }
        Ok((first_line, headers))
    }

    fn parse_first_line(&self, line: &[u8]) -> Result<FirstLine, CodecError> {
        if line.len() > MAX_LINE {
            return self.err(
                FramingErrorKind::HeaderTooLong,
                format!("{}-byte first line", line.len()),
            );
        }
        let line = match std::str::from_utf8(line) {
            Ok(l) => l,
            Err(_) => {
                return self.err(
                    FramingErrorKind::InvalidRequestLine,
                    format!("non-UTF-8 first line:\n{:#?}", LimitedHex::new(line, 64)),
                )
            }
        };

        if let Some(rest) = line.strip_prefix("RTSP/1.0 ") {
            // Status-Line = RTSP-Version SP Status-Code SP Reason-Phrase
            let (status, reason) = match rest.split_once(' ') {
                Some((s, r)) => (s, r),
                None => (rest, ""),
            };
            let status = match u16::from_str_radix(status, 10) {
                Ok(s) if (100..1000).contains(&s) => StatusCode(s),
                _ => {
                    return self.err(
                        FramingErrorKind::InvalidStatusLine,
                        format!("bad status in {:?}", line),
                    )
                }
            };
            return Ok(FirstLine::Response {
                status,
                reason: reason.to_owned(),
            });
        }

        // Request-Line = Method SP Request-URI SP RTSP-Version
        let mut parts = line.splitn(3, ' ');
        let (method, url, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v)) => (m, u, v),
            _ => {
                return self.err(
                    FramingErrorKind::InvalidRequestLine,
                    format!("malformed request line {:?}", line),
                )
            }
        };
        if version != "RTSP/1.0" {
            return self.err(
                FramingErrorKind::InvalidRequestLine,
                format!("unsupported version in {:?}", line),
            );
        }
        let method: Method = match method.parse() {
            Ok(m) => m,
            Err(()) => {
                return self.err(
                    FramingErrorKind::InvalidMethod,
                    format!("unknown method {:?}", method),
                )
            }
        };
        let url = match url::Url::parse(url) {
            Ok(u) => u,
            Err(e) => {
                return self.err(
                    FramingErrorKind::InvalidRequestLine,
                    format!("bad request URI {:?}: {}", url, e),
                )
            }
        };
        Ok(FirstLine::Request { method, url })
    }
}

enum FirstLine {
    Request { method: Method, url: url::Url },
    Response { status: StatusCode, reason: String },
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

/// Finds the start of the first `\r\n\r\n` in `src`.
fn find_double_crlf(src: &[u8]) -> Option<usize> {
    src.windows(4).position(|w| w == b"\r\n\r\n")
}

impl tokio_util::codec::Decoder for Codec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (len, msg) = match self.parse_msg(src) {
            Err(e) => return Err(e),
            Ok(None) => return Ok(None),
            Ok(Some((len, msg))) => (len, msg),
        };
        self.read_pos += len as u64;
        Ok(Some(msg))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => self.err(
                FramingErrorKind::ShortRead,
                format!("EOF mid-message with {} bytes buffered", src.len()),
            ),
        }
    }
}

/// A response missing or disagreeing on `CSeq` is useless to the caller;
/// surface it as a framing problem rather than matching it to a request.
pub(crate) fn check_cseq(response: &Response, expected: u32) -> Result<(), CodecError> {
    match get_cseq(&response.headers) {
        Some(c) if c == expected => Ok(()),
        Some(c) => Err(CodecError::Parse {
            kind: FramingErrorKind::MissingCSeq,
            description: format!("response CSeq {} does not match request CSeq {}", c, expected),
            pos: 0,
        }),
        None => Err(CodecError::Parse {
            kind: FramingErrorKind::MissingCSeq,
            description: "response has no CSeq header".to_owned(),
            pos: 0,
        }),
    }
}

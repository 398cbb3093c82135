// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire-level RTSP message model: requests, responses, and interleaved
//! binary frames, plus the codec that reads all three off one byte stream.

use bytes::{BufMut, Bytes, BytesMut};
use url::Url;

use crate::StreamType;

pub(crate) mod codec;

/// The RTSP/1.0 methods, as defined in [RFC 2326 section
/// 10](https://datatracker.ietf.org/doc/html/rfc2326#section-10).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Describe,
    Announce,
    Setup,
    Play,
    Pause,
    Record,
    Teardown,
    Options,
    GetParameter,
    SetParameter,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Describe => "DESCRIBE",
            Method::Announce => "ANNOUNCE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Record => "RECORD",
            Method::Teardown => "TEARDOWN",
            Method::Options => "OPTIONS",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "DESCRIBE" => Method::Describe,
            "ANNOUNCE" => Method::Announce,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "RECORD" => Method::Record,
            "TEARDOWN" => Method::Teardown,
            "OPTIONS" => Method::Options,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            _ => return Err(()),
        })
    }
}

/// An RTSP status code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const SESSION_NOT_FOUND: StatusCode = StatusCode(454);
    pub const UNSUPPORTED_TRANSPORT: StatusCode = StatusCode(461);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);

    #[inline]
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }

    /// The canonical reason phrase, used when building responses.
    pub fn reason(self) -> &'static str {
        match self.0 {
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            454 => "Session Not Found",
            461 => "Unsupported Transport",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            _ => "",
        }
    }
}

impl From<StatusCode> for u16 {
    fn from(c: StatusCode) -> Self {
        c.0
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An insertion-ordered header map.
///
/// Lookups are ASCII-case-insensitive; the spelling supplied at insertion is
/// preserved on write. A key maps to an ordered list of values, written as
/// repeated header lines. (Comma-joining would corrupt `WWW-Authenticate`,
/// whose Digest parameters themselves contain commas.)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderMap(Vec<(String, Vec<String>)>);

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap(Vec::new())
    }

    /// Appends a value, creating the key if absent.
    pub fn add<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        let name = name.into();
        match self.entry_mut(&name) {
            Some(vs) => vs.push(value.into()),
            None => self.0.push((name, vec![value.into()])),
        }
    }

    /// Replaces all values of the key with the single supplied value.
    pub fn set<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        let name = name.into();
        match self.entry_mut(&name) {
            Some(vs) => {
                vs.clear();
                vs.push(value.into());
            }
            None => self.0.push((name, vec![value.into()])),
        }
    }

    /// Returns the first value of the key, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, vs)| vs.first().map(String::as_str))
    }

    /// Returns all values of the key, in insertion order.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, vs)| &vs[..])
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(n, vs)| (n.as_str(), &vs[..]))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut Vec<String>> {
        self.0
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, vs)| vs)
    }

    fn write_to(&self, buf: &mut BytesMut) {
        for (name, values) in &self.0 {
            for value in values {
                buf.put_slice(name.as_bytes());
                buf.put_slice(b": ");
                buf.put_slice(value.as_bytes());
                buf.put_slice(b"\r\n");
            }
        }
    }
}

/// An RTSP request.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Serializes onto the end of `buf`, supplying `Content-Length` when a
    /// body is present and the caller did not.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.url.as_str().as_bytes());
        buf.put_slice(b" RTSP/1.0\r\n");
        self.headers.write_to(buf);
        if !self.body.is_empty() && !self.headers.contains("Content-Length") {
            buf.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
    }
}

/// An RTSP response.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            reason: status.reason().to_owned(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(b"RTSP/1.0 ");
        buf.put_slice(self.status.0.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.reason.as_bytes());
        buf.put_slice(b"\r\n");
        self.headers.write_to(buf);
        if !self.body.is_empty() && !self.headers.contains("Content-Length") {
            buf.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
    }
}

/// Magic byte that introduces an interleaved frame on the control stream.
pub const INTERLEAVED_MAGIC: u8 = 0x24;

/// An RTP or RTCP packet carried inside the RTSP TCP control stream.
///
/// Wire format: `0x24 | channel:u8 | len:u16 BE | payload[len]`, where the
/// channel id is `track_id * 2` for RTP and `track_id * 2 + 1` for RTCP.
#[derive(Clone, Debug, PartialEq)]
pub struct InterleavedFrame {
    pub track_id: usize,
    pub stream_type: StreamType,
    pub payload: Bytes,
}

impl InterleavedFrame {
    pub(crate) fn from_channel(channel_id: u8, payload: Bytes) -> Self {
        InterleavedFrame {
            track_id: usize::from(channel_id >> 1),
            stream_type: if channel_id & 1 == 0 {
                StreamType::Rtp
            } else {
                StreamType::Rtcp
            },
            payload,
        }
    }

    pub fn channel_id(&self) -> u8 {
        channel_id(self.track_id, self.stream_type)
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(INTERLEAVED_MAGIC);
        buf.put_u8(self.channel_id());
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
    }
}

/// Returns the interleaved channel id of a track's RTP or RTCP flow.
///
/// The channel field is one byte, so only tracks 0..=127 are addressable;
/// callers negotiating TCP transport must reject larger ids before calling
/// this.
pub fn channel_id(track_id: usize, stream_type: StreamType) -> u8 {
    debug_assert!(track_id <= 127, "track {} exceeds the channel space", track_id);
    (track_id as u8) * 2
        + match stream_type {
            StreamType::Rtp => 0,
            StreamType::Rtcp => 1,
        }
}

/// Any of the three message kinds that share the control stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Frame(InterleavedFrame),
}

/// Extracts the `CSeq` header, if present and parseable.
pub(crate) fn get_cseq(headers: &HeaderMap) -> Option<u32> {
    headers
        .get("CSeq")
        .and_then(|v| u32::from_str_radix(v.trim(), 10).ok())
}

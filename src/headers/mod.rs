// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed views of the structured RTSP headers this library negotiates with:
//! `Transport`, `Session`, and `RTP-Info`.
//!
//! Parse errors are plain strings; callers wrap them with connection context.

use crate::{StreamProtocol, TransportMode};

/// Delivery style requested in a `Transport` header. Only unicast sessions
/// are routable by this library.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Unicast,
    Multicast,
}

/// A parsed `Transport` header.
///
/// Grammar (RFC 2326 section 12.39):
/// `RTP/AVP[/TCP|/UDP];(unicast|multicast);{interleaved=a-b | client_port=a-b
/// | server_port=a-b | ssrc=X | mode=play|record}`.
/// Unknown parameters are ignored on read and never produced on write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transport {
    pub protocol: StreamProtocol,
    pub delivery: Delivery,
    pub mode: Option<TransportMode>,
    pub interleaved: Option<(u8, u8)>,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    pub ssrc: Option<u32>,
}

impl Transport {
    pub fn new(protocol: StreamProtocol) -> Self {
        Transport {
            protocol,
            delivery: Delivery::Unicast,
            mode: None,
            interleaved: None,
            client_port: None,
            server_port: None,
            ssrc: None,
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        let mut parts = value.split(';');
        let protocol = match parts.next().map(str::trim) {
            Some("RTP/AVP") | Some("RTP/AVP/UDP") => StreamProtocol::Udp,
            Some("RTP/AVP/TCP") => StreamProtocol::Tcp,
            o => return Err(format!("unsupported transport protocol {:?}", o)),
        };
        let mut th = Transport::new(protocol);
        for part in parts {
            let part = part.trim();
            if part.eq_ignore_ascii_case("unicast") {
                th.delivery = Delivery::Unicast;
            } else if part.eq_ignore_ascii_case("multicast") {
                th.delivery = Delivery::Multicast;
            } else if let Some(v) = part.strip_prefix("interleaved=") {
                let (a, b) = parse_pair::<u8>(v)?;
                th.interleaved = Some((a, b.unwrap_or(a + 1)));
            } else if let Some(v) = part.strip_prefix("client_port=") {
                let (a, b) = parse_pair::<u16>(v)?;
                th.client_port = Some((a, b.unwrap_or(a + 1)));
            } else if let Some(v) = part.strip_prefix("server_port=") {
                let (a, b) = parse_pair::<u16>(v)?;
                th.server_port = Some((a, b.unwrap_or(a + 1)));
            } else if let Some(v) = part.strip_prefix("ssrc=") {
                th.ssrc = Some(
                    u32::from_str_radix(v.trim(), 16).map_err(|_| format!("bad ssrc {:?}", v))?,
                );
            } else if let Some(v) = part.strip_prefix("mode=") {
                let v = v.trim_matches('"');
                if v.eq_ignore_ascii_case("play") {
                    th.mode = Some(TransportMode::Play);
                } else if v.eq_ignore_ascii_case("record") {
                    th.mode = Some(TransportMode::Record);
                } else {
                    return Err(format!("bad transport mode {:?}", v));
                }
            }
            // Other parameters (source=, ttl=, ...) are tolerated.
        }
        Ok(th)
    }

    pub fn write(&self) -> String {
        let mut s = String::with_capacity(64);
        s.push_str(match self.protocol {
            StreamProtocol::Udp => "RTP/AVP",
            StreamProtocol::Tcp => "RTP/AVP/TCP",
        });
        s.push_str(match self.delivery {
            Delivery::Unicast => ";unicast",
            Delivery::Multicast => ";multicast",
        });
        if let Some((a, b)) = self.interleaved {
            s.push_str(&format!(";interleaved={}-{}", a, b));
        }
        if let Some((a, b)) = self.client_port {
            s.push_str(&format!(";client_port={}-{}", a, b));
        }
        if let Some((a, b)) = self.server_port {
            s.push_str(&format!(";server_port={}-{}", a, b));
        }
        if let Some(ssrc) = self.ssrc {
            s.push_str(&format!(";ssrc={:08X}", ssrc));
        }
        if let Some(mode) = self.mode {
            s.push_str(match mode {
                TransportMode::Play => ";mode=play",
                TransportMode::Record => ";mode=record",
            });
        }
        s
    }
}

fn parse_pair<T: std::str::FromStr>(v: &str) -> Result<(T, Option<T>), String> {
    let mut it = v.splitn(2, '-');
    let a = it.next().expect("splitn returns at least one part");
    let a = a
        .trim()
        .parse()
        .map_err(|_| format!("bad number {:?} in pair {:?}", a, v))?;
    let b = match it.next() {
        Some(b) => Some(
            b.trim()
                .parse()
                .map_err(|_| format!("bad number {:?} in pair {:?}", b, v))?,
        ),
        None => None,
    };
    Ok((a, b))
}

/// A parsed `Session` header: opaque token plus optional `timeout` parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub timeout_sec: u32,
}

impl Session {
    pub const DEFAULT_TIMEOUT_SEC: u32 = 60;

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.split_once(';') {
            None => Ok(Session {
                id: value.trim().to_owned(),
                timeout_sec: Self::DEFAULT_TIMEOUT_SEC,
            }),
            Some((id, param)) => {
                let timeout_sec = match param.trim().strip_prefix("timeout=") {
                    Some(v) => u32::from_str_radix(v, 10)
                        .map_err(|_| format!("unparseable timeout {:?}", v))?,
                    None => return Err(format!("unparseable Session header {:?}", value)),
                };
                Ok(Session {
                    id: id.trim().to_owned(),
                    timeout_sec,
                })
            }
        }
    }
}

/// One entry of an `RTP-Info` header (RFC 2326 section 12.33), written on
/// `PLAY` responses to anchor each stream's starting sequence number and
/// RTP timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtpInfoEntry {
    pub url: String,
    pub sequence_number: Option<u16>,
    pub timestamp: Option<u32>,
}

/// An `RTP-Info` header: comma-separated list of per-stream entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RtpInfo(pub Vec<RtpInfoEntry>);

impl RtpInfo {
    pub fn parse(value: &str) -> Result<Self, String> {
        let mut entries = Vec::new();
        for part in value.split(',') {
            let mut url = None;
            let mut sequence_number = None;
            let mut timestamp = None;
            for kv in part.split(';') {
                let (k, v) = kv
                    .trim()
                    .split_once('=')
                    .ok_or_else(|| format!("unable to parse key-value {:?}", kv))?;
                match k {
                    "url" => url = Some(v.to_owned()),
                    "seq" => {
                        sequence_number = Some(
                            u16::from_str_radix(v, 10).map_err(|_| format!("bad seq {:?}", v))?,
                        )
                    }
                    "rtptime" => {
                        timestamp = Some(
                            u32::from_str_radix(v, 10)
                                .map_err(|_| format!("bad rtptime {:?}", v))?,
                        )
                    }
                    _ => return Err(format!("invalid key {:?}", k)),
                }
            }
            entries.push(RtpInfoEntry {
                url: url.ok_or_else(|| format!("RTP-Info entry without url: {:?}", part))?,
                sequence_number,
                timestamp,
            });
        }
        Ok(RtpInfo(entries))
    }

    pub fn write(&self) -> String {
        self.0
            .iter()
            .map(|e| {
                let mut s = format!("url={}", e.url);
                if let Some(seq) = e.sequence_number {
                    s.push_str(&format!(";seq={}", seq));
                }
                if let Some(ts) = e.timestamp {
                    s.push_str(&format!(";rtptime={}", ts));
                }
                s
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

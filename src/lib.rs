// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Low-level RTSP 1.0 library.
//!
//! This crate mediates between RTSP signalling and RTP/RTCP media transport:
//! it establishes and tears down media sessions, negotiates per-track
//! transport (interleaved TCP or paired UDP ports), enforces the RTSP state
//! machine on both the client and the server side, and routes media frames
//! between sockets and the caller.
//!
//! It deliberately stops short of codec knowledge: SDP bodies are parsed
//! only far enough to enumerate tracks, and RTP payloads pass through as
//! opaque bytes.

#![forbid(clippy::print_stderr, clippy::print_stdout)]
// I prefer to use from_str_radix(..., 10) to explicitly note the base.
#![allow(clippy::from_str_radix_10)]

use log::trace;
use rand::Rng;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::ops::Range;
use std::time::Duration;

mod error;
mod hex;

pub mod base;
pub mod headers;
pub mod rtcp;
mod track;

pub use error::Error;
pub use track::{Track, Tracks};

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod client;
pub mod server;
mod tokio;

use error::ErrorInt;

/// A media frame routed between sockets and the caller:
/// `(track id, stream type, payload)`.
pub type ReceivedFrame = (usize, StreamType, bytes::Bytes);

/// Interval between RTCP sender/receiver reports produced by the library.
///
/// RFC 3550 section 6.2 prescribes a bandwidth-adaptive interval; this
/// library instead uses a single fixed period for compatibility with the
/// servers and cameras it is deployed against.
pub const RTCP_REPORT_PERIOD: Duration = Duration::from_secs(10);

/// Interval between keepalive requests sent while a client session plays.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Kind of packet carried on a media channel: RTP or its control sibling.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamType {
    Rtp,
    Rtcp,
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamType::Rtp => f.pad("RTP"),
            StreamType::Rtcp => f.pad("RTCP"),
        }
    }
}

/// Transport protocol negotiated for a session's media.
///
/// The choice is made once per session at `SETUP` time and dispatched on
/// once when frame routing starts, not per frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamProtocol {
    Udp,
    Tcp,
}

impl std::fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamProtocol::Udp => f.pad("UDP"),
            StreamProtocol::Tcp => f.pad("TCP"),
        }
    }
}

/// Direction of a session: `Play` receives media, `Record` publishes it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Play,
    Record,
}

/// The live/dead handoff between a connection and its background loops.
///
/// `open` and `error` flip together under the write lock; frame read/write
/// paths take the read lock, so they observe both fields consistently.
pub(crate) struct Live {
    pub(crate) state: ::tokio::sync::RwLock<LiveState>,
}

pub(crate) struct LiveState {
    pub(crate) open: bool,
    pub(crate) error: Option<Error>,
}

impl Live {
    pub(crate) fn new(open: bool) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Live {
            state: ::tokio::sync::RwLock::new(LiveState { open, error: None }),
        })
    }

    /// Latches the terminal error. The first latch wins.
    pub(crate) async fn close_with(&self, e: Error) {
        let mut guard = self.state.write().await;
        if guard.open || guard.error.is_none() {
            guard.open = false;
            guard.error = Some(e);
        }
    }

    pub(crate) async fn latched(&self) -> Error {
        self.state
            .read()
            .await
            .error
            .clone()
            .unwrap_or_else(|| wrap!(ErrorInt::ConnectionClosed))
    }
}

/// A track's pair of local UDP sockets: RTP on an even port, RTCP on the
/// odd port directly above it (RFC 3550 section 11).
struct UdpPair {
    rtp_port: u16,
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
}

impl UdpPair {
    /// Binds an even/odd pair on `ip_addr`.
    ///
    /// The OS can't hand out two adjacent ports atomically, so this starts
    /// at a random even port in the lower half of the IANA ephemeral range
    /// and walks upward (wrapping) until both binds succeed.
    fn bind(ip_addr: IpAddr) -> Result<Self, std::io::Error> {
        const PORT_RANGE: Range<u16> = 16384..32768;
        const ATTEMPTS: u16 = 16;
        let span = PORT_RANGE.end - PORT_RANGE.start;
        let mut port = PORT_RANGE.start + (rand::thread_rng().gen_range(0..span) & !1);
        for attempt in 0..ATTEMPTS {
            match Self::bind_at(ip_addr, port) {
                Ok(pair) => return Ok(pair),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!(
                        "port pair {}-{} on {} in use ({}/{})",
                        port,
                        port + 1,
                        ip_addr,
                        attempt + 1,
                        ATTEMPTS
                    );
                    port += 2;
                    if port >= PORT_RANGE.end {
                        port = PORT_RANGE.start;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!(
                "no free RTP/RTCP port pair on {} after {} attempts",
                ip_addr, ATTEMPTS
            ),
        ))
    }

    fn bind_at(ip_addr: IpAddr, rtp_port: u16) -> Result<Self, std::io::Error> {
        let rtp_socket = UdpSocket::bind(SocketAddr::new(ip_addr, rtp_port))?;
        let rtcp_socket = UdpSocket::bind(SocketAddr::new(ip_addr, rtp_port + 1))?;
        Ok(Self {
            rtp_port,
            rtp_socket,
            rtcp_socket,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn udp_pair_is_even_and_adjacent() {
        let pair = UdpPair::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert_eq!(pair.rtp_port & 1, 0);
        assert_eq!(
            pair.rtp_socket.local_addr().unwrap().port(),
            pair.rtp_port
        );
        assert_eq!(
            pair.rtcp_socket.local_addr().unwrap().port(),
            pair.rtp_port + 1
        );
    }
}

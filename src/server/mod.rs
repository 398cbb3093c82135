// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP server: listener, per-connection state machine, and frame routing.
//!
//! A [`Server`] accepts TCP (or, with TLS configured, RTSPS) connections
//! and yields [`ServerConn`]s. The caller drives each connection with
//! [`ServerConn::read`], supplying a [`ServerHandler`] whose callbacks
//! produce the responses; 2xx responses trigger the state transitions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::tokio::BoxedStream;
use crate::{Error, ErrorInt};

mod conn;
mod interleaved;
mod path;
#[cfg(test)]
mod tests;
mod udp;

pub use conn::{
    AnnounceCtx, DescribeCtx, ErrorResponse, HandlerResult, PauseCtx, PlayCtx, RecordCtx,
    ServerConn, ServerHandler, ServerState, SetupCtx,
};

/// Server-side configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Per-read deadline on control sockets.
    pub read_timeout: Duration,

    /// Per-write deadline on control sockets.
    pub write_timeout: Duration,

    /// Capacity of each connection's inbound frame queue.
    pub read_buffer_count: usize,

    /// Local UDP listen addresses. Both must be set to offer UDP transport;
    /// otherwise UDP `SETUP`s are refused with 461 and clients fall back to
    /// TCP.
    pub udp_rtp_address: Option<SocketAddr>,
    pub udp_rtcp_address: Option<SocketAddr>,

    /// When present, the listener accepts RTSPS (RTSP over TLS) instead of
    /// plain TCP.
    pub tls: Option<Arc<tokio_rustls::rustls::ServerConfig>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            read_buffer_count: 512,
            udp_rtp_address: None,
            udp_rtcp_address: None,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Binds a listener with this configuration.
    pub async fn bind(self, addr: SocketAddr) -> Result<Server, Error> {
        let udp = match (self.udp_rtp_address, self.udp_rtcp_address) {
            (Some(rtp), Some(rtcp)) => Some(Arc::new(
                udp::UdpListeners::bind(rtp, rtcp)
                    .await
                    .map_err(|e| wrap!(ErrorInt::UdpBindFailed(e)))?,
            )),
            (None, None) => None,
            _ => bail!(ErrorInt::InvalidArgument(
                "UDP RTP and RTCP listen addresses must be configured together".to_owned()
            )),
        };
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| wrap!(ErrorInt::ReadError(e)))?;
        let tls = self.tls.clone().map(TlsAcceptor::from);
        Ok(Server {
            listener,
            config: Arc::new(self),
            udp,
            tls,
        })
    }
}

/// A listening RTSP server.
pub struct Server {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    udp: Option<Arc<udp::UdpListeners>>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Binds a listener with default configuration (TCP transport only).
    pub async fn bind(addr: SocketAddr) -> Result<Server, Error> {
        ServerConfig::default().bind(addr).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener
            .local_addr()
            .map_err(|e| wrap!(ErrorInt::ReadError(e)))
    }

    /// Accepts the next connection. Each connection starts in `Initial`
    /// state and is destroyed when its socket closes.
    pub async fn accept(&self) -> Result<ServerConn, Error> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| wrap!(ErrorInt::ReadError(e)))?;
        let stream: BoxedStream = match &self.tls {
            Some(acceptor) => Box::new(
                acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| wrap!(ErrorInt::ReadError(e)))?,
            ),
            None => Box::new(stream),
        };
        Ok(ServerConn::new(
            stream,
            peer_addr,
            self.config.clone(),
            self.udp.clone(),
        ))
    }
}

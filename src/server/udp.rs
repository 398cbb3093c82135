// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The server's shared UDP listener pair.
//!
//! Unlike the client, which binds a fresh even/odd pair per track, the
//! server answers all sessions from two fixed sockets and demultiplexes
//! inbound datagrams by source address: `(remote address, local socket)` →
//! (connection, track, stream type). Datagrams from unknown sources are
//! dropped silently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::trace;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::{ReceivedFrame, StreamType};

#[derive(Clone)]
struct DemuxEntry {
    track_id: usize,
    tx: mpsc::Sender<ReceivedFrame>,
}

struct Endpoint {
    socket: Arc<UdpSocket>,
    demux: Arc<Mutex<HashMap<SocketAddr, DemuxEntry>>>,
    reader: tokio::task::JoinHandle<()>,
}

impl Endpoint {
    async fn bind(addr: SocketAddr, stream_type: StreamType) -> Result<Self, std::io::Error> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let demux: Arc<Mutex<HashMap<SocketAddr, DemuxEntry>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn({
            let socket = socket.clone();
            let demux = demux.clone();
            async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    let (n, from) = match socket.recv_from(&mut buf).await {
                        Ok(r) => r,
                        Err(e) => {
                            trace!("UDP {} listener read error: {}", stream_type, e);
                            continue;
                        }
                    };
                    let entry = demux.lock().expect("demux mutex").get(&from).cloned();
                    let Some(entry) = entry else {
                        // unknown remote endpoint
                        continue;
                    };
                    let frame = (
                        entry.track_id,
                        stream_type,
                        Bytes::copy_from_slice(&buf[..n]),
                    );
                    // A full per-connection queue sheds datagrams rather
                    // than stalling the shared listener.
                    let _ = entry.tx.try_send(frame);
                }
            }
        });
        Ok(Endpoint {
            socket,
            demux,
            reader,
        })
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// The RTP/RTCP listener pair configured via
/// [`crate::server::ServerConfig::udp_rtp_address`] and
/// [`crate::server::ServerConfig::udp_rtcp_address`].
pub(crate) struct UdpListeners {
    rtp: Endpoint,
    rtcp: Endpoint,
}

impl UdpListeners {
    pub(crate) async fn bind(
        rtp_addr: SocketAddr,
        rtcp_addr: SocketAddr,
    ) -> Result<Self, std::io::Error> {
        Ok(UdpListeners {
            rtp: Endpoint::bind(rtp_addr, StreamType::Rtp).await?,
            rtcp: Endpoint::bind(rtcp_addr, StreamType::Rtcp).await?,
        })
    }

    /// The local ports announced as `server_port` in `SETUP` responses.
    pub(crate) fn local_ports(&self) -> (u16, u16) {
        (
            self.rtp.socket.local_addr().map(|a| a.port()).unwrap_or(0),
            self.rtcp.socket.local_addr().map(|a| a.port()).unwrap_or(0),
        )
    }

    /// Routes future datagrams from the given client ports to a connection's
    /// frame queue.
    pub(crate) fn register(
        &self,
        remote_rtp: SocketAddr,
        remote_rtcp: SocketAddr,
        track_id: usize,
        tx: mpsc::Sender<ReceivedFrame>,
    ) {
        self.rtp.demux.lock().expect("demux mutex").insert(
            remote_rtp,
            DemuxEntry {
                track_id,
                tx: tx.clone(),
            },
        );
        self.rtcp
            .demux
            .lock()
            .expect("demux mutex")
            .insert(remote_rtcp, DemuxEntry { track_id, tx });
    }

    pub(crate) fn unregister(&self, remote_rtp: SocketAddr, remote_rtcp: SocketAddr) {
        self.rtp.demux.lock().expect("demux mutex").remove(&remote_rtp);
        self.rtcp
            .demux
            .lock()
            .expect("demux mutex")
            .remove(&remote_rtcp);
    }

    /// Sends one outbound packet from the shared socket of the given kind.
    pub(crate) async fn send(
        &self,
        stream_type: StreamType,
        payload: &[u8],
        to: SocketAddr,
    ) -> Result<(), std::io::Error> {
        let socket = match stream_type {
            StreamType::Rtp => &self.rtp.socket,
            StreamType::Rtcp => &self.rtcp.socket,
        };
        socket.send_to(payload, to).await.map(|_| ())
    }
}

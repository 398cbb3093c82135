// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Background loops run while a client session is in `Play` or `Record`.
//!
//! Each loop honors a one-shot terminate signal, latches its terminal error
//! into the shared [`Live`] state, and hands the control-socket reader back
//! to the foreground so `PAUSE`/`TEARDOWN` can read their responses.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use url::Url;

use crate::base::{self, InterleavedFrame, Message, Method, Request};
use crate::tokio::{MessageReader, MessageWriter};
use crate::{
    ErrorInt, Live, ReceivedFrame, StreamProtocol, StreamType, KEEPALIVE_PERIOD,
    RTCP_REPORT_PERIOD,
};

use super::{SetupTrack, TrackTransport};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum Role {
    Play,
    Record,
}

pub(super) struct LoopCtx {
    pub(super) role: Role,
    pub(super) protocol: StreamProtocol,
    pub(super) reader: Option<MessageReader>,
    pub(super) writer: Arc<AsyncMutex<MessageWriter>>,
    pub(super) tracks: BTreeMap<usize, Arc<SetupTrack>>,
    pub(super) live: Arc<Live>,
    pub(super) frame_tx: mpsc::Sender<ReceivedFrame>,
    pub(super) next_cseq: Arc<std::sync::atomic::AtomicU32>,
    pub(super) session_id: Option<String>,
    pub(super) stream_url: Option<Url>,
    pub(super) user_agent: String,
    pub(super) read_timeout: Duration,
}

/// Handle on a running background loop.
pub(super) struct Background {
    terminate_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<Option<MessageReader>>,
}

impl Background {
    /// Signals termination and waits for the loop to finish, returning the
    /// control-socket reader if the loop had borrowed it.
    pub(super) async fn stop(self) -> Option<MessageReader> {
        let _ = self.terminate_tx.send(true);
        self.handle.await.unwrap_or(None)
    }

    /// Signals termination without waiting; used when the connection is
    /// dropped rather than closed.
    pub(super) fn signal(&self) {
        let _ = self.terminate_tx.send(true);
    }
}

pub(super) fn spawn(ctx: LoopCtx) -> Background {
    let (terminate_tx, terminate_rx) = watch::channel(false);
    let handle = tokio::spawn(run(ctx, terminate_rx));
    Background {
        terminate_tx,
        handle,
    }
}

async fn run(ctx: LoopCtx, terminate_rx: watch::Receiver<bool>) -> Option<MessageReader> {
    match (ctx.role, ctx.protocol) {
        (Role::Record, StreamProtocol::Udp) => record_udp(ctx, terminate_rx).await,
        (Role::Record, StreamProtocol::Tcp) => record_tcp(ctx, terminate_rx).await,
        (Role::Play, StreamProtocol::Tcp) => play_tcp(ctx, terminate_rx).await,
        (Role::Play, StreamProtocol::Udp) => play_udp(ctx, terminate_rx).await,
    }
}

fn report_ticker() -> tokio::time::Interval {
    tokio::time::interval_at(
        tokio::time::Instant::now() + RTCP_REPORT_PERIOD,
        RTCP_REPORT_PERIOD,
    )
}

/// Walks the tracks and routes any due RTCP report over its transport.
async fn send_reports(
    tracks: &BTreeMap<usize, Arc<SetupTrack>>,
    writer: &Arc<AsyncMutex<MessageWriter>>,
    live: &Arc<Live>,
) {
    if !live.state.read().await.open {
        return;
    }
    let now = Instant::now();
    for (id, t) in tracks {
        let report = t.rtcp.lock().expect("rtcp mutex").report(now);
        let Some(payload) = report else { continue };
        let result = match &t.transport {
            TrackTransport::Udp { rtcp_socket, .. } => {
                rtcp_socket.send(&payload).await.map(|_| ())
            }
            TrackTransport::Tcp => {
                let frame = InterleavedFrame {
                    track_id: *id,
                    stream_type: StreamType::Rtcp,
                    payload,
                };
                match writer.lock().await.write_frame(&frame).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        live.close_with(e).await;
                        return;
                    }
                }
            }
        };
        if let Err(e) = result {
            debug!("failed to send RTCP report on track {}: {}", id, e);
        }
    }
}

/// Publishing over UDP: the control socket is idle except for the
/// possibility of server-initiated messages, which are surfaced as the
/// session error.
async fn record_udp(
    mut ctx: LoopCtx,
    mut terminate_rx: watch::Receiver<bool>,
) -> Option<MessageReader> {
    let mut reader = ctx.reader.take().expect("record UDP loop borrows the reader");
    let mut report = report_ticker();
    loop {
        tokio::select! {
            _ = terminate_rx.changed() => {
                ctx.live.close_with(wrap!(ErrorInt::Terminated)).await;
                return Some(reader);
            }
            // Idle UDP publishing is normal; no read deadline here.
            msg = reader.next(None) => {
                let e = match msg {
                    Ok(Some(Message::Request(req))) if req.method == Method::Teardown => {
                        wrap!(ErrorInt::Terminated)
                    }
                    Ok(Some(Message::Response(resp))) => wrap!(ErrorInt::WrongStatusCode {
                        code: resp.status,
                        message: format!("unexpected response while publishing: {}", resp.reason),
                    }),
                    Ok(Some(_)) => continue,
                    Ok(None) => wrap!(ErrorInt::ConnectionClosed),
                    Err(e) => e,
                };
                ctx.live.close_with(e).await;
                return Some(reader);
            }
            _ = report.tick() => send_reports(&ctx.tracks, &ctx.writer, &ctx.live).await,
        }
    }
}

/// Publishing over TCP: frames interleave on the control socket under the
/// foreground's `write_frame`; this loop only drives the report ticker.
async fn record_tcp(ctx: LoopCtx, mut terminate_rx: watch::Receiver<bool>) -> Option<MessageReader> {
    let mut report = report_ticker();
    loop {
        tokio::select! {
            _ = terminate_rx.changed() => {
                ctx.live.close_with(wrap!(ErrorInt::Terminated)).await;
                return None;
            }
            _ = report.tick() => send_reports(&ctx.tracks, &ctx.writer, &ctx.live).await,
        }
    }
}

/// Outstanding-keepalive bookkeeping shared by the play loops.
struct Keepalive {
    outstanding: Option<u32>,
}

impl Keepalive {
    /// Sends a `GET_PARAMETER` keepalive, or fails if the previous one was
    /// never answered within a whole period.
    async fn tick(&mut self, ctx: &LoopCtx) -> Result<(), crate::Error> {
        if let Some(cseq) = self.outstanding {
            debug!(
                "server failed to respond to keepalive {} within {:?}",
                cseq, KEEPALIVE_PERIOD
            );
            bail!(ErrorInt::Timeout);
        }
        let url = match &ctx.stream_url {
            Some(u) => u.clone(),
            None => return Ok(()),
        };
        let cseq = ctx.next_cseq.fetch_add(1, Ordering::Relaxed);
        let mut req = Request::new(Method::GetParameter, url);
        req.headers.set("CSeq", cseq.to_string());
        req.headers.set("User-Agent", ctx.user_agent.clone());
        if let Some(session_id) = &ctx.session_id {
            req.headers.set("Session", session_id.clone());
        }
        ctx.writer.lock().await.write_request(&req).await?;
        self.outstanding = Some(cseq);
        Ok(())
    }

    /// Returns true if the response settles the outstanding keepalive.
    fn matches(&mut self, resp: &crate::base::Response) -> bool {
        match self.outstanding {
            Some(cseq) if base::get_cseq(&resp.headers) == Some(cseq) => {
                self.outstanding = None;
                true
            }
            _ => false,
        }
    }
}

/// Delivers a frame into the bounded queue. A full queue drops the frame
/// (slow consumers must not stall the socket); a closed queue means the
/// session is going away.
fn deliver(
    frame_tx: &mpsc::Sender<ReceivedFrame>,
    frame: ReceivedFrame,
) -> Result<(), crate::Error> {
    match frame_tx.try_send(frame) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            debug!("inbound frame queue full; dropping frame");
            Ok(())
        }
        Err(TrySendError::Closed(_)) => Err(wrap!(ErrorInt::Terminated)),
    }
}

/// Playing over TCP: one reader distinguishes frames from responses.
async fn play_tcp(
    mut ctx: LoopCtx,
    mut terminate_rx: watch::Receiver<bool>,
) -> Option<MessageReader> {
    let mut reader = ctx.reader.take().expect("play TCP loop borrows the reader");
    let mut report = report_ticker();
    let mut keepalive_ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEPALIVE_PERIOD,
        KEEPALIVE_PERIOD,
    );
    let mut keepalive = Keepalive { outstanding: None };
    loop {
        tokio::select! {
            _ = terminate_rx.changed() => {
                ctx.live.close_with(wrap!(ErrorInt::Terminated)).await;
                return Some(reader);
            }
            msg = reader.next(Some(ctx.read_timeout)) => {
                let e = match msg {
                    Ok(Some(Message::Frame(f))) => match ctx.tracks.get(&f.track_id) {
                        Some(t) => {
                            t.rtcp
                                .lock()
                                .expect("rtcp mutex")
                                .process_frame(Instant::now(), f.stream_type, &f.payload);
                            match deliver(&ctx.frame_tx, (f.track_id, f.stream_type, f.payload)) {
                                Ok(()) => continue,
                                Err(e) => e,
                            }
                        }
                        None => wrap!(ErrorInt::InvalidArgument(format!(
                            "received interleaved data on unassigned channel {}",
                            f.channel_id()
                        ))),
                    },
                    Ok(Some(Message::Response(resp))) => {
                        if keepalive.matches(&resp) {
                            continue;
                        }
                        wrap!(ErrorInt::WrongStatusCode {
                            code: resp.status,
                            message: format!("unexpected response while playing: {}", resp.reason),
                        })
                    }
                    Ok(Some(Message::Request(req))) if req.method == Method::Teardown => {
                        wrap!(ErrorInt::Terminated)
                    }
                    Ok(Some(Message::Request(req))) => {
                        warn!("ignoring {} request during playback", req.method);
                        continue;
                    }
                    Ok(None) => wrap!(ErrorInt::ConnectionClosed),
                    Err(e) => e,
                };
                ctx.live.close_with(e).await;
                return Some(reader);
            }
            _ = report.tick() => send_reports(&ctx.tracks, &ctx.writer, &ctx.live).await,
            _ = keepalive_ticker.tick() => {
                if let Err(e) = keepalive.tick(&ctx).await {
                    ctx.live.close_with(e).await;
                    return Some(reader);
                }
            }
        }
    }
}

/// Playing over UDP: one reader task per track per stream type, plus the
/// control-socket reader watching for session termination.
async fn play_udp(
    mut ctx: LoopCtx,
    mut terminate_rx: watch::Receiver<bool>,
) -> Option<MessageReader> {
    let mut reader = ctx.reader.take().expect("play UDP loop borrows the reader");

    let mut subtasks = Vec::new();
    for t in ctx.tracks.values() {
        if let TrackTransport::Udp {
            rtp_socket,
            rtcp_socket,
        } = &t.transport
        {
            for (stream_type, socket) in [
                (StreamType::Rtp, rtp_socket.clone()),
                (StreamType::Rtcp, rtcp_socket.clone()),
            ] {
                subtasks.push(tokio::spawn(udp_reader(
                    t.clone(),
                    stream_type,
                    socket,
                    ctx.frame_tx.clone(),
                    ctx.live.clone(),
                    terminate_rx.clone(),
                )));
            }
        }
    }

    let mut report = report_ticker();
    let mut keepalive_ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEPALIVE_PERIOD,
        KEEPALIVE_PERIOD,
    );
    let mut keepalive = Keepalive { outstanding: None };
    let result = loop {
        tokio::select! {
            _ = terminate_rx.changed() => break wrap!(ErrorInt::Terminated),
            // The control socket is expected to stay silent apart from
            // keepalive responses; anything else ends the session.
            msg = reader.next(None) => {
                match msg {
                    Ok(Some(Message::Response(resp))) => {
                        if keepalive.matches(&resp) {
                            continue;
                        }
                        break wrap!(ErrorInt::WrongStatusCode {
                            code: resp.status,
                            message: format!("unexpected response while playing: {}", resp.reason),
                        });
                    }
                    Ok(Some(Message::Request(req))) if req.method == Method::Teardown => {
                        break wrap!(ErrorInt::Terminated);
                    }
                    Ok(Some(Message::Request(req))) => {
                        warn!("ignoring {} request during playback", req.method);
                        continue;
                    }
                    Ok(Some(Message::Frame(_))) => continue,
                    Ok(None) => break wrap!(ErrorInt::ConnectionClosed),
                    Err(e) => break e,
                }
            }
            _ = report.tick() => send_reports(&ctx.tracks, &ctx.writer, &ctx.live).await,
            _ = keepalive_ticker.tick() => {
                if let Err(e) = keepalive.tick(&ctx).await {
                    break e;
                }
            }
        }
    };
    ctx.live.close_with(result).await;
    for h in &subtasks {
        h.abort();
    }
    for h in subtasks {
        let _ = h.await;
    }
    Some(reader)
}

async fn udp_reader(
    track: Arc<SetupTrack>,
    stream_type: StreamType,
    socket: Arc<tokio::net::UdpSocket>,
    frame_tx: mpsc::Sender<ReceivedFrame>,
    live: Arc<Live>,
    mut terminate_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            _ = terminate_rx.changed() => return,
            r = socket.recv(&mut buf) => match r {
                Ok(n) => {
                    let payload = Bytes::copy_from_slice(&buf[..n]);
                    track
                        .rtcp
                        .lock()
                        .expect("rtcp mutex")
                        .process_frame(Instant::now(), stream_type, &payload);
                    if deliver(&frame_tx, (track.id, stream_type, payload)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    live.close_with(wrap!(ErrorInt::UdpRecvError(e))).await;
                    return;
                }
            },
        }
    }
}

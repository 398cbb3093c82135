// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One accepted server-side connection.
//!
//! [`ServerConn::read`] drives the request loop: it parses requests, enforces
//! the protocol invariants (path agreement, duplicate `SETUP`, channel
//! collisions, `RECORD` completeness, session tokens) *before* invoking the
//! user's [`ServerHandler`] callback, applies the state transition when the
//! callback's response is 2xx, and routes inbound media frames to
//! [`ServerHandler::on_frame`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Instant;

use bytes::Bytes;
use log::debug;
use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use url::Url;

use crate::base::{self, InterleavedFrame, Message, Method, Request, Response, StatusCode};
use crate::headers::{self, Delivery, Transport};
use crate::rtcp::RtcpSession;
use crate::tokio::{BoxedStream, MessageReader, MessageWriter};
use crate::{
    Error, ErrorInt, Live, ReceivedFrame, StreamProtocol, StreamType, Tracks, TransportMode,
    RTCP_REPORT_PERIOD,
};

use super::interleaved::{ChannelTable, ClaimError};
use super::path;
use super::udp::UdpListeners;
use super::ServerConfig;

/// State of a server connection; constrains which methods are legal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServerState {
    Initial,
    PrePlay,
    Play,
    PreRecord,
    Record,
    Closed,
}

pub struct DescribeCtx<'a> {
    pub url: &'a Url,
    pub path: String,
}

pub struct AnnounceCtx<'a> {
    pub url: &'a Url,
    pub path: &'a str,
    pub tracks: &'a Tracks,
}

pub struct SetupCtx<'a> {
    pub url: &'a Url,
    pub path: &'a str,
    pub track_id: usize,
    pub transport: &'a Transport,
}

pub struct PlayCtx<'a> {
    pub url: &'a Url,
}

pub struct RecordCtx<'a> {
    pub url: &'a Url,
}

pub struct PauseCtx<'a> {
    pub url: &'a Url,
}

/// A callback outcome that delivers `response` to the client and then closes
/// the connection with `error`.
///
/// (A plain non-2xx [`Response`] is *not* an error: it is delivered verbatim
/// and leaves the connection alive with its state unchanged.)
pub struct ErrorResponse {
    pub response: Response,
    pub error: Error,
}

impl ErrorResponse {
    pub fn new(response: Response, reason: impl Into<String>) -> Self {
        ErrorResponse {
            response,
            error: wrap!(ErrorInt::Handler(reason.into())),
        }
    }
}

pub type HandlerResult = Result<Response, ErrorResponse>;

/// User callbacks driving a server connection.
///
/// Defaults answer `501 Not Implemented`, which never causes a state
/// transition, so a handler only implements the methods it serves.
pub trait ServerHandler: Send {
    fn on_describe(
        &mut self,
        _ctx: DescribeCtx<'_>,
    ) -> Result<(Response, Option<Bytes>), ErrorResponse> {
        Ok((Response::new(StatusCode::NOT_IMPLEMENTED), None))
    }

    fn on_announce(&mut self, _ctx: AnnounceCtx<'_>) -> HandlerResult {
        Ok(Response::new(StatusCode::NOT_IMPLEMENTED))
    }

    fn on_setup(&mut self, _ctx: SetupCtx<'_>) -> HandlerResult {
        Ok(Response::new(StatusCode::NOT_IMPLEMENTED))
    }

    fn on_play(&mut self, _ctx: PlayCtx<'_>) -> HandlerResult {
        Ok(Response::new(StatusCode::NOT_IMPLEMENTED))
    }

    fn on_record(&mut self, _ctx: RecordCtx<'_>) -> HandlerResult {
        Ok(Response::new(StatusCode::NOT_IMPLEMENTED))
    }

    fn on_pause(&mut self, _ctx: PauseCtx<'_>) -> HandlerResult {
        Ok(Response::new(StatusCode::NOT_IMPLEMENTED))
    }

    /// Called for each media frame received from this connection's peer.
    fn on_frame(&mut self, _track_id: usize, _stream_type: StreamType, _payload: &Bytes) {}
}

enum ServerTrackTransport {
    Udp {
        peer_rtp: SocketAddr,
        peer_rtcp: SocketAddr,
    },
    Tcp,
}

struct ServerTrack {
    transport: ServerTrackTransport,
    rtcp: StdMutex<RtcpSession>,
}

struct SessionState {
    state: ServerState,
    session_id: Option<String>,
    base_path: Option<String>,
    announced: Option<Tracks>,
    protocol: Option<StreamProtocol>,
    tracks: BTreeMap<usize, Arc<ServerTrack>>,
    channels: ChannelTable,
    registered_udp: Vec<(SocketAddr, SocketAddr)>,
}

struct ConnCore {
    config: Arc<ServerConfig>,
    udp: Option<Arc<UdpListeners>>,
    peer_addr: SocketAddr,
    writer: AsyncMutex<MessageWriter>,
    reader: AsyncMutex<Option<MessageReader>>,
    frame_tx: mpsc::Sender<ReceivedFrame>,
    frame_rx: AsyncMutex<Option<mpsc::Receiver<ReceivedFrame>>>,
    session: StdRwLock<SessionState>,
    live: Arc<Live>,
    terminate_tx: watch::Sender<bool>,
    terminate_rx: watch::Receiver<bool>,
}

/// An accepted server-side RTSP connection. Cheap to clone; clones share
/// the connection.
#[derive(Clone)]
pub struct ServerConn {
    core: Arc<ConnCore>,
}

impl ServerConn {
    pub(crate) fn new(
        stream: BoxedStream,
        peer_addr: SocketAddr,
        config: Arc<ServerConfig>,
        udp: Option<Arc<UdpListeners>>,
    ) -> Self {
        let (reader, writer) = crate::tokio::split(stream, config.write_timeout);
        let (frame_tx, frame_rx) = mpsc::channel(config.read_buffer_count);
        let (terminate_tx, terminate_rx) = watch::channel(false);
        ServerConn {
            core: Arc::new(ConnCore {
                config,
                udp,
                peer_addr,
                writer: AsyncMutex::new(writer),
                reader: AsyncMutex::new(Some(reader)),
                frame_tx,
                frame_rx: AsyncMutex::new(Some(frame_rx)),
                session: StdRwLock::new(SessionState {
                    state: ServerState::Initial,
                    session_id: None,
                    base_path: None,
                    announced: None,
                    protocol: None,
                    tracks: BTreeMap::new(),
                    channels: ChannelTable::default(),
                    registered_udp: Vec::new(),
                }),
                live: Live::new(true),
                terminate_tx,
                terminate_rx,
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        self.core.session.read().expect("session lock").state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.core.peer_addr
    }

    /// Drives the request loop until the connection terminates, returning
    /// the terminal error (`Terminated` after a clean `TEARDOWN` or
    /// [`ServerConn::close`]).
    pub async fn read<H: ServerHandler>(&self, mut handler: H) -> Error {
        let mut reader = match self.core.reader.lock().await.take() {
            Some(r) => r,
            None => return wrap!(ErrorInt::ConnectionClosed),
        };
        let mut frame_rx = match self.core.frame_rx.lock().await.take() {
            Some(r) => r,
            None => return wrap!(ErrorInt::ConnectionClosed),
        };
        let mut terminate_rx = self.core.terminate_rx.clone();
        let mut report = tokio::time::interval_at(
            tokio::time::Instant::now() + RTCP_REPORT_PERIOD,
            RTCP_REPORT_PERIOD,
        );

        let err = loop {
            tokio::select! {
                _ = terminate_rx.changed() => break wrap!(ErrorInt::Terminated),
                msg = reader.next(Some(self.core.config.read_timeout)) => match msg {
                    Ok(Some(Message::Request(req))) => {
                        match self.handle_request(&mut handler, req).await {
                            Ok(()) => continue,
                            Err(e) => break e,
                        }
                    }
                    Ok(Some(Message::Frame(f))) => {
                        self.dispatch_frame(
                            &mut handler,
                            self.lookup_channel(f.channel_id()),
                            f.payload,
                        );
                        continue;
                    }
                    Ok(Some(Message::Response(_))) => break wrap!(ErrorInt::FramingError {
                        kind: crate::error::FramingErrorKind::InvalidStatusLine,
                        description: "unexpected response from client".to_owned(),
                    }),
                    Ok(None) => break wrap!(ErrorInt::ConnectionClosed),
                    Err(e) => break e,
                },
                frame = frame_rx.recv() => match frame {
                    Some((track_id, stream_type, payload)) => {
                        self.dispatch_frame(&mut handler, Some((track_id, stream_type)), payload);
                        continue;
                    }
                    None => break wrap!(ErrorInt::ConnectionClosed),
                },
                _ = report.tick() => self.send_reports().await,
            }
        };
        self.cleanup().await;
        err
    }

    /// Sends one media frame to this connection's peer over the track's
    /// negotiated transport. Requires a completed `SETUP` for the track.
    pub async fn write_frame(
        &self,
        track_id: usize,
        stream_type: StreamType,
        payload: Bytes,
    ) -> Result<(), Error> {
        let track = self
            .core
            .session
            .read()
            .expect("session lock")
            .tracks
            .get(&track_id)
            .cloned();
        let track = track
            .ok_or_else(|| wrap!(ErrorInt::InvalidArgument(format!("no track {}", track_id))))?;

        let result = {
            let guard = self.core.live.state.read().await;
            if !guard.open {
                return Err(guard
                    .error
                    .clone()
                    .unwrap_or_else(|| wrap!(ErrorInt::ConnectionClosed)));
            }
            track
                .rtcp
                .lock()
                .expect("rtcp mutex")
                .process_frame(Instant::now(), stream_type, &payload);
            self.route(track_id, &track, stream_type, payload).await
        };
        if let Err(e) = &result {
            self.core.live.close_with(e.clone()).await;
        }
        result
    }

    /// Terminates the connection: the request loop (if running) exits with
    /// `Terminated` and frame writes start failing.
    pub async fn close(&self) {
        let _ = self.core.terminate_tx.send(true);
        self.cleanup().await;
    }

    async fn route(
        &self,
        track_id: usize,
        track: &ServerTrack,
        stream_type: StreamType,
        payload: Bytes,
    ) -> Result<(), Error> {
        match &track.transport {
            ServerTrackTransport::Tcp => {
                let frame = InterleavedFrame {
                    track_id,
                    stream_type,
                    payload,
                };
                self.core.writer.lock().await.write_frame(&frame).await
            }
            ServerTrackTransport::Udp { peer_rtp, peer_rtcp } => {
                let udp = self.core.udp.as_ref().ok_or_else(|| {
                    wrap!(ErrorInt::TransportNotAccepted(
                        "UDP transport without UDP listeners".to_owned()
                    ))
                })?;
                let to = match stream_type {
                    StreamType::Rtp => *peer_rtp,
                    StreamType::Rtcp => *peer_rtcp,
                };
                udp.send(stream_type, &payload, to)
                    .await
                    .map_err(|e| wrap!(ErrorInt::WriteError(e)))
            }
        }
    }

    fn lookup_channel(&self, channel_id: u8) -> Option<(usize, StreamType)> {
        self.core
            .session
            .read()
            .expect("session lock")
            .channels
            .lookup(channel_id)
    }

    fn dispatch_frame<H: ServerHandler>(
        &self,
        handler: &mut H,
        target: Option<(usize, StreamType)>,
        payload: Bytes,
    ) {
        // Frames addressing nothing configured are dropped silently, like
        // UDP datagrams from unknown remotes.
        let Some((track_id, stream_type)) = target else {
            return;
        };
        let track = self
            .core
            .session
            .read()
            .expect("session lock")
            .tracks
            .get(&track_id)
            .cloned();
        let Some(track) = track else { return };
        track
            .rtcp
            .lock()
            .expect("rtcp mutex")
            .process_frame(Instant::now(), stream_type, &payload);
        handler.on_frame(track_id, stream_type, &payload);
    }

    async fn send_reports(&self) {
        let tracks: Vec<(usize, Arc<ServerTrack>)> = {
            let s = self.core.session.read().expect("session lock");
            s.tracks.iter().map(|(id, t)| (*id, t.clone())).collect()
        };
        let now = Instant::now();
        for (id, track) in tracks {
            let report = track.rtcp.lock().expect("rtcp mutex").report(now);
            let Some(payload) = report else { continue };
            let result = match &track.transport {
                ServerTrackTransport::Tcp => {
                    let frame = InterleavedFrame {
                        track_id: id,
                        stream_type: StreamType::Rtcp,
                        payload,
                    };
                    self.core.writer.lock().await.write_frame(&frame).await
                }
                ServerTrackTransport::Udp { peer_rtcp, .. } => match &self.core.udp {
                    Some(udp) => udp
                        .send(StreamType::Rtcp, &payload, *peer_rtcp)
                        .await
                        .map_err(|e| wrap!(ErrorInt::WriteError(e))),
                    None => Ok(()),
                },
            };
            if let Err(e) = result {
                debug!("failed to send RTCP report on track {}: {}", id, e);
            }
        }
    }

    async fn cleanup(&self) {
        self.core.live.close_with(wrap!(ErrorInt::Terminated)).await;
        let registered = {
            let mut s = self.core.session.write().expect("session lock");
            s.state = ServerState::Closed;
            std::mem::take(&mut s.registered_udp)
        };
        if let Some(udp) = &self.core.udp {
            for (rtp, rtcp) in registered {
                udp.unregister(rtp, rtcp);
            }
        }
    }

    /// Sends a response, echoing `CSeq` and attaching the session token.
    async fn send(&self, cseq: u32, mut resp: Response) -> Result<(), Error> {
        resp.headers.set("CSeq", cseq.to_string());
        if resp.headers.get("Session").is_none() {
            let sid = self
                .core
                .session
                .read()
                .expect("session lock")
                .session_id
                .clone();
            if let Some(sid) = sid {
                resp.headers.set("Session", sid);
            }
        }
        self.core.writer.lock().await.write_response(&resp).await
    }

    /// Adopts a handler-supplied session token, or mints one after the
    /// first successful `SETUP`.
    fn ensure_session_id(&self, resp: &Response) {
        let mut s = self.core.session.write().expect("session lock");
        if s.session_id.is_some() {
            return;
        }
        s.session_id = Some(match resp.headers.get("Session") {
            Some(v) => match headers::Session::parse(v) {
                Ok(session) => session.id,
                Err(_) => v.to_owned(),
            },
            None => format!("{:08}", rand::thread_rng().gen_range(0..=99_999_999u32)),
        });
    }

    async fn handle_request<H: ServerHandler>(
        &self,
        handler: &mut H,
        req: Request,
    ) -> Result<(), Error> {
        let cseq = match base::get_cseq(&req.headers) {
            Some(c) => c,
            None => {
                let resp = Response::new(StatusCode::BAD_REQUEST);
                let _ = self.core.writer.lock().await.write_response(&resp).await;
                bail!(ErrorInt::FramingError {
                    kind: crate::error::FramingErrorKind::MissingCSeq,
                    description: format!("{} request has no CSeq header", req.method),
                });
            }
        };

        // A request naming a different session than the one issued is
        // addressed to something this connection doesn't hold.
        if let Some(h) = req.headers.get("Session") {
            let presented = headers::Session::parse(h)
                .map(|s| s.id)
                .unwrap_or_else(|_| h.to_owned());
            let current = self
                .core
                .session
                .read()
                .expect("session lock")
                .session_id
                .clone();
            if let Some(current) = current {
                if presented != current {
                    self.send(cseq, Response::new(StatusCode::SESSION_NOT_FOUND))
                        .await?;
                    bail!(ErrorInt::SessionNotFound);
                }
            }
        }

        match req.method {
            Method::Options => {
                let resp = Response::new(StatusCode::OK).with_header(
                    "Public",
                    "DESCRIBE, ANNOUNCE, SETUP, PLAY, PAUSE, RECORD, TEARDOWN, \
                     GET_PARAMETER, SET_PARAMETER",
                );
                self.send(cseq, resp).await
            }
            // best-effort keepalive echoes
            Method::GetParameter | Method::SetParameter => {
                self.send(cseq, Response::new(StatusCode::OK)).await
            }
            Method::Teardown => {
                self.send(cseq, Response::new(StatusCode::OK)).await?;
                bail!(ErrorInt::Terminated)
            }
            Method::Describe => self.handle_describe(handler, cseq, &req).await,
            Method::Announce => self.handle_announce(handler, cseq, &req).await,
            Method::Setup => self.handle_setup(handler, cseq, &req).await,
            Method::Play => self.handle_play(handler, cseq, &req).await,
            Method::Record => self.handle_record(handler, cseq, &req).await,
            Method::Pause => self.handle_pause(handler, cseq, &req).await,
        }
    }

    /// Rejects an invalid request: delivers the response, then fails the
    /// connection with `err`.
    async fn reject(&self, cseq: u32, status: StatusCode, err: Error) -> Result<(), Error> {
        let _ = self.send(cseq, Response::new(status)).await;
        Err(err)
    }

    fn check_state(
        &self,
        method: Method,
        allowed: &'static [ServerState],
    ) -> Result<ServerState, Error> {
        let state = self.state();
        if allowed.contains(&state) {
            return Ok(state);
        }
        bail!(ErrorInt::WrongState {
            method,
            current: state.into(),
            allowed: state_kinds(allowed),
        })
    }

    async fn handle_describe<H: ServerHandler>(
        &self,
        handler: &mut H,
        cseq: u32,
        req: &Request,
    ) -> Result<(), Error> {
        let ctx = DescribeCtx {
            url: &req.url,
            path: path::presentation_path(&req.url),
        };
        match handler.on_describe(ctx) {
            Ok((mut resp, sdp)) => {
                if resp.status.is_success() {
                    if let Some(sdp) = sdp {
                        resp.headers.set("Content-Type", "application/sdp");
                        resp.headers.set(
                            "Content-Base",
                            format!("{}/", req.url.as_str().trim_end_matches('/')),
                        );
                        resp.body = sdp;
                    }
                }
                self.send(cseq, resp).await
            }
            Err(er) => {
                let _ = self.send(cseq, er.response).await;
                Err(er.error)
            }
        }
    }

    async fn handle_announce<H: ServerHandler>(
        &self,
        handler: &mut H,
        cseq: u32,
        req: &Request,
    ) -> Result<(), Error> {
        if let Err(e) = self.check_state(Method::Announce, &[ServerState::Initial]) {
            return self.reject(cseq, StatusCode::BAD_REQUEST, e).await;
        }
        let content_type = req.headers.get("Content-Type").map(|v| v.trim().to_owned());
        if !matches!(&content_type, Some(v) if v.starts_with("application/sdp")) {
            return self
                .reject(
                    cseq,
                    StatusCode::BAD_REQUEST,
                    wrap!(ErrorInt::InvalidArgument(format!(
                        "ANNOUNCE with Content-Type {:?}",
                        content_type
                    ))),
                )
                .await;
        }
        let mut tracks = match Tracks::from_sdp(&req.body) {
            Ok(t) => t,
            Err(e) => {
                return self
                    .reject(
                        cseq,
                        StatusCode::BAD_REQUEST,
                        wrap!(ErrorInt::InvalidArgument(format!("bad ANNOUNCE body: {}", e))),
                    )
                    .await
            }
        };
        for t in &mut tracks.0 {
            t.base_url = Some(req.url.clone());
        }
        let announce_path = path::presentation_path(&req.url);

        let result = handler.on_announce(AnnounceCtx {
            url: &req.url,
            path: &announce_path,
            tracks: &tracks,
        });
        match result {
            Ok(resp) => {
                if resp.status.is_success() {
                    let mut s = self.core.session.write().expect("session lock");
                    s.base_path = Some(announce_path);
                    s.announced = Some(tracks);
                    s.state = ServerState::PreRecord;
                }
                self.send(cseq, resp).await
            }
            Err(er) => {
                let _ = self.send(cseq, er.response).await;
                Err(er.error)
            }
        }
    }

    async fn handle_setup<H: ServerHandler>(
        &self,
        handler: &mut H,
        cseq: u32,
        req: &Request,
    ) -> Result<(), Error> {
        let th_value = match req.headers.get("Transport") {
            Some(v) => v,
            None => {
                return self
                    .reject(
                        cseq,
                        StatusCode::BAD_REQUEST,
                        wrap!(ErrorInt::TransportNotAccepted(
                            "SETUP without Transport header".to_owned()
                        )),
                    )
                    .await
            }
        };
        let th = match Transport::parse(th_value) {
            Ok(th) => th,
            Err(e) => {
                return self
                    .reject(
                        cseq,
                        StatusCode::BAD_REQUEST,
                        wrap!(ErrorInt::TransportNotAccepted(e)),
                    )
                    .await
            }
        };
        if th.delivery == Delivery::Multicast {
            return self
                .reject(
                    cseq,
                    StatusCode::UNSUPPORTED_TRANSPORT,
                    wrap!(ErrorInt::TransportNotAccepted(
                        "only unicast delivery is supported".to_owned()
                    )),
                )
                .await;
        }
        let mode = th.mode.unwrap_or(TransportMode::Play);
        let state_check = match mode {
            TransportMode::Play => self.check_state(
                Method::Setup,
                &[ServerState::Initial, ServerState::PrePlay],
            ),
            TransportMode::Record => self.check_state(Method::Setup, &[ServerState::PreRecord]),
        };
        let state = match state_check {
            Ok(s) => s,
            Err(e) => return self.reject(cseq, StatusCode::BAD_REQUEST, e).await,
        };

        let pq = path::path_and_query(&req.url);
        let (announced, base_path) = {
            let s = self.core.session.read().expect("session lock");
            (s.announced.clone(), s.base_path.clone())
        };
        let (base, track_id) = {
            if let Some(announced) = &announced {
                // Publisher side: the control attribute decides, and the base
                // must be the announced presentation path.
                match path::parse_setup_path_announced(&pq, announced) {
                    Ok((base, id)) if Some(&base) == base_path.as_ref() => (base, id),
                    _ => {
                        return self
                            .reject(
                                cseq,
                                StatusCode::BAD_REQUEST,
                                wrap!(ErrorInt::InvalidTrackPath { path: pq }),
                            )
                            .await;
                    }
                }
            } else {
                match path::parse_setup_path(&pq) {
                    Ok((base, id)) => {
                        if let Some(bp) = &base_path {
                            if &base != bp {
                                return self
                                    .reject(
                                        cseq,
                                        StatusCode::BAD_REQUEST,
                                        wrap!(ErrorInt::CantSetupTracksDifferentPaths),
                                    )
                                    .await;
                            }
                        }
                        (base, id)
                    }
                    Err(_) => {
                        return self
                            .reject(
                                cseq,
                                StatusCode::BAD_REQUEST,
                                wrap!(ErrorInt::InvalidTrackPath { path: pq }),
                            )
                            .await;
                    }
                }
            }
        };

        let (already_setup, protocol_mismatch) = {
            let s = self.core.session.read().expect("session lock");
            (
                s.tracks.contains_key(&track_id),
                matches!(s.protocol, Some(p) if p != th.protocol),
            )
        };
        if already_setup {
            return self
                .reject(
                    cseq,
                    StatusCode::BAD_REQUEST,
                    wrap!(ErrorInt::TrackAlreadySetup { id: track_id }),
                )
                .await;
        }
        if protocol_mismatch {
            return self
                .reject(
                    cseq,
                    StatusCode::BAD_REQUEST,
                    wrap!(ErrorInt::CantSetupTracksDifferentProtocols),
                )
                .await;
        }

        // Transport-specific validation.
        let interleaved = match th.protocol {
            StreamProtocol::Tcp => {
                let pair = match th.interleaved {
                    Some(p) => p,
                    None => {
                        return self
                            .reject(
                                cseq,
                                StatusCode::UNSUPPORTED_TRANSPORT,
                                wrap!(ErrorInt::TransportNotAccepted(
                                    "TCP transport without interleaved ids".to_owned()
                                )),
                            )
                            .await
                    }
                };
                let check = self
                    .core
                    .session
                    .read()
                    .expect("session lock")
                    .channels
                    .check(pair, track_id);
                match check {
                    Ok(()) => Some(pair),
                    Err(ClaimError::BadShape) => {
                        return self
                            .reject(
                                cseq,
                                StatusCode::UNSUPPORTED_TRANSPORT,
                                wrap!(ErrorInt::TransportNotAccepted(format!(
                                    "interleaved ids {}-{} do not match track {}",
                                    pair.0, pair.1, track_id
                                ))),
                            )
                            .await
                    }
                    Err(ClaimError::Busy { id }) => {
                        return self
                            .reject(
                                cseq,
                                StatusCode::BAD_REQUEST,
                                wrap!(ErrorInt::InterleavedChannelBusy { id }),
                            )
                            .await
                    }
                }
            }
            StreamProtocol::Udp => {
                if self.core.udp.is_none() {
                    // UDP is refused but the connection stays alive; the
                    // client is expected to retry with TCP.
                    return self
                        .send(cseq, Response::new(StatusCode::UNSUPPORTED_TRANSPORT))
                        .await;
                }
                if th.client_port.is_none() {
                    return self
                        .reject(
                            cseq,
                            StatusCode::BAD_REQUEST,
                            wrap!(ErrorInt::TransportNotAccepted(
                                "UDP transport without client_port".to_owned()
                            )),
                        )
                        .await;
                }
                None
            }
        };

        let result = handler.on_setup(SetupCtx {
            url: &req.url,
            path: &base,
            track_id,
            transport: &th,
        });
        let resp = match result {
            Ok(resp) => resp,
            Err(er) => {
                let _ = self.send(cseq, er.response).await;
                return Err(er.error);
            }
        };
        if !resp.status.is_success() {
            return self.send(cseq, resp).await;
        }

        // Commit: record the track, fill in the response transport, make
        // sure a session token exists, transition.
        self.ensure_session_id(&resp);
        let mut th_out = th.clone();
        let transport = match th.protocol {
            StreamProtocol::Tcp => ServerTrackTransport::Tcp,
            StreamProtocol::Udp => {
                let udp = self.core.udp.as_ref().expect("checked above");
                let (client_rtp, client_rtcp) = th.client_port.expect("checked above");
                let peer_rtp = SocketAddr::new(self.core.peer_addr.ip(), client_rtp);
                let peer_rtcp = SocketAddr::new(self.core.peer_addr.ip(), client_rtcp);
                udp.register(peer_rtp, peer_rtcp, track_id, self.core.frame_tx.clone());
                th_out.server_port = Some(udp.local_ports());
                ServerTrackTransport::Udp { peer_rtp, peer_rtcp }
            }
        };
        let clock_rate = {
            let s = self.core.session.read().expect("session lock");
            s.announced
                .as_ref()
                .and_then(|a| a.0.get(track_id))
                .map(|t| t.clock_rate())
                .unwrap_or(90_000)
        };
        let rtcp = match mode {
            // In a recording session this side receives; in a playback
            // session it sends.
            TransportMode::Record => RtcpSession::new_receiver(clock_rate),
            TransportMode::Play => RtcpSession::new_sender(clock_rate),
        };
        {
            let mut s = self.core.session.write().expect("session lock");
            if let Some(pair) = interleaved {
                // Serial request handling makes this claim infallible after
                // the check above.
                let _ = s.channels.claim(pair, track_id);
            }
            if let ServerTrackTransport::Udp { peer_rtp, peer_rtcp } = &transport {
                s.registered_udp.push((*peer_rtp, *peer_rtcp));
            }
            s.tracks.insert(
                track_id,
                Arc::new(ServerTrack {
                    transport,
                    rtcp: StdMutex::new(rtcp),
                }),
            );
            s.protocol = Some(th.protocol);
            if s.base_path.is_none() {
                s.base_path = Some(base);
            }
            if mode == TransportMode::Play && state == ServerState::Initial {
                s.state = ServerState::PrePlay;
            }
        }
        let mut resp = resp;
        resp.headers.set("Transport", th_out.write());
        self.send(cseq, resp).await
    }

    async fn handle_play<H: ServerHandler>(
        &self,
        handler: &mut H,
        cseq: u32,
        req: &Request,
    ) -> Result<(), Error> {
        let state = match self.check_state(Method::Play, &[ServerState::PrePlay, ServerState::Play])
        {
            Ok(s) => s,
            Err(e) => return self.reject(cseq, StatusCode::BAD_REQUEST, e).await,
        };
        if self.core.session.read().expect("session lock").tracks.is_empty() {
            return self
                .reject(cseq, StatusCode::BAD_REQUEST, wrap!(ErrorInt::NoTracksSetup))
                .await;
        }
        match handler.on_play(PlayCtx { url: &req.url }) {
            Ok(resp) => {
                // A PLAY while already playing answers 200 without
                // restarting anything.
                if resp.status.is_success() && state != ServerState::Play {
                    self.core.session.write().expect("session lock").state = ServerState::Play;
                }
                self.send(cseq, resp).await
            }
            Err(er) => {
                let _ = self.send(cseq, er.response).await;
                Err(er.error)
            }
        }
    }

    async fn handle_record<H: ServerHandler>(
        &self,
        handler: &mut H,
        cseq: u32,
        req: &Request,
    ) -> Result<(), Error> {
        if let Err(e) = self.check_state(Method::Record, &[ServerState::PreRecord]) {
            return self.reject(cseq, StatusCode::BAD_REQUEST, e).await;
        }
        let not_all_setup = {
            let s = self.core.session.read().expect("session lock");
            let announced = s.announced.as_ref().map(Tracks::len).unwrap_or(0);
            s.tracks.len() != announced
        };
        if not_all_setup {
            return self
                .reject(
                    cseq,
                    StatusCode::BAD_REQUEST,
                    wrap!(ErrorInt::NotAllAnnouncedTracksSetup),
                )
                .await;
        }
        match handler.on_record(RecordCtx { url: &req.url }) {
            Ok(resp) => {
                if resp.status.is_success() {
                    self.core.session.write().expect("session lock").state = ServerState::Record;
                }
                self.send(cseq, resp).await
            }
            Err(er) => {
                let _ = self.send(cseq, er.response).await;
                Err(er.error)
            }
        }
    }

    async fn handle_pause<H: ServerHandler>(
        &self,
        handler: &mut H,
        cseq: u32,
        req: &Request,
    ) -> Result<(), Error> {
        let state = match self.check_state(
            Method::Pause,
            &[
                ServerState::PrePlay,
                ServerState::Play,
                ServerState::PreRecord,
                ServerState::Record,
            ],
        ) {
            Ok(s) => s,
            Err(e) => return self.reject(cseq, StatusCode::BAD_REQUEST, e).await,
        };
        match handler.on_pause(PauseCtx { url: &req.url }) {
            Ok(resp) => {
                if resp.status.is_success() {
                    // A PAUSE in a Pre* state is a no-op.
                    let next = match state {
                        ServerState::Play => Some(ServerState::PrePlay),
                        ServerState::Record => Some(ServerState::PreRecord),
                        _ => None,
                    };
                    if let Some(next) = next {
                        self.core.session.write().expect("session lock").state = next;
                    }
                }
                self.send(cseq, resp).await
            }
            Err(er) => {
                let _ = self.send(cseq, er.response).await;
                Err(er.error)
            }
        }
    }
}

fn state_kinds(states: &'static [ServerState]) -> &'static [crate::error::StateKind] {
    use crate::error::StateKind;
    match states {
        [ServerState::Initial] => &[StateKind::Initial],
        [ServerState::PreRecord] => &[StateKind::PreRecord],
        [ServerState::Initial, ServerState::PrePlay] => &[StateKind::Initial, StateKind::PrePlay],
        [ServerState::PrePlay, ServerState::Play] => &[StateKind::PrePlay, StateKind::Play],
        [ServerState::PrePlay, ServerState::Play, ServerState::PreRecord, ServerState::Record] => &[
            StateKind::PrePlay,
            StateKind::Play,
            StateKind::PreRecord,
            StateKind::Record,
        ],
        _ => &[],
    }
}

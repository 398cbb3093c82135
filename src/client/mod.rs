// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP client connection.
//!
//! A [`ClientConn`] drives the request/response cycle and the per-session
//! state machine: `DESCRIBE` → `SETUP`(×N) → `PLAY` for readers,
//! `ANNOUNCE` → `SETUP`(×N) → `RECORD` for publishers. Entering `Play` or
//! `Record` starts background loops that pump media frames, periodic RTCP
//! reports, and keepalives until `pause`, `teardown`, or an error.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use bytes::Bytes;
use log::debug;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use url::Url;

use crate::base::{self, Method, Request, Response, StatusCode};
use crate::headers::{self, Transport};
use crate::rtcp::RtcpSession;
use crate::tokio::{MessageReader, MessageWriter};
use crate::{
    Error, ErrorInt, Live, ReceivedFrame, StreamProtocol, StreamType, Track, Tracks, TransportMode,
};

mod background;
#[cfg(test)]
mod tests;

/// State of a client connection; constrains which methods are legal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientState {
    Initial,
    PrePlay,
    Play,
    PreRecord,
    Record,
    Closed,
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Client-side configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Per-read deadline on the control socket.
    pub read_timeout: Duration,

    /// Per-write deadline on the control socket.
    pub write_timeout: Duration,

    /// Capacity of the inbound frame queue read by [`ClientConn::read_frame`].
    pub read_buffer_count: usize,

    pub user_agent: String,
    pub credentials: Option<Credentials>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            read_buffer_count: 512,
            user_agent: concat!("chiasm/", env!("CARGO_PKG_VERSION")).to_owned(),
            credentials: None,
        }
    }
}

enum AuthChallenge {
    Digest(Box<digest_auth::WwwAuthenticateHeader>),
    Basic,
}

/// Transport of one configured track, fixed at `SETUP` time.
pub(crate) enum TrackTransport {
    Udp {
        /// Socket pair, each connected to the server's announced port so
        /// plain `send`/`recv` applies and foreign datagrams are filtered.
        rtp_socket: Arc<tokio::net::UdpSocket>,
        rtcp_socket: Arc<tokio::net::UdpSocket>,
    },
    /// Interleaved on the control socket; channel ids follow from the track id.
    Tcp,
}

/// A track that has completed `SETUP`.
pub(crate) struct SetupTrack {
    pub(crate) id: usize,
    pub(crate) transport: TrackTransport,
    pub(crate) rtcp: StdMutex<RtcpSession>,
}

/// An RTSP client connection.
pub struct ClientConn {
    config: ClientConfig,
    state: ClientState,
    writer: Arc<AsyncMutex<MessageWriter>>,

    /// `None` while loaned to a background loop.
    reader: Option<MessageReader>,

    local_ip: IpAddr,
    peer_ip: IpAddr,
    next_cseq: Arc<AtomicU32>,
    session_id: Option<String>,
    requested_auth: Option<AuthChallenge>,

    /// The presentation URL; all SETUPs must agree on it.
    stream_url: Option<Url>,
    stream_protocol: Option<StreamProtocol>,

    /// Tracks announced by us (publisher mode).
    announced: Option<Tracks>,

    tracks: BTreeMap<usize, Arc<SetupTrack>>,
    live: Arc<Live>,
    background: Option<background::Background>,
    frame_rx: Option<mpsc::Receiver<ReceivedFrame>>,
}

impl ClientConn {
    /// Connects the control socket for the given `rtsp://` URL.
    pub async fn dial(url: &Url) -> Result<Self, Error> {
        Self::dial_with_config(url, ClientConfig::default()).await
    }

    pub async fn dial_with_config(url: &Url, config: ClientConfig) -> Result<Self, Error> {
        if url.scheme() != "rtsp" {
            bail!(ErrorInt::InvalidArgument(format!(
                "only rtsp urls supported, got {:?}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| wrap!(ErrorInt::InvalidArgument(format!("no host in {}", url))))?;
        let port = url.port().unwrap_or(554);
        let stream = crate::tokio::connect(host, port).await?;
        let local_ip = stream
            .local_addr()
            .map_err(|e| wrap!(ErrorInt::ReadError(e)))?
            .ip();
        let peer_ip = stream
            .peer_addr()
            .map_err(|e| wrap!(ErrorInt::ReadError(e)))?
            .ip();
        let (reader, writer) = crate::tokio::split(Box::new(stream), config.write_timeout);
        Ok(ClientConn {
            config,
            state: ClientState::Initial,
            writer: Arc::new(AsyncMutex::new(writer)),
            reader: Some(reader),
            local_ip,
            peer_ip,
            next_cseq: Arc::new(AtomicU32::new(1)),
            session_id: None,
            requested_auth: None,
            stream_url: None,
            stream_protocol: None,
            announced: None,
            tracks: BTreeMap::new(),
            live: Live::new(false),
            background: None,
            frame_rx: None,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn check_state(&self, method: Method, allowed: &'static [ClientState]) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        bail!(ErrorInt::WrongState {
            method,
            current: self.state.into(),
            allowed: state_kinds(allowed),
        });
    }

    /// Sends a request and reads its response, discarding any interleaved
    /// frames that arrive first.
    ///
    /// Auto-attaches `CSeq`, `Session`, `Authorization`, and `User-Agent`;
    /// remembers the session token from the response; handles one `401`
    /// challenge round; surfaces any other non-2xx as an error.
    async fn do_request(&mut self, req: Request) -> Result<Response, Error> {
        loop {
            let cseq = self.next_cseq.fetch_add(1, Ordering::Relaxed);
            let mut req = req.clone();
            req.headers.set("CSeq", cseq.to_string());
            req.headers.set("User-Agent", self.config.user_agent.clone());
            if let Some(session_id) = &self.session_id {
                req.headers.set("Session", session_id.clone());
            }
            if let Some(challenge) = &self.requested_auth {
                let creds = self.config.credentials.as_ref().ok_or_else(|| {
                    debug!("authentication required but no credentials supplied");
                    wrap!(ErrorInt::AuthenticationFailed)
                })?;
                req.headers
                    .set("Authorization", authorization(challenge, creds, &req)?);
            }

            self.writer.lock().await.write_request(&req).await?;

            let reader = self
                .reader
                .as_mut()
                .ok_or_else(|| wrap!(ErrorInt::ConnectionClosed))?;
            let resp = reader
                .next_response_ignoring_frames(Some(self.config.read_timeout))
                .await?;
            base::codec::check_cseq(&resp, cseq).map_err(crate::tokio::codec_error)?;

            if let Some(v) = resp.headers.get("Session") {
                let session = headers::Session::parse(v).map_err(|e| {
                    wrap!(ErrorInt::InvalidArgument(format!(
                        "bad Session header: {}",
                        e
                    )))
                })?;
                self.session_id = Some(session.id);
            }

            if resp.status == StatusCode::UNAUTHORIZED {
                if self.requested_auth.is_some() {
                    bail!(ErrorInt::AuthenticationFailed);
                }
                let www_authenticate = resp.headers.get("WWW-Authenticate").ok_or_else(|| {
                    wrap!(ErrorInt::InvalidArgument(
                        "401 without WWW-Authenticate header".to_owned()
                    ))
                })?;
                self.requested_auth = Some(parse_challenge(www_authenticate)?);
                continue;
            }
            if !resp.status.is_success() {
                bail!(ErrorInt::WrongStatusCode {
                    code: resp.status,
                    message: resp.reason,
                });
            }
            return Ok(resp);
        }
    }

    /// Sends an `OPTIONS` request; usable as a pre-session probe or keepalive.
    pub async fn options(&mut self, url: &Url) -> Result<Response, Error> {
        self.do_request(Request::new(Method::Options, url.clone()))
            .await
    }

    /// Sends a `DESCRIBE` request and enumerates the presentation's tracks.
    pub async fn describe(&mut self, url: &Url) -> Result<Tracks, Error> {
        self.check_state(Method::Describe, &[ClientState::Initial])?;
        let resp = self
            .do_request(
                Request::new(Method::Describe, url.clone())
                    .with_header("Accept", "application/sdp"),
            )
            .await?;

        // RFC 2326 appendix C.1.1: the base URL comes from Content-Base,
        // then Content-Location, then the request URL.
        let base_url = match resp
            .headers
            .get("Content-Base")
            .or_else(|| resp.headers.get("Content-Location"))
        {
            Some(v) => Url::parse(v)
                .map_err(|e| wrap!(ErrorInt::InvalidArgument(format!("bad base URL: {}", e))))?,
            None => url.clone(),
        };

        let mut tracks = Tracks::from_sdp(&resp.body)
            .map_err(|e| wrap!(ErrorInt::InvalidArgument(format!("bad DESCRIBE body: {}", e))))?;
        for t in &mut tracks.0 {
            t.base_url = Some(base_url.clone());
        }
        self.stream_url = Some(base_url);
        Ok(tracks)
    }

    /// Sends an `ANNOUNCE` request carrying the tracks' SDP and moves to
    /// `PreRecord`.
    ///
    /// The tracks are prepared in place: dense ids, the presentation URL as
    /// base, and `trackID=<n>` control attributes. The caller keeps using
    /// them for the subsequent `SETUP`s.
    pub async fn announce(&mut self, url: &Url, tracks: &mut Tracks) -> Result<Response, Error> {
        self.check_state(Method::Announce, &[ClientState::Initial])?;
        if tracks.is_empty() {
            bail!(ErrorInt::InvalidArgument("no tracks to announce".to_owned()));
        }
        tracks.prepare_for_announce(url);
        let body = tracks.to_sdp();
        let resp = self
            .do_request(
                Request::new(Method::Announce, url.clone())
                    .with_header("Content-Type", "application/sdp")
                    .with_body(body),
            )
            .await?;
        self.stream_url = Some(url.clone());
        self.announced = Some(tracks.clone());
        self.state = ClientState::PreRecord;
        Ok(resp)
    }

    /// Sends a `SETUP` request for one track, negotiating UDP or interleaved
    /// TCP transport.
    ///
    /// All tracks of a session must use one protocol and hang off one
    /// presentation URL; the first `SETUP` fixes both.
    pub async fn setup(
        &mut self,
        mode: TransportMode,
        protocol: StreamProtocol,
        track: &Track,
    ) -> Result<Response, Error> {
        match mode {
            TransportMode::Play => self.check_state(
                Method::Setup,
                &[ClientState::Initial, ClientState::PrePlay],
            )?,
            TransportMode::Record => {
                self.check_state(Method::Setup, &[ClientState::PreRecord])?
            }
        }
        if self.tracks.contains_key(&track.id) {
            bail!(ErrorInt::TrackAlreadySetup { id: track.id });
        }
        if let Some(p) = self.stream_protocol {
            if p != protocol {
                bail!(ErrorInt::CantSetupTracksDifferentProtocols);
            }
        }
        let base_url = match &track.base_url {
            Some(u) => u.clone(),
            None => bail!(ErrorInt::InvalidArgument("track has no base URL".to_owned())),
        };
        match &self.stream_url {
            Some(stream_url) if *stream_url != base_url => {
                bail!(ErrorInt::CantSetupTracksDifferentPaths)
            }
            Some(_) => {}
            None => self.stream_url = Some(base_url),
        }

        let url = track
            .setup_url()
            .map_err(|e| wrap!(ErrorInt::InvalidArgument(e)))?;

        let mut th = Transport::new(protocol);
        th.mode = Some(mode);
        let udp_pair = match protocol {
            StreamProtocol::Udp => {
                let pair = crate::tokio::UdpPair::bind(self.local_ip)
                    .map_err(|e| wrap!(ErrorInt::UdpBindFailed(e)))?;
                th.client_port = Some((pair.rtp_port, pair.rtp_port + 1));
                Some(pair)
            }
            StreamProtocol::Tcp => {
                // The interleaved channel field is one byte; tracks past 127
                // have no channel pair to claim.
                if track.id > 127 {
                    bail!(ErrorInt::InvalidArgument(format!(
                        "track {} can't use TCP transport: interleaved channel ids only \
                         address tracks 0-127",
                        track.id
                    )));
                }
                th.interleaved = Some((
                    base::channel_id(track.id, StreamType::Rtp),
                    base::channel_id(track.id, StreamType::Rtcp),
                ));
                None
            }
        };

        let resp = self
            .do_request(
                Request::new(Method::Setup, url).with_header("Transport", th.write()),
            )
            .await?;

        let transport = match udp_pair {
            Some(pair) => {
                let resp_th = resp
                    .headers
                    .get("Transport")
                    .ok_or_else(|| {
                        wrap!(ErrorInt::TransportNotAccepted(
                            "SETUP response has no Transport header".to_owned()
                        ))
                    })
                    .and_then(|v| {
                        Transport::parse(v).map_err(|e| wrap!(ErrorInt::TransportNotAccepted(e)))
                    })?;
                let (rtp_port, rtcp_port) = resp_th.server_port.ok_or_else(|| {
                    wrap!(ErrorInt::TransportNotAccepted(
                        "SETUP response has no server_port".to_owned()
                    ))
                })?;
                pair.rtp_socket
                    .connect(SocketAddr::new(self.peer_ip, rtp_port))
                    .await
                    .map_err(|e| wrap!(ErrorInt::UdpBindFailed(e)))?;
                pair.rtcp_socket
                    .connect(SocketAddr::new(self.peer_ip, rtcp_port))
                    .await
                    .map_err(|e| wrap!(ErrorInt::UdpBindFailed(e)))?;
                TrackTransport::Udp {
                    rtp_socket: Arc::new(pair.rtp_socket),
                    rtcp_socket: Arc::new(pair.rtcp_socket),
                }
            }
            None => TrackTransport::Tcp,
        };

        let rtcp = match mode {
            TransportMode::Record => RtcpSession::new_sender(track.clock_rate()),
            TransportMode::Play => RtcpSession::new_receiver(track.clock_rate()),
        };
        self.tracks.insert(
            track.id,
            Arc::new(SetupTrack {
                id: track.id,
                transport,
                rtcp: StdMutex::new(rtcp),
            }),
        );
        self.stream_protocol = Some(protocol);
        if mode == TransportMode::Play {
            self.state = ClientState::PrePlay;
        }
        Ok(resp)
    }

    /// Sends a `PLAY` request and starts the background read loop. Frames
    /// then arrive via [`ClientConn::read_frame`].
    pub async fn play(&mut self) -> Result<Response, Error> {
        self.check_state(Method::Play, &[ClientState::PrePlay])?;
        if self.tracks.is_empty() {
            bail!(ErrorInt::NoTracksSetup);
        }
        let url = self.stream_url()?;
        let resp = self
            .do_request(Request::new(Method::Play, url).with_header("Range", "npt=0.000-"))
            .await?;
        self.state = ClientState::Play;
        self.start_background(background::Role::Play).await;
        Ok(resp)
    }

    /// Sends a `RECORD` request and starts the background publish loop.
    /// Frames may then be published via [`ClientConn::write_frame`].
    pub async fn record(&mut self) -> Result<Response, Error> {
        self.check_state(Method::Record, &[ClientState::PreRecord])?;
        if self.tracks.is_empty() {
            bail!(ErrorInt::NoTracksSetup);
        }
        // The server will reject a partial RECORD anyway; fail before
        // putting it on the wire.
        if let Some(announced) = &self.announced {
            if self.tracks.len() != announced.len() {
                bail!(ErrorInt::NotAllAnnouncedTracksSetup);
            }
        }
        let url = self.stream_url()?;
        let resp = self.do_request(Request::new(Method::Record, url)).await?;
        self.state = ClientState::Record;
        self.start_background(background::Role::Record).await;
        Ok(resp)
    }

    /// Sends a `PAUSE` request, stopping the background loops first.
    pub async fn pause(&mut self) -> Result<Response, Error> {
        self.check_state(Method::Pause, &[ClientState::Play, ClientState::Record])?;
        self.stop_background().await;
        let url = self.stream_url()?;
        let resp = self.do_request(Request::new(Method::Pause, url)).await?;
        self.state = match self.state {
            ClientState::Play => ClientState::PrePlay,
            _ => ClientState::PreRecord,
        };
        Ok(resp)
    }

    /// Sends a best-effort `TEARDOWN` and closes the connection.
    pub async fn teardown(&mut self) -> Result<(), Error> {
        self.stop_background().await;
        if let Ok(url) = self.stream_url() {
            // The session may already be dead server-side; the close
            // proceeds regardless of what this returns.
            let _ = self.do_request(Request::new(Method::Teardown, url)).await;
        }
        self.close().await;
        Ok(())
    }

    /// Terminates background loops and closes the socket without signalling
    /// the peer.
    pub async fn close(&mut self) {
        self.stop_background().await;
        self.live.close_with(wrap!(ErrorInt::Terminated)).await;
        self.reader = None;
        self.state = ClientState::Closed;
    }

    /// Publishes one frame on a track. Legal only in `Record` state.
    ///
    /// Write failures propagate to the caller and latch, so subsequent
    /// writes observe a consistent failure.
    pub async fn write_frame(
        &self,
        track_id: usize,
        stream_type: StreamType,
        payload: Bytes,
    ) -> Result<(), Error> {
        if self.state != ClientState::Record {
            bail!(ErrorInt::WrongState {
                method: Method::Record,
                current: self.state.into(),
                allowed: &[crate::error::StateKind::Record],
            });
        }
        let track = self
            .tracks
            .get(&track_id)
            .ok_or_else(|| wrap!(ErrorInt::InvalidArgument(format!("no track {}", track_id))))?;

        let result = {
            let guard = self.live.state.read().await;
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
            match &track.transport {
                TrackTransport::Udp {
                    rtp_socket,
                    rtcp_socket,
                } => {
                    let socket = match stream_type {
                        StreamType::Rtp => rtp_socket,
                        StreamType::Rtcp => rtcp_socket,
                    };
                    socket
                        .send(&payload)
                        .await
                        .map(|_| ())
                        .map_err(|e| wrap!(ErrorInt::WriteError(e)))
                }
                TrackTransport::Tcp => {
                    let frame = base::InterleavedFrame {
                        track_id,
                        stream_type,
                        payload: payload.clone(),
                    };
                    self.writer.lock().await.write_frame(&frame).await
                }
            }
        };
        if let Err(e) = &result {
            self.live.close_with(e.clone()).await;
        }
        result
    }

    /// Returns the next received frame. Legal while playing.
    ///
    /// Returns the latched session error once the background loop stops.
    pub async fn read_frame(&mut self) -> Result<ReceivedFrame, Error> {
        let rx = match &mut self.frame_rx {
            Some(rx) => rx,
            None => bail!(ErrorInt::WrongState {
                method: Method::Play,
                current: self.state.into(),
                allowed: &[crate::error::StateKind::Play],
            }),
        };
        match rx.recv().await {
            Some(f) => Ok(f),
            None => Err(self.live.latched().await),
        }
    }

    fn stream_url(&self) -> Result<Url, Error> {
        self.stream_url
            .clone()
            .ok_or_else(|| wrap!(ErrorInt::InvalidArgument("no stream URL".to_owned())))
    }

    async fn start_background(&mut self, role: background::Role) {
        {
            let mut guard = self.live.state.write().await;
            guard.open = true;
            guard.error = None;
        }
        let protocol = self
            .stream_protocol
            .expect("SETUP fixed the protocol before PLAY/RECORD");
        // The reader is loaned to the loop except while publishing over TCP,
        // where frames interleave with the foreground's own writes and no
        // responses are expected.
        let reader = match (role, protocol) {
            (background::Role::Record, StreamProtocol::Tcp) => None,
            _ => self.reader.take(),
        };
        let (frame_tx, frame_rx) = mpsc::channel(self.config.read_buffer_count);
        self.frame_rx = match role {
            background::Role::Play => Some(frame_rx),
            background::Role::Record => None,
        };
        self.background = Some(background::spawn(background::LoopCtx {
            role,
            protocol,
            reader,
            writer: self.writer.clone(),
            tracks: self.tracks.clone(),
            live: self.live.clone(),
            frame_tx,
            next_cseq: self.next_cseq.clone(),
            session_id: self.session_id.clone(),
            stream_url: self.stream_url.clone(),
            user_agent: self.config.user_agent.clone(),
            read_timeout: self.config.read_timeout,
        }));
    }

    async fn stop_background(&mut self) {
        if let Some(bg) = self.background.take() {
            if let Some(reader) = bg.stop().await {
                self.reader = Some(reader);
            }
        }
        self.frame_rx = None;
    }
}

impl Drop for ClientConn {
    fn drop(&mut self) {
        // The loops hold clones of the shared socket halves; tell them to
        // wind down rather than tick against a dead connection.
        if let Some(bg) = &self.background {
            bg.signal();
        }
    }
}

fn state_kinds(states: &'static [ClientState]) -> &'static [crate::error::StateKind] {
    use crate::error::StateKind;
    // The allowed-state sets are small and fixed; map them to the shared
    // reporting type statically.
    match states {
        [ClientState::Initial] => &[StateKind::Initial],
        [ClientState::PreRecord] => &[StateKind::PreRecord],
        [ClientState::PrePlay] => &[StateKind::PrePlay],
        [ClientState::Initial, ClientState::PrePlay] => &[StateKind::Initial, StateKind::PrePlay],
        [ClientState::Play, ClientState::Record] => &[StateKind::Play, StateKind::Record],
        _ => &[],
    }
}

fn parse_challenge(www_authenticate: &str) -> Result<AuthChallenge, Error> {
    if www_authenticate.starts_with("Digest ") {
        let h = digest_auth::WwwAuthenticateHeader::parse(www_authenticate)
            .map_err(|_| wrap!(ErrorInt::AuthenticationFailed))?;
        return Ok(AuthChallenge::Digest(Box::new(h)));
    }
    if www_authenticate.starts_with("Basic ") || www_authenticate == "Basic" {
        return Ok(AuthChallenge::Basic);
    }
    bail!(ErrorInt::InvalidArgument(format!(
        "unsupported authentication scheme in {:?}",
        www_authenticate
    )))
}

fn authorization(
    challenge: &AuthChallenge,
    creds: &Credentials,
    req: &Request,
) -> Result<String, Error> {
    match challenge {
        AuthChallenge::Basic => {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", creds.username, creds.password));
            Ok(format!("Basic {}", token))
        }
        AuthChallenge::Digest(h) => {
            let mut h = (**h).clone();
            let method = digest_auth::HttpMethod(Cow::Borrowed(req.method.as_str()));
            let ctx = digest_auth::AuthContext::new_with_method(
                &creds.username,
                &creds.password,
                req.url.as_str(),
                Option::<&'static [u8]>::None,
                method,
            );
            let authorization = h
                .respond(&ctx)
                .map_err(|_| wrap!(ErrorInt::AuthenticationFailed))?;
            Ok(authorization.to_string())
        }
    }
}


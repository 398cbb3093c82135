// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end sessions between [`ClientConn`] and the in-crate server.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;

use crate::base::{Response, StatusCode};
use crate::server::{
    AnnounceCtx, DescribeCtx, PauseCtx, PlayCtx, RecordCtx, ServerConfig, ServerConn,
    ServerHandler, SetupCtx,
};
use crate::{StreamProtocol, StreamType, Tracks, TransportMode};

use super::*;

#[test]
fn wrong_state_reported() {
    let e = wrap!(crate::ErrorInt::WrongState {
        method: crate::base::Method::Play,
        current: ClientState::Initial.into(),
        allowed: &[crate::error::StateKind::PrePlay],
    });
    let s = e.to_string();
    assert!(s.contains("PLAY"), "{}", s);
    assert!(s.contains("Initial"), "{}", s);
    assert!(s.contains("PrePlay"), "{}", s);
}

#[test]
fn basic_authorization() {
    let creds = Credentials {
        username: "user".to_owned(),
        password: "pass".to_owned(),
    };
    let req = crate::base::Request::new(
        crate::base::Method::Describe,
        Url::parse("rtsp://h/s").unwrap(),
    );
    let v = authorization(&AuthChallenge::Basic, &creds, &req).unwrap();
    assert_eq!(v, "Basic dXNlcjpwYXNz");
}

const SDP: &[u8] = b"v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=Stream\r\n\
    c=IN IP4 0.0.0.0\r\n\
    t=0 0\r\n\
    m=video 0 RTP/AVP 96\r\n\
    a=rtpmap:96 H264/90000\r\n\
    a=control:trackID=0\r\n";

struct Handler {
    frame_tx: mpsc::UnboundedSender<(usize, StreamType, Bytes)>,
    /// When set, `PLAY` starts a writer task streaming RTP on track 0.
    conn_for_play: Option<ServerConn>,
}

impl ServerHandler for Handler {
    fn on_describe(
        &mut self,
        _ctx: DescribeCtx<'_>,
    ) -> Result<(Response, Option<Bytes>), crate::server::ErrorResponse> {
        Ok((
            Response::new(StatusCode::OK),
            Some(Bytes::from_static(SDP)),
        ))
    }

    fn on_announce(&mut self, _ctx: AnnounceCtx<'_>) -> crate::server::HandlerResult {
        Ok(Response::new(StatusCode::OK))
    }

    fn on_setup(&mut self, _ctx: SetupCtx<'_>) -> crate::server::HandlerResult {
        Ok(Response::new(StatusCode::OK))
    }

    fn on_play(&mut self, _ctx: PlayCtx<'_>) -> crate::server::HandlerResult {
        if let Some(conn) = self.conn_for_play.take() {
            tokio::spawn(async move {
                loop {
                    if conn
                        .write_frame(0, StreamType::Rtp, Bytes::from_static(b"\x01\x02\x03\x04"))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            });
        }
        Ok(Response::new(StatusCode::OK))
    }

    fn on_record(&mut self, _ctx: RecordCtx<'_>) -> crate::server::HandlerResult {
        Ok(Response::new(StatusCode::OK))
    }

    fn on_pause(&mut self, _ctx: PauseCtx<'_>) -> crate::server::HandlerResult {
        Ok(Response::new(StatusCode::OK))
    }

    fn on_frame(&mut self, track_id: usize, stream_type: StreamType, payload: &Bytes) {
        let _ = self.frame_tx.send((track_id, stream_type, payload.clone()));
    }
}

async fn start_server(
    config: ServerConfig,
    stream_frames_on_play: bool,
) -> (
    Url,
    mpsc::UnboundedReceiver<(usize, StreamType, Bytes)>,
    tokio::sync::oneshot::Receiver<String>,
) {
    let server = config.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let stream_url = Url::parse(&format!("rtsp://127.0.0.1:{}/teststream", addr.port())).unwrap();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (err_tx, err_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let conn = server.accept().await.unwrap();
        let handler = Handler {
            frame_tx,
            conn_for_play: stream_frames_on_play.then(|| conn.clone()),
        };
        let err = conn.read(handler).await;
        let _ = err_tx.send(err.to_string());
    });
    (stream_url, frame_rx, err_rx)
}

#[tokio::test]
async fn publish_tcp() {
    let (url, mut frame_rx, err_rx) = start_server(ServerConfig::default(), false).await;

    let mut conn = ClientConn::dial(&url).await.unwrap();
    let mut tracks = Tracks::from_sdp(SDP).unwrap();
    conn.announce(&url, &mut tracks).await.unwrap();
    assert_eq!(conn.state(), ClientState::PreRecord);
    conn.setup(TransportMode::Record, StreamProtocol::Tcp, &tracks.0[0])
        .await
        .unwrap();
    let resp = conn.record().await.unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(conn.state(), ClientState::Record);

    conn.write_frame(0, StreamType::Rtp, Bytes::from_static(b"\x01\x02\x03\x04"))
        .await
        .unwrap();

    let (track_id, stream_type, payload) =
        tokio::time::timeout(Duration::from_secs(5), frame_rx.recv())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(track_id, 0);
    assert_eq!(stream_type, StreamType::Rtp);
    assert_eq!(&payload[..], b"\x01\x02\x03\x04");

    conn.teardown().await.unwrap();
    assert_eq!(conn.state(), ClientState::Closed);
    assert_eq!(err_rx.await.unwrap(), "terminated");
}

#[tokio::test]
async fn publish_udp() {
    let config = ServerConfig {
        udp_rtp_address: Some("127.0.0.1:0".parse().unwrap()),
        udp_rtcp_address: Some("127.0.0.1:0".parse().unwrap()),
        ..ServerConfig::default()
    };
    let (url, mut frame_rx, _err_rx) = start_server(config, false).await;

    let mut conn = ClientConn::dial(&url).await.unwrap();
    let mut tracks = Tracks::from_sdp(SDP).unwrap();
    conn.announce(&url, &mut tracks).await.unwrap();
    conn.setup(TransportMode::Record, StreamProtocol::Udp, &tracks.0[0])
        .await
        .unwrap();
    conn.record().await.unwrap();

    // UDP is lossy even on loopback; retry until the demuxed frame shows up.
    let received = loop {
        conn.write_frame(0, StreamType::Rtp, Bytes::from_static(b"\x01\x02\x03\x04"))
            .await
            .unwrap();
        match tokio::time::timeout(Duration::from_millis(200), frame_rx.recv()).await {
            Ok(Some(f)) => break f,
            Ok(None) => panic!("server went away"),
            Err(_) => continue,
        }
    };
    assert_eq!(received.0, 0);
    assert_eq!(received.1, StreamType::Rtp);
    assert_eq!(&received.2[..], b"\x01\x02\x03\x04");

    // pause returns to PreRecord and the publish path reports termination
    conn.pause().await.unwrap();
    assert_eq!(conn.state(), ClientState::PreRecord);
    let err = conn
        .write_frame(0, StreamType::Rtp, Bytes::from_static(b"\x01"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("state"), "{}", err);
}

#[tokio::test]
async fn play_tcp() {
    let (url, _frame_rx, _err_rx) = start_server(ServerConfig::default(), true).await;

    let mut conn = ClientConn::dial(&url).await.unwrap();
    let tracks = conn.describe(&url).await.unwrap();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks.0[0].control(), Some("trackID=0"));

    conn.setup(TransportMode::Play, StreamProtocol::Tcp, &tracks.0[0])
        .await
        .unwrap();
    assert_eq!(conn.state(), ClientState::PrePlay);
    conn.play().await.unwrap();
    assert_eq!(conn.state(), ClientState::Play);

    let (track_id, stream_type, payload) =
        tokio::time::timeout(Duration::from_secs(5), conn.read_frame())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(track_id, 0);
    assert_eq!(stream_type, StreamType::Rtp);
    assert_eq!(&payload[..], b"\x01\x02\x03\x04");

    conn.pause().await.unwrap();
    assert_eq!(conn.state(), ClientState::PrePlay);
    conn.teardown().await.unwrap();
}

#[tokio::test]
async fn state_machine_rejects_out_of_order_methods() {
    let (url, _frame_rx, _err_rx) = start_server(ServerConfig::default(), false).await;
    let mut conn = ClientConn::dial(&url).await.unwrap();

    let err = conn.play().await.unwrap_err();
    assert!(err.to_string().contains("PLAY"), "{}", err);
    let err = conn.record().await.unwrap_err();
    assert!(err.to_string().contains("RECORD"), "{}", err);
    let err = conn.pause().await.unwrap_err();
    assert!(err.to_string().contains("PAUSE"), "{}", err);

    // DESCRIBE then SETUP for an unrelated presentation is rejected locally.
    let tracks = conn.describe(&url).await.unwrap();
    let mut other = tracks.0[0].clone();
    other.base_url = Some(Url::parse("rtsp://127.0.0.1/otherstream").unwrap());
    let err = conn
        .setup(TransportMode::Play, StreamProtocol::Tcp, &other)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "can't setup tracks with different paths");
}

#[tokio::test]
async fn duplicate_setup_rejected_locally() {
    let (url, _frame_rx, _err_rx) = start_server(ServerConfig::default(), false).await;
    let mut conn = ClientConn::dial(&url).await.unwrap();
    let tracks = conn.describe(&url).await.unwrap();
    conn.setup(TransportMode::Play, StreamProtocol::Tcp, &tracks.0[0])
        .await
        .unwrap();
    let err = conn
        .setup(TransportMode::Play, StreamProtocol::Tcp, &tracks.0[0])
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "track 0 has already been setup");
}

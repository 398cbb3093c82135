// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server behavior tests driven by a raw wire-level client, so the bytes on
//! the socket are exactly what a foreign implementation would send.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;

use crate::base::{Message, Method, Request, Response, StatusCode};
use crate::headers::Transport;
use crate::tokio::{MessageReader, MessageWriter};
use crate::{StreamProtocol, StreamType, TransportMode};

use super::*;

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn sdp_with_control(control: &str) -> Bytes {
    Bytes::from(format!(
        "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=Stream\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\n\
         m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:{}\r\n",
        control
    ))
}

fn sdp_two_tracks() -> Bytes {
    Bytes::from(
        "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=Stream\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\n\
         m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:trackID=0\r\n\
         m=audio 0 RTP/AVP 97\r\na=rtpmap:97 MPEG4-GENERIC/48000\r\na=control:trackID=1\r\n"
            .to_owned(),
    )
}

fn tcp_transport(mode: TransportMode, interleaved: (u8, u8)) -> String {
    let mut th = Transport::new(StreamProtocol::Tcp);
    th.mode = Some(mode);
    th.interleaved = Some(interleaved);
    th.write()
}

struct RawConn {
    reader: MessageReader,
    writer: MessageWriter,
}

impl RawConn {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = crate::tokio::split(Box::new(stream), Duration::from_secs(5));
        RawConn { reader, writer }
    }

    async fn roundtrip(&mut self, req: Request) -> Response {
        self.writer.write_request(&req).await.unwrap();
        self.reader
            .next_response_ignoring_frames(Some(Duration::from_secs(5)))
            .await
            .unwrap()
    }

    async fn next_frame(&mut self) -> crate::base::InterleavedFrame {
        loop {
            match self
                .reader
                .next(Some(Duration::from_secs(5)))
                .await
                .unwrap()
                .unwrap()
            {
                Message::Frame(f) => return f,
                _ => continue,
            }
        }
    }
}

/// Accepts one connection and runs its request loop, reporting the terminal
/// error.
fn serve_one<H: ServerHandler + 'static>(
    server: Server,
    handler: H,
) -> tokio::sync::oneshot::Receiver<String> {
    let (err_tx, err_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let conn = server.accept().await.unwrap();
        let err = conn.read(handler).await;
        let _ = err_tx.send(err.to_string());
    });
    err_rx
}

#[derive(Clone)]
struct Recorder {
    setup_tx: mpsc::UnboundedSender<(String, usize)>,
    frame_tx: Option<mpsc::UnboundedSender<(usize, StreamType, Bytes)>>,
}

impl ServerHandler for Recorder {
    fn on_announce(&mut self, _ctx: AnnounceCtx<'_>) -> HandlerResult {
        Ok(Response::new(StatusCode::OK))
    }

    fn on_setup(&mut self, ctx: SetupCtx<'_>) -> HandlerResult {
        let _ = self.setup_tx.send((ctx.path.to_owned(), ctx.track_id));
        Ok(Response::new(StatusCode::OK))
    }

    fn on_play(&mut self, _ctx: PlayCtx<'_>) -> HandlerResult {
        Ok(Response::new(StatusCode::OK))
    }

    fn on_record(&mut self, _ctx: RecordCtx<'_>) -> HandlerResult {
        Ok(Response::new(StatusCode::OK))
    }

    fn on_pause(&mut self, _ctx: PauseCtx<'_>) -> HandlerResult {
        Ok(Response::new(StatusCode::OK))
    }

    fn on_frame(&mut self, track_id: usize, stream_type: StreamType, payload: &Bytes) {
        if let Some(tx) = &self.frame_tx {
            let _ = tx.send((track_id, stream_type, payload.clone()));
        }
    }
}

fn recorder() -> (Recorder, mpsc::UnboundedReceiver<(String, usize)>) {
    let (setup_tx, setup_rx) = mpsc::unbounded_channel();
    (
        Recorder {
            setup_tx,
            frame_tx: None,
        },
        setup_rx,
    )
}

#[tokio::test]
async fn read_setup_paths() {
    for (case_url, path, track_id) in [
        ("rtsp://localhost:8554/teststream/trackID=2", "teststream", 2usize),
        (
            "rtsp://localhost:8554/teststream?testing=123/trackID=4",
            "teststream",
            4,
        ),
        // needed to support reading MPEG-TS with ffmpeg
        ("rtsp://localhost:8554/teststream/", "teststream", 0),
        ("rtsp://localhost:8554/test/stream/trackID=0", "test/stream", 0),
        ("rtsp://localhost:8554/test/stream/", "test/stream", 0),
        (
            "rtsp://localhost:8554/test/stream?testing=123/trackID=4",
            "test/stream",
            4,
        ),
    ] {
        let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (handler, mut setup_rx) = recorder();
        let _err_rx = serve_one(server, handler);

        let mut conn = RawConn::connect(addr).await;
        let ch = (track_id * 2) as u8;
        let resp = conn
            .roundtrip(
                Request::new(Method::Setup, url(case_url))
                    .with_header("CSeq", "1")
                    .with_header(
                        "Transport",
                        tcp_transport(TransportMode::Play, (ch, ch + 1)),
                    ),
            )
            .await;
        assert_eq!(resp.status, StatusCode::OK, "{}", case_url);
        let (got_path, got_id) = setup_rx.recv().await.unwrap();
        assert_eq!(got_path, path, "{}", case_url);
        assert_eq!(got_id, track_id, "{}", case_url);
    }
}

#[tokio::test]
async fn read_setup_different_paths_rejected() {
    let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (handler, _setup_rx) = recorder();
    let err_rx = serve_one(server, handler);

    let mut conn = RawConn::connect(addr).await;
    let resp = conn
        .roundtrip(
            Request::new(Method::Setup, url("rtsp://localhost:8554/teststream/trackID=0"))
                .with_header("CSeq", "1")
                .with_header("Transport", tcp_transport(TransportMode::Play, (0, 1))),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = conn
        .roundtrip(
            Request::new(
                Method::Setup,
                url("rtsp://localhost:8554/test12stream/trackID=1"),
            )
            .with_header("CSeq", "2")
            .with_header("Transport", tcp_transport(TransportMode::Play, (2, 3))),
        )
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    assert_eq!(
        err_rx.await.unwrap(),
        "can't setup tracks with different paths"
    );
}

#[tokio::test]
async fn read_setup_double_rejected() {
    let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (handler, _setup_rx) = recorder();
    let err_rx = serve_one(server, handler);

    let mut conn = RawConn::connect(addr).await;
    let resp = conn
        .roundtrip(
            Request::new(Method::Setup, url("rtsp://localhost:8554/teststream/trackID=0"))
                .with_header("CSeq", "1")
                .with_header("Transport", tcp_transport(TransportMode::Play, (0, 1))),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = conn
        .roundtrip(
            Request::new(Method::Setup, url("rtsp://localhost:8554/teststream/trackID=0"))
                .with_header("CSeq", "2")
                .with_header("Transport", tcp_transport(TransportMode::Play, (0, 1))),
        )
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    assert_eq!(err_rx.await.unwrap(), "track 0 has already been setup");
}

#[tokio::test]
async fn publish_setup_paths() {
    for (control, case_url, path) in [
        ("trackID=0", "rtsp://localhost:8554/teststream/trackID=0", "teststream"),
        // the announced index wins over the control attribute's number
        ("trackID=2", "rtsp://localhost:8554/teststream/trackID=2", "teststream"),
        ("testing=0", "rtsp://localhost:8554/teststream/testing=0", "teststream"),
        ("?testing=0", "rtsp://localhost:8554/teststream?testing=0", "teststream"),
        ("trackID=0", "rtsp://localhost:8554/test/stream/trackID=0", "test/stream"),
        ("?testing=0", "rtsp://localhost:8554/test/stream?testing=0", "test/stream"),
    ] {
        let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (handler, mut setup_rx) = recorder();
        let _err_rx = serve_one(server, handler);

        let mut conn = RawConn::connect(addr).await;
        let resp = conn
            .roundtrip(
                Request::new(Method::Announce, url(&format!("rtsp://localhost:8554/{}", path)))
                    .with_header("CSeq", "1")
                    .with_header("Content-Type", "application/sdp")
                    .with_body(sdp_with_control(control)),
            )
            .await;
        assert_eq!(resp.status, StatusCode::OK, "{} {}", control, case_url);

        let resp = conn
            .roundtrip(
                Request::new(Method::Setup, url(case_url))
                    .with_header("CSeq", "2")
                    .with_header("Transport", tcp_transport(TransportMode::Record, (0, 1))),
            )
            .await;
        assert_eq!(resp.status, StatusCode::OK, "{} {}", control, case_url);
        let (got_path, got_id) = setup_rx.recv().await.unwrap();
        assert_eq!(got_path, path, "{} {}", control, case_url);
        assert_eq!(got_id, 0, "{} {}", control, case_url);
    }
}

#[tokio::test]
async fn publish_setup_different_path_rejected() {
    let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (handler, _setup_rx) = recorder();
    let err_rx = serve_one(server, handler);

    let mut conn = RawConn::connect(addr).await;
    let resp = conn
        .roundtrip(
            Request::new(Method::Announce, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "1")
                .with_header("Content-Type", "application/sdp")
                .with_body(sdp_with_control("trackID=0")),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = conn
        .roundtrip(
            Request::new(
                Method::Setup,
                url("rtsp://localhost:8554/test2stream/trackID=0"),
            )
            .with_header("CSeq", "2")
            .with_header("Transport", tcp_transport(TransportMode::Record, (0, 1))),
        )
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    assert_eq!(
        err_rx.await.unwrap(),
        "invalid track path (test2stream/trackID=0)"
    );
}

#[tokio::test]
async fn publish_record_partial_tracks_rejected() {
    let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (handler, _setup_rx) = recorder();
    let err_rx = serve_one(server, handler);

    let mut conn = RawConn::connect(addr).await;
    let resp = conn
        .roundtrip(
            Request::new(Method::Announce, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "1")
                .with_header("Content-Type", "application/sdp")
                .with_body(sdp_two_tracks()),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = conn
        .roundtrip(
            Request::new(Method::Setup, url("rtsp://localhost:8554/teststream/trackID=0"))
                .with_header("CSeq", "2")
                .with_header("Transport", tcp_transport(TransportMode::Record, (0, 1))),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = conn
        .roundtrip(
            Request::new(Method::Record, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "3"),
        )
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    assert_eq!(
        err_rx.await.unwrap(),
        "not all announced tracks have been setup"
    );
}

#[tokio::test]
async fn publish_receive_interleaved_frames() {
    let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (mut handler, _setup_rx) = recorder();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    handler.frame_tx = Some(frame_tx);
    let _err_rx = serve_one(server, handler);

    let mut conn = RawConn::connect(addr).await;
    let resp = conn
        .roundtrip(
            Request::new(Method::Announce, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "1")
                .with_header("Content-Type", "application/sdp")
                .with_body(sdp_with_control("trackID=0")),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = conn
        .roundtrip(
            Request::new(Method::Setup, url("rtsp://localhost:8554/teststream/trackID=0"))
                .with_header("CSeq", "2")
                .with_header("Transport", tcp_transport(TransportMode::Record, (0, 1))),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = conn
        .roundtrip(
            Request::new(Method::Record, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "3"),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    conn.writer
        .write_frame(&crate::base::InterleavedFrame {
            track_id: 0,
            stream_type: StreamType::Rtp,
            payload: Bytes::from_static(b"\x01\x02\x03\x04"),
        })
        .await
        .unwrap();
    conn.writer
        .write_frame(&crate::base::InterleavedFrame {
            track_id: 0,
            stream_type: StreamType::Rtcp,
            payload: Bytes::from_static(b"\x05\x06\x07\x08"),
        })
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

    let (track_id, stream_type, payload) =
        tokio::time::timeout(Duration::from_secs(5), frame_rx.recv())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(track_id, 0);
    assert_eq!(stream_type, StreamType::Rtcp);
    assert_eq!(&payload[..], b"\x05\x06\x07\x08");
}

#[tokio::test]
async fn read_receive_udp_rtcp_packet() {
    let config = ServerConfig {
        udp_rtp_address: Some("127.0.0.1:0".parse().unwrap()),
        udp_rtcp_address: Some("127.0.0.1:0".parse().unwrap()),
        ..ServerConfig::default()
    };
    let server = config.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (mut handler, _setup_rx) = recorder();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    handler.frame_tx = Some(frame_tx);
    let _err_rx = serve_one(server, handler);

    // The "client" side of the UDP session.
    let client_rtp = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_rtcp = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut th = Transport::new(StreamProtocol::Udp);
    th.mode = Some(TransportMode::Play);
    th.client_port = Some((
        client_rtp.local_addr().unwrap().port(),
        client_rtcp.local_addr().unwrap().port(),
    ));

    let mut conn = RawConn::connect(addr).await;
    let resp = conn
        .roundtrip(
            Request::new(Method::Setup, url("rtsp://localhost:8554/teststream/trackID=0"))
                .with_header("CSeq", "1")
                .with_header("Transport", th.write()),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    let resp_th = Transport::parse(resp.headers.get("Transport").unwrap()).unwrap();
    let (_, server_rtcp_port) = resp_th.server_port.unwrap();

    let resp = conn
        .roundtrip(
            Request::new(Method::Play, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "2"),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    client_rtcp
        .send_to(
            b"\x01\x02\x03\x04",
            SocketAddr::new("127.0.0.1".parse().unwrap(), server_rtcp_port),
        )
        .await
        .unwrap();

    let (track_id, stream_type, payload) =
        tokio::time::timeout(Duration::from_secs(5), frame_rx.recv())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(track_id, 0);
    assert_eq!(stream_type, StreamType::Rtcp);
    assert_eq!(&payload[..], b"\x01\x02\x03\x04");
}

/// Streams frames while the PLAY response is in flight. The client must be
/// able to read the response first by scanning past interleaved data.
struct FrameOnPlay {
    conn: Option<ServerConn>,
}

impl ServerHandler for FrameOnPlay {
    fn on_setup(&mut self, _ctx: SetupCtx<'_>) -> HandlerResult {
        Ok(Response::new(StatusCode::OK))
    }

    fn on_play(&mut self, _ctx: PlayCtx<'_>) -> HandlerResult {
        if let Some(conn) = self.conn.take() {
            tokio::spawn(async move {
                loop {
                    if conn
                        .write_frame(0, StreamType::Rtp, Bytes::from_static(b"\x00\x00\x00\x00"))
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

    fn on_pause(&mut self, _ctx: PauseCtx<'_>) -> HandlerResult {
        Ok(Response::new(StatusCode::OK))
    }
}

#[tokio::test]
async fn read_tcp_response_before_frames() {
    let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (err_tx, _err_rx) = tokio::sync::oneshot::channel::<String>();
    tokio::spawn(async move {
        let conn = server.accept().await.unwrap();
        let handler = FrameOnPlay {
            conn: Some(conn.clone()),
        };
        let err = conn.read(handler).await;
        let _ = err_tx.send(err.to_string());
    });

    let mut conn = RawConn::connect(addr).await;
    let resp = conn
        .roundtrip(
            Request::new(Method::Setup, url("rtsp://localhost:8554/teststream/trackID=0"))
                .with_header("CSeq", "1")
                .with_header("Transport", tcp_transport(TransportMode::Play, (0, 1))),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = conn
        .roundtrip(
            Request::new(Method::Play, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "2"),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let frame = conn.next_frame().await;
    assert_eq!(frame.track_id, 0);
    assert_eq!(frame.stream_type, StreamType::Rtp);

    // A second PLAY answers 200 without restarting the writer; PAUSE twice
    // is idempotent in PrePlay.
    let resp = conn
        .roundtrip(
            Request::new(Method::Play, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "3"),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = conn
        .roundtrip(
            Request::new(Method::Pause, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "4"),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = conn
        .roundtrip(
            Request::new(Method::Pause, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "5"),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);
}

#[tokio::test]
async fn wrong_session_token_rejected() {
    let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (handler, _setup_rx) = recorder();
    let err_rx = serve_one(server, handler);

    let mut conn = RawConn::connect(addr).await;
    let resp = conn
        .roundtrip(
            Request::new(Method::Setup, url("rtsp://localhost:8554/teststream/trackID=0"))
                .with_header("CSeq", "1")
                .with_header("Transport", tcp_transport(TransportMode::Play, (0, 1))),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    let issued = resp.headers.get("Session").unwrap().to_owned();
    assert!(!issued.is_empty());

    let resp = conn
        .roundtrip(
            Request::new(Method::Play, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "2")
                .with_header("Session", format!("not-{}", issued)),
        )
        .await;
    assert_eq!(resp.status, StatusCode::SESSION_NOT_FOUND);
    assert_eq!(err_rx.await.unwrap(), "session not found");
}

#[tokio::test]
async fn udp_refused_without_listeners() {
    let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (handler, _setup_rx) = recorder();
    let _err_rx = serve_one(server, handler);

    let mut th = Transport::new(StreamProtocol::Udp);
    th.mode = Some(TransportMode::Play);
    th.client_port = Some((35466, 35467));

    let mut conn = RawConn::connect(addr).await;
    let resp = conn
        .roundtrip(
            Request::new(Method::Setup, url("rtsp://localhost:8554/teststream/trackID=0"))
                .with_header("CSeq", "1")
                .with_header("Transport", th.write()),
        )
        .await;
    assert_eq!(resp.status, StatusCode::UNSUPPORTED_TRANSPORT);

    // the connection stays alive and accepts a TCP retry
    let resp = conn
        .roundtrip(
            Request::new(Method::Setup, url("rtsp://localhost:8554/teststream/trackID=0"))
                .with_header("CSeq", "2")
                .with_header("Transport", tcp_transport(TransportMode::Play, (0, 1))),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);
}

#[tokio::test]
async fn options_and_keepalives_answered() {
    let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (handler, _setup_rx) = recorder();
    let _err_rx = serve_one(server, handler);

    let mut conn = RawConn::connect(addr).await;
    let resp = conn
        .roundtrip(
            Request::new(Method::Options, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "1"),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(resp.headers.get("Public").unwrap().contains("SETUP"));

    let resp = conn
        .roundtrip(
            Request::new(Method::GetParameter, url("rtsp://localhost:8554/teststream"))
                .with_header("CSeq", "2"),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);
}

// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based connection I/O.
//!
//! The control socket is split once at session start: the read half feeds a
//! [`FramedRead`] with the message codec (so interleaved frames and RTSP
//! messages can be distinguished mid-stream), and the write half serializes
//! whole messages under a per-write deadline. Background loops borrow the
//! reader and hand it back on termination; the writer is shared behind a
//! mutex because requests, interleaved frames, and RTCP reports all funnel
//! onto one stream.

use bytes::BytesMut;
use futures::StreamExt;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::FramedRead;

use crate::base::codec::{Codec, CodecError};
use crate::base::{InterleavedFrame, Message, Request, Response};
use crate::{Error, ErrorInt};

/// Object-safe supertrait so plain TCP and TLS streams share one shape.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncStream for T {}

pub(crate) type BoxedStream = Box<dyn AsyncStream>;

pub(crate) fn codec_error(e: CodecError) -> Error {
    match e {
        CodecError::Io(e) => wrap!(ErrorInt::ReadError(e)),
        CodecError::Parse {
            kind,
            description,
            pos,
        } => wrap!(ErrorInt::FramingError {
            kind,
            description: format!("{} (at stream pos {})", description, pos),
        }),
    }
}

/// Connects the control TCP socket for a client session.
pub(crate) async fn connect(host: &str, port: u16) -> Result<TcpStream, Error> {
    TcpStream::connect((host, port))
        .await
        .map_err(|e| wrap!(ErrorInt::ReadError(e)))
}

/// Splits a stream into the reader/writer pair used by connections.
pub(crate) fn split(
    stream: BoxedStream,
    write_timeout: Duration,
) -> (MessageReader, MessageWriter) {
    let (r, w) = tokio::io::split(stream);
    (
        MessageReader(FramedRead::new(r, Codec::new())),
        MessageWriter {
            io: w,
            buf: BytesMut::with_capacity(1024),
            write_timeout,
        },
    )
}

/// The reading side of a control socket.
pub(crate) struct MessageReader(FramedRead<ReadHalf<BoxedStream>, Codec>);

impl MessageReader {
    /// Returns the next message, `None` on clean EOF.
    ///
    /// `timeout` is the per-read deadline; pass `None` to wait indefinitely
    /// (idle is normal while media flows elsewhere, e.g. UDP publishing).
    pub(crate) async fn next(&mut self, timeout: Option<Duration>) -> Result<Option<Message>, Error> {
        let item = match timeout {
            Some(t) => match tokio::time::timeout(t, self.0.next()).await {
                Ok(item) => item,
                Err(_) => bail!(ErrorInt::Timeout),
            },
            None => self.0.next().await,
        };
        match item {
            None => Ok(None),
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(codec_error(e)),
        }
    }

    /// Returns the next response, discarding interleaved frames.
    ///
    /// This is the read mode used when a protocol reply is expected while
    /// media may be flowing in the other direction on the same stream.
    pub(crate) async fn next_response_ignoring_frames(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        loop {
            match self.next(timeout).await? {
                None => bail!(ErrorInt::ConnectionClosed),
                Some(Message::Frame(_)) => continue,
                Some(Message::Response(resp)) => return Ok(resp),
                Some(Message::Request(req)) => {
                    bail!(ErrorInt::FramingError {
                        kind: crate::error::FramingErrorKind::InvalidRequestLine,
                        description: format!(
                            "unexpected {} request while awaiting response",
                            req.method
                        ),
                    })
                }
            }
        }
    }
}

/// The writing side of a control socket.
///
/// Each write serializes into a scratch buffer and then flushes the whole
/// message under the configured deadline, so concurrent writers (frames,
/// reports, requests) never interleave partial messages.
pub(crate) struct MessageWriter {
    io: WriteHalf<BoxedStream>,
    buf: BytesMut,
    write_timeout: Duration,
}

impl MessageWriter {
    pub(crate) async fn write_request(&mut self, req: &Request) -> Result<(), Error> {
        self.buf.clear();
        req.write_to(&mut self.buf);
        self.flush().await
    }

    pub(crate) async fn write_response(&mut self, resp: &Response) -> Result<(), Error> {
        self.buf.clear();
        resp.write_to(&mut self.buf);
        self.flush().await
    }

    pub(crate) async fn write_frame(&mut self, frame: &InterleavedFrame) -> Result<(), Error> {
        self.buf.clear();
        frame.write_to(&mut self.buf);
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), Error> {
        match tokio::time::timeout(self.write_timeout, self.io.write_all(&self.buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => bail!(ErrorInt::WriteError(e)),
            Err(_) => bail!(ErrorInt::Timeout),
        }
    }
}

/// [`crate::UdpPair`] rewrapped for the tokio runtime; the even/odd
/// allocation itself stays synchronous.
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

impl UdpPair {
    pub(crate) fn bind(ip_addr: IpAddr) -> Result<Self, std::io::Error> {
        let inner = crate::UdpPair::bind(ip_addr)?;
        inner.rtp_socket.set_nonblocking(true)?;
        inner.rtcp_socket.set_nonblocking(true)?;
        Ok(Self {
            rtp_port: inner.rtp_port,
            rtp_socket: UdpSocket::from_std(inner.rtp_socket)?,
            rtcp_socket: UdpSocket::from_std(inner.rtcp_socket)?,
        })
    }
}

// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use thiserror::Error;

use crate::base::StatusCode;
use crate::client::ClientState;
use crate::server::ServerState;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages; a handful of accessors
/// exist for the cases callers are expected to branch on (status codes and
/// state violations).
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the status code, if the error was generated from a response.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self.0.as_ref() {
            ErrorInt::WrongStatusCode { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if the error indicates the connection or session was
    /// terminated on purpose, as opposed to failing.
    pub fn is_terminated(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::Terminated)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

/// Kind of a low-level message framing failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FramingErrorKind {
    /// An interleaved frame did not start with the `0x24` magic byte.
    WrongMagic,
    InvalidRequestLine,
    InvalidStatusLine,
    InvalidMethod,
    HeaderTooLong,
    TooManyHeaders,
    BodyTooLarge,
    MissingCSeq,
    /// End of stream in the middle of a message.
    ShortRead,
}

impl std::fmt::Display for FramingErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FramingErrorKind::WrongMagic => "wrong magic byte",
            FramingErrorKind::InvalidRequestLine => "invalid request line",
            FramingErrorKind::InvalidStatusLine => "invalid status line",
            FramingErrorKind::InvalidMethod => "invalid method",
            FramingErrorKind::HeaderTooLong => "header too long",
            FramingErrorKind::TooManyHeaders => "too many headers",
            FramingErrorKind::BodyTooLarge => "body too large",
            FramingErrorKind::MissingCSeq => "missing CSeq",
            FramingErrorKind::ShortRead => "short read",
        };
        f.pad(s)
    }
}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unparseable or unexpected bytes on the control stream.
    #[error("RTSP framing error ({kind}): {description}")]
    FramingError {
        kind: FramingErrorKind,
        description: String,
    },

    #[error("can't perform a {method} in state {current:?} (allowed: {allowed:?})")]
    WrongState {
        method: crate::base::Method,
        current: StateKind,
        allowed: &'static [StateKind],
    },

    #[error("track {id} has already been setup")]
    TrackAlreadySetup { id: usize },

    #[error("can't setup tracks with different paths")]
    CantSetupTracksDifferentPaths,

    #[error("can't setup tracks with different protocols")]
    CantSetupTracksDifferentProtocols,

    #[error("not all announced tracks have been setup")]
    NotAllAnnouncedTracksSetup,

    #[error("invalid track path ({path})")]
    InvalidTrackPath { path: String },

    #[error("session not found")]
    SessionNotFound,

    #[error("no tracks have been setup")]
    NoTracksSetup,

    #[error("unable to bind UDP port pair: {0}")]
    UdpBindFailed(#[source] std::io::Error),

    #[error("interleaved channel {id} is already in use")]
    InterleavedChannelBusy { id: u8 },

    #[error("transport header is not acceptable: {0}")]
    TransportNotAccepted(String),

    #[error("bad status code {code} ({message})")]
    WrongStatusCode { code: StatusCode, message: String },

    #[error("authentication failed")]
    AuthenticationFailed,

    /// An error produced by a server handler callback, delivered alongside
    /// its response.
    #[error("{0}")]
    Handler(String),

    #[error("terminated")]
    Terminated,

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("error reading from RTSP peer: {0}")]
    ReadError(#[source] std::io::Error),

    #[error("error writing to RTSP peer: {0}")]
    WriteError(#[source] std::io::Error),

    #[error("error receiving UDP packet: {0}")]
    UdpRecvError(#[source] std::io::Error),
}

/// State of either side of a connection, for `WrongState` reporting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum StateKind {
    Initial,
    PrePlay,
    Play,
    PreRecord,
    Record,
    Closed,
}

impl From<ClientState> for StateKind {
    fn from(s: ClientState) -> Self {
        match s {
            ClientState::Initial => StateKind::Initial,
            ClientState::PrePlay => StateKind::PrePlay,
            ClientState::Play => StateKind::Play,
            ClientState::PreRecord => StateKind::PreRecord,
            ClientState::Record => StateKind::Record,
            ClientState::Closed => StateKind::Closed,
        }
    }
}

impl From<ServerState> for StateKind {
    fn from(s: ServerState) -> Self {
        match s {
            ServerState::Initial => StateKind::Initial,
            ServerState::PrePlay => StateKind::PrePlay,
            ServerState::Play => StateKind::Play,
            ServerState::PreRecord => StateKind::PreRecord,
            ServerState::Record => StateKind::Record,
            ServerState::Closed => StateKind::Closed,
        }
    }
}

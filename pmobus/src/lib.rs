//! # pmobus
//!
//! Request/reply transport between the PMOSignage processes.
//!
//! Messages are XML documents framed with a 4-byte big-endian length
//! prefix over localhost TCP. Every request carries a `token` attribute
//! (except the one-off `register`) and receives exactly one reply. A
//! requester that sees no reply within [`REQUEST_TIMEOUT`] discards its
//! socket, reconnects and retransmits the outstanding message, which
//! gives the same at-least-once pairing the engine has always relied
//! on.
//!
//! Each socket is owned by exactly one task: [`ReplyEndpoint`] runs an
//! accept loop dispatching to a [`RequestHandler`], [`RequestPump`]
//! drains a queue of outgoing requests and emits idle pings. The rest
//! of a process talks to them over channels only.

pub mod client;
pub mod endpoint;
pub mod envelope;

use std::time::Duration;

use thiserror::Error;

pub use client::{ReplySink, RequestClient, RequestPump};
pub use endpoint::{ReplyEndpoint, RequestHandler};
pub use envelope::{verbs, Envelope, EnvelopeKind};

/// How long a requester waits for a reply before rebuilding its socket.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// Frequency with which supervised processes are expected to check in.
pub const SUBPROCESS_CHECKIN_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single message frame.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

// Default port numbers.
//
// Note - dynamic, private or ephemeral ports: 49152-65535.
// We use those in the region 55343+.
pub const SUBSMANAGER_REQ_PORT: u16 = 55343;
pub const SENSORMANAGER_REQ_PORT: u16 = 55344;
pub const RENDERER_REQ_PORT: u16 = 55345;

pub const SUBSMANAGER_REP_PORT: u16 = 55346;
pub const SENSORMANAGER_REP_PORT: u16 = 55347;
pub const DISPLAYCONTROLLER_REP_PORT: u16 = 55348;

/// Localhost address for one of the fixed ports.
pub fn localhost(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid RPC XML: {0}")]
    Parse(#[from] xmltree::ParseError),
    #[error("invalid RPC XML: {0}")]
    InvalidEnvelope(String),
    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(u32),
    #[error("no reply within {}ms", REQUEST_TIMEOUT.as_millis())]
    ReplyTimeout,
    #[error("endpoint is shutting down")]
    Terminated,
}

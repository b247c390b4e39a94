//! # pmoproc
//!
//! Subprocess supervision for PMOSignage.
//!
//! A *manager* owns a set of handler subprocesses: it spawns them with
//! a one-off registration token, watches their stderr, expects a
//! registration then periodic check-ins over the bus, and restarts
//! anything that goes quiet. A *handler* is the child-process side of
//! the same contract: register, receive params, keep checking in, and
//! for pull handlers re-read a source on a refresh schedule with a
//! doubling backoff on failure.

pub mod handler;
pub mod logging;
pub mod manager;

use std::time::Duration;

use thiserror::Error;

pub use handler::{HandlerContext, HandlerOptions, PullDriver, PullSource};
pub use manager::{HandlerStub, Manager, ManagerDelegate, Subprocess};

pub const SUBPROCESS_CHECK_INTERVAL: Duration = Duration::from_millis(500);
pub const SUBPROCESS_CHECKIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const SUBPROCESS_KILLTERM_TIMEOUT: Duration = Duration::from_secs(5);
pub const SUBPROCESS_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const SUBPROCESS_FAILED_LIMIT: u32 = 5;
pub const SUBPROCESS_RESTART_SLEEP: Duration = Duration::from_secs(10);
pub const SUBPROCESS_RESTART_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("cannot start handler - handler status checker stopped or stopping")]
    NotExecuting,
    #[error("failed to spawn subprocess: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("no handler registered for scheme '{0}'")]
    UnknownScheme(String),
    #[error("could not parse uri '{0}'")]
    BadUri(String),
    #[error(transparent)]
    Bus(#[from] pmobus::BusError),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("bad command line: {0}")]
    BadArguments(String),
    #[error("invalid RPC XML: {0}")]
    Rpc(String),
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("read failed: {0}")]
    Read(String),
}

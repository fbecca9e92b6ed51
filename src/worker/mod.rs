//! The worker processes.
//!
//! The orchestrator forks one worker per concern and talks to each over
//! a socket pair passed as the child's standard input. Every worker is
//! single-threaded and strictly serial: it reads one request, does the
//! work, writes the response, and preserves request order. A worker
//! terminates when its ingress stream reaches end of file.

use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;

pub mod http;
pub mod parser;
pub mod rrdp;
pub mod rsync;

/// The names the workers are announced as on the command line.
pub const PROC_PARSER: &str = "parser";
pub const PROC_RSYNC: &str = "rsync";
pub const PROC_HTTP: &str = "http";
pub const PROC_RRDP: &str = "rrdp";

/// The result of an HTTP fetch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HttpResult {
    /// Anything else.
    Failed,

    /// 200 OK; the body was delivered.
    Ok,

    /// 304 Not Modified; the cached copy is current.
    NotModified,
}

impl HttpResult {
    pub fn to_u8(self) -> u8 {
        match self {
            HttpResult::Failed => 0,
            HttpResult::Ok => 1,
            HttpResult::NotModified => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(HttpResult::Failed),
            1 => Some(HttpResult::Ok),
            2 => Some(HttpResult::NotModified),
            _ => None
        }
    }

    pub fn is_success(self) -> bool {
        !matches!(self, HttpResult::Failed)
    }
}

/// Message kinds on the RRDP channel.
pub mod rrdp_msg {
    /// Orchestrator to worker: synchronize this repository.
    pub const START: u8 = 0;

    /// Worker to orchestrator: the session state to persist.
    pub const SESSION: u8 = 1;

    /// Worker to orchestrator: apply this file operation.
    pub const FILE: u8 = 2;

    /// Worker to orchestrator: this repository is finished.
    pub const END: u8 = 3;

    /// Worker to orchestrator: fetch this URI for me.
    pub const HTTP_REQ: u8 = 4;

    /// Orchestrator to worker: the fetch you asked for concluded.
    pub const HTTP_FIN: u8 = 5;
}

/// Takes over the socket the orchestrator passed as standard input.
///
/// # Safety
///
/// Must only be called once, at worker start, with nothing else using
/// descriptor 0.
pub unsafe fn stdin_stream() -> UnixStream {
    UnixStream::from_raw_fd(0)
}

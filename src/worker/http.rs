//! The HTTP worker.
//!
//! Performs conditional GETs on behalf of the orchestrator. Every
//! request carries a descriptor the response body is streamed into; the
//! worker closes it when the body ends, which is how the consumer on the
//! other end of a pipe learns the transfer is over. The completion
//! report carries the new Last-Modified value for the next conditional
//! fetch.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::FromRawFd;
use std::time::Duration;
use log::warn;
use reqwest::blocking::Client;
use reqwest::header;
use reqwest::StatusCode;
use crate::ipc::{IoBuf, WorkerChannel};
use super::HttpResult;

/// Runs the HTTP worker until its ingress stream ends.
///
/// Requests are `(id, uri, last_mod)` plus the body descriptor;
/// responses are `(id, result, last_mod)`.
pub fn run(mut channel: WorkerChannel) -> io::Result<()> {
    let client = match Client::builder()
        .user_agent(concat!("rpki-rp/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(15))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            return Err(io::Error::new(io::ErrorKind::Other, err))
        }
    };

    while let Some(mut frame) = channel.read_frame()? {
        let id = frame.take_u64()?;
        let uri = frame.take_str()?;
        let last_mod = frame.take_opt_str()?;
        let body_fd = channel.take_fd().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData, "request without body fd"
            )
        })?;
        let mut body = unsafe { File::from_raw_fd(body_fd) };

        let (result, new_last_mod) = fetch(
            &client, &uri, last_mod.as_deref(), &mut body
        );
        // Dropping the file closes the descriptor; the reader sees EOF.
        drop(body);

        let mut buf = IoBuf::new();
        buf.simple_u64(id);
        buf.simple_u8(result.to_u8());
        buf.opt_str(new_last_mod.as_deref());
        channel.write_frame(buf)?;
    }
    Ok(())
}

/// Performs one conditional GET, streaming the body into `body`.
fn fetch(
    client: &Client,
    uri: &str,
    last_mod: Option<&str>,
    body: &mut File,
) -> (HttpResult, Option<String>) {
    let mut request = client.get(uri);
    if let Some(last_mod) = last_mod {
        request = request.header(header::IF_MODIFIED_SINCE, last_mod);
    }
    let mut response = match request.send() {
        Ok(response) => response,
        Err(err) => {
            warn!("{}: {}", uri, err);
            return (HttpResult::Failed, None)
        }
    };

    if response.status() == StatusCode::NOT_MODIFIED {
        return (HttpResult::NotModified, last_mod.map(Into::into))
    }
    if !response.status().is_success() {
        warn!("{}: HTTP {}", uri, response.status());
        return (HttpResult::Failed, None)
    }

    let new_last_mod = response.headers()
        .get(header::LAST_MODIFIED)
        .and_then(|value| value.to_str().ok())
        .map(Into::into);

    match response.copy_to(body) {
        Ok(_) => {
            if body.flush().is_err() {
                return (HttpResult::Failed, None)
            }
            (HttpResult::Ok, new_last_mod)
        }
        Err(err) => {
            warn!("{}: {}", uri, err);
            (HttpResult::Failed, None)
        }
    }
}

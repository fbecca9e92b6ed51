//! The rsync worker.
//!
//! Mirrors one module per request by invoking the external rsync client
//! and reports success or failure tagged with the caller's repository
//! id. The worker itself never parses anything it fetched.

use std::fs;
use std::io;
use std::process::{Command, Stdio};
use log::warn;
use crate::ipc::{IoBuf, WorkerChannel};

/// Runs the rsync worker until its ingress stream ends.
///
/// Requests are `(id, uri, destination)`; responses are `(id, ok)`.
pub fn run(
    mut channel: WorkerChannel, rsync_command: &str
) -> io::Result<()> {
    while let Some(mut frame) = channel.read_frame()? {
        let id = frame.take_u64()?;
        let uri = frame.take_str()?;
        let dst = frame.take_str()?;
        let ok = fetch(rsync_command, &uri, &dst);
        let mut buf = IoBuf::new();
        buf.simple_u64(id);
        buf.simple_bool(ok);
        channel.write_frame(buf)?;
    }
    Ok(())
}

/// Mirrors `uri` into the directory `dst`.
fn fetch(rsync_command: &str, uri: &str, dst: &str) -> bool {
    if let Err(err) = fs::create_dir_all(dst) {
        warn!("{}: {}", dst, err);
        return false
    }
    let status = Command::new(rsync_command)
        .arg("-rt")
        .arg("--delete")
        .arg("--exclude=.*")
        .arg("--timeout=180")
        .arg(uri)
        .arg(dst)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!("rsync {}: exited with {}", uri, status);
            false
        }
        Err(err) => {
            warn!("rsync {}: {}", uri, err);
            false
        }
    }
}

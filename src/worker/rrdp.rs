//! The RRDP worker.
//!
//! Synchronizes one repository per START request: fetches the update
//! notification through the HTTP worker (the orchestrator relays both
//! the request and the passed pipe descriptor), decides between deltas
//! and snapshot, and streams the resulting file operations back as FILE
//! messages. The worker never touches the cache directory itself; the
//! orchestrator applies the operations so all writes stay in one place.
//!
//! Requests that arrive while a repository is being worked on queue up
//! and are served in order.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::FromRawFd;
use log::warn;
use uuid::Uuid;
use crate::crypto::DigestAlgorithm;
use crate::ipc::{Frame, IoBuf, WorkerChannel};
use crate::rrdp::{
    parse_delta, parse_snapshot, FetchPlan, NotificationFile, RrdpSession,
};
use super::{rrdp_msg, HttpResult};

/// Runs the RRDP worker until its ingress stream ends.
pub fn run(mut channel: WorkerChannel) -> io::Result<()> {
    let mut worker = Worker {
        channel,
        queued: VecDeque::new(),
    };
    loop {
        let mut frame = match worker.next_frame()? {
            Some(frame) => frame,
            None => return Ok(())
        };
        match frame.take_u8()? {
            rrdp_msg::START => worker.serve(&mut frame)?,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData, "unexpected message"
                ))
            }
        }
    }
}


//------------ Worker --------------------------------------------------------

struct Worker {
    channel: WorkerChannel,
    queued: VecDeque<Frame>,
}

impl Worker {
    /// Returns the next frame: queued ones first, then the stream.
    fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        if let Some(frame) = self.queued.pop_front() {
            return Ok(Some(frame))
        }
        self.channel.read_frame()
    }

    /// Serves one START request.
    fn serve(&mut self, frame: &mut Frame) -> io::Result<()> {
        let id = frame.take_u64()?;
        let notify = frame.take_str()?;
        let session_id = frame.take_str()?;
        let serial = frame.take_u64()?;
        let last_mod = frame.take_opt_str()?;

        let state = RrdpSession {
            session_id: session_id.parse().unwrap_or_else(|_| Uuid::nil()),
            serial,
            last_mod,
        };

        let ok = match self.sync(id, &notify, &state) {
            Ok(ok) => ok,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!("{}: {}", notify, err);
                false
            }
            Err(err) => return Err(err)
        };

        let mut buf = IoBuf::new();
        buf.simple_u8(rrdp_msg::END);
        buf.simple_u64(id);
        buf.simple_bool(ok);
        self.channel.write_frame(buf)
    }

    /// Performs the actual synchronization.
    ///
    /// Returns whether the repository is now up to date. I/O errors on
    /// the channel itself are fatal and propagated.
    fn sync(
        &mut self, id: u64, notify: &str, state: &RrdpSession
    ) -> io::Result<bool> {
        let (result, last_mod, body) =
            self.http_get(id, notify, state.last_mod.as_deref())?;
        match result {
            HttpResult::Failed => return Ok(false),
            HttpResult::NotModified => return Ok(true),
            HttpResult::Ok => { }
        }

        let notification = match NotificationFile::parse(body.as_slice()) {
            Ok(notification) => notification,
            Err(err) => {
                warn!("{}: {}", notify, err);
                return Ok(false)
            }
        };

        match notification.plan(state) {
            FetchPlan::UpToDate => {
                self.send_session(id, &RrdpSession {
                    session_id: notification.session_id,
                    serial: notification.serial,
                    last_mod: last_mod.clone(),
                })?;
                Ok(true)
            }
            FetchPlan::Deltas(deltas) => {
                for (serial, uri_hash) in deltas {
                    let body = match self.fetch_document(
                        id, &uri_hash.uri, &uri_hash.hash
                    )? {
                        Some(body) => body,
                        None => return Ok(false)
                    };
                    let res = parse_delta(
                        body.as_slice(),
                        notification.session_id,
                        serial,
                        |op| {
                            self.send_file(id, op)
                                .map_err(|_| crate::xml::Error::Malformed)
                        }
                    );
                    if let Err(err) = res {
                        warn!("{}: delta {}: {}", notify, serial, err);
                        return Ok(false)
                    }
                }
                self.send_session(id, &RrdpSession {
                    session_id: notification.session_id,
                    serial: notification.serial,
                    last_mod,
                })?;
                Ok(true)
            }
            FetchPlan::Snapshot => {
                let body = match self.fetch_document(
                    id, &notification.snapshot.uri,
                    &notification.snapshot.hash
                )? {
                    Some(body) => body,
                    None => return Ok(false)
                };
                let res = parse_snapshot(
                    body.as_slice(),
                    notification.session_id,
                    notification.serial,
                    |op| {
                        self.send_file(id, op)
                            .map_err(|_| crate::xml::Error::Malformed)
                    }
                );
                if let Err(err) = res {
                    warn!("{}: snapshot: {}", notify, err);
                    return Ok(false)
                }
                self.send_session(id, &RrdpSession {
                    session_id: notification.session_id,
                    serial: notification.serial,
                    last_mod,
                })?;
                Ok(true)
            }
        }
    }

    /// Fetches a snapshot or delta document and checks its hash.
    fn fetch_document(
        &mut self, id: u64, uri: &str, hash: &[u8; 32]
    ) -> io::Result<Option<Vec<u8>>> {
        let (result, _, body) = self.http_get(id, uri, None)?;
        if !matches!(result, HttpResult::Ok) {
            return Ok(None)
        }
        let digest = DigestAlgorithm::sha256().digest(&body);
        if digest.as_ref() != hash {
            warn!("{}: hash mismatch", uri);
            return Ok(None)
        }
        Ok(Some(body))
    }

    /// Fetches one URI through the orchestrator and the HTTP worker.
    ///
    /// Creates a pipe, hands the write end out with the request, and
    /// reads the body off the read end until the HTTP worker closes it.
    fn http_get(
        &mut self, id: u64, uri: &str, last_mod: Option<&str>
    ) -> io::Result<(HttpResult, Option<String>, Vec<u8>)> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error())
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let mut buf = IoBuf::new();
        buf.simple_u8(rrdp_msg::HTTP_REQ);
        buf.simple_u64(id);
        buf.str(uri);
        buf.opt_str(last_mod);
        let sent = self.channel.write_frame_fd(buf, write_fd);
        // Our copy of the write end must go away, or we'd never see EOF.
        unsafe { libc::close(write_fd); }
        if let Err(err) = sent {
            unsafe { libc::close(read_fd); }
            return Err(err)
        }

        let mut body = Vec::new();
        let mut pipe = unsafe { File::from_raw_fd(read_fd) };
        pipe.read_to_end(&mut body)?;
        drop(pipe);

        // The completion report follows the body.
        loop {
            let mut frame = self.channel.read_frame()?.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "orchestrator went away"
                )
            })?;
            match frame.take_u8()? {
                rrdp_msg::HTTP_FIN => {
                    let fin_id = frame.take_u64()?;
                    if fin_id != id {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "completion for wrong repository"
                        ))
                    }
                    let result = HttpResult::from_u8(frame.take_u8()?)
                        .ok_or_else(|| io::Error::new(
                            io::ErrorKind::InvalidData, "bad HTTP result"
                        ))?;
                    let last_mod = frame.take_opt_str()?;
                    return Ok((result, last_mod, body))
                }
                rrdp_msg::START => {
                    // A new repository queued up behind the one we are
                    // working on; keep it for later.
                    let mut data = vec![rrdp_msg::START];
                    data.extend_from_slice(frame.rest());
                    self.queued.push_back(Frame::new(data));
                }
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData, "unexpected message"
                    ))
                }
            }
        }
    }

    fn send_session(
        &mut self, id: u64, session: &RrdpSession
    ) -> io::Result<()> {
        let mut buf = IoBuf::new();
        buf.simple_u8(rrdp_msg::SESSION);
        buf.simple_u64(id);
        buf.str(&session.session_id.to_string());
        buf.simple_u64(session.serial);
        buf.opt_str(session.last_mod.as_deref());
        self.channel.write_frame(buf)
    }

    fn send_file(
        &mut self, id: u64, op: crate::rrdp::FileOp
    ) -> io::Result<()> {
        // Refuse URIs that could escape the repository directory before
        // they ever reach the orchestrator.
        if !crate::validate::valid_uri(op.uri.as_bytes(), "rsync://") {
            warn!("{}: invalid publish URI", op.uri);
            return Ok(())
        }
        let mut buf = IoBuf::new();
        buf.simple_u8(rrdp_msg::FILE);
        buf.simple_u64(id);
        buf.simple_u8(op.what.to_u8());
        buf.str(&op.uri);
        buf.opt_buf(op.hash.as_ref().map(|hash| hash.as_ref()));
        buf.buf(&op.data);
        self.channel.write_frame(buf)
    }
}


//! Framed inter-process messaging.
//!
//! Every payload that crosses a process boundary is serialized into a
//! length-prefixed frame: a native-endian `u32` length followed by that
//! many payload bytes. All processes are children of the orchestrator on
//! the same machine, so scalars travel in host byte order. A frame can
//! additionally carry one file descriptor as ancillary data; this is used
//! only for handing an HTTP response body over to the RRDP worker.
//!
//! The orchestrator side uses [`Channel`]: a non-blocking wrapper that
//! buffers partial reads and queues writes so the event loop never blocks
//! on a single descriptor. Workers use the blocking helpers at the bottom
//! since they are strictly serial request/response.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use bytes::Bytes;

/// Frames larger than this indicate a corrupted stream and are fatal.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;


//------------ IoBuf ---------------------------------------------------------

/// An append-only buffer collecting one outgoing frame.
#[derive(Clone, Debug, Default)]
pub struct IoBuf {
    data: Vec<u8>,
}

impl IoBuf {
    pub fn new() -> Self {
        IoBuf { data: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends a fixed-width scalar in host byte order.
    pub fn simple_u8(&mut self, value: u8) {
        self.data.push(value)
    }

    pub fn simple_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_ne_bytes())
    }

    pub fn simple_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_ne_bytes())
    }

    pub fn simple_i64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_ne_bytes())
    }

    pub fn simple_bool(&mut self, value: bool) {
        self.simple_u8(value as u8)
    }

    /// Appends raw bytes without a length; the layout must be implied.
    pub fn simple_bytes(&mut self, value: &[u8]) {
        self.data.extend_from_slice(value)
    }

    /// Appends a length-delimited byte buffer.
    pub fn buf(&mut self, value: &[u8]) {
        self.simple_u32(value.len() as u32);
        self.data.extend_from_slice(value);
    }

    /// Appends an optional length-delimited byte buffer.
    pub fn opt_buf(&mut self, value: Option<&[u8]>) {
        match value {
            Some(value) => {
                self.simple_bool(true);
                self.buf(value);
            }
            None => self.simple_bool(false)
        }
    }

    /// Appends a length-delimited UTF-8 string.
    pub fn str(&mut self, value: &str) {
        self.buf(value.as_bytes())
    }

    pub fn opt_str(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                self.simple_bool(true);
                self.str(value);
            }
            None => self.simple_bool(false)
        }
    }

    /// Returns the finished frame: length prefix plus payload.
    pub fn finish(self) -> Vec<u8> {
        let mut res = Vec::with_capacity(self.data.len() + 4);
        res.extend_from_slice(&(self.data.len() as u32).to_ne_bytes());
        res.extend_from_slice(&self.data);
        res
    }
}


//------------ Frame ---------------------------------------------------------

/// One received frame being decoded.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    pos: usize,
}

impl Frame {
    pub fn new(data: Vec<u8>) -> Self {
        Frame { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns the not yet consumed part of the frame.
    pub fn rest(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn need(&self, len: usize) -> io::Result<()> {
        if self.remaining() < len {
            Err(io::Error::new(
                io::ErrorKind::InvalidData, "truncated frame"
            ))
        }
        else {
            Ok(())
        }
    }

    pub fn take_u8(&mut self) -> io::Result<u8> {
        self.need(1)?;
        let res = self.data[self.pos];
        self.pos += 1;
        Ok(res)
    }

    pub fn take_u32(&mut self) -> io::Result<u32> {
        self.need(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_ne_bytes(bytes))
    }

    pub fn take_u64(&mut self) -> io::Result<u64> {
        self.need(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_ne_bytes(bytes))
    }

    pub fn take_i64(&mut self) -> io::Result<i64> {
        self.take_u64().map(|value| value as i64)
    }

    pub fn take_bool(&mut self) -> io::Result<bool> {
        match self.take_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData, "invalid boolean"
            ))
        }
    }

    /// Takes `len` raw bytes.
    pub fn take_bytes(&mut self, len: usize) -> io::Result<Bytes> {
        self.need(len)?;
        let res = Bytes::copy_from_slice(
            &self.data[self.pos..self.pos + len]
        );
        self.pos += len;
        Ok(res)
    }

    /// Takes a length-delimited byte buffer.
    pub fn take_buf(&mut self) -> io::Result<Bytes> {
        let len = self.take_u32()? as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData, "oversized buffer in frame"
            ))
        }
        self.take_bytes(len)
    }

    pub fn take_opt_buf(&mut self) -> io::Result<Option<Bytes>> {
        if self.take_bool()? {
            self.take_buf().map(Some)
        }
        else {
            Ok(None)
        }
    }

    /// Takes a length-delimited UTF-8 string.
    pub fn take_str(&mut self) -> io::Result<String> {
        let buf = self.take_buf()?;
        String::from_utf8(buf.to_vec()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "invalid string")
        })
    }

    pub fn take_opt_str(&mut self) -> io::Result<Option<String>> {
        if self.take_bool()? {
            self.take_str().map(Some)
        }
        else {
            Ok(None)
        }
    }
}


//------------ Channel -------------------------------------------------------

/// A non-blocking channel to a worker process.
///
/// Reading accumulates bytes until whole frames are available; writing
/// queues frames and drains them whenever the socket accepts more. File
/// descriptors received as ancillary data are collected in arrival order
/// and handed out through [`take_fd`][Self::take_fd].
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
    rd: Vec<u8>,
    wr: VecDeque<PendingWrite>,
    fds: VecDeque<RawFd>,
    eof: bool,
}

#[derive(Debug)]
struct PendingWrite {
    data: Vec<u8>,
    written: usize,
    fd: Option<RawFd>,
}

impl Channel {
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Channel {
            stream,
            rd: Vec::new(),
            wr: VecDeque::new(),
            fds: VecDeque::new(),
            eof: false,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Returns whether there is queued output waiting for the socket.
    pub fn wants_write(&self) -> bool {
        !self.wr.is_empty()
    }

    /// Queues a frame for sending.
    pub fn send(&mut self, buf: IoBuf) {
        self.wr.push_back(PendingWrite {
            data: buf.finish(),
            written: 0,
            fd: None,
        });
    }

    /// Queues a frame that carries a file descriptor.
    ///
    /// The descriptor is attached to the first byte of the frame and the
    /// channel takes ownership: it is closed once sent.
    pub fn send_fd(&mut self, buf: IoBuf, fd: RawFd) {
        self.wr.push_back(PendingWrite {
            data: buf.finish(),
            written: 0,
            fd: Some(fd),
        });
    }

    /// Writes as much queued output as the socket accepts.
    pub fn flush(&mut self) -> io::Result<()> {
        while let Some(front) = self.wr.front_mut() {
            let res = if front.written == 0 {
                if let Some(fd) = front.fd {
                    send_with_fd(&self.stream, &front.data, fd)
                }
                else {
                    write_nonblock(&self.stream, &front.data)
                }
            }
            else {
                write_nonblock(&self.stream, &front.data[front.written..])
            };
            match res {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero, "worker closed socket"
                    ))
                }
                Ok(n) => {
                    if front.written == 0 {
                        if let Some(fd) = front.fd.take() {
                            // Sent together with the first byte; our copy
                            // is no longer needed.
                            unsafe { libc::close(fd); }
                        }
                    }
                    front.written += n;
                    if front.written == front.data.len() {
                        self.wr.pop_front();
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(())
                }
                Err(err) => return Err(err)
            }
        }
        Ok(())
    }

    /// Reads whatever the socket has and returns all completed frames.
    pub fn recv(&mut self) -> io::Result<Vec<Frame>> {
        loop {
            match recv_with_fds(&self.stream, &mut self.fds) {
                Ok(None) => {
                    self.eof = true;
                    break
                }
                Ok(Some(chunk)) => {
                    self.rd.extend_from_slice(&chunk);
                    if chunk.len() < RECV_CHUNK {
                        break
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    break
                }
                Err(err) => return Err(err)
            }
        }
        let mut res = Vec::new();
        loop {
            if self.rd.len() < 4 {
                break
            }
            let mut len = [0u8; 4];
            len.copy_from_slice(&self.rd[..4]);
            let len = u32::from_ne_bytes(len) as usize;
            if len > MAX_FRAME_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData, "oversized frame"
                ))
            }
            if self.rd.len() < len + 4 {
                break
            }
            let rest = self.rd.split_off(len + 4);
            let mut frame = mem::replace(&mut self.rd, rest);
            frame.drain(..4);
            res.push(Frame::new(frame));
        }
        Ok(res)
    }

    /// Pops the next received file descriptor.
    pub fn take_fd(&mut self) -> Option<RawFd> {
        self.fds.pop_front()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        for fd in self.fds.drain(..) {
            unsafe { libc::close(fd); }
        }
        for pending in self.wr.drain(..) {
            if let Some(fd) = pending.fd {
                unsafe { libc::close(fd); }
            }
        }
    }
}


//------------ Blocking helpers for workers ----------------------------------

/// Reads one frame, blocking. Returns `None` on clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut len = [0u8; 4];
    let mut got = 0;
    while got < 4 {
        match reader.read(&mut len[got..])? {
            0 if got == 0 => return Ok(None),
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof, "truncated frame header"
                ))
            }
            n => got += n
        }
    }
    let len = u32::from_ne_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData, "oversized frame"
        ))
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(Some(Frame::new(data)))
}

/// Writes one frame, blocking.
pub fn write_frame<W: Write>(writer: &mut W, buf: IoBuf) -> io::Result<()> {
    writer.write_all(&buf.finish())?;
    writer.flush()
}

//------------ WorkerChannel -------------------------------------------------

/// The blocking channel a worker process serves requests on.
///
/// Reading goes through `recvmsg` so that descriptors attached by the
/// peer are collected instead of silently discarded; a plain `read`
/// would lose them.
#[derive(Debug)]
pub struct WorkerChannel {
    stream: UnixStream,
    rd: Vec<u8>,
    fds: VecDeque<RawFd>,
}

impl WorkerChannel {
    pub fn new(stream: UnixStream) -> Self {
        WorkerChannel {
            stream,
            rd: Vec::new(),
            fds: VecDeque::new(),
        }
    }

    /// Reads the next frame, blocking. `None` on clean end of stream.
    pub fn read_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if self.rd.len() >= 4 {
                let mut len = [0u8; 4];
                len.copy_from_slice(&self.rd[..4]);
                let len = u32::from_ne_bytes(len) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData, "oversized frame"
                    ))
                }
                if self.rd.len() >= len + 4 {
                    let rest = self.rd.split_off(len + 4);
                    let mut frame = mem::replace(&mut self.rd, rest);
                    frame.drain(..4);
                    return Ok(Some(Frame::new(frame)))
                }
            }
            match recv_with_fds(&self.stream, &mut self.fds)? {
                None => {
                    if self.rd.is_empty() {
                        return Ok(None)
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof, "truncated frame"
                    ))
                }
                Some(chunk) => self.rd.extend_from_slice(&chunk),
            }
        }
    }

    /// Pops the next received file descriptor.
    pub fn take_fd(&mut self) -> Option<RawFd> {
        self.fds.pop_front()
    }

    /// Writes one frame, blocking.
    pub fn write_frame(&mut self, buf: IoBuf) -> io::Result<()> {
        let data = buf.finish();
        let mut written = 0;
        while written < data.len() {
            match write_nonblock_loop(&self.stream, &data[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero, "peer closed socket"
                    ))
                }
                Ok(n) => written += n,
                Err(err) => return Err(err)
            }
        }
        Ok(())
    }

    /// Writes one frame carrying a descriptor, blocking.
    ///
    /// The descriptor stays owned by the caller.
    pub fn write_frame_fd(
        &mut self, buf: IoBuf, fd: RawFd
    ) -> io::Result<()> {
        let data = buf.finish();
        let mut written = send_with_fd(&self.stream, &data, fd)?;
        while written < data.len() {
            match write_nonblock_loop(&self.stream, &data[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero, "peer closed socket"
                    ))
                }
                Ok(n) => written += n,
                Err(err) => return Err(err)
            }
        }
        Ok(())
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        for fd in self.fds.drain(..) {
            unsafe { libc::close(fd); }
        }
    }
}

/// Like `send` but retries on EINTR; the socket is blocking here.
fn write_nonblock_loop(
    stream: &UnixStream, data: &[u8]
) -> io::Result<usize> {
    loop {
        match write_nonblock(stream, data) {
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => { }
            other => return other
        }
    }
}


//------------ Descriptor passing --------------------------------------------

const RECV_CHUNK: usize = 64 * 1024;

fn write_nonblock(stream: &UnixStream, data: &[u8]) -> io::Result<usize> {
    let res = unsafe {
        libc::send(
            stream.as_raw_fd(),
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    }
    else {
        Ok(res as usize)
    }
}

/// Sends `data` with `fd` attached as SCM_RIGHTS ancillary data.
///
/// Returns the number of payload bytes written. The descriptor rides on
/// the first byte, so a short write still delivers it.
fn send_with_fd(
    stream: &UnixStream, data: &[u8], fd: RawFd
) -> io::Result<usize> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };
        let mut cmsg_buf = [0u8; 64];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE(
            mem::size_of::<RawFd>() as u32
        ) as usize;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(
            mem::size_of::<RawFd>() as u32
        ) as usize;
        std::ptr::copy_nonoverlapping(
            &fd as *const RawFd as *const u8,
            libc::CMSG_DATA(cmsg),
            mem::size_of::<RawFd>(),
        );

        let res = libc::sendmsg(
            stream.as_raw_fd(), &msg, libc::MSG_NOSIGNAL
        );
        if res < 0 {
            Err(io::Error::last_os_error())
        }
        else {
            Ok(res as usize)
        }
    }
}

/// Receives a chunk of bytes, collecting any ancillary descriptors.
///
/// Returns `None` on end of stream.
fn recv_with_fds(
    stream: &UnixStream, fds: &mut VecDeque<RawFd>
) -> io::Result<Option<Vec<u8>>> {
    unsafe {
        let mut buf = vec![0u8; RECV_CHUNK];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut cmsg_buf = [0u8; 256];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len();

        let res = libc::recvmsg(
            stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC
        );
        if res < 0 {
            return Err(io::Error::last_os_error())
        }
        if res == 0 {
            return Ok(None)
        }

        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == libc::SCM_RIGHTS
            {
                let data_len = (*cmsg).cmsg_len
                    - libc::CMSG_LEN(0) as usize;
                let count = data_len / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    fds.push_back(*data.add(i));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        buf.truncate(res as usize);
        Ok(Some(buf))
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut buf = IoBuf::new();
        buf.simple_u8(7);
        buf.simple_u32(0xDEAD_BEEF);
        buf.simple_u64(u64::MAX - 1);
        buf.simple_i64(-42);
        buf.simple_bool(true);
        buf.buf(b"abc");
        buf.opt_buf(None);
        buf.opt_buf(Some(b"xy"));
        buf.str("hello");
        buf.opt_str(None);
        buf.opt_str(Some("world"));

        let frame = buf.finish();
        let mut len = [0u8; 4];
        len.copy_from_slice(&frame[..4]);
        assert_eq!(
            u32::from_ne_bytes(len) as usize, frame.len() - 4
        );

        let mut frame = Frame::new(frame[4..].to_vec());
        assert_eq!(frame.take_u8().unwrap(), 7);
        assert_eq!(frame.take_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(frame.take_u64().unwrap(), u64::MAX - 1);
        assert_eq!(frame.take_i64().unwrap(), -42);
        assert!(frame.take_bool().unwrap());
        assert_eq!(frame.take_buf().unwrap().as_ref(), b"abc");
        assert_eq!(frame.take_opt_buf().unwrap(), None);
        assert_eq!(
            frame.take_opt_buf().unwrap().unwrap().as_ref(), b"xy"
        );
        assert_eq!(frame.take_str().unwrap(), "hello");
        assert_eq!(frame.take_opt_str().unwrap(), None);
        assert_eq!(frame.take_opt_str().unwrap().unwrap(), "world");
        assert_eq!(frame.remaining(), 0);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut frame = Frame::new(vec![1, 2]);
        assert!(frame.take_u32().is_err());
    }

    #[test]
    fn blocking_round_trip() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let mut buf = IoBuf::new();
        buf.str("ping");
        write_frame(&mut a, buf).unwrap();
        let mut buf = IoBuf::new();
        buf.str("pong");
        write_frame(&mut a, buf).unwrap();
        drop(a);

        let mut frame = read_frame(&mut b).unwrap().unwrap();
        assert_eq!(frame.take_str().unwrap(), "ping");
        let mut frame = read_frame(&mut b).unwrap().unwrap();
        assert_eq!(frame.take_str().unwrap(), "pong");
        assert!(read_frame(&mut b).unwrap().is_none());
    }

    #[test]
    fn channel_round_trip() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut chan = Channel::new(a).unwrap();

        let mut buf = IoBuf::new();
        buf.simple_u32(12);
        buf.str("request");
        chan.send(buf);
        assert!(chan.wants_write());
        chan.flush().unwrap();
        assert!(!chan.wants_write());

        let mut frame = read_frame(&mut b).unwrap().unwrap();
        assert_eq!(frame.take_u32().unwrap(), 12);
        assert_eq!(frame.take_str().unwrap(), "request");

        let mut buf = IoBuf::new();
        buf.str("response");
        write_frame(&mut b, buf).unwrap();

        // Wait for the bytes to arrive, then drain frames.
        let mut frames = Vec::new();
        for _ in 0..100 {
            frames = chan.recv().unwrap();
            if !frames.is_empty() {
                break
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].remaining(), 4 + 8);
    }

    #[test]
    fn fd_passing() {
        use std::io::Seek;

        let (a, b) = UnixStream::pair().unwrap();
        let mut chan = Channel::new(a).unwrap();

        // Pass a file descriptor pointing at a temp file with content.
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"fd payload").unwrap();
        file.rewind().unwrap();
        let fd = unsafe {
            libc::dup(std::os::unix::io::AsRawFd::as_raw_fd(&file))
        };

        let mut buf = IoBuf::new();
        buf.str("with fd");
        chan.send_fd(buf, fd);
        chan.flush().unwrap();

        let mut worker = WorkerChannel::new(b);
        let mut frame = worker.read_frame().unwrap().unwrap();
        assert_eq!(frame.take_str().unwrap(), "with fd");

        let received = worker.take_fd().unwrap();
        let mut received = unsafe {
            use std::os::unix::io::FromRawFd;
            std::fs::File::from_raw_fd(received)
        };
        let mut content = String::new();
        received.read_to_string(&mut content).unwrap();
        assert_eq!(content, "fd payload");
    }
}

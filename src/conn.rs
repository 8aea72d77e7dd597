//! Framed, message-oriented transport over a Unix stream socket.
//!
//! Each message is a 12-byte header `(u32 dest_id, u32 opcode, u32 length)`
//! in little-endian followed by `length` bytes of encoded record. File
//! descriptors attached while encoding ride the message's first byte as
//! `SCM_RIGHTS` ancillary data and are referenced from the payload by
//! index, in strict order of appearance.
//!
//! A [`Connection`] splits into a [`SendHalf`] and a [`RecvHalf`] so a
//! dispatcher can parse requests straight out of the receive buffer while
//! marshalling replies into the send queue.

use byteorder::{ByteOrder, LE};
use log::trace;
use nix::cmsg_space;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Hard cap on a single message payload.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// File descriptors one message may carry.
pub const MAX_FDS_PER_MSG: usize = 28;

/// Bytes of `(dest_id, opcode, length)` in front of every payload.
pub const HEADER_SIZE: usize = 12;

const READ_CHUNK: usize = 4096;

/// Why the connection can no longer make progress.
#[derive(Debug)]
pub enum ConnError {
    /// Peer closed the socket; tear the connection down.
    Closed,
    /// Malformed traffic from the peer; close with a diagnostic.
    Protocol(String),
    Io(io::Error),
}

impl ConnError {
    /// True for would-block conditions worth retrying on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnError::Closed => write!(f, "connection closed by peer"),
            ConnError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            ConnError::Io(e) => write!(f, "connection i/o error: {e}"),
        }
    }
}

impl Error for ConnError {}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> ConnError {
        ConnError::Io(e)
    }
}

impl From<nix::errno::Errno> for ConnError {
    fn from(e: nix::errno::Errno) -> ConnError {
        use nix::errno::Errno;
        match e {
            Errno::EPIPE | Errno::ECONNRESET => ConnError::Closed,
            other => ConnError::Io(io::Error::from_raw_os_error(other as i32)),
        }
    }
}

struct OutFrame {
    header: [u8; HEADER_SIZE],
    payload: Vec<u8>,
    sent: usize,
    fds: Vec<OwnedFd>,
}

impl OutFrame {
    fn len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameDesc {
    dest_id: u32,
    opcode: u32,
    start: usize,
    end: usize,
}

/// One received message; `payload` aliases the connection's read buffer
/// and stays valid until the next `poll`.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'f> {
    pub dest_id: u32,
    pub opcode: u32,
    pub payload: &'f [u8],
}

/// Received file descriptors in arrival order.
///
/// A decoder claims them with [`FdQueue::take`]; indices must be consumed
/// in strict appearance order within one message.
#[derive(Debug, Default)]
pub struct FdQueue {
    fds: VecDeque<OwnedFd>,
    taken: usize,
}

impl FdQueue {
    /// Reset the per-message index counter before dispatching a message.
    pub fn start_message(&mut self) {
        self.taken = 0;
    }

    pub fn take(&mut self, index: u32) -> Result<OwnedFd, ConnError> {
        if index as usize != self.taken {
            return Err(ConnError::Protocol(format!(
                "fd index {index} out of order, expected {}",
                self.taken
            )));
        }
        let fd = self.fds.pop_front().ok_or_else(|| {
            ConnError::Protocol(format!("fd index {index} has no ancillary descriptor"))
        })?;
        self.taken += 1;
        Ok(fd)
    }

    pub fn pending(&self) -> usize {
        self.fds.len()
    }
}

#[derive(Default)]
struct TxState {
    scratch: Vec<u8>,
    attach: Vec<OwnedFd>,
    queue: VecDeque<OutFrame>,
}

struct RxState {
    buf: Vec<u8>,
    consumed: usize,
    frames: Vec<FrameDesc>,
    fds: FdQueue,
    cmsg: Vec<u8>,
}

/// A bidirectional framed connection.
pub struct Connection {
    stream: UnixStream,
    tx: TxState,
    rx: RxState,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Connection {
        Connection {
            stream,
            tx: TxState::default(),
            rx: RxState {
                buf: Vec::new(),
                consumed: 0,
                frames: Vec::new(),
                fds: FdQueue::default(),
                cmsg: cmsg_space!([RawFd; MAX_FDS_PER_MSG]),
            },
        }
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    pub fn split(&mut self) -> (SendHalf<'_>, RecvHalf<'_>) {
        let Connection { stream, tx, rx } = self;
        (SendHalf { stream, tx }, RecvHalf { stream, rx })
    }
}

/// Write side: scratch buffer, FD attach list and the outbound queue.
pub struct SendHalf<'a> {
    stream: &'a UnixStream,
    tx: &'a mut TxState,
}

impl SendHalf<'_> {
    /// Hand out the cleared scratch buffer for marshalling one message.
    /// Commit it with [`SendHalf::end_write`].
    pub fn begin_write(&mut self) -> Vec<u8> {
        let mut buf = mem::take(&mut self.tx.scratch);
        buf.clear();
        self.tx.attach.clear();
        buf
    }

    /// Register an FD for the in-progress message; returns the index the
    /// payload encodes in its place. The connection keeps its own dup
    /// until the message is sent.
    pub fn attach_fd(&mut self, fd: BorrowedFd<'_>) -> io::Result<u32> {
        if self.tx.attach.len() >= MAX_FDS_PER_MSG {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "too many fds attached to one message",
            ));
        }
        let own = fd.try_clone_to_owned()?;
        self.tx.attach.push(own);
        Ok((self.tx.attach.len() - 1) as u32)
    }

    /// Frame the scratch contents and queue the message for flushing.
    pub fn end_write(&mut self, dest_id: u32, opcode: u32, payload: Vec<u8>) {
        debug_assert!(payload.len() <= MAX_FRAME_SIZE as usize);
        let mut header = [0u8; HEADER_SIZE];
        LE::write_u32(&mut header[0..4], dest_id);
        LE::write_u32(&mut header[4..8], opcode);
        LE::write_u32(&mut header[8..12], payload.len() as u32);
        trace!(
            target: "conn",
            "queue message dest {} opcode {} len {} fds {}",
            dest_id,
            opcode,
            payload.len(),
            self.tx.attach.len()
        );
        self.tx.queue.push_back(OutFrame {
            header,
            payload,
            sent: 0,
            fds: mem::take(&mut self.tx.attach),
        });
    }

    /// Send queued messages. Short writes leave a residual for the next
    /// call; a would-block condition surfaces as a transient error.
    pub fn flush(&mut self) -> Result<(), ConnError> {
        while !self.tx.queue.is_empty() {
            if self.send_front()? == 0 {
                break;
            }
        }
        Ok(())
    }

    // One sendmsg: the front frame's remainder, its FDs on the first
    // byte, plus any following FD-less frames coalesced behind it.
    fn send_front(&mut self) -> Result<usize, ConnError> {
        let mut iov: Vec<IoSlice> = Vec::new();
        let mut raw: Vec<RawFd> = Vec::new();
        for (i, frame) in self.tx.queue.iter().enumerate() {
            if i == 0 {
                if frame.sent < HEADER_SIZE {
                    iov.push(IoSlice::new(&frame.header[frame.sent..]));
                    iov.push(IoSlice::new(&frame.payload));
                } else {
                    iov.push(IoSlice::new(&frame.payload[frame.sent - HEADER_SIZE..]));
                }
                if frame.sent == 0 {
                    raw.extend(frame.fds.iter().map(|fd| fd.as_raw_fd()));
                }
            } else {
                if !frame.fds.is_empty() {
                    break;
                }
                iov.push(IoSlice::new(&frame.header));
                iov.push(IoSlice::new(&frame.payload));
            }
        }
        let scm = [ControlMessage::ScmRights(&raw)];
        let cmsgs = if raw.is_empty() { &scm[..0] } else { &scm[..] };
        let n = sendmsg::<UnixAddr>(
            self.stream.as_raw_fd(),
            &iov,
            cmsgs,
            MsgFlags::MSG_NOSIGNAL,
            None,
        )?;
        let mut left = n;
        while left > 0 {
            let front = self.tx.queue.front_mut().expect("bytes map to a frame");
            let remaining = front.len() - front.sent;
            if left >= remaining {
                left -= remaining;
                let done = self.tx.queue.pop_front().expect("frame present");
                // recycle the payload allocation for the next begin_write
                if self.tx.scratch.capacity() < done.payload.capacity() {
                    self.tx.scratch = done.payload;
                }
            } else {
                front.sent += left;
                // ancillary data went out with the first chunk
                front.fds.clear();
                left = 0;
            }
        }
        Ok(n)
    }

    pub fn has_pending(&self) -> bool {
        !self.tx.queue.is_empty()
    }
}

/// Read side: receive buffer, parsed frame ring and the FD queue.
pub struct RecvHalf<'a> {
    stream: &'a UnixStream,
    rx: &'a mut RxState,
}

impl RecvHalf<'_> {
    /// Release the previous batch, read once from the socket and parse
    /// complete frames. Returns how many frames are ready; zero means a
    /// partial frame is still in flight.
    pub fn poll(&mut self) -> Result<usize, ConnError> {
        self.rx.frames.clear();
        if self.rx.consumed > 0 {
            self.rx.buf.drain(..self.rx.consumed);
            self.rx.consumed = 0;
        }
        self.fill()?;
        self.parse()?;
        Ok(self.rx.frames.len())
    }

    fn fill(&mut self) -> Result<(), ConnError> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut got: Vec<RawFd> = Vec::new();
        let n = {
            let mut iov = [IoSliceMut::new(&mut chunk)];
            let msg = recvmsg::<UnixAddr>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut self.rx.cmsg),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )?;
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    got.extend(fds);
                }
            }
            msg.bytes
        };
        for fd in got {
            // Safety: the kernel just installed this descriptor for us;
            // nothing else owns it.
            self.rx.fds.fds.push_back(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        if n == 0 {
            return Err(ConnError::Closed);
        }
        self.rx.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn parse(&mut self) -> Result<(), ConnError> {
        let mut pos = 0usize;
        loop {
            let avail = self.rx.buf.len() - pos;
            if avail < HEADER_SIZE {
                break;
            }
            let dest_id = LE::read_u32(&self.rx.buf[pos..]);
            let opcode = LE::read_u32(&self.rx.buf[pos + 4..]);
            let length = LE::read_u32(&self.rx.buf[pos + 8..]);
            if length > MAX_FRAME_SIZE {
                return Err(ConnError::Protocol(format!(
                    "{length} byte message exceeds the {MAX_FRAME_SIZE} byte cap"
                )));
            }
            if avail - HEADER_SIZE < length as usize {
                break;
            }
            let start = pos + HEADER_SIZE;
            let end = start + length as usize;
            self.rx.frames.push(FrameDesc {
                dest_id,
                opcode,
                start,
                end,
            });
            pos = end;
        }
        self.rx.consumed = pos;
        Ok(())
    }

    /// The parsed frames of the last `poll` plus the FD queue they may
    /// reference.
    pub fn inbound(&mut self) -> (Frames<'_>, &mut FdQueue) {
        let RxState {
            buf, frames, fds, ..
        } = &mut *self.rx;
        (
            Frames {
                buf,
                frames: frames.iter(),
            },
            fds,
        )
    }
}

/// Iterator over the frames of one `poll` batch.
pub struct Frames<'f> {
    buf: &'f [u8],
    frames: std::slice::Iter<'f, FrameDesc>,
}

impl<'f> Iterator for Frames<'f> {
    type Item = Frame<'f>;

    fn next(&mut self) -> Option<Frame<'f>> {
        let desc = self.frames.next()?;
        Some(Frame {
            dest_id: desc.dest_id,
            opcode: desc.opcode,
            payload: &self.buf[desc.start..desc.end],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
    use std::ffi::CString;
    use std::fs::File;
    use std::io::Write;
    use std::os::unix::fs::FileExt;
    use std::os::unix::io::AsFd;

    fn pair() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        (Connection::new(a), Connection::new(b))
    }

    fn memfd_with(content: &[u8]) -> OwnedFd {
        let name = CString::new("conn-test").unwrap();
        let fd = memfd_create(name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC).unwrap();
        let mut file = File::from(fd);
        file.write_all(content).unwrap();
        file.into()
    }

    fn poll_one(conn: &mut Connection) -> (u32, u32, Vec<u8>) {
        let (_, mut rx) = conn.split();
        loop {
            if rx.poll().unwrap() > 0 {
                let (mut frames, _) = rx.inbound();
                let f = frames.next().unwrap();
                return (f.dest_id, f.opcode, f.payload.to_vec());
            }
        }
    }

    #[test]
    fn frame_roundtrip() {
        let (mut a, mut b) = pair();
        {
            let (mut tx, _) = a.split();
            let mut buf = tx.begin_write();
            buf.extend_from_slice(b"payload");
            tx.end_write(3, 9, buf);
            tx.flush().unwrap();
        }
        let (dest, opcode, payload) = poll_one(&mut b);
        assert_eq!((dest, opcode), (3, 9));
        assert_eq!(&payload, b"payload");
    }

    #[test]
    fn coalesced_commits() {
        let (mut a, mut b) = pair();
        {
            let (mut tx, _) = a.split();
            for i in 0..3u32 {
                let mut buf = tx.begin_write();
                buf.extend_from_slice(&i.to_le_bytes());
                tx.end_write(0, i, buf);
            }
            tx.flush().unwrap();
            assert!(!tx.has_pending());
        }
        let (_, mut rx) = b.split();
        let mut seen = Vec::new();
        while seen.len() < 3 {
            rx.poll().unwrap();
            let (frames, _) = rx.inbound();
            for f in frames {
                seen.push(f.opcode);
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn fd_passing_in_order() {
        let (mut a, mut b) = pair();
        let one = memfd_with(b"first");
        let two = memfd_with(b"second");
        {
            let (mut tx, _) = a.split();
            let buf = tx.begin_write();
            let i0 = tx.attach_fd(one.as_fd()).unwrap();
            let i1 = tx.attach_fd(two.as_fd()).unwrap();
            assert_eq!((i0, i1), (0, 1));
            tx.end_write(0, 0, buf);
            tx.flush().unwrap();
        }
        let (_, mut rx) = b.split();
        while rx.poll().unwrap() == 0 {}
        let (_, fds) = rx.inbound();
        fds.start_message();
        let first = File::from(fds.take(0).unwrap());
        let second = File::from(fds.take(1).unwrap());
        let mut buf = [0u8; 5];
        first.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"first");
        let mut buf = [0u8; 6];
        second.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"second");
        assert_eq!(fds.pending(), 0);
    }

    #[test]
    fn fd_out_of_order_rejected() {
        let (mut a, mut b) = pair();
        let one = memfd_with(b"x");
        let two = memfd_with(b"y");
        {
            let (mut tx, _) = a.split();
            let buf = tx.begin_write();
            tx.attach_fd(one.as_fd()).unwrap();
            tx.attach_fd(two.as_fd()).unwrap();
            tx.end_write(0, 0, buf);
            tx.flush().unwrap();
        }
        let (_, mut rx) = b.split();
        while rx.poll().unwrap() == 0 {}
        let (_, fds) = rx.inbound();
        fds.start_message();
        assert!(matches!(fds.take(1), Err(ConnError::Protocol(_))));
    }

    #[test]
    fn oversize_frame_rejected() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(a);
        let mut header = [0u8; HEADER_SIZE];
        LE::write_u32(&mut header[8..12], MAX_FRAME_SIZE + 1);
        b.write_all(&header).unwrap();
        let (_, mut rx) = conn.split();
        assert!(matches!(rx.poll(), Err(ConnError::Protocol(_))));
    }

    #[test]
    fn peer_close_is_terminal() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(a);
        drop(b);
        let (_, mut rx) = conn.split();
        assert!(matches!(rx.poll(), Err(ConnError::Closed)));
    }
}

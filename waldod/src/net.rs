// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Full-transfer socket primitives and the length-prefixed framing.
//!
//! These sit on raw `libc` calls rather than `std::io` because the worker
//! needs two behaviors std does not promise: `EINTR`/`EAGAIN` retries that
//! never surface, and `MSG_NOSIGNAL` on every send so a client that hung up
//! produces an error return instead of `SIGPIPE`.

use std::fmt;
use std::io;
use std::os::fd::RawFd;

use waldo_proto::MAX_FRAME_SIZE;

/// Connection-fatal transfer failures. Everything here ends the client
/// session; per-request errors travel as error replies instead.
#[derive(Debug)]
pub enum FrameError {
    /// The peer closed the connection (a zero-byte read).
    Closed,
    /// A frame announced a zero-length payload, which no message produces.
    Empty,
    /// A frame announced more than [`MAX_FRAME_SIZE`] bytes.
    TooLarge(u64),
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed by peer"),
            Self::Empty => write!(f, "zero-length frame"),
            Self::TooLarge(n) => {
                write!(f, "frame of {n} bytes exceeds the {MAX_FRAME_SIZE} cap")
            }
            Self::Io(err) => write!(f, "socket error: {err}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

fn retryable(err: &io::Error) -> bool {
    let errno = err.raw_os_error();
    errno == Some(libc::EINTR)
        || errno == Some(libc::EAGAIN)
        || errno == Some(libc::EWOULDBLOCK)
}

/// Receives exactly `buf.len()` bytes from a socket.
pub fn recv_all(fd: RawFd, buf: &mut [u8]) -> Result<(), FrameError> {
    let mut off = 0;
    while off < buf.len() {
        let n = unsafe {
            libc::recv(
                fd,
                buf[off..].as_mut_ptr().cast(),
                buf.len() - off,
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if retryable(&err) {
                continue;
            }
            return Err(err.into());
        }
        if n == 0 {
            return Err(FrameError::Closed);
        }
        off += n as usize;
    }
    Ok(())
}

/// Sends all of `buf` on a socket. Zero-byte sends are retried; a broken
/// connection comes back as an error thanks to `MSG_NOSIGNAL`.
pub fn send_all(fd: RawFd, buf: &[u8]) -> Result<(), FrameError> {
    let mut off = 0;
    while off < buf.len() {
        let n = unsafe {
            libc::send(
                fd,
                buf[off..].as_ptr().cast(),
                buf.len() - off,
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if retryable(&err) {
                continue;
            }
            return Err(err.into());
        }
        off += n as usize;
    }
    Ok(())
}

/// Receives one frame and returns its payload.
pub fn recv_frame(fd: RawFd) -> Result<Vec<u8>, FrameError> {
    let mut len_bytes = [0u8; 8];
    recv_all(fd, &mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes);
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_SIZE as u64 {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    recv_all(fd, &mut payload)?;
    Ok(payload)
}

/// Sends `payload` as one frame. Length prefix and payload go out in a
/// single buffer so a slow peer never observes a torn header.
pub fn send_frame(fd: RawFd, payload: &[u8]) -> Result<(), FrameError> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(payload);
    send_all(fd, &frame)
}

/// Marks an fd close-on-exec so spawned children never inherit it.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// One `read(2)`, retried on `EINTR`. For the PTY master, which is not a
/// socket.
pub fn read_some(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if retryable(&err) {
                continue;
            }
            return Err(err);
        }
        return Ok(n as usize);
    }
}

/// One `recv(2)`, retried on `EINTR`, for the socket side of the PTY loop.
pub fn recv_some(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if retryable(&err) {
                continue;
            }
            return Err(err);
        }
        return Ok(n as usize);
    }
}

/// Writes all of `buf` to a non-socket fd (the PTY master).
pub fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut off = 0;
    while off < buf.len() {
        let n = unsafe {
            libc::write(fd, buf[off..].as_ptr().cast(), buf.len() - off)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if retryable(&err) {
                continue;
            }
            return Err(err);
        }
        off += n as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn frame_roundtrip() {
        let (a, b) = UnixStream::pair().unwrap();
        send_frame(a.as_raw_fd(), b"hello frames").unwrap();
        let payload = recv_frame(b.as_raw_fd()).unwrap();
        assert_eq!(payload, b"hello frames");
    }

    #[test]
    fn oversized_frame_is_refused() {
        let (a, b) = UnixStream::pair().unwrap();
        let huge = (MAX_FRAME_SIZE as u64 + 1).to_le_bytes();
        send_all(a.as_raw_fd(), &huge).unwrap();
        match recv_frame(b.as_raw_fd()) {
            Err(FrameError::TooLarge(n)) => {
                assert_eq!(n, MAX_FRAME_SIZE as u64 + 1)
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[test]
    fn zero_length_frame_is_refused() {
        let (a, b) = UnixStream::pair().unwrap();
        send_all(a.as_raw_fd(), &0u64.to_le_bytes()).unwrap();
        assert!(matches!(
            recv_frame(b.as_raw_fd()),
            Err(FrameError::Empty)
        ));
    }

    #[test]
    fn peer_close_is_distinguishable() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(matches!(
            recv_frame(b.as_raw_fd()),
            Err(FrameError::Closed)
        ));
    }

    #[test]
    fn send_to_closed_peer_errors_instead_of_killing_us() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        // The first send may land in the buffer; keep pushing until the
        // RST comes back. Without MSG_NOSIGNAL this would raise SIGPIPE.
        let mut saw_error = false;
        for _ in 0..16 {
            if send_frame(a.as_raw_fd(), &[0u8; 1024]).is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
    }
}

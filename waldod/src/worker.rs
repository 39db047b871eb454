// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-connection service: handshake, then the request loop.
//!
//! One [`Worker`] value carries all per-connection state. The loop is
//! strictly sequential: read a frame, dispatch, flush the reply, consume
//! the pending-PTY latch if the reply armed it, and only then read again.
//! There is no pipelining to get wrong.
//!
//! In the usual deployment this runs in a re-exec'd child process, so a
//! routine that faults (peek of a wild address, a call gone wrong) takes
//! out this connection and nothing else.

use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::{Context, Result};
use log::debug;
use nix::sys::utsname::uname;

use waldo_proto::messages::Handshake;
use waldo_proto::{Arch, Envelope, Wire, MESSAGE_MAGIC, SERVER_VERSION};

use crate::dispatch::dispatch;
use crate::net::{self, FrameError};
use crate::pty::{self, PtyHandoff};

/// Per-connection state threaded through the dispatcher.
#[derive(Default)]
pub struct Worker {
    /// Armed by a successful foreground exec; consumed by the loop before
    /// the next request is read.
    pub pending_pty: Option<PtyHandoff>,
    /// Set by the close_client routine; the loop exits after the reply.
    pub close_requested: bool,
}

fn send_handshake(fd: i32) -> Result<()> {
    let uts = uname().context("uname")?;
    let handshake = Handshake {
        magic: MESSAGE_MAGIC,
        arch: if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else {
            Arch::Unknown
        },
        sysname: uts.sysname().to_string_lossy().into_owned(),
        machine: uts.machine().to_string_lossy().into_owned(),
        platform: std::env::consts::OS.to_owned(),
        server_version: SERVER_VERSION,
        client_id: std::process::id(),
    };
    net::send_frame(fd, &handshake.to_bytes())?;
    Ok(())
}

/// Serves one client until it disconnects, asks to close, or breaks the
/// protocol. A clean disconnect is `Ok`; framing violations are `Err` and
/// the caller just logs them. Either way the socket drops here.
pub fn handle_client(sock: OwnedFd) -> Result<()> {
    let fd = sock.as_raw_fd();
    debug!("enter, fd: {fd}");

    // Children spawned by exec must not inherit the client socket.
    net::set_cloexec(fd).context("cloexec")?;

    send_handshake(fd).context("handshake")?;

    let mut worker = Worker::default();
    loop {
        let payload = match net::recv_frame(fd) {
            Ok(payload) => payload,
            Err(FrameError::Closed) => {
                debug!("client fd {fd} disconnected");
                return Ok(());
            }
            Err(err) => return Err(err).context("receive request"),
        };
        // A bad magic number means we are not talking to a client at all;
        // hang up rather than guess.
        let request = Envelope::parse(&payload).context("parse request")?;
        debug!("client fd: {fd}, msg_id: {}", request.msg_id);

        let reply = dispatch(&mut worker, &request);
        net::send_frame(fd, &reply.to_bytes()).context("send reply")?;

        // A foreground exec armed the latch during dispatch; the client is
        // now waiting in terminal mode and the next bytes must be PTY
        // frames, not a reply.
        if let Some(handoff) = worker.pending_pty.take() {
            pty::stream(fd, handoff).context("pty stream")?;
        }

        if worker.close_requested {
            debug!("client fd {fd} requested close");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use waldo_proto::messages::*;
    use waldo_proto::{MsgId, MAX_REQ_MSG_ID, REPLY_ERROR_MSG_ID};

    /// Client half of a served connection; the worker runs on a thread.
    struct Client {
        stream: UnixStream,
    }

    impl Client {
        fn start() -> Self {
            let (ours, theirs) = UnixStream::pair().unwrap();
            std::thread::spawn(move || {
                let _ = handle_client(OwnedFd::from(theirs));
            });
            let mut client = Client { stream: ours };
            let handshake =
                Handshake::from_bytes(&client.recv_frame()).unwrap();
            assert_eq!(handshake.magic, MESSAGE_MAGIC);
            assert_eq!(handshake.server_version, SERVER_VERSION);
            assert_eq!(handshake.client_id, std::process::id());
            client
        }

        fn send_frame(&mut self, payload: &[u8]) {
            let mut frame = (payload.len() as u64).to_le_bytes().to_vec();
            frame.extend_from_slice(payload);
            self.stream.write_all(&frame).unwrap();
        }

        fn recv_frame(&mut self) -> Vec<u8> {
            let mut len_bytes = [0u8; 8];
            self.stream.read_exact(&mut len_bytes).unwrap();
            let mut payload = vec![0u8; u64::from_le_bytes(len_bytes) as usize];
            self.stream.read_exact(&mut payload).unwrap();
            payload
        }

        fn request<T: Wire>(&mut self, id: MsgId, body: &T) -> Envelope {
            self.send_frame(&Envelope::new(id as u32, body.to_bytes()).to_bytes());
            Envelope::parse(&self.recv_frame()).unwrap()
        }

        fn expect_ok<R: Wire>(&mut self, id: MsgId, body: &impl Wire) -> R {
            let reply = self.request(id, body);
            assert_eq!(reply.msg_id, id.reply_id(), "unexpected reply id");
            R::from_bytes(&reply.body).unwrap()
        }

        fn expect_error(&mut self, id: MsgId, body: &impl Wire) -> ReplyError {
            let reply = self.request(id, body);
            assert_eq!(reply.msg_id, REPLY_ERROR_MSG_ID);
            ReplyError::from_bytes(&reply.body).unwrap()
        }

        fn at_eof(&mut self) -> bool {
            matches!(self.stream.read(&mut [0u8; 1]), Ok(0))
        }
    }

    fn scalar(ret: CallReturn) -> u64 {
        match ret {
            CallReturn::Value(v) => v,
            CallReturn::ArmRegisters(regs) => regs.x[0],
        }
    }

    #[test]
    fn handshake_then_close() {
        let mut client = Client::start();
        let _: ReplyCloseClient =
            client.expect_ok(MsgId::CloseClient, &RequestCloseClient);
        assert!(client.at_eof());
    }

    #[test]
    fn close_reply_id_is_shifted_request_id() {
        let mut client = Client::start();
        let reply = client.request(MsgId::CloseClient, &RequestCloseClient);
        assert_eq!(reply.msg_id, MsgId::CloseClient as u32 + MAX_REQ_MSG_ID);
        assert!(reply.body.is_empty());
    }

    #[test]
    fn dlopen_dlsym_call_strlen() {
        let mut client = Client::start();

        // Empty filename: handle onto ourselves.
        let opened: ReplyDlopen = client.expect_ok(
            MsgId::Dlopen,
            &RequestDlopen {
                filename: String::new(),
                mode: libc::RTLD_NOW as u32,
            },
        );
        assert_ne!(opened.handle, 0);

        let sym: ReplyDlsym = client.expect_ok(
            MsgId::Dlsym,
            &RequestDlsym {
                handle: opened.handle,
                symbol_name: "strlen".into(),
            },
        );
        assert_ne!(sym.ptr, 0);

        let called: ReplyCall = client.expect_ok(
            MsgId::Call,
            &RequestCall {
                address: sym.ptr,
                va_list_index: 1,
                argv: vec![Argument::Str("hello".into())],
            },
        );
        assert_eq!(scalar(called.ret), 5);

        let closed: ReplyDlclose = client.expect_ok(
            MsgId::Dlclose,
            &RequestDlclose {
                handle: opened.handle,
            },
        );
        assert_eq!(closed.res, 0);
    }

    #[test]
    fn call_with_bad_va_index_is_protocol_error() {
        let mut client = Client::start();
        let err = client.expect_error(
            MsgId::Call,
            &RequestCall {
                address: 0,
                va_list_index: 5,
                argv: vec![],
            },
        );
        assert!(err.message.contains("Protocol error"), "{}", err.message);
    }

    #[test]
    fn peek_of_zero_bytes_never_touches_the_address() {
        let mut client = Client::start();
        let reply: ReplyPeek = client.expect_ok(
            MsgId::Peek,
            &RequestPeek {
                // Deliberately wild; size 0 must not dereference it.
                address: 0xdead_0000_0000,
                size: 0,
            },
        );
        assert!(reply.data.is_empty());
    }

    // The worker serves from a thread in this process, so peeks and pokes
    // land in our own address space and we can verify them end to end.
    #[test]
    fn poke_then_peek_roundtrip() {
        let mut client = Client::start();
        let buf: &'static mut [u8] = Vec::leak(vec![0u8; 8]);
        let address = buf.as_ptr() as u64;

        let _: ReplyPoke = client.expect_ok(
            MsgId::Poke,
            &RequestPoke {
                address,
                data: vec![1, 2, 3, 4],
            },
        );

        let peeked: ReplyPeek = client.expect_ok(
            MsgId::Peek,
            &RequestPeek { address, size: 8 },
        );
        assert_eq!(peeked.data, [1, 2, 3, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn listdir_reports_both_stat_flavors() {
        let dir = std::env::temp_dir().join(format!(
            "waldod-listdir-{}-{:?}",
            std::process::id(),
            std::thread::current().id(),
        ));
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("a"), b"").unwrap();
        std::os::unix::fs::symlink("a", dir.join("b")).unwrap();

        let mut client = Client::start();
        let reply: ReplyListDir = client.expect_ok(
            MsgId::ListDir,
            &RequestListDir {
                path: dir.to_str().unwrap().to_owned(),
            },
        );

        // ".", "..", "a", "b"; enumeration order is the directory's.
        assert_eq!(reply.dir_entries.len(), 4);
        for entry in &reply.dir_entries {
            assert!(!entry.d_name.is_empty());
            assert_eq!(entry.stat.errno, 0);
            assert_eq!(entry.lstat.errno, 0);
        }

        let b = reply
            .dir_entries
            .iter()
            .find(|e| e.d_name == "b")
            .expect("symlink entry missing");
        assert_eq!(b.lstat.st_mode as u32 & libc::S_IFMT, libc::S_IFLNK);
        assert_eq!(b.stat.st_mode as u32 & libc::S_IFMT, libc::S_IFREG);
        assert_eq!(b.d_type, libc::DT_LNK as u32);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn listdir_of_missing_path_is_an_error() {
        let mut client = Client::start();
        let err = client.expect_error(
            MsgId::ListDir,
            &RequestListDir {
                path: "/nonexistent-waldod-test".into(),
            },
        );
        assert!(err.message.contains("LISTDIR"), "{}", err.message);
        assert_eq!(err.errno, libc::ENOENT);
    }

    #[test]
    fn exec_foreground_streams_pty_until_exit() {
        let mut client = Client::start();
        let reply: ReplyExec = client.expect_ok(
            MsgId::Exec,
            &RequestExec {
                argv: vec!["/bin/echo".into(), "hi".into()],
                envp: vec![],
                background: false,
            },
        );
        assert!(reply.pid > 0);

        // Reply first, then the side channel: buffers, one exit code, and
        // nothing after it but our own close.
        let mut output = Vec::new();
        let status = loop {
            match PtyMessage::from_bytes(&client.recv_frame()).unwrap() {
                PtyMessage::Buffer(chunk) => output.extend_from_slice(&chunk),
                PtyMessage::ExitCode(status) => break status,
            }
        };
        assert!(
            output.windows(2).any(|w| w == b"hi"),
            "pty output missing payload: {output:?}"
        );
        assert_eq!(status, 0);

        // The worker is back in request mode afterwards.
        let _: ReplyCloseClient =
            client.expect_ok(MsgId::CloseClient, &RequestCloseClient);
    }

    #[test]
    fn exec_background_sends_no_pty_stream() {
        let mut client = Client::start();
        let reply: ReplyExec = client.expect_ok(
            MsgId::Exec,
            &RequestExec {
                argv: vec!["/bin/sh".into(), "-c".into(), "exit 0".into()],
                envp: vec![],
                background: true,
            },
        );
        assert!(reply.pid > 0);

        // If a stray PTY frame followed, it would sit where this reply is
        // expected and the parse would fail.
        let _: ReplyCloseClient =
            client.expect_ok(MsgId::CloseClient, &RequestCloseClient);
    }

    #[test]
    fn exec_with_empty_argv_is_protocol_error() {
        let mut client = Client::start();
        let err = client.expect_error(
            MsgId::Exec,
            &RequestExec {
                argv: vec![],
                envp: vec![],
                background: true,
            },
        );
        assert!(
            err.message.contains("Protocol error on msg_id 8 (EXEC)"),
            "{}",
            err.message
        );
    }

    #[test]
    fn exec_passes_explicit_environment() {
        let mut client = Client::start();
        let _: ReplyExec = client.expect_ok(
            MsgId::Exec,
            &RequestExec {
                argv: vec![
                    "/bin/sh".into(),
                    "-c".into(),
                    "echo $WALDO_TEST_MARKER".into(),
                ],
                envp: vec!["WALDO_TEST_MARKER=pickle".into()],
                background: false,
            },
        );
        let mut output = Vec::new();
        loop {
            match PtyMessage::from_bytes(&client.recv_frame()).unwrap() {
                PtyMessage::Buffer(chunk) => output.extend_from_slice(&chunk),
                PtyMessage::ExitCode(_) => break,
            }
        }
        assert!(
            output.windows(6).any(|w| w == b"pickle"),
            "environment did not reach the child: {output:?}"
        );
    }

    #[test]
    fn unknown_msg_id_keeps_the_connection_alive() {
        let mut client = Client::start();
        client.send_frame(&Envelope::new(99, vec![]).to_bytes());
        let reply = Envelope::parse(&client.recv_frame()).unwrap();
        assert_eq!(reply.msg_id, REPLY_ERROR_MSG_ID);
        let err = ReplyError::from_bytes(&reply.body).unwrap();
        assert!(err.message.contains("Out of bound msg_id 99"));

        // Still in business.
        let _: ReplyCloseClient =
            client.expect_ok(MsgId::CloseClient, &RequestCloseClient);
    }

    #[test]
    fn bad_magic_terminates_the_connection() {
        let mut client = Client::start();
        let mut payload = Envelope::new(1, vec![]).to_bytes();
        payload[0] ^= 0xFF;
        client.send_frame(&payload);
        assert!(client.at_eof());
    }
}

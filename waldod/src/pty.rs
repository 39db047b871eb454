// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Child spawning and the foreground PTY stream.
//!
//! Foreground children run behind a pseudo-terminal rather than pipes; some
//! tools detect a pipe on stdout and change buffering (or simply forget to
//! flush), and a PTY keeps them honest. The child becomes its own session
//! leader so terminal-generated signals stay away from the worker.
//!
//! The [`PtyHandoff`] is the pending-PTY latch: a successful foreground
//! spawn parks `{ pid, master }` on the worker, the exec reply goes out,
//! and the worker loop trades the latch for [`stream`] before reading
//! anything else. Single producer, single consumer, one shot.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::Result;
use log::debug;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::select::{select, FdSet};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use waldo_proto::messages::PtyMessage;
use waldo_proto::{Wire, PTY_BUFFER_SIZE};

use crate::net;

/// Ownership handoff from the exec routine to the streaming loop.
pub struct PtyHandoff {
    pub pid: u32,
    pub master: OwnedFd,
}

fn command_for(argv: &[String], envp: &[String]) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    if !envp.is_empty() {
        cmd.env_clear();
        cmd.envs(envp.iter().map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (kv.clone(), String::new()),
        }));
    }
    cmd
}

/// Spawns a child on a fresh PTY slave and returns the armed latch.
pub fn spawn_foreground(argv: &[String], envp: &[String]) -> io::Result<PtyHandoff> {
    let master = posix_openpt(OFlag::O_RDWR).map_err(io::Error::from)?;
    grantpt(&master).map_err(io::Error::from)?;
    unlockpt(&master).map_err(io::Error::from)?;
    let slave_path = ptsname_r(&master).map_err(io::Error::from)?;

    // Children only ever see the slave; close-on-exec keeps the master out
    // of this child and every later one.
    net::set_cloexec(master.as_raw_fd())?;

    let slave = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&slave_path)?;
    debug!("slave pty: {slave_path}");

    let mut cmd = command_for(argv, envp);
    cmd.stdin(Stdio::from(slave.try_clone()?));
    cmd.stdout(Stdio::from(slave.try_clone()?));
    cmd.stderr(Stdio::from(slave));
    unsafe {
        cmd.pre_exec(|| {
            // New session: the PTY's signals belong to the child, not us.
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = cmd.spawn()?;
    // The Stdio handles closed our slave copies at spawn; only the master
    // remains on this side.
    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    Ok(PtyHandoff {
        pid: child.id(),
        master,
    })
}

/// Spawns a detached child with `/dev/null` stdio. The exit status is
/// collected by a reaper thread and discarded; clients must not wait for an
/// exit-code message that will never come.
pub fn spawn_background(argv: &[String], envp: &[String]) -> io::Result<u32> {
    let mut cmd = command_for(argv, envp);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    let child = cmd.spawn()?;
    let pid = child.id();
    thread::spawn(move || {
        let _ = waitpid(Pid::from_raw(pid as i32), None);
        debug!("reaped background pid {pid}");
    });
    Ok(pid)
}

/// Multiplexes bytes between the PTY master and the client socket until
/// either side closes, then reaps the child and reports its status. The
/// master dies with the handoff on every path out of here.
pub fn stream(sock: RawFd, handoff: PtyHandoff) -> Result<()> {
    debug!("pty mode: pid {} master {}", handoff.pid, handoff.master.as_raw_fd());
    let master = handoff.master.as_raw_fd();
    let mut buf = [0u8; PTY_BUFFER_SIZE];

    loop {
        let sock_fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(sock) };
        let mut readfds = FdSet::new();
        readfds.insert(handoff.master.as_fd());
        readfds.insert(sock_fd);

        match select(None, &mut readfds, None, None, None) {
            Ok(n) if n > 0 => {}
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }

        if readfds.contains(handoff.master.as_fd()) {
            // EIO here is the usual Linux way of saying the child is gone
            // and the slave side is closed; either way the stream is over.
            match net::read_some(master, &mut buf) {
                Ok(n) if n > 0 => {
                    let msg = PtyMessage::Buffer(buf[..n].to_vec());
                    net::send_frame(sock, &msg.to_bytes())?;
                }
                _ => {
                    debug!("pty master EOF");
                    break;
                }
            }
        }

        if readfds.contains(sock_fd) {
            match net::recv_some(sock, &mut buf) {
                Ok(n) if n > 0 => net::write_all(master, &buf[..n])?,
                _ => {
                    debug!("client closed input during pty");
                    break;
                }
            }
        }
    }

    let mut status: libc::c_int = 0;
    unsafe {
        libc::waitpid(handoff.pid as libc::pid_t, &mut status, 0);
    }
    net::send_frame(sock, &PtyMessage::ExitCode(status).to_bytes())?;
    debug!("sent exit code {status} for pid {}", handoff.pid);
    Ok(())
}

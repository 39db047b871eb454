// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! waldod: remote-execution and in-process introspection daemon.
//!
//! The listener accepts TCP connections on an IPv6 dual-stack socket and
//! re-execs itself once per client (`-w`), handing the accepted socket over
//! on fd 3. Each worker owns exactly one connection, so a client that talks
//! the server into dereferencing garbage kills its own worker and nobody
//! else's. `-d` skips the worker spawn and serves clients in-process,
//! serially, which is occasionally the debugging mode you want and never
//! the deployment you want.

mod dispatch;
mod logger;
mod net;
mod pty;
mod routines;
mod worker;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use nix::errno::Errno;
use nix::sys::signal::{sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{
    accept, bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog,
    SockFlag, SockType, SockaddrIn6,
};

/// The fd a worker inherits its client socket on.
const WORKER_SOCKET_FD: RawFd = 3;

const MAX_CONNECTIONS: i32 = 1024;

#[derive(Debug, Parser)]
#[clap(name = "waldod", version)]
/// Remote execution and in-process introspection daemon.
struct Args {
    /// Port to listen on.
    #[clap(short, long, default_value_t = 5910)]
    port: u16,

    /// Log sink: stdout, syslog, or file:<path>. May be repeated.
    #[clap(short, long = "output", value_name = "SINK")]
    output: Vec<String>,

    /// Handle clients in-process instead of spawning a worker per
    /// connection.
    #[clap(short, long)]
    direct: bool,

    /// Worker mode: serve the single client inherited on fd 3. Set by the
    /// listener, not by people.
    #[clap(short, long, hide = true)]
    worker: bool,
}

extern "C" fn reap_children(_signo: libc::c_int) {
    // Signal context: nothing here but waitpid.
    loop {
        let pid =
            unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
    }
}

fn install_sigchld_reaper() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(reap_children),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &action) }.context("sigaction")?;
    Ok(())
}

/// Re-execs this binary as a one-connection worker. The worker sees our
/// argv plus `-w`, so port and log sinks carry over, and the client socket
/// arrives dup'd onto [`WORKER_SOCKET_FD`].
fn spawn_worker(client: OwnedFd) -> Result<()> {
    let exe = std::env::current_exe().context("locate server binary")?;
    let mut cmd = Command::new(exe);
    cmd.args(std::env::args_os().skip(1));
    cmd.arg("-w");
    let raw = client.as_raw_fd();
    unsafe {
        cmd.pre_exec(move || {
            // dup2 leaves the new fd without FD_CLOEXEC, so it survives the
            // exec even though our copy is marked close-on-exec.
            if libc::dup2(raw, WORKER_SOCKET_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = cmd.spawn().context("spawn worker")?;
    debug!("spawned worker process: {}", child.id());
    // Parent's copy closes with `client`; the reaper collects the worker.
    Ok(())
}

fn listen_loop(args: &Args) -> Result<()> {
    let listener = socket(
        AddressFamily::Inet6,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("socket")?;
    net::set_cloexec(listener.as_raw_fd()).context("cloexec")?;
    setsockopt(&listener, sockopt::ReuseAddr, &true).context("SO_REUSEADDR")?;
    // Dual stack: IPv4 peers show up as v4-mapped v6 addresses. Not every
    // platform lets us clear this, hence best-effort.
    let _ = setsockopt(&listener, sockopt::Ipv6V6Only, &false);

    let addr = SockaddrIn6::from(std::net::SocketAddrV6::new(
        std::net::Ipv6Addr::UNSPECIFIED,
        args.port,
        0,
        0,
    ));
    bind(listener.as_raw_fd(), &addr).context("bind")?;
    listen(
        &listener,
        Backlog::new(MAX_CONNECTIONS).unwrap_or(Backlog::MAXCONN),
    )
    .context("listen")?;
    info!("waiting for connections on [::]:{}", args.port);

    install_sigchld_reaper()?;

    loop {
        let client = match accept(listener.as_raw_fd()) {
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("accept"),
        };
        net::set_cloexec(client.as_raw_fd()).context("client cloexec")?;
        info!("got a connection [{}]", client.as_raw_fd());

        if args.direct {
            debug!("direct mode: handling client without spawning worker");
            if let Err(err) = worker::handle_client(client) {
                debug!("client error: {err:#}");
            }
        } else {
            spawn_worker(client)?;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logger::init(&logger::SinkConfig::parse(&args.output));

    // A worker mid-write to a vanished client must get an error return,
    // not a termination signal.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("ignore SIGPIPE")?;

    if args.worker {
        debug!("new worker spawned");
        // Safety: the listener promises this fd by contract of `-w`.
        let sock = unsafe { OwnedFd::from_raw_fd(WORKER_SOCKET_FD) };
        if let Err(err) = worker::handle_client(sock) {
            debug!("client error: {err:#}");
        }
        return Ok(());
    }

    listen_loop(&args)
}

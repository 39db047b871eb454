// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process routines: exec and close_client.

use log::error;

use waldo_proto::messages::{
    ReplyCloseClient, ReplyExec, RequestCloseClient, RequestExec,
};
use waldo_proto::Wire;

use crate::dispatch::{RoutineError, RoutineResult};
use crate::pty;
use crate::worker::Worker;

pub(crate) fn exec(worker: &mut Worker, body: &[u8]) -> RoutineResult {
    let request = RequestExec::from_bytes(body)?;
    if request.argv.is_empty() {
        return Err(RoutineError::Protocol);
    }

    let pid = if request.background {
        pty::spawn_background(&request.argv, &request.envp)
    } else {
        pty::spawn_foreground(&request.argv, &request.envp).map(|handoff| {
            let pid = handoff.pid;
            // Arm the latch; the worker loop consumes it right after this
            // reply is flushed.
            worker.pending_pty = Some(handoff);
            pid
        })
    }
    .map_err(|err| {
        error!("spawn of {:?} failed: {err}", request.argv[0]);
        RoutineError::Protocol
    })?;

    Ok(ReplyExec { pid }.to_bytes())
}

pub(crate) fn close_client(worker: &mut Worker, body: &[u8]) -> RoutineResult {
    RequestCloseClient::from_bytes(body)?;
    worker.close_requested = true;
    Ok(ReplyCloseClient.to_bytes())
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The call routine: thin shim over the engine in `waldo-call`. The decoded
//! request stays alive on this frame for the whole call, which is what
//! keeps string and byte buffer addresses valid for the callee.

use log::{debug, warn};

use waldo_proto::messages::{ReplyCall, RequestCall};
use waldo_proto::Wire;

use crate::dispatch::{RoutineError, RoutineResult};
use crate::worker::Worker;

pub(crate) fn call(_worker: &mut Worker, body: &[u8]) -> RoutineResult {
    let request = RequestCall::from_bytes(body)?;
    debug!("address: {:#x}", request.address);
    let ret = waldo_call::call(
        request.address,
        request.va_list_index,
        &request.argv,
    )
    .map_err(|err| {
        warn!("call rejected: {err}");
        RoutineError::Protocol
    })?;
    Ok(ReplyCall { ret }.to_bytes())
}

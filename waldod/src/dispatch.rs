// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request dispatch: one table slot per request id, one reply per request.
//!
//! The table is the protocol surface in miniature: a slot's position is its
//! message id, its name shows up in client-visible error strings, and a
//! `None` slot means "id reserved but not served here". Routines decode
//! their own bodies (the types make a central descriptor table redundant)
//! and hand back either a packed reply body or a [`RoutineError`]; reply
//! buffers are owned `Vec`s that drop after the send, so no routine needs
//! a cleanup hook to release what it attached.

use log::debug;
use nix::errno::Errno;

use waldo_proto::messages::ReplyError;
use waldo_proto::{DecodeError, Envelope, Wire, MAX_REQ_MSG_ID, REPLY_ERROR_MSG_ID};

use crate::routines;
use crate::worker::Worker;

/// How a routine failed. `Protocol` is the client's fault (malformed or
/// invariant-violating request), `Server` is ours (a syscall or allocation
/// let us down). Either way the connection survives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RoutineError {
    Protocol,
    Server,
}

impl From<DecodeError> for RoutineError {
    fn from(_err: DecodeError) -> Self {
        Self::Protocol
    }
}

pub type RoutineResult = Result<Vec<u8>, RoutineError>;

type Routine = fn(&mut Worker, &[u8]) -> RoutineResult;

struct RoutineEntry {
    name: &'static str,
    run: Routine,
}

// Indexed by request msg_id; slot zero is unused by the protocol.
static ROUTINES: [Option<RoutineEntry>; MAX_REQ_MSG_ID as usize] = [
    None,
    Some(RoutineEntry { name: "DLOPEN", run: routines::dl::dlopen }),
    Some(RoutineEntry { name: "DLCLOSE", run: routines::dl::dlclose }),
    Some(RoutineEntry { name: "DLSYM", run: routines::dl::dlsym }),
    Some(RoutineEntry { name: "PEEK", run: routines::mem::peek }),
    Some(RoutineEntry { name: "POKE", run: routines::mem::poke }),
    Some(RoutineEntry { name: "CALL", run: routines::call::call }),
    Some(RoutineEntry { name: "LISTDIR", run: routines::fs::listdir }),
    Some(RoutineEntry { name: "EXEC", run: routines::proc::exec }),
    Some(RoutineEntry { name: "CLOSE_CLIENT", run: routines::proc::close_client }),
];

enum Lookup {
    OutOfRange,
    NoRoutine,
    Found(&'static RoutineEntry),
}

fn lookup(msg_id: u32) -> Lookup {
    if msg_id == 0 || msg_id >= MAX_REQ_MSG_ID {
        return Lookup::OutOfRange;
    }
    match &ROUTINES[msg_id as usize] {
        Some(entry) => Lookup::Found(entry),
        None => Lookup::NoRoutine,
    }
}

/// Builds an error reply carrying the errno left behind by whatever just
/// failed. Nothing runs between a routine's failure and this snapshot, so
/// the thread errno is still the interesting one.
fn error_reply(message: String) -> Envelope {
    let body = ReplyError {
        message,
        errno: Errno::last() as i32,
    };
    Envelope::new(REPLY_ERROR_MSG_ID, body.to_bytes())
}

/// Turns one request envelope into one reply envelope. Never fails: every
/// failure mode has an error-reply shape.
pub fn dispatch(worker: &mut Worker, request: &Envelope) -> Envelope {
    let entry = match lookup(request.msg_id) {
        Lookup::OutOfRange => {
            return error_reply(format!(
                "Out of bound msg_id {}: must be 1-{}",
                request.msg_id,
                MAX_REQ_MSG_ID - 1
            ));
        }
        Lookup::NoRoutine => {
            return error_reply(format!(
                "No routine configured for msg_id {}",
                request.msg_id
            ));
        }
        Lookup::Found(entry) => entry,
    };

    debug!("dispatching msg_id {} ({})", request.msg_id, entry.name);

    match (entry.run)(worker, &request.body) {
        Ok(body) => Envelope::new(request.msg_id + MAX_REQ_MSG_ID, body),
        Err(RoutineError::Server) => error_reply(format!(
            "Server error on msg_id {} ({})",
            request.msg_id, entry.name
        )),
        Err(RoutineError::Protocol) => error_reply(format!(
            "Protocol error on msg_id {} ({})",
            request.msg_id, entry.name
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;
    use waldo_proto::MsgId;

    // Every defined request id must have a slot, and the slot order must
    // match the id values; a shifted table would route requests to the
    // wrong routines while looking healthy.
    #[test]
    fn table_covers_every_request_id() {
        for id in 1..MAX_REQ_MSG_ID {
            assert!(
                MsgId::from_u32(id).is_some(),
                "id {id} has no MsgId variant"
            );
            assert!(
                matches!(lookup(id), Lookup::Found(_)),
                "id {id} has no routine"
            );
        }
        assert!(matches!(lookup(0), Lookup::OutOfRange));
        assert!(matches!(lookup(MAX_REQ_MSG_ID), Lookup::OutOfRange));
        assert!(matches!(lookup(u32::MAX), Lookup::OutOfRange));
    }

    #[test]
    fn table_names_match_ids() {
        let expected = [
            (MsgId::Dlopen, "DLOPEN"),
            (MsgId::Dlclose, "DLCLOSE"),
            (MsgId::Dlsym, "DLSYM"),
            (MsgId::Peek, "PEEK"),
            (MsgId::Poke, "POKE"),
            (MsgId::Call, "CALL"),
            (MsgId::ListDir, "LISTDIR"),
            (MsgId::Exec, "EXEC"),
            (MsgId::CloseClient, "CLOSE_CLIENT"),
        ];
        for (id, name) in expected {
            match lookup(id as u32) {
                Lookup::Found(entry) => assert_eq!(entry.name, name),
                _ => panic!("no routine for {id:?}"),
            }
        }
    }

    #[test]
    fn out_of_range_id_reports_the_id() {
        let mut worker = Worker::default();
        let reply = dispatch(&mut worker, &Envelope::new(99, vec![]));
        assert_eq!(reply.msg_id, REPLY_ERROR_MSG_ID);
        let err = ReplyError::from_bytes(&reply.body).unwrap();
        assert!(err.message.contains("Out of bound msg_id 99"), "{}", err.message);
    }

    #[test]
    fn malformed_body_is_a_protocol_error() {
        let mut worker = Worker::default();
        // Dlopen wants a string and a mode; one byte satisfies neither.
        let reply =
            dispatch(&mut worker, &Envelope::new(MsgId::Dlopen as u32, vec![1]));
        assert_eq!(reply.msg_id, REPLY_ERROR_MSG_ID);
        let err = ReplyError::from_bytes(&reply.body).unwrap();
        assert!(
            err.message.contains("Protocol error on msg_id 1 (DLOPEN)"),
            "{}",
            err.message
        );
    }
}

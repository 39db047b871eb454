// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire protocol for the waldo daemon.
//!
//! Everything that crosses the TCP connection is a *frame*: an 8-byte
//! little-endian length followed by that many payload bytes. For requests and
//! replies the payload is an [`Envelope`]: a fixed header carrying
//! [`MESSAGE_MAGIC`] and a message id, followed by the body encoded per the
//! schema that id selects. Two payload kinds ride the framing *without* an
//! envelope header, because the peer already knows what must come next: the
//! one-shot [`Handshake`](messages::Handshake) the worker emits on connect,
//! and the [`PtyMessage`](messages::PtyMessage) stream that follows a
//! foreground exec reply.
//!
//! The encoding is deliberately boring so that two independent
//! implementations produce byte-identical output: integers are fixed-width
//! little-endian, strings are `u32`-length-prefixed UTF-8 with no trailing
//! NUL, byte buffers and lists are `u32`-length/count-prefixed, and enum
//! variants carry a single tag byte. Golden-byte tests in
//! [`messages`] pin all of this down; changing any of it is a protocol
//! break, not a refactor.
//!
//! Message id space: requests occupy `[1, MAX_REQ_MSG_ID)`. A successful
//! reply reuses the request id shifted up by [`MAX_REQ_MSG_ID`], which keeps
//! the two ranges disjoint and makes "which request does this answer" a
//! subtraction. [`REPLY_ERROR_MSG_ID`] sits outside both ranges.

use core::fmt;

use num_derive::FromPrimitive;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub mod messages;
pub mod wire;

pub use wire::{Reader, Wire, Writer};

/// Magic value leading every request/reply envelope (and the handshake).
pub const MESSAGE_MAGIC: u32 = 0x1234_5678;

/// One past the highest request message id. Also the offset added to a
/// request id to form its success-reply id.
pub const MAX_REQ_MSG_ID: u32 = 10;

/// Message id of an error reply. Outside both the request range and the
/// shifted success-reply range.
pub const REPLY_ERROR_MSG_ID: u32 = 2 * MAX_REQ_MSG_ID;

/// Protocol revision reported in the handshake; clients use it to pick a
/// call-reply interpretation.
pub const SERVER_VERSION: u32 = 5;

/// Upper bound on a single frame's payload. There is no checksum on the
/// wire, so a corrupt length would otherwise have us waiting on gigabytes.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Chunk size for PTY master reads during foreground-exec streaming.
pub const PTY_BUFFER_SIZE: usize = 8 * 1024;

/// Request message ids. The numeric values are the wire protocol; the order
/// here is load-bearing and pinned by tests.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum MsgId {
    Dlopen = 1,
    Dlclose = 2,
    Dlsym = 3,
    Peek = 4,
    Poke = 5,
    Call = 6,
    ListDir = 7,
    Exec = 8,
    CloseClient = 9,
}

impl MsgId {
    /// The message id of a successful reply to this request.
    pub fn reply_id(self) -> u32 {
        self as u32 + MAX_REQ_MSG_ID
    }
}

/// Architectures a server can report in its handshake. Determines which arm
/// of the call reply the client should expect.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum Arch {
    Unknown = 0,
    Arm64 = 1,
}

/// Errors produced while decoding received bytes. All of these are protocol
/// violations by the peer; none are recoverable for the message concerned.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The input ended before the schema was satisfied.
    Truncated,
    /// The schema was satisfied but input bytes remain; canonical messages
    /// have none.
    Trailing(usize),
    /// A length-prefixed string was not valid UTF-8.
    BadUtf8,
    /// An envelope led with something other than [`MESSAGE_MAGIC`].
    BadMagic(u32),
    /// An enum tag byte (or tag word) had no corresponding variant.
    BadTag { what: &'static str, tag: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "message truncated"),
            Self::Trailing(n) => write!(f, "{n} trailing bytes after message"),
            Self::BadUtf8 => write!(f, "string field is not UTF-8"),
            Self::BadMagic(m) => write!(f, "bad envelope magic {m:#010x}"),
            Self::BadTag { what, tag } => write!(f, "bad {what} tag {tag}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// The fixed leader of every request/reply payload.
#[derive(FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
#[repr(C)]
struct Header {
    magic: U32<LittleEndian>,
    msg_id: U32<LittleEndian>,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Header>(), 8);

/// A request or reply, minus the outer length prefix (which belongs to the
/// socket layer, not the codec).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub msg_id: u32,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(msg_id: u32, body: Vec<u8>) -> Self {
        Self { msg_id, body }
    }

    /// Serializes the envelope: header, then body, magic included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = Header {
            magic: U32::new(MESSAGE_MAGIC),
            msg_id: U32::new(self.msg_id),
        };
        let mut out = Vec::with_capacity(8 + self.body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Parses a received frame payload. A magic mismatch is fatal to the
    /// connection and is reported distinctly so callers can hang up.
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (header, body) =
            Header::read_from_prefix(bytes).map_err(|_| DecodeError::Truncated)?;
        if header.magic.get() != MESSAGE_MAGIC {
            return Err(DecodeError::BadMagic(header.magic.get()));
        }
        Ok(Self {
            msg_id: header.msg_id.get(),
            body: body.to_vec(),
        })
    }
}

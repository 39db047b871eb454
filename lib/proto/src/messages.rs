// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request, reply, handshake, and PTY message schemas.
//!
//! Each request id from [`crate::MsgId`] pairs one request type with one
//! reply type. The structs here are plain owned data; nothing borrows the
//! receive buffer, so a decoded request can outlive the frame it arrived in
//! (the call engine depends on that to keep string/byte arguments alive
//! across an indirect call).

use num_traits::FromPrimitive;

use crate::wire::{Reader, Wire, Writer};
use crate::{Arch, DecodeError};

/// One argument to a remote function call.
///
/// `Str` and `Bytes` contribute the *address* of their buffer to the callee,
/// never the contents; the buffers themselves live in the decoded request
/// for as long as the call runs.
#[derive(Clone, Debug, PartialEq)]
pub enum Argument {
    Int(u64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
}

const ARG_TAG_INT: u8 = 1;
const ARG_TAG_DOUBLE: u8 = 2;
const ARG_TAG_STR: u8 = 3;
const ARG_TAG_BYTES: u8 = 4;

impl Wire for Argument {
    fn encode(&self, w: &mut Writer) {
        match self {
            Self::Int(v) => {
                w.put_u8(ARG_TAG_INT);
                w.put_u64(*v);
            }
            Self::Double(v) => {
                w.put_u8(ARG_TAG_DOUBLE);
                w.put_f64(*v);
            }
            Self::Str(s) => {
                w.put_u8(ARG_TAG_STR);
                w.put_str(s);
            }
            Self::Bytes(b) => {
                w.put_u8(ARG_TAG_BYTES);
                w.put_bytes(b);
            }
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match r.get_u8()? {
            ARG_TAG_INT => Ok(Self::Int(r.get_u64()?)),
            ARG_TAG_DOUBLE => Ok(Self::Double(r.get_f64()?)),
            ARG_TAG_STR => Ok(Self::Str(r.get_str()?)),
            ARG_TAG_BYTES => Ok(Self::Bytes(r.get_bytes()?)),
            tag => Err(DecodeError::BadTag {
                what: "argument",
                tag: tag.into(),
            }),
        }
    }
}

fn put_list<T: Wire>(w: &mut Writer, items: &[T]) {
    w.put_u32(items.len() as u32);
    for item in items {
        item.encode(w);
    }
}

fn get_list<T: Wire>(r: &mut Reader<'_>) -> Result<Vec<T>, DecodeError> {
    let count = r.get_u32()? as usize;
    // Cap the preallocation; a lying count still has to back every element
    // with real bytes before it can make us allocate in earnest.
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(T::decode(r)?);
    }
    Ok(items)
}

impl Wire for String {
    fn encode(&self, w: &mut Writer) {
        w.put_str(self);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        r.get_str()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestDlopen {
    pub filename: String,
    pub mode: u32,
}

impl Wire for RequestDlopen {
    fn encode(&self, w: &mut Writer) {
        w.put_str(&self.filename);
        w.put_u32(self.mode);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            filename: r.get_str()?,
            mode: r.get_u32()?,
        })
    }
}

/// A zero handle means the load failed; the server does not editorialize
/// beyond that and the client is expected to treat zero as failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyDlopen {
    pub handle: u64,
}

impl Wire for ReplyDlopen {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.handle);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            handle: r.get_u64()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestDlclose {
    pub handle: u64,
}

impl Wire for RequestDlclose {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.handle);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            handle: r.get_u64()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyDlclose {
    pub res: u64,
}

impl Wire for ReplyDlclose {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.res);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { res: r.get_u64()? })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestDlsym {
    pub handle: u64,
    pub symbol_name: String,
}

impl Wire for RequestDlsym {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.handle);
        w.put_str(&self.symbol_name);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            handle: r.get_u64()?,
            symbol_name: r.get_str()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyDlsym {
    pub ptr: u64,
}

impl Wire for ReplyDlsym {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.ptr);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { ptr: r.get_u64()? })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestPeek {
    pub address: u64,
    pub size: u64,
}

impl Wire for RequestPeek {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.address);
        w.put_u64(self.size);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            address: r.get_u64()?,
            size: r.get_u64()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyPeek {
    pub data: Vec<u8>,
}

impl Wire for ReplyPeek {
    fn encode(&self, w: &mut Writer) {
        w.put_bytes(&self.data);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            data: r.get_bytes()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestPoke {
    pub address: u64,
    pub data: Vec<u8>,
}

impl Wire for RequestPoke {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.address);
        w.put_bytes(&self.data);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            address: r.get_u64()?,
            data: r.get_bytes()?,
        })
    }
}

/// Poke succeeds silently; the reply body is empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplyPoke;

impl Wire for ReplyPoke {
    fn encode(&self, _w: &mut Writer) {}

    fn decode(_r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestCall {
    pub address: u64,
    /// Index of the first variadic argument. Arguments at this index and
    /// beyond go to the stack regardless of free registers; pass
    /// `argv.len()` for a fully non-variadic call.
    pub va_list_index: u64,
    pub argv: Vec<Argument>,
}

impl Wire for RequestCall {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.address);
        w.put_u64(self.va_list_index);
        put_list(w, &self.argv);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            address: r.get_u64()?,
            va_list_index: r.get_u64()?,
            argv: get_list(r)?,
        })
    }
}

/// Post-call snapshot of the AArch64 argument/result registers. `d` holds
/// the raw bit patterns of `d0..d7`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArmRegisters {
    pub x: [u64; 8],
    pub d: [u64; 8],
}

impl Wire for ArmRegisters {
    fn encode(&self, w: &mut Writer) {
        for v in self.x.iter().chain(self.d.iter()) {
            w.put_u64(*v);
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let mut regs = Self::default();
        for v in regs.x.iter_mut().chain(regs.d.iter_mut()) {
            *v = r.get_u64()?;
        }
        Ok(regs)
    }
}

const CALL_RETURN_TAG_VALUE: u8 = 0;
const CALL_RETURN_TAG_ARM: u8 = 1;

/// What came back from the indirect call. Which arm a server produces is a
/// property of its build target, advertised in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallReturn {
    Value(u64),
    ArmRegisters(ArmRegisters),
}

impl Wire for CallReturn {
    fn encode(&self, w: &mut Writer) {
        match self {
            Self::Value(v) => {
                w.put_u8(CALL_RETURN_TAG_VALUE);
                w.put_u64(*v);
            }
            Self::ArmRegisters(regs) => {
                w.put_u8(CALL_RETURN_TAG_ARM);
                regs.encode(w);
            }
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match r.get_u8()? {
            CALL_RETURN_TAG_VALUE => Ok(Self::Value(r.get_u64()?)),
            CALL_RETURN_TAG_ARM => Ok(Self::ArmRegisters(ArmRegisters::decode(r)?)),
            tag => Err(DecodeError::BadTag {
                what: "call return",
                tag: tag.into(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplyCall {
    pub ret: CallReturn,
}

impl Wire for ReplyCall {
    fn encode(&self, w: &mut Writer) {
        self.ret.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            ret: CallReturn::decode(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestListDir {
    pub path: String,
}

impl Wire for RequestListDir {
    fn encode(&self, w: &mut Writer) {
        w.put_str(&self.path);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { path: r.get_str()? })
    }
}

/// One `stat(2)`/`lstat(2)` result, widened to u64 across the board.
/// `errno` is zero iff the underlying call succeeded; on failure the
/// remaining fields are zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirEntryStat {
    pub errno: u64,
    pub st_dev: u64,
    pub st_mode: u64,
    pub st_nlink: u64,
    pub st_ino: u64,
    pub st_uid: u64,
    pub st_gid: u64,
    pub st_rdev: u64,
    pub st_size: u64,
    pub st_blocks: u64,
    pub st_blksize: u64,
    pub st_atime: u64,
    pub st_mtime: u64,
    pub st_ctime: u64,
}

impl DirEntryStat {
    fn fields(&self) -> [u64; 14] {
        [
            self.errno,
            self.st_dev,
            self.st_mode,
            self.st_nlink,
            self.st_ino,
            self.st_uid,
            self.st_gid,
            self.st_rdev,
            self.st_size,
            self.st_blocks,
            self.st_blksize,
            self.st_atime,
            self.st_mtime,
            self.st_ctime,
        ]
    }
}

impl Wire for DirEntryStat {
    fn encode(&self, w: &mut Writer) {
        for f in self.fields() {
            w.put_u64(f);
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            errno: r.get_u64()?,
            st_dev: r.get_u64()?,
            st_mode: r.get_u64()?,
            st_nlink: r.get_u64()?,
            st_ino: r.get_u64()?,
            st_uid: r.get_u64()?,
            st_gid: r.get_u64()?,
            st_rdev: r.get_u64()?,
            st_size: r.get_u64()?,
            st_blocks: r.get_u64()?,
            st_blksize: r.get_u64()?,
            st_atime: r.get_u64()?,
            st_mtime: r.get_u64()?,
            st_ctime: r.get_u64()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// `d_type` straight from the dirent (`DT_REG`, `DT_LNK`, ...).
    pub d_type: u32,
    pub d_name: String,
    pub stat: DirEntryStat,
    pub lstat: DirEntryStat,
}

impl Wire for DirEntry {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.d_type);
        w.put_str(&self.d_name);
        self.stat.encode(w);
        self.lstat.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            d_type: r.get_u32()?,
            d_name: r.get_str()?,
            stat: DirEntryStat::decode(r)?,
            lstat: DirEntryStat::decode(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyListDir {
    pub dir_entries: Vec<DirEntry>,
}

impl Wire for ReplyListDir {
    fn encode(&self, w: &mut Writer) {
        put_list(w, &self.dir_entries);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            dir_entries: get_list(r)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestExec {
    /// Program and arguments; must be nonempty.
    pub argv: Vec<String>,
    /// `KEY=VALUE` strings; empty means the child inherits the server's
    /// environment.
    pub envp: Vec<String>,
    /// Background children get `/dev/null` stdio and a detached reaper;
    /// foreground children get a PTY and the post-reply streaming mode.
    pub background: bool,
}

impl Wire for RequestExec {
    fn encode(&self, w: &mut Writer) {
        put_list(w, &self.argv);
        put_list(w, &self.envp);
        w.put_bool(self.background);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            argv: get_list(r)?,
            envp: get_list(r)?,
            background: r.get_bool()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyExec {
    pub pid: u32,
}

impl Wire for ReplyExec {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.pid);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { pid: r.get_u32()? })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestCloseClient;

impl Wire for RequestCloseClient {
    fn encode(&self, _w: &mut Writer) {}

    fn decode(_r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplyCloseClient;

impl Wire for ReplyCloseClient {
    fn encode(&self, _w: &mut Writer) {}

    fn decode(_r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self)
    }
}

/// Body of a [`crate::REPLY_ERROR_MSG_ID`] reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyError {
    pub message: String,
    /// `errno` observed when the routine failed; zero when there was none.
    pub errno: i32,
}

impl Wire for ReplyError {
    fn encode(&self, w: &mut Writer) {
        w.put_str(&self.message);
        w.put_i32(self.errno);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            message: r.get_str()?,
            errno: r.get_i32()?,
        })
    }
}

const PTY_TAG_BUFFER: u8 = 0;
const PTY_TAG_EXIT_CODE: u8 = 1;

/// One frame of the foreground-exec side channel. These are framed like any
/// other message but carry no envelope header; they are only legal
/// immediately after a successful foreground exec reply, so the client
/// already knows what is coming.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PtyMessage {
    Buffer(Vec<u8>),
    /// Raw `waitpid` status of the reaped child; always the final frame of
    /// the stream.
    ExitCode(i32),
}

impl Wire for PtyMessage {
    fn encode(&self, w: &mut Writer) {
        match self {
            Self::Buffer(data) => {
                w.put_u8(PTY_TAG_BUFFER);
                w.put_bytes(data);
            }
            Self::ExitCode(status) => {
                w.put_u8(PTY_TAG_EXIT_CODE);
                w.put_i32(*status);
            }
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match r.get_u8()? {
            PTY_TAG_BUFFER => Ok(Self::Buffer(r.get_bytes()?)),
            PTY_TAG_EXIT_CODE => Ok(Self::ExitCode(r.get_i32()?)),
            tag => Err(DecodeError::BadTag {
                what: "pty message",
                tag: tag.into(),
            }),
        }
    }
}

/// One-shot worker → client greeting, sent before any request is read. The
/// client keys its call-reply interpretation off `arch` and
/// `server_version`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub magic: u32,
    pub arch: Arch,
    pub sysname: String,
    pub machine: String,
    pub platform: String,
    pub server_version: u32,
    /// Pid of the worker serving this connection.
    pub client_id: u32,
}

impl Wire for Handshake {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.magic);
        w.put_u32(self.arch as u32);
        w.put_str(&self.sysname);
        w.put_str(&self.machine);
        w.put_str(&self.platform);
        w.put_u32(self.server_version);
        w.put_u32(self.client_id);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let magic = r.get_u32()?;
        let arch_raw = r.get_u32()?;
        let arch = Arch::from_u32(arch_raw).ok_or(DecodeError::BadTag {
            what: "arch",
            tag: arch_raw,
        })?;
        Ok(Self {
            magic,
            arch,
            sysname: r.get_str()?,
            machine: r.get_str()?,
            platform: r.get_str()?,
            server_version: r.get_u32()?,
            client_id: r.get_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The tag bytes are protocol. Like the request ids, their values are
    // pinned here so an innocent-looking enum reorder fails loudly.
    #[test]
    fn argument_tag_values() {
        for (expected, arg) in [
            (1, Argument::Int(0)),
            (2, Argument::Double(0.0)),
            (3, Argument::Str(String::new())),
            (4, Argument::Bytes(Vec::new())),
        ] {
            let bytes = arg.to_bytes();
            assert_eq!(expected, bytes[0], "tag for {arg:?}");
        }
    }

    #[test]
    fn pty_and_call_return_tag_values() {
        assert_eq!(PtyMessage::Buffer(vec![]).to_bytes()[0], 0);
        assert_eq!(PtyMessage::ExitCode(0).to_bytes()[0], 1);
        assert_eq!(CallReturn::Value(0).to_bytes()[0], 0);
        assert_eq!(
            CallReturn::ArmRegisters(ArmRegisters::default()).to_bytes()[0],
            1
        );
    }

    #[test]
    fn dlopen_request_golden_bytes() {
        let req = RequestDlopen {
            filename: "libm.so.6".into(),
            mode: 2,
        };
        let mut expected = vec![9, 0, 0, 0];
        expected.extend_from_slice(b"libm.so.6");
        expected.extend_from_slice(&[2, 0, 0, 0]);
        assert_eq!(req.to_bytes(), expected);
        assert_eq!(RequestDlopen::from_bytes(&expected).unwrap(), req);
    }

    #[test]
    fn call_request_golden_bytes() {
        let req = RequestCall {
            address: 0x1000,
            va_list_index: 1,
            argv: vec![Argument::Str("%d\n".into()), Argument::Int(7)],
        };
        let mut expected = vec![];
        expected.extend_from_slice(&0x1000u64.to_le_bytes());
        expected.extend_from_slice(&1u64.to_le_bytes());
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.push(3); // Str
        expected.extend_from_slice(&3u32.to_le_bytes());
        expected.extend_from_slice(b"%d\n");
        expected.push(1); // Int
        expected.extend_from_slice(&7u64.to_le_bytes());
        assert_eq!(req.to_bytes(), expected);
        assert_eq!(RequestCall::from_bytes(&expected).unwrap(), req);
    }

    #[test]
    fn exec_request_roundtrip() {
        let req = RequestExec {
            argv: vec!["/bin/echo".into(), "hi".into()],
            envp: vec![],
            background: false,
        };
        assert_eq!(RequestExec::from_bytes(&req.to_bytes()).unwrap(), req);
    }

    #[test]
    fn empty_bodies_encode_to_nothing() {
        assert!(RequestCloseClient.to_bytes().is_empty());
        assert!(ReplyCloseClient.to_bytes().is_empty());
        assert!(ReplyPoke.to_bytes().is_empty());
        // ...and strictness still applies: an empty schema rejects content.
        assert!(ReplyPoke::from_bytes(&[0]).is_err());
    }

    #[test]
    fn arm_register_bank_is_128_bytes() {
        let regs = ArmRegisters {
            x: [1, 2, 3, 4, 5, 6, 7, 8],
            d: [9, 10, 11, 12, 13, 14, 15, 16],
        };
        let bytes = regs.to_bytes();
        assert_eq!(bytes.len(), 128);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[64], 9);
        assert_eq!(ArmRegisters::from_bytes(&bytes).unwrap(), regs);
    }

    #[test]
    fn dir_entry_stat_is_14_words() {
        let stat = DirEntryStat {
            errno: 0,
            st_mode: 0o100644,
            st_size: 42,
            ..Default::default()
        };
        let bytes = stat.to_bytes();
        assert_eq!(bytes.len(), 14 * 8);
        assert_eq!(DirEntryStat::from_bytes(&bytes).unwrap(), stat);
    }

    #[test]
    fn handshake_roundtrip() {
        let hs = Handshake {
            magic: crate::MESSAGE_MAGIC,
            arch: Arch::Arm64,
            sysname: "Linux".into(),
            machine: "aarch64".into(),
            platform: "linux".into(),
            server_version: crate::SERVER_VERSION,
            client_id: 1234,
        };
        assert_eq!(Handshake::from_bytes(&hs.to_bytes()).unwrap(), hs);
    }

    #[test]
    fn handshake_rejects_unknown_arch() {
        let mut bytes = Handshake {
            magic: crate::MESSAGE_MAGIC,
            arch: Arch::Unknown,
            sysname: String::new(),
            machine: String::new(),
            platform: String::new(),
            server_version: 0,
            client_id: 0,
        }
        .to_bytes();
        bytes[4] = 9;
        assert_eq!(
            Handshake::from_bytes(&bytes),
            Err(DecodeError::BadTag { what: "arch", tag: 9 })
        );
    }

    #[test]
    fn truncated_argument_list_is_rejected() {
        let req = RequestCall {
            address: 0,
            va_list_index: 0,
            argv: vec![Argument::Int(1), Argument::Int(2)],
        };
        let bytes = req.to_bytes();
        // Chop the final argument in half.
        assert_eq!(
            RequestCall::from_bytes(&bytes[..bytes.len() - 4]),
            Err(DecodeError::Truncated)
        );
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Directory enumeration with full stat/lstat metadata per entry.

use log::debug;
use nix::dir::{Dir, Type};
use nix::fcntl::OFlag;
use nix::sys::stat::{lstat, stat, FileStat, Mode};

use waldo_proto::messages::{
    DirEntry, DirEntryStat, ReplyListDir, RequestListDir,
};
use waldo_proto::Wire;

use crate::dispatch::{RoutineError, RoutineResult};
use crate::worker::Worker;

fn stat_block(result: nix::Result<FileStat>) -> DirEntryStat {
    match result {
        Ok(st) => DirEntryStat {
            errno: 0,
            st_dev: st.st_dev as u64,
            st_mode: st.st_mode as u64,
            st_nlink: st.st_nlink as u64,
            st_ino: st.st_ino as u64,
            st_uid: st.st_uid as u64,
            st_gid: st.st_gid as u64,
            st_rdev: st.st_rdev as u64,
            st_size: st.st_size as u64,
            st_blocks: st.st_blocks as u64,
            st_blksize: st.st_blksize as u64,
            st_atime: st.st_atime as u64,
            st_mtime: st.st_mtime as u64,
            st_ctime: st.st_ctime as u64,
        },
        // Failure is per-entry data, not a routine failure: the entry keeps
        // its name and carries the errno, everything else zero.
        Err(errno) => DirEntryStat {
            errno: errno as i32 as u64,
            ..Default::default()
        },
    }
}

fn d_type_of(file_type: Option<Type>) -> u32 {
    let dt = match file_type {
        Some(Type::Fifo) => libc::DT_FIFO,
        Some(Type::CharacterDevice) => libc::DT_CHR,
        Some(Type::Directory) => libc::DT_DIR,
        Some(Type::BlockDevice) => libc::DT_BLK,
        Some(Type::File) => libc::DT_REG,
        Some(Type::Symlink) => libc::DT_LNK,
        Some(Type::Socket) => libc::DT_SOCK,
        None => libc::DT_UNKNOWN,
    };
    dt as u32
}

pub(crate) fn listdir(_worker: &mut Worker, body: &[u8]) -> RoutineResult {
    let request = RequestListDir::from_bytes(body)?;
    debug!("path={:?}", request.path);
    if request.path.is_empty() {
        return Err(RoutineError::Protocol);
    }

    let open = || {
        Dir::open(
            request.path.as_str(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        )
    };

    // First pass: size the reply.
    let mut dir = open().map_err(|_| RoutineError::Protocol)?;
    let entry_count = dir.iter().count();
    drop(dir);

    // Second pass: fill it. The directory can shift between passes; the
    // reply is capped at the first pass's count.
    let mut dir = open().map_err(|_| RoutineError::Server)?;
    let mut dir_entries = Vec::with_capacity(entry_count);
    for entry in dir.iter() {
        if dir_entries.len() == entry_count {
            break;
        }
        let entry = entry.map_err(|_| RoutineError::Server)?;
        let d_name = entry.file_name().to_string_lossy().into_owned();
        let fullpath = format!("{}/{}", request.path, d_name);
        dir_entries.push(DirEntry {
            d_type: d_type_of(entry.file_type()),
            d_name,
            stat: stat_block(stat(fullpath.as_str())),
            lstat: stat_block(lstat(fullpath.as_str())),
        });
    }

    Ok(ReplyListDir { dir_entries }.to_bytes())
}

#![forbid(unsafe_code)]
//! FUSE adapter.
//!
//! A thin translation layer: kernel FUSE requests arrive via the `fuser`
//! crate, get forwarded to an [`FsOps`] implementation, and errors are
//! mapped through [`ApfsError::to_errno()`]. Everything not overridden
//! here falls back to fuser's defaults (ENOSYS).

use apfs_core::{FileKind, FsOps, InodeAttr};
use apfs_error::ApfsError;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Cached attribute/entry TTL. The volume is immutable under a read-only
/// mount, so a generous TTL is safe.
const ATTR_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn to_fuser_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::Fifo => FileType::NamedPipe,
        FileKind::Socket => FileType::Socket,
    }
}

fn to_file_attr(attr: &InodeAttr) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

/// FUSE filesystem that delegates all operations to an [`FsOps`]
/// implementation.
pub struct ApfsFuse {
    ops: Box<dyn FsOps>,
}

impl ApfsFuse {
    #[must_use]
    pub fn new(ops: Box<dyn FsOps>) -> Self {
        Self { ops }
    }
}

impl Filesystem for ApfsFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {}

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.ops.getattr(ino) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(e) => {
                warn!(ino, error = %e, "getattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.ops.lookup(parent, name) {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), 0),
            Err(e) => {
                // ENOENT is routine for missing entries; don't warn.
                if e.to_errno() != libc::ENOENT {
                    warn!(parent, ?name, error = %e, "lookup failed");
                }
                reply.error(e.to_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Stateless open: no file handles to track.
        reply.opened(0, 0);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.ops.read(ino, byte_offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!(ino, offset, size, error = %e, "read failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let fs_offset = u64::try_from(offset).unwrap_or(0);
        match self.ops.readdir(ino, fs_offset) {
            Ok(entries) => {
                for entry in &entries {
                    let full = reply.add(
                        entry.ino,
                        i64::try_from(entry.offset).unwrap_or(i64::MAX),
                        to_fuser_file_type(entry.kind),
                        OsStr::new(&entry.name_str()),
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => {
                warn!(ino, offset, error = %e, "readdir failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.ops.readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(e) => {
                warn!(ino, error = %e, "readlink failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.ops.statfs() {
            Ok(st) => reply.statfs(
                st.blocks,
                st.bfree,
                st.bavail,
                st.files,
                st.ffree,
                st.block_size,
                st.namelen,
                st.block_size,
            ),
            Err(e) => {
                warn!(error = %e, "statfs failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.ops.listxattr(ino) {
            Ok(names) => {
                let mut packed = Vec::new();
                for name in &names {
                    packed.extend_from_slice(name);
                    packed.push(0);
                }
                let needed = u32::try_from(packed.len()).unwrap_or(u32::MAX);
                if size == 0 {
                    reply.size(needed);
                } else if needed <= size {
                    reply.data(&packed);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => {
                warn!(ino, error = %e, "listxattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        match self.ops.getxattr(ino, name) {
            Ok(data) => {
                let needed = u32::try_from(data.len()).unwrap_or(u32::MAX);
                if size == 0 {
                    reply.size(needed);
                } else if needed <= size {
                    reply.data(&data);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => {
                if e.to_errno() != libc::ENOENT {
                    warn!(ino, ?name, error = %e, "getxattr failed");
                }
                // Missing xattrs answer ENODATA, not ENOENT.
                let errno = match e {
                    ApfsError::NotFound(_) => libc::ENODATA,
                    other => other.to_errno(),
                };
                reply.error(errno);
            }
        }
    }
}

/// Mount-time options for the FUSE session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

fn build_mount_options(options: &SessionOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("apfs".to_owned()),
        MountOption::Subtype("apfs".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
        // The reader has no write paths; the kernel enforces it too.
        MountOption::RO,
    ];

    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }

    opts
}

/// Mount at `mountpoint` and block until the filesystem is unmounted.
pub fn mount(
    ops: Box<dyn FsOps>,
    mountpoint: impl AsRef<Path>,
    options: &SessionOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    fuser::mount2(ApfsFuse::new(ops), mountpoint, &fuse_opts)?;
    Ok(())
}

/// Mount in the background; unmounts when the session handle drops.
pub fn mount_background(
    ops: Box<dyn FsOps>,
    mountpoint: impl AsRef<Path>,
    options: &SessionOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let session = fuser::spawn_mount2(ApfsFuse::new(ops), mountpoint, &fuse_opts)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apfs_core::InodeAttr;
    use std::time::SystemTime;

    #[test]
    fn file_type_conversion() {
        let cases = [
            (FileKind::RegularFile, FileType::RegularFile),
            (FileKind::Directory, FileType::Directory),
            (FileKind::Symlink, FileType::Symlink),
            (FileKind::BlockDevice, FileType::BlockDevice),
            (FileKind::CharDevice, FileType::CharDevice),
            (FileKind::Fifo, FileType::NamedPipe),
            (FileKind::Socket, FileType::Socket),
        ];
        for (kind, expected) in &cases {
            assert_eq!(to_fuser_file_type(*kind), *expected);
        }
    }

    #[test]
    fn attr_conversion() {
        let attr = InodeAttr {
            ino: 2,
            size: 1024,
            blocks: 2,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind: FileKind::Directory,
            perm: 0o755,
            nlink: 3,
            uid: 501,
            gid: 20,
            rdev: 0,
            blksize: 4096,
        };
        let fattr = to_file_attr(&attr);
        assert_eq!(fattr.ino, 2);
        assert_eq!(fattr.kind, FileType::Directory);
        assert_eq!(fattr.perm, 0o755);
        assert_eq!(fattr.nlink, 3);
        assert_eq!(fattr.blksize, 4096);
    }

    #[test]
    fn read_only_is_always_requested() {
        let opts = build_mount_options(&SessionOptions::default());
        assert!(opts.contains(&MountOption::RO));
        assert!(!opts.contains(&MountOption::AllowOther));

        let opts = build_mount_options(&SessionOptions {
            allow_other: true,
            auto_unmount: false,
        });
        assert!(opts.contains(&MountOption::RO));
        assert!(opts.contains(&MountOption::AllowOther));
        assert!(!opts.contains(&MountOption::AutoUnmount));
    }
}

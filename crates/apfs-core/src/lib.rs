#![forbid(unsafe_code)]
//! Mounting and reading APFS volumes.
//!
//! `ApfsVolume::mount` runs the bootstrap (container superblock, volume
//! selection, omap root, catalog root) and the resulting volume handle
//! implements [`FsOps`], the read-only operation surface the FUSE layer
//! consumes. Everything is exposed read-only unconditionally.

use std::ffi::OsStr;
use std::time::{Duration, SystemTime};

use apfs_error::Result;
use apfs_types::{
    DT_BLK, DT_CHR, DT_DIR, DT_FIFO, DT_LNK, DT_REG, DT_SOCK, S_IFBLK, S_IFCHR, S_IFDIR,
    S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
};

mod dir;
mod extents;
mod inode;
mod mount;
mod options;
mod ops;
mod xattr;

pub use extents::{BlockMapping, FileExtent};
pub use inode::Inode;
pub use mount::ApfsVolume;
pub use options::MountOptions;

/// File kinds surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Derive the kind from a POSIX mode word. Unknown patterns read as
    /// regular files rather than failing the whole inode.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            S_IFBLK => Self::BlockDevice,
            S_IFCHR => Self::CharDevice,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Socket,
            _ => Self::RegularFile,
        }
    }

    /// Derive the kind from a directory entry's `DT_*` value, falling
    /// back to `whiteout` entries reading as regular files.
    #[must_use]
    pub fn from_dirent_type(dt: u16) -> Self {
        match dt {
            DT_DIR => Self::Directory,
            DT_LNK => Self::Symlink,
            DT_BLK => Self::BlockDevice,
            DT_CHR => Self::CharDevice,
            DT_FIFO => Self::Fifo,
            DT_SOCK => Self::Socket,
            DT_REG => Self::RegularFile,
            _ => Self::RegularFile,
        }
    }
}

/// Inode attributes handed to the host, with any uid/gid overrides
/// already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub kind: FileKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

/// One directory entry as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    /// Opaque resume offset for the next readdir call.
    pub offset: u64,
    pub kind: FileKind,
    pub name: Vec<u8>,
}

impl DirEntry {
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Filesystem-wide statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatfsInfo {
    pub block_size: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namelen: u32,
    pub fsid: u64,
    pub fs_type: u32,
}

/// The read-only operation surface consumed by the FUSE adapter.
pub trait FsOps: Send + Sync {
    fn getattr(&self, ino: u64) -> Result<InodeAttr>;
    fn lookup(&self, parent: u64, name: &OsStr) -> Result<InodeAttr>;
    fn readdir(&self, ino: u64, offset: u64) -> Result<Vec<DirEntry>>;
    fn read(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>>;
    fn readlink(&self, ino: u64) -> Result<Vec<u8>>;
    fn statfs(&self) -> Result<StatfsInfo>;
    fn listxattr(&self, ino: u64) -> Result<Vec<Vec<u8>>>;
    fn getxattr(&self, ino: u64, name: &OsStr) -> Result<Vec<u8>>;
}

/// Convert an on-disk nanosecond timestamp to `SystemTime`.
#[must_use]
pub(crate) fn timestamp(nanos: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_nanos(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_kind_from_mode() {
        assert_eq!(FileKind::from_mode(0o100_644), FileKind::RegularFile);
        assert_eq!(FileKind::from_mode(0o040_755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(0o120_777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(0o140_000), FileKind::Socket);
        assert_eq!(FileKind::from_mode(0), FileKind::RegularFile);
    }

    #[test]
    fn file_kind_from_dirent_type() {
        assert_eq!(FileKind::from_dirent_type(DT_DIR), FileKind::Directory);
        assert_eq!(FileKind::from_dirent_type(DT_REG), FileKind::RegularFile);
        assert_eq!(FileKind::from_dirent_type(DT_LNK), FileKind::Symlink);
        assert_eq!(FileKind::from_dirent_type(15), FileKind::RegularFile);
    }

    #[test]
    fn timestamp_is_epoch_relative() {
        assert_eq!(timestamp(0), SystemTime::UNIX_EPOCH);
        assert_eq!(
            timestamp(1_500_000_000)
                .duration_since(SystemTime::UNIX_EPOCH)
                .expect("after epoch"),
            Duration::from_nanos(1_500_000_000)
        );
    }
}

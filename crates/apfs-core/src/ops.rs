//! The `FsOps` implementation for a mounted volume.

use crate::inode::Inode;
use crate::mount::ApfsVolume;
use crate::{timestamp, DirEntry, FileKind, FsOps, InodeAttr, StatfsInfo};
use apfs_error::{ApfsError, Result};
use apfs_types::Cnid;
use std::ffi::OsStr;

impl ApfsVolume {
    /// Build host-facing attributes, applying any uid/gid overrides from
    /// the mount options.
    fn attr(&self, inode: &Inode) -> InodeAttr {
        InodeAttr {
            ino: inode.ino.0,
            size: inode.size,
            blocks: inode.alloced_size.div_ceil(512),
            atime: timestamp(inode.access_time),
            mtime: timestamp(inode.mod_time),
            ctime: timestamp(inode.change_time),
            crtime: timestamp(inode.create_time),
            kind: FileKind::from_mode(inode.mode),
            perm: inode.mode & 0o7777,
            nlink: inode.nlink(),
            uid: self.options.uid.unwrap_or(inode.uid),
            gid: self.options.gid.unwrap_or(inode.gid),
            rdev: 0,
            blksize: self.block_size().get(),
        }
    }
}

impl FsOps for ApfsVolume {
    fn getattr(&self, ino: u64) -> Result<InodeAttr> {
        let inode = self.read_inode(Cnid(ino))?;
        Ok(self.attr(&inode))
    }

    fn lookup(&self, parent: u64, name: &OsStr) -> Result<InodeAttr> {
        let parent = self.read_inode(Cnid(parent))?;
        let name = name.as_encoded_bytes();
        let drec = self.lookup_dirent(&parent, name)?;
        let inode = self.read_inode(drec.file_id)?;
        Ok(self.attr(&inode))
    }

    fn readdir(&self, ino: u64, offset: u64) -> Result<Vec<DirEntry>> {
        let dir = self.read_inode(Cnid(ino))?;
        self.read_dir(&dir, offset)
    }

    fn read(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let inode = self.read_inode(Cnid(ino))?;
        self.read_file(&inode, offset, size)
    }

    fn readlink(&self, ino: u64) -> Result<Vec<u8>> {
        let inode = self.read_inode(Cnid(ino))?;
        if FileKind::from_mode(inode.mode) != FileKind::Symlink {
            return Err(ApfsError::Invalid(format!("inode {ino:#x} is not a symlink")));
        }
        self.symlink_target(&inode)
    }

    fn statfs(&self) -> Result<StatfsInfo> {
        ApfsVolume::statfs(self)
    }

    fn listxattr(&self, ino: u64) -> Result<Vec<Vec<u8>>> {
        self.list_xattrs(Cnid(ino))
    }

    fn getxattr(&self, ino: u64, name: &OsStr) -> Result<Vec<u8>> {
        self.get_xattr(Cnid(ino), name.as_encoded_bytes())
    }
}

//! Inode records and the per-mount inode table.

use crate::extents::FileExtent;
use crate::mount::ApfsVolume;
use apfs_btree::{catalog_query, CatalogKey, LookupMode};
use apfs_error::{ApfsError, Result};
use apfs_ondisk::parse_inode_val;
use apfs_types::Cnid;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// A decoded inode plus its single-slot extent cache.
///
/// The cache mutex is held only across the compare and the write-back,
/// never across a B-tree query.
#[derive(Debug)]
pub struct Inode {
    pub ino: Cnid,
    pub parent: Cnid,
    /// Owner of the inode's data stream; file-extent keys carry this id.
    pub extent_id: u64,
    pub size: u64,
    pub alloced_size: u64,
    pub mode: u16,
    pub nchildren_or_nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub bsd_flags: u32,
    pub create_time: u64,
    pub mod_time: u64,
    pub change_time: u64,
    pub access_time: u64,
    pub(crate) cached_extent: Mutex<Option<FileExtent>>,
}

impl Inode {
    pub(crate) fn is_dir(&self) -> bool {
        crate::FileKind::from_mode(self.mode) == crate::FileKind::Directory
    }

    /// Link count as the host expects it: directories report their child
    /// count plus the `.` and `..` entries.
    pub(crate) fn nlink(&self) -> u32 {
        if self.is_dir() {
            self.nchildren_or_nlink.saturating_add(2)
        } else {
            self.nchildren_or_nlink.max(1)
        }
    }
}

impl ApfsVolume {
    /// Fetch an inode, reading its catalog record on a cache miss.
    pub fn read_inode(&self, ino: Cnid) -> Result<Arc<Inode>> {
        if let Some(inode) = self.inodes.read().get(&ino.0) {
            return Ok(Arc::clone(inode));
        }

        let found = catalog_query(
            &self.dev,
            &self.omap_root,
            &self.catalog_root,
            &CatalogKey::inode(ino.0),
            LookupMode::Exact,
        )
        .map_err(|e| match e {
            ApfsError::NotFound(_) => ApfsError::NotFound(format!("no inode record for {ino}")),
            other => other,
        })?;

        let val = parse_inode_val(found.val_bytes()).map_err(|e| ApfsError::Corruption {
            block: found.table.block().0,
            detail: format!("bad inode record for {ino}: {e}"),
        })?;

        let (size, alloced_size) = val
            .dstream
            .map_or((0, 0), |ds| (ds.size, ds.alloced_size));
        let inode = Arc::new(Inode {
            ino,
            parent: val.parent_id,
            extent_id: val.private_id,
            size,
            alloced_size,
            mode: val.mode,
            nchildren_or_nlink: val.nchildren_or_nlink,
            uid: val.owner,
            gid: val.group,
            bsd_flags: val.bsd_flags,
            create_time: val.create_time,
            mod_time: val.mod_time,
            change_time: val.change_time,
            access_time: val.access_time,
            cached_extent: Mutex::new(None),
        });
        trace!(target: "apfs::inode", ino = ino.0, size, mode = inode.mode, "inode read");

        // Two racing readers may both build the inode; the first insert
        // wins and both callers see the same Arc afterwards.
        let mut table = self.inodes.write();
        Ok(Arc::clone(
            table.entry(ino.0).or_insert(inode),
        ))
    }
}

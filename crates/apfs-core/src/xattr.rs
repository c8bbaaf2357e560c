//! Extended attributes and symlink targets.
//!
//! Only embedded attribute data is supported; attributes spilled to a
//! data stream are rejected rather than misread.

use crate::inode::Inode;
use crate::mount::ApfsVolume;
use apfs_btree::{catalog_query, walk_catalog_records, CatalogKey, LookupMode};
use apfs_error::{ApfsError, Result};
use apfs_ondisk::{parse_xattr_key, parse_xattr_val};
use apfs_types::{Cnid, APFS_TYPE_XATTR, SYMLINK_XATTR_NAME, XATTR_DATA_STREAM};

impl ApfsVolume {
    /// Names of every attribute on the object, in key order.
    pub(crate) fn list_xattrs(&self, ino: Cnid) -> Result<Vec<Vec<u8>>> {
        let mut names = Vec::new();
        walk_catalog_records(
            &self.dev,
            &self.omap_root,
            &self.catalog_root,
            &CatalogKey::range_start(ino.0, APFS_TYPE_XATTR),
            &CatalogKey::range_end(ino.0, APFS_TYPE_XATTR),
            &mut |key, _val| {
                let parsed = parse_xattr_key(key).map_err(|e| ApfsError::Corruption {
                    block: self.catalog_root.block().0,
                    detail: format!("bad xattr key on {ino}: {e}"),
                })?;
                names.push(parsed.name);
                Ok(true)
            },
        )?;
        Ok(names)
    }

    /// Fetch one attribute's embedded data.
    pub(crate) fn get_xattr(&self, ino: Cnid, name: &[u8]) -> Result<Vec<u8>> {
        let found = catalog_query(
            &self.dev,
            &self.omap_root,
            &self.catalog_root,
            &CatalogKey::xattr(ino.0, name),
            LookupMode::Exact,
        )
        .map_err(|e| match e {
            ApfsError::NotFound(_) => ApfsError::NotFound(format!(
                "no xattr {:?} on {ino}",
                String::from_utf8_lossy(name)
            )),
            other => other,
        })?;

        let val = parse_xattr_val(found.val_bytes()).map_err(|e| ApfsError::Corruption {
            block: found.table.block().0,
            detail: format!("bad xattr record on {ino}: {e}"),
        })?;

        if val.flags & XATTR_DATA_STREAM != 0 {
            return Err(ApfsError::Invalid(format!(
                "xattr {:?} on {ino} uses a data stream, which is not supported",
                String::from_utf8_lossy(name)
            )));
        }

        Ok(val.data)
    }

    /// A symlink's target path, stored in a well-known xattr.
    pub(crate) fn symlink_target(&self, inode: &Inode) -> Result<Vec<u8>> {
        let mut target = self.get_xattr(inode.ino, SYMLINK_XATTR_NAME.as_bytes())?;
        if target.last() == Some(&0) {
            target.pop();
        }
        Ok(target)
    }
}

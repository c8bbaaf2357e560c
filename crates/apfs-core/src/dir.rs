//! Directory lookup and enumeration over catalog `DIR_REC` records.

use crate::inode::Inode;
use crate::mount::ApfsVolume;
use crate::{DirEntry, FileKind};
use apfs_btree::{catalog_query, walk_catalog_records, CatalogKey, LookupMode};
use apfs_error::{ApfsError, Result};
use apfs_ondisk::{parse_drec_key, parse_drec_val, DrecVal};
use apfs_types::APFS_TYPE_DIR_REC;

impl ApfsVolume {
    /// Exact directory-entry lookup by name.
    pub(crate) fn lookup_dirent(&self, parent: &Inode, name: &[u8]) -> Result<DrecVal> {
        if !parent.is_dir() {
            return Err(ApfsError::NotDirectory);
        }

        let found = catalog_query(
            &self.dev,
            &self.omap_root,
            &self.catalog_root,
            &CatalogKey::dir_rec(parent.ino.0, name),
            LookupMode::Exact,
        )
        .map_err(|e| match e {
            ApfsError::NotFound(_) => ApfsError::NotFound(format!(
                "no entry {:?} in directory {}",
                String::from_utf8_lossy(name),
                parent.ino
            )),
            other => other,
        })?;

        parse_drec_val(found.val_bytes()).map_err(|e| ApfsError::Corruption {
            block: found.table.block().0,
            detail: format!("bad directory record in {}: {e}", parent.ino),
        })
    }

    /// Enumerate a directory from `offset` (an opaque resume cursor
    /// handed out in previous entries). `.` and `..` are synthesized at
    /// offsets 0 and 1.
    pub(crate) fn read_dir(&self, dir: &Inode, offset: u64) -> Result<Vec<DirEntry>> {
        if !dir.is_dir() {
            return Err(ApfsError::NotDirectory);
        }

        let mut entries = Vec::new();
        if offset == 0 {
            entries.push(DirEntry {
                ino: dir.ino.0,
                offset: 1,
                kind: FileKind::Directory,
                name: b".".to_vec(),
            });
        }
        if offset <= 1 {
            entries.push(DirEntry {
                ino: dir.parent.0.max(1),
                offset: 2,
                kind: FileKind::Directory,
                name: b"..".to_vec(),
            });
        }

        let mut cursor: u64 = 2;
        walk_catalog_records(
            &self.dev,
            &self.omap_root,
            &self.catalog_root,
            &CatalogKey::range_start(dir.ino.0, APFS_TYPE_DIR_REC),
            &CatalogKey::range_end(dir.ino.0, APFS_TYPE_DIR_REC),
            &mut |key, val| {
                let next = cursor + 1;
                if cursor >= offset.max(2) {
                    let drec_key = parse_drec_key(key).map_err(|e| ApfsError::Corruption {
                        block: self.catalog_root.block().0,
                        detail: format!("bad directory key in {}: {e}", dir.ino),
                    })?;
                    let drec_val = parse_drec_val(val).map_err(|e| ApfsError::Corruption {
                        block: self.catalog_root.block().0,
                        detail: format!("bad directory record in {}: {e}", dir.ino),
                    })?;
                    entries.push(DirEntry {
                        ino: drec_val.file_id.0,
                        offset: next,
                        kind: FileKind::from_dirent_type(drec_val.dt()),
                        name: drec_key.name,
                    });
                }
                cursor = next;
                Ok(true)
            },
        )?;

        Ok(entries)
    }
}

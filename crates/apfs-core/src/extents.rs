//! File-extent resolution: map an inode's logical block to a physical
//! device block, through the catalog with a per-inode single-slot cache.

use crate::inode::Inode;
use crate::mount::ApfsVolume;
use apfs_btree::{catalog_query, CatalogKey, LookupMode};
use apfs_error::{ApfsError, Result};
use apfs_ondisk::{
    parse_file_extent_key, parse_file_extent_val, parse_jkey_header, FILE_EXTENT_KEY_SIZE,
    FILE_EXTENT_VAL_SIZE,
};
use apfs_types::{Paddr, APFS_TYPE_FILE_EXTENT};
use tracing::{error, trace};

/// A decoded file extent: a contiguous logical byte run backed by a
/// contiguous physical block run (`phys_block_num == 0` marks a hole).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileExtent {
    pub logical_addr: u64,
    pub phys_block_num: Paddr,
    pub len: u64,
}

impl FileExtent {
    /// Whether this extent covers the given logical byte address.
    #[must_use]
    pub fn contains(&self, iaddr: u64) -> bool {
        iaddr >= self.logical_addr && iaddr - self.logical_addr < self.len
    }
}

/// What a logical block maps to, plus the number of contiguous bytes the
/// host may batch under the same extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMapping {
    Physical { block: Paddr, run_bytes: u64 },
    Hole { run_bytes: u64 },
}

impl ApfsVolume {
    /// Find the extent record covering `iaddr`, consulting and refreshing
    /// the inode's cache.
    ///
    /// Returns `None` when no extent covers the address (a sparse region
    /// past the last record). The cache lock is released across the
    /// catalog query; a racing reader may overwrite the slot with another
    /// valid extent, which is harmless.
    fn extent_read(&self, inode: &Inode, iaddr: u64) -> Result<Option<FileExtent>> {
        {
            let cache = inode.cached_extent.lock();
            if let Some(extent) = cache.filter(|e| e.contains(iaddr)) {
                trace!(target: "apfs::extents", ino = inode.ino.0, iaddr, "extent cache hit");
                return Ok(Some(extent));
            }
        }

        let found = match catalog_query(
            &self.dev,
            &self.omap_root,
            &self.catalog_root,
            &CatalogKey::file_extent(inode.extent_id, iaddr),
            LookupMode::LessOrEqual,
        ) {
            Ok(found) => found,
            Err(ApfsError::NotFound(_)) => return Ok(None),
            Err(other) => return Err(other),
        };

        // The nearest-lower record may belong to another object or type,
        // meaning nothing covers this address.
        let hdr = parse_jkey_header(found.key_bytes()).map_err(|e| ApfsError::Corruption {
            block: found.table.block().0,
            detail: e.to_string(),
        })?;
        if hdr.obj_id != inode.extent_id || hdr.kind != APFS_TYPE_FILE_EXTENT {
            return Ok(None);
        }

        if found.key_bytes().len() != FILE_EXTENT_KEY_SIZE
            || found.val_bytes().len() != FILE_EXTENT_VAL_SIZE
        {
            error!(
                target: "apfs::extents",
                ino = inode.ino.0,
                "bad extent record for inode {:#x}", inode.ino.0
            );
            return Err(ApfsError::Corruption {
                block: found.table.block().0,
                detail: format!("bad extent record for inode {}", inode.ino),
            });
        }

        let key = parse_file_extent_key(found.key_bytes()).map_err(|e| ApfsError::Corruption {
            block: found.table.block().0,
            detail: e.to_string(),
        })?;
        let val = parse_file_extent_val(found.val_bytes()).map_err(|e| ApfsError::Corruption {
            block: found.table.block().0,
            detail: e.to_string(),
        })?;

        // Extent length must be a positive multiple of the block size.
        let block_size = u64::from(self.block_size().get());
        let len = val.len();
        if len == 0 || len % block_size != 0 {
            error!(
                target: "apfs::extents",
                ino = inode.ino.0,
                len,
                "bad extent length for inode {:#x}", inode.ino.0
            );
            return Err(ApfsError::Corruption {
                block: found.table.block().0,
                detail: format!("bad extent length for inode {}", inode.ino),
            });
        }

        let extent = FileExtent {
            logical_addr: key.logical_addr,
            phys_block_num: val.phys_block_num,
            len,
        };

        if !extent.contains(iaddr) {
            // Nearest-lower landed on an earlier extent: sparse tail.
            return Ok(None);
        }

        *inode.cached_extent.lock() = Some(extent);
        trace!(
            target: "apfs::extents",
            ino = inode.ino.0,
            logical = extent.logical_addr,
            phys = extent.phys_block_num.0,
            len = extent.len,
            "extent cached"
        );
        Ok(Some(extent))
    }

    /// Map logical block `iblock` of `inode`, reporting up to
    /// `max_bytes` of contiguous coverage under the same extent.
    pub fn get_block(&self, inode: &Inode, iblock: u64, max_bytes: u64) -> Result<BlockMapping> {
        let bits = self.block_size().bits();
        let block_size = u64::from(self.block_size().get());
        let iaddr = iblock
            .checked_shl(bits)
            .filter(|addr| addr >> bits == iblock)
            .ok_or_else(|| {
                ApfsError::Invalid(format!("logical block {iblock} overflows the address space"))
            })?;

        let Some(extent) = self.extent_read(inode, iaddr)? else {
            return Ok(BlockMapping::Hole {
                run_bytes: max_bytes,
            });
        };

        // Block offset of iblock within the extent, and the bytes left
        // under it.
        let blk_off = iblock - (extent.logical_addr >> bits);
        let remaining = extent.len - blk_off * block_size;
        let run_bytes = remaining.min(max_bytes);

        if extent.phys_block_num == Paddr(0) {
            return Ok(BlockMapping::Hole { run_bytes });
        }

        let block = extent
            .phys_block_num
            .checked_add(blk_off)
            .ok_or_else(|| ApfsError::Corruption {
                block: extent.phys_block_num.0,
                detail: format!("extent physical range overflows for inode {}", inode.ino),
            })?;
        Ok(BlockMapping::Physical { block, run_bytes })
    }

    /// Read file bytes, zero-filling holes and clamping at the inode
    /// size.
    pub fn read_file(&self, inode: &Inode, offset: u64, size: u32) -> Result<Vec<u8>> {
        if inode.is_dir() {
            return Err(ApfsError::IsDirectory);
        }
        if offset >= inode.size {
            return Ok(Vec::new());
        }

        let block_size = u64::from(self.block_size().get());
        let want = u64::from(size).min(inode.size - offset);
        let mut out = vec![0_u8; usize::try_from(want).map_err(|_| {
            ApfsError::Invalid("read size overflows usize".to_owned())
        })?];

        let mut done: u64 = 0;
        while done < want {
            let pos = offset + done;
            let iblock = pos / block_size;
            let in_block = pos % block_size;
            let take = (block_size - in_block).min(want - done);

            match self.get_block(inode, iblock, block_size)? {
                BlockMapping::Hole { .. } => {
                    // Already zeroed.
                }
                BlockMapping::Physical { block, .. } => {
                    let buf = self.dev.read_block(block)?;
                    let src_start = usize::try_from(in_block)
                        .map_err(|_| ApfsError::Invalid("offset overflows usize".to_owned()))?;
                    let take_usize = usize::try_from(take)
                        .map_err(|_| ApfsError::Invalid("length overflows usize".to_owned()))?;
                    let dst_start = usize::try_from(done)
                        .map_err(|_| ApfsError::Invalid("offset overflows usize".to_owned()))?;
                    out[dst_start..dst_start + take_usize]
                        .copy_from_slice(&buf.as_slice()[src_start..src_start + take_usize]);
                }
            }
            done += take;
        }

        Ok(out)
    }
}

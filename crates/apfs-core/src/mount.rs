//! Mount bootstrap, teardown, and container-wide accounting.
//!
//! The bootstrap runs in fixed phases: map the container superblock
//! (probing at the default block size, then re-reading at the advertised
//! one), select the volume through the container omap, load the volume's
//! omap root and catalog root, and finally check the root directory
//! inode. Any failure unwinds everything acquired so far.

use crate::inode::Inode;
use crate::options::MountOptions;
use crate::StatfsInfo;
use apfs_block::{BlockBuf, BlockDevice, ByteBlockDevice, ByteDevice};
use apfs_btree::{omap_lookup, omap_read_table, walk_omap_records, Table};
use apfs_error::{ApfsError, Result};
use apfs_ondisk::{
    nx_fs_oid, parse_apfs_superblock, parse_nx_superblock, parse_omap_phys,
    verify_object_checksum, ApfsSuperblock, NxSuperblock, NX_FS_OID_OFFSET,
};
use apfs_types::{
    read_le_u64, BlockSize, Cnid, Oid, Paddr, APFS_SUPER_MAGIC, NX_BLOCK_NUM,
    NX_DEFAULT_BLOCK_SIZE,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A mounted volume: the two persistent tree roots plus the superblock
/// buffers they were derived from.
pub struct ApfsVolume {
    // Field order is the teardown order: catalog root, omap root, volume
    // superblock, container superblock (Rust drops fields in declaration
    // order).
    pub(crate) catalog_root: Table,
    pub(crate) omap_root: Table,
    pub(crate) volume_sb: ApfsSuperblock,
    #[allow(dead_code)] // held to keep the buffer resident for the mount's lifetime
    volume_sb_buf: BlockBuf,
    pub(crate) nx: NxSuperblock,
    #[allow(dead_code)] // held to keep the buffer resident for the mount's lifetime
    nx_buf: BlockBuf,
    pub(crate) dev: Arc<dyn BlockDevice>,
    pub(crate) options: MountOptions,
    pub(crate) inodes: RwLock<HashMap<u64, Arc<Inode>>>,
}

impl std::fmt::Debug for ApfsVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApfsVolume").finish_non_exhaustive()
    }
}

impl ApfsVolume {
    /// Mount one volume of the container on `dev`, read-only.
    pub fn mount<D: ByteDevice + 'static>(dev: D, options: MountOptions) -> Result<Self> {
        info!(target: "apfs::mount", vol = options.vol, "mounting read-only");

        // Phase 1: map the container superblock. Probe at the default
        // block size, then re-read at the advertised size if it differs.
        let probe_size = BlockSize::new(NX_DEFAULT_BLOCK_SIZE).expect("default block size");
        let blocks = ByteBlockDevice::new(dev, probe_size)?;
        let mut nx_buf = blocks.read_block(Paddr(NX_BLOCK_NUM))?;
        let mut nx = parse_nx_superblock(nx_buf.as_slice())
            .map_err(|e| ApfsError::Invalid(format!("not an apfs container: {e}")))?;

        let blocks = if nx.block_size == probe_size {
            blocks
        } else {
            let blocks = blocks.with_block_size(nx.block_size)?;
            nx_buf = blocks.read_block(Paddr(NX_BLOCK_NUM))?;
            nx = parse_nx_superblock(nx_buf.as_slice())
                .map_err(|e| ApfsError::Invalid(format!("not an apfs container: {e}")))?;
            blocks
        };

        verify_object_checksum(nx_buf.as_slice()).map_err(|_| ApfsError::Corruption {
            block: NX_BLOCK_NUM,
            detail: "inconsistent container superblock".to_owned(),
        })?;
        debug!(
            target: "apfs::mount",
            block_size = nx.block_size.get(),
            block_count = nx.block_count,
            "container superblock mapped"
        );

        let dev: Arc<dyn BlockDevice> = Arc::new(blocks);

        // Phase 2: map the volume superblock for the requested index.
        let (volume_sb, volume_sb_buf) = map_volume_super(&dev, &nx, nx_buf.as_slice(), options.vol)?;

        // Phase 3: the volume's omap root.
        let omap_root = read_volume_omap(&dev, &volume_sb)?;

        // Phase 4: the catalog root, a virtual oid resolved through the
        // volume omap.
        let catalog_root = omap_read_table(&dev, &omap_root, volume_sb.root_tree_oid)?;

        let volume = Self {
            catalog_root,
            omap_root,
            volume_sb,
            volume_sb_buf,
            nx,
            nx_buf,
            options,
            dev,
            inodes: RwLock::new(HashMap::new()),
        };

        // Phase 5: the root directory must exist before the mount is
        // handed to the host.
        volume.read_inode(Cnid::ROOT_DIR)?;

        info!(
            target: "apfs::mount",
            volume = %volume.volume_sb.volname,
            files = volume.volume_sb.num_files,
            "mounted"
        );
        Ok(volume)
    }

    /// The parsed container superblock.
    #[must_use]
    pub fn container_sb(&self) -> &NxSuperblock {
        &self.nx
    }

    /// The parsed superblock of the mounted volume.
    #[must_use]
    pub fn volume_sb(&self) -> &ApfsSuperblock {
        &self.volume_sb
    }

    #[must_use]
    pub fn mount_options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.dev.block_size()
    }

    /// Blocks in use across every volume of the container: walk the
    /// container omap tree and sum each volume superblock's allocation
    /// count.
    pub fn count_used_blocks(&self) -> Result<u64> {
        let omap_buf = self.dev.read_block(self.nx.omap_oid)?;
        let omap = parse_omap_phys(omap_buf.as_slice()).map_err(|e| ApfsError::Corruption {
            block: self.nx.omap_oid.0,
            detail: e.to_string(),
        })?;
        let tree = Table::open(&self.dev, omap.tree_oid, None)?;

        let mut count: u64 = 0;
        walk_omap_records(&self.dev, &tree, &mut |_key, val| {
            if val.len() != 16 {
                return Err(ApfsError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad index in volume block: value length {}", val.len()),
                )));
            }
            // The volume superblock's block number sits in the second
            // eight bytes of the record value.
            let vsb = Paddr(read_le_u64(val, 8).map_err(|e| ApfsError::Corruption {
                block: tree.block().0,
                detail: e.to_string(),
            })?);
            let buf = self.dev.read_block(vsb)?;
            let sb = parse_apfs_superblock(buf.as_slice()).map_err(|e| ApfsError::Corruption {
                block: vsb.0,
                detail: e.to_string(),
            })?;
            count = count.saturating_add(sb.fs_alloc_count);
            Ok(true)
        })?;

        Ok(count)
    }

    /// Filesystem statistics. Free space is container-wide; the file
    /// count covers only the mounted volume.
    pub fn statfs(&self) -> Result<StatfsInfo> {
        let blocks = self.nx.block_count;
        let used = self.count_used_blocks()?;
        let bfree = blocks.saturating_sub(used);

        Ok(StatfsInfo {
            block_size: self.block_size().get(),
            blocks,
            bfree,
            bavail: bfree,
            files: self.volume_sb.total_objects(),
            ffree: 0,
            namelen: 255,
            fsid: self.volume_sb.fsid(),
            fs_type: APFS_SUPER_MAGIC,
        })
    }
}

/// Locate and map the volume superblock for `vol_index`.
fn map_volume_super(
    dev: &Arc<dyn BlockDevice>,
    nx: &NxSuperblock,
    nx_raw: &[u8],
    vol_index: u32,
) -> Result<(ApfsSuperblock, BlockBuf)> {
    // The fs_oid slot must fit inside the one-block superblock; past that
    // there is no such volume, and no omap read is attempted.
    let slot_end = NX_FS_OID_OFFSET as u64 + 8 * (u64::from(vol_index) + 1);
    if slot_end > u64::from(nx.block_size.get()) {
        return Err(ApfsError::Invalid(format!(
            "volume number {vol_index} out of range"
        )));
    }

    let vol_oid = nx_fs_oid(nx_raw, vol_index).map_err(|e| ApfsError::Corruption {
        block: NX_BLOCK_NUM,
        detail: e.to_string(),
    })?;
    if vol_oid == Oid::INVALID {
        return Err(ApfsError::Invalid(format!(
            "requested volume {vol_index} does not exist"
        )));
    }

    // Container omap: descriptor block, then its tree root.
    let omap_buf = dev.read_block(nx.omap_oid)?;
    let omap = parse_omap_phys(omap_buf.as_slice()).map_err(|e| ApfsError::Corruption {
        block: nx.omap_oid.0,
        detail: e.to_string(),
    })?;
    let tree = Table::open(dev, omap.tree_oid, None)?;

    let vsb = omap_lookup(dev, &tree, vol_oid).map_err(|e| match e {
        ApfsError::NotFound(_) => ApfsError::Corruption {
            block: tree.block().0,
            detail: format!("volume oid {vol_oid} not in the container omap"),
        },
        other => other,
    })?;

    let buf = dev.read_block(vsb)?;
    let sb = parse_apfs_superblock(buf.as_slice()).map_err(|e| ApfsError::Invalid(format!(
        "bad volume superblock at block {vsb}: {e}"
    )))?;
    verify_object_checksum(buf.as_slice()).map_err(|_| ApfsError::Corruption {
        block: vsb.0,
        detail: "inconsistent volume superblock".to_owned(),
    })?;

    debug!(target: "apfs::mount", volume = %sb.volname, block = vsb.0, "volume superblock mapped");
    Ok((sb, buf))
}

/// Open the volume's omap tree root.
fn read_volume_omap(dev: &Arc<dyn BlockDevice>, sb: &ApfsSuperblock) -> Result<Table> {
    let omap_buf = dev.read_block(sb.omap_oid)?;
    let omap = parse_omap_phys(omap_buf.as_slice()).map_err(|e| ApfsError::Corruption {
        block: sb.omap_oid.0,
        detail: e.to_string(),
    })?;
    Table::open(dev, omap.tree_oid, None)
}

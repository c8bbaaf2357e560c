#![forbid(unsafe_code)]
//! Synthetic APFS containers for end-to-end testing.
//!
//! `ImageBuilder` emits a valid, checksummed container image in memory:
//! container superblock, container omap, one or more volumes, each with
//! its own omap, catalog tree (optionally multi-level), file content
//! blocks, and whatever corruption a test asks for. The layout follows
//! the same on-disk rules the reader enforces, so every byte placed here
//! is exercised through the real parsing paths.

use anyhow::{bail, ensure, Context, Result};
use apfs_block::ByteDevice;
use apfs_btree::CatalogKey;
use apfs_ondisk::{
    jkey_header_word, seal_object_checksum, BTNODE_FIXED_KV_SIZE, BTNODE_LEAF, BTNODE_ROOT,
    NX_FS_OID_OFFSET,
};
use apfs_types::{
    drec_hash, Cnid, APFS_TYPE_DIR_REC, APFS_TYPE_FILE_EXTENT, APFS_TYPE_INODE,
    APFS_TYPE_XATTR, DT_DIR, DT_LNK, DT_REG, S_IFDIR, S_IFLNK, S_IFREG, SYMLINK_XATTR_NAME,
    XATTR_DATA_EMBEDDED,
};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Metadata, Subscriber};

mod nodes;

use nodes::{build_node, NodeSpec};

/// Well-known timestamp used for all synthesized inodes (ns since epoch).
pub const BUILD_TIME_NS: u64 = 1_600_000_000_000_000_000;

const FS_OID_BASE: u64 = 0x402;
const CATALOG_ROOT_OID_BASE: u64 = 0x700;
const CATALOG_LEAF_OID_BASE: u64 = 0x7000;

/// Where file-content blocks start when the builder allocates them.
const DATA_START_BLOCK: u64 = 256;

// ── Volume description ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExtentSpec {
    pub logical_addr: u64,
    pub phys_block_num: u64,
    /// Raw `len_and_flags` word; normally a block-multiple byte length.
    pub len_and_flags: u64,
}

#[derive(Debug, Clone)]
enum FileData {
    /// Content the builder materializes into allocated blocks.
    Bytes(Vec<u8>),
    /// Explicit extents and logical size, for holes and corruption.
    Extents { size: u64, extents: Vec<ExtentSpec> },
}

#[derive(Debug, Clone)]
struct FileSpec {
    ino: u64,
    parent: u64,
    name: Vec<u8>,
    data: FileData,
    uid: u32,
    gid: u32,
}

#[derive(Debug, Clone)]
struct DirSpec {
    ino: u64,
    parent: u64,
    name: Vec<u8>,
}

#[derive(Debug, Clone)]
struct SymlinkSpec {
    ino: u64,
    parent: u64,
    name: Vec<u8>,
    target: Vec<u8>,
}

/// One volume being assembled.
#[derive(Debug)]
pub struct VolumeBuilder {
    name: String,
    uuid: [u8; 16],
    alloc_count: u64,
    files: Vec<FileSpec>,
    dirs: Vec<DirSpec>,
    symlinks: Vec<SymlinkSpec>,
    xattrs: Vec<(u64, Vec<u8>, Vec<u8>)>,
    raw_records: Vec<(Vec<u8>, Vec<u8>)>,
    /// When set, catalog leaves hold at most this many records and the
    /// tree gets an internal root.
    leaf_capacity: Option<usize>,
}

impl VolumeBuilder {
    fn new(name: &str, index: u32) -> Self {
        let mut uuid = [0_u8; 16];
        uuid[0] = 0xA0 + index as u8;
        uuid[15] = index as u8;
        Self {
            name: name.to_owned(),
            uuid,
            alloc_count: 1,
            files: Vec::new(),
            dirs: Vec::new(),
            symlinks: Vec::new(),
            xattrs: Vec::new(),
            raw_records: Vec::new(),
            leaf_capacity: None,
        }
    }

    pub fn alloc_count(&mut self, count: u64) -> &mut Self {
        self.alloc_count = count;
        self
    }

    pub fn uuid(&mut self, uuid: [u8; 16]) -> &mut Self {
        self.uuid = uuid;
        self
    }

    /// Cap catalog leaf fan-out, forcing a two-level tree.
    pub fn leaf_capacity(&mut self, capacity: usize) -> &mut Self {
        self.leaf_capacity = Some(capacity);
        self
    }

    /// Add a regular file whose content blocks the builder allocates.
    pub fn file(&mut self, ino: u64, parent: u64, name: &str, content: &[u8]) -> &mut Self {
        self.files.push(FileSpec {
            ino,
            parent,
            name: name.as_bytes().to_vec(),
            data: FileData::Bytes(content.to_vec()),
            uid: 501,
            gid: 20,
        });
        self
    }

    /// Add a regular file with hand-placed extents (holes, corruption).
    pub fn file_with_extents(
        &mut self,
        ino: u64,
        parent: u64,
        name: &str,
        size: u64,
        extents: &[ExtentSpec],
    ) -> &mut Self {
        self.files.push(FileSpec {
            ino,
            parent,
            name: name.as_bytes().to_vec(),
            data: FileData::Extents {
                size,
                extents: extents.to_vec(),
            },
            uid: 501,
            gid: 20,
        });
        self
    }

    /// Add a subdirectory.
    pub fn dir(&mut self, ino: u64, parent: u64, name: &str) -> &mut Self {
        self.dirs.push(DirSpec {
            ino,
            parent,
            name: name.as_bytes().to_vec(),
        });
        self
    }

    /// Add a symlink (target stored in the well-known xattr).
    pub fn symlink(&mut self, ino: u64, parent: u64, name: &str, target: &str) -> &mut Self {
        self.symlinks.push(SymlinkSpec {
            ino,
            parent,
            name: name.as_bytes().to_vec(),
            target: target.as_bytes().to_vec(),
        });
        self
    }

    /// Attach an embedded xattr to an object.
    pub fn xattr(&mut self, ino: u64, name: &str, data: &[u8]) -> &mut Self {
        self.xattrs
            .push((ino, name.as_bytes().to_vec(), data.to_vec()));
        self
    }

    /// Inject a raw catalog record, bypassing the typed builders.
    pub fn raw_record(&mut self, key: Vec<u8>, val: Vec<u8>) -> &mut Self {
        self.raw_records.push((key, val));
        self
    }

    fn object_counts(&self) -> (u64, u64, u64, u64) {
        (
            self.files.len() as u64,
            self.dirs.len() as u64 + 1, // the root directory
            self.symlinks.len() as u64,
            0,
        )
    }

    fn children_of(&self, ino: u64) -> u32 {
        let mut count = 0_u32;
        count += self.files.iter().filter(|f| f.parent == ino).count() as u32;
        count += self.dirs.iter().filter(|d| d.parent == ino).count() as u32;
        count += self.symlinks.iter().filter(|s| s.parent == ino).count() as u32;
        count
    }
}

// ── Record encoding helpers ─────────────────────────────────────────────────

fn inode_key(ino: u64) -> Vec<u8> {
    jkey_header_word(ino, APFS_TYPE_INODE).to_le_bytes().to_vec()
}

fn drec_key(parent: u64, name: &[u8]) -> Vec<u8> {
    let mut key = jkey_header_word(parent, APFS_TYPE_DIR_REC)
        .to_le_bytes()
        .to_vec();
    key.extend_from_slice(&drec_hash(name).to_le_bytes());
    key.extend_from_slice(name);
    key.push(0);
    key
}

fn extent_key(extent_id: u64, logical_addr: u64) -> Vec<u8> {
    let mut key = jkey_header_word(extent_id, APFS_TYPE_FILE_EXTENT)
        .to_le_bytes()
        .to_vec();
    key.extend_from_slice(&logical_addr.to_le_bytes());
    key
}

fn xattr_key(ino: u64, name: &[u8]) -> Vec<u8> {
    let mut key = jkey_header_word(ino, APFS_TYPE_XATTR)
        .to_le_bytes()
        .to_vec();
    key.extend_from_slice(&((name.len() as u16) + 1).to_le_bytes());
    key.extend_from_slice(name);
    key.push(0);
    key
}

fn extent_val(spec: &ExtentSpec) -> Vec<u8> {
    let mut val = Vec::with_capacity(24);
    val.extend_from_slice(&spec.len_and_flags.to_le_bytes());
    val.extend_from_slice(&spec.phys_block_num.to_le_bytes());
    val.extend_from_slice(&0_u64.to_le_bytes());
    val
}

fn drec_val(file_id: u64, dt: u16) -> Vec<u8> {
    let mut val = Vec::with_capacity(18);
    val.extend_from_slice(&file_id.to_le_bytes());
    val.extend_from_slice(&BUILD_TIME_NS.to_le_bytes());
    val.extend_from_slice(&dt.to_le_bytes());
    val
}

fn xattr_val(data: &[u8]) -> Vec<u8> {
    let mut val = Vec::new();
    val.extend_from_slice(&XATTR_DATA_EMBEDDED.to_le_bytes());
    val.extend_from_slice(&(data.len() as u16).to_le_bytes());
    val.extend_from_slice(data);
    val
}

struct InodeParams<'a> {
    parent: u64,
    mode: u16,
    nchildren_or_nlink: u32,
    uid: u32,
    gid: u32,
    /// (logical size, allocated size); emits the dstream xfield.
    dstream: Option<(u64, u64)>,
    name: Option<&'a [u8]>,
}

fn inode_val(ino: u64, params: &InodeParams<'_>) -> Vec<u8> {
    let mut raw = vec![0_u8; 92];
    raw[0..8].copy_from_slice(&params.parent.to_le_bytes());
    raw[8..16].copy_from_slice(&ino.to_le_bytes()); // private_id
    raw[16..24].copy_from_slice(&BUILD_TIME_NS.to_le_bytes());
    raw[24..32].copy_from_slice(&BUILD_TIME_NS.to_le_bytes());
    raw[32..40].copy_from_slice(&BUILD_TIME_NS.to_le_bytes());
    raw[40..48].copy_from_slice(&BUILD_TIME_NS.to_le_bytes());
    raw[56..60].copy_from_slice(&params.nchildren_or_nlink.to_le_bytes());
    raw[72..76].copy_from_slice(&params.uid.to_le_bytes());
    raw[76..80].copy_from_slice(&params.gid.to_le_bytes());
    raw[80..82].copy_from_slice(&params.mode.to_le_bytes());

    // Xfield blob: optional name (type 4), optional dstream (type 8),
    // payloads 8-byte aligned.
    let mut descriptors = Vec::new();
    let mut payloads: Vec<Vec<u8>> = Vec::new();
    if let Some(name) = params.name {
        let mut data = name.to_vec();
        data.push(0);
        descriptors.push((4_u8, data.len() as u16));
        payloads.push(data);
    }
    if let Some((size, alloced)) = params.dstream {
        let mut data = vec![0_u8; 40];
        data[0..8].copy_from_slice(&size.to_le_bytes());
        data[8..16].copy_from_slice(&alloced.to_le_bytes());
        descriptors.push((8_u8, 40_u16));
        payloads.push(data);
    }

    if !descriptors.is_empty() {
        raw.extend_from_slice(&(descriptors.len() as u16).to_le_bytes());
        let used: usize = payloads.iter().map(|p| p.len().div_ceil(8) * 8).sum();
        raw.extend_from_slice(&(used as u16).to_le_bytes());
        for (xtype, size) in &descriptors {
            raw.push(*xtype);
            raw.push(0);
            raw.extend_from_slice(&size.to_le_bytes());
        }
        for payload in &payloads {
            let padded = payload.len().div_ceil(8) * 8;
            raw.extend_from_slice(payload);
            raw.extend(std::iter::repeat(0).take(padded - payload.len()));
        }
    }

    raw
}

/// Omap leaves are searched by (oid, xid); keep builder output sorted.
fn sort_omap_records(records: &mut [(Vec<u8>, Vec<u8>)]) {
    records.sort_by_key(|(key, _)| {
        let oid = u64::from_le_bytes(key[0..8].try_into().expect("omap key oid"));
        let xid = u64::from_le_bytes(key[8..16].try_into().expect("omap key xid"));
        (oid, xid)
    });
}

fn omap_record(oid: u64, xid: u64, paddr: u64) -> (Vec<u8>, Vec<u8>) {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&oid.to_le_bytes());
    key.extend_from_slice(&xid.to_le_bytes());
    let mut val = vec![0_u8; 16];
    val[8..16].copy_from_slice(&paddr.to_le_bytes());
    (key, val)
}

// ── Image builder ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ImageBuilder {
    block_size: u32,
    block_count: u64,
    /// `nx_block_count` as written to disk; defaults to `block_count`.
    declared_block_count: Option<u64>,
    volumes: Vec<VolumeBuilder>,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            declared_block_count: None,
            volumes: Vec::new(),
        }
    }

    /// Override the container's advertised block count.
    pub fn declared_block_count(&mut self, count: u64) -> &mut Self {
        self.declared_block_count = Some(count);
        self
    }

    /// Add a volume and configure it through the returned builder.
    pub fn volume(&mut self, name: &str) -> &mut VolumeBuilder {
        let index = self.volumes.len() as u32;
        self.volumes.push(VolumeBuilder::new(name, index));
        self.volumes.last_mut().expect("just pushed")
    }

    /// Re-borrow a previously added volume by index.
    pub fn volume_at(&mut self, index: usize) -> &mut VolumeBuilder {
        &mut self.volumes[index]
    }

    /// Serialize the container image.
    pub fn build(&self) -> Result<Vec<u8>> {
        ensure!(!self.volumes.is_empty(), "image needs at least one volume");
        let bs = self.block_size as usize;
        let mut image = vec![0_u8; bs * usize::try_from(self.block_count).context("image size")?];
        let mut place = |paddr: u64, block: Vec<u8>| -> Result<()> {
            ensure!(block.len() == bs, "block is not block-sized");
            ensure!(paddr < self.block_count, "paddr {paddr} outside the image");
            let start = usize::try_from(paddr).context("paddr")? * bs;
            image[start..start + bs].copy_from_slice(&block);
            Ok(())
        };

        let mut next_meta: u64 = 1;
        let mut alloc_meta = || {
            let block = next_meta;
            next_meta += 1;
            block
        };

        let container_omap_phys = alloc_meta();
        let container_omap_root = alloc_meta();

        // Per-volume metadata blocks and trees.
        let mut container_omap_records = Vec::new();
        let mut next_data = DATA_START_BLOCK;
        for (index, vol) in self.volumes.iter().enumerate() {
            let vsb_block = alloc_meta();
            let omap_phys_block = alloc_meta();
            let omap_root_block = alloc_meta();

            let fs_oid = FS_OID_BASE + index as u64;
            container_omap_records.push(omap_record(fs_oid, 1, vsb_block));

            // Assemble and sort the volume's catalog records.
            let records = self.catalog_records(vol, &mut next_data, &mut place)?;
            let catalog_root_oid = CATALOG_ROOT_OID_BASE + 0x10 * index as u64;
            let mut vol_omap_records = Vec::new();

            let catalog_nodes = self.catalog_nodes(
                vol,
                records,
                catalog_root_oid,
                CATALOG_LEAF_OID_BASE + 0x100 * index as u64,
                &mut alloc_meta,
                &mut vol_omap_records,
            )?;
            for (paddr, node) in catalog_nodes {
                place(paddr, node)?;
            }

            // Volume omap tree (single fixed-kv leaf root).
            sort_omap_records(&mut vol_omap_records);
            place(
                omap_root_block,
                build_node(&NodeSpec {
                    block_size: bs,
                    flags: BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE,
                    level: 0,
                    oid: omap_root_block,
                    entries: vol_omap_records,
                    fixed: Some((16, 16)),
                })?,
            )?;
            place(omap_phys_block, self.omap_phys_block(omap_phys_block, omap_root_block))?;
            place(vsb_block, self.volume_superblock(vol, vsb_block, omap_phys_block, catalog_root_oid))?;
        }

        // Container omap tree over all volumes.
        sort_omap_records(&mut container_omap_records);
        place(
            container_omap_root,
            build_node(&NodeSpec {
                block_size: bs,
                flags: BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE,
                level: 0,
                oid: container_omap_root,
                entries: container_omap_records,
                fixed: Some((16, 16)),
            })?,
        )?;
        place(container_omap_phys, self.omap_phys_block(container_omap_phys, container_omap_root))?;
        place(0, self.container_superblock(container_omap_phys))?;

        Ok(image)
    }

    /// All catalog records of a volume, sorted by on-disk key order.
    fn catalog_records(
        &self,
        vol: &VolumeBuilder,
        next_data: &mut u64,
        place: &mut dyn FnMut(u64, Vec<u8>) -> Result<()>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let bs = self.block_size as u64;
        let mut records = Vec::new();

        // Root directory (ino 2, parent 1 by convention).
        records.push((
            inode_key(Cnid::ROOT_DIR.0),
            inode_val(
                Cnid::ROOT_DIR.0,
                &InodeParams {
                    parent: 1,
                    mode: S_IFDIR | 0o755,
                    nchildren_or_nlink: vol.children_of(Cnid::ROOT_DIR.0),
                    uid: 0,
                    gid: 0,
                    dstream: None,
                    name: Some(b"root".as_slice()),
                },
            ),
        ));

        for dir in &vol.dirs {
            records.push((
                inode_key(dir.ino),
                inode_val(
                    dir.ino,
                    &InodeParams {
                        parent: dir.parent,
                        mode: S_IFDIR | 0o755,
                        nchildren_or_nlink: vol.children_of(dir.ino),
                        uid: 501,
                        gid: 20,
                        dstream: None,
                        name: Some(&dir.name),
                    },
                ),
            ));
            records.push((drec_key(dir.parent, &dir.name), drec_val(dir.ino, DT_DIR)));
        }

        for file in &vol.files {
            let (size, alloced, extents) = match &file.data {
                FileData::Bytes(content) => {
                    let blocks = (content.len() as u64).div_ceil(bs).max(1);
                    let phys = *next_data;
                    *next_data += blocks;
                    for i in 0..blocks {
                        let mut block = vec![0_u8; bs as usize];
                        let start = (i * bs) as usize;
                        let end = content.len().min(start + bs as usize);
                        if start < content.len() {
                            block[..end - start].copy_from_slice(&content[start..end]);
                        }
                        place(phys + i, block)?;
                    }
                    (
                        content.len() as u64,
                        blocks * bs,
                        vec![ExtentSpec {
                            logical_addr: 0,
                            phys_block_num: phys,
                            len_and_flags: blocks * bs,
                        }],
                    )
                }
                FileData::Extents { size, extents } => {
                    let alloced: u64 = extents
                        .iter()
                        .map(|e| e.len_and_flags & apfs_types::FILE_EXTENT_LEN_MASK)
                        .sum();
                    (*size, alloced, extents.clone())
                }
            };

            records.push((
                inode_key(file.ino),
                inode_val(
                    file.ino,
                    &InodeParams {
                        parent: file.parent,
                        mode: S_IFREG | 0o644,
                        nchildren_or_nlink: 1,
                        uid: file.uid,
                        gid: file.gid,
                        dstream: Some((size, alloced)),
                        name: Some(&file.name),
                    },
                ),
            ));
            records.push((drec_key(file.parent, &file.name), drec_val(file.ino, DT_REG)));
            for extent in &extents {
                records.push((
                    extent_key(file.ino, extent.logical_addr),
                    extent_val(extent),
                ));
            }
        }

        for link in &vol.symlinks {
            records.push((
                inode_key(link.ino),
                inode_val(
                    link.ino,
                    &InodeParams {
                        parent: link.parent,
                        mode: S_IFLNK | 0o777,
                        nchildren_or_nlink: 1,
                        uid: 501,
                        gid: 20,
                        dstream: None,
                        name: Some(&link.name),
                    },
                ),
            ));
            records.push((drec_key(link.parent, &link.name), drec_val(link.ino, DT_LNK)));
            let mut target = link.target.clone();
            target.push(0);
            records.push((
                xattr_key(link.ino, SYMLINK_XATTR_NAME.as_bytes()),
                xattr_val(&target),
            ));
        }

        for (ino, name, data) in &vol.xattrs {
            records.push((xattr_key(*ino, name), xattr_val(data)));
        }

        records.extend(vol.raw_records.iter().cloned());

        records.sort_by(|a, b| {
            match (CatalogKey::parse(&a.0), CatalogKey::parse(&b.0)) {
                (Ok(ka), Ok(kb)) => ka.cmp(&kb),
                // Injected raw records may not parse; keep the order total.
                _ => a.0.cmp(&b.0),
            }
        });
        Ok(records)
    }

    /// Serialize the catalog as one root leaf, or as leaves under an
    /// internal root when a leaf capacity is set. Returns placed nodes
    /// and appends the virtual-oid mappings to the volume omap.
    fn catalog_nodes(
        &self,
        vol: &VolumeBuilder,
        records: Vec<(Vec<u8>, Vec<u8>)>,
        root_oid: u64,
        leaf_oid_base: u64,
        alloc_meta: &mut dyn FnMut() -> u64,
        omap_records: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<Vec<(u64, Vec<u8>)>> {
        let bs = self.block_size as usize;
        let mut nodes = Vec::new();

        let capacity = vol.leaf_capacity.unwrap_or(usize::MAX);
        if records.len() <= capacity {
            let paddr = alloc_meta();
            omap_records.push(omap_record(root_oid, 1, paddr));
            nodes.push((
                paddr,
                build_node(&NodeSpec {
                    block_size: bs,
                    flags: BTNODE_ROOT | BTNODE_LEAF,
                    level: 0,
                    oid: root_oid,
                    entries: records,
                    fixed: None,
                })?,
            ));
            return Ok(nodes);
        }

        if capacity == 0 {
            bail!("leaf capacity must be positive");
        }

        let mut root_entries = Vec::new();
        for (i, chunk) in records.chunks(capacity).enumerate() {
            let leaf_oid = leaf_oid_base + i as u64;
            let paddr = alloc_meta();
            omap_records.push(omap_record(leaf_oid, 1, paddr));
            root_entries.push((chunk[0].0.clone(), leaf_oid.to_le_bytes().to_vec()));
            nodes.push((
                paddr,
                build_node(&NodeSpec {
                    block_size: bs,
                    flags: BTNODE_LEAF,
                    level: 0,
                    oid: leaf_oid,
                    entries: chunk.to_vec(),
                    fixed: None,
                })?,
            ));
        }

        let root_paddr = alloc_meta();
        omap_records.push(omap_record(root_oid, 1, root_paddr));
        nodes.push((
            root_paddr,
            build_node(&NodeSpec {
                block_size: bs,
                flags: BTNODE_ROOT,
                level: 1,
                oid: root_oid,
                entries: root_entries,
                fixed: None,
            })?,
        ));
        Ok(nodes)
    }

    fn container_superblock(&self, omap_phys: u64) -> Vec<u8> {
        let bs = self.block_size as usize;
        let mut block = vec![0_u8; bs];
        block[0x08..0x10].copy_from_slice(&1_u64.to_le_bytes()); // oid
        block[0x10..0x18].copy_from_slice(&1_u64.to_le_bytes()); // xid
        block[0x18..0x1C].copy_from_slice(&1_u32.to_le_bytes()); // NX type
        block[0x20..0x24].copy_from_slice(b"NXSB");
        block[0x24..0x28].copy_from_slice(&self.block_size.to_le_bytes());
        block[0x28..0x30].copy_from_slice(
            &self
                .declared_block_count
                .unwrap_or(self.block_count)
                .to_le_bytes(),
        );
        block[0x48] = 0xC0; // container uuid, first byte
        block[0xA0..0xA8].copy_from_slice(&omap_phys.to_le_bytes());
        block[0xB4..0xB8].copy_from_slice(&(self.volumes.len() as u32).to_le_bytes());
        for (i, _) in self.volumes.iter().enumerate() {
            let slot = NX_FS_OID_OFFSET + 8 * i;
            block[slot..slot + 8].copy_from_slice(&(FS_OID_BASE + i as u64).to_le_bytes());
        }
        seal_object_checksum(&mut block).expect("seal container superblock");
        block
    }

    fn volume_superblock(
        &self,
        vol: &VolumeBuilder,
        paddr: u64,
        omap_phys: u64,
        root_tree_oid: u64,
    ) -> Vec<u8> {
        let (files, dirs, symlinks, other) = vol.object_counts();
        let bs = self.block_size as usize;
        let mut block = vec![0_u8; bs];
        block[0x08..0x10].copy_from_slice(&paddr.to_le_bytes());
        block[0x10..0x18].copy_from_slice(&1_u64.to_le_bytes());
        block[0x18..0x1C].copy_from_slice(&13_u32.to_le_bytes()); // FS type
        block[0x20..0x24].copy_from_slice(b"APSB");
        block[0x58..0x60].copy_from_slice(&vol.alloc_count.to_le_bytes());
        block[0x80..0x88].copy_from_slice(&omap_phys.to_le_bytes());
        block[0x88..0x90].copy_from_slice(&root_tree_oid.to_le_bytes());
        block[0xB8..0xC0].copy_from_slice(&files.to_le_bytes());
        block[0xC0..0xC8].copy_from_slice(&dirs.to_le_bytes());
        block[0xC8..0xD0].copy_from_slice(&symlinks.to_le_bytes());
        block[0xD0..0xD8].copy_from_slice(&other.to_le_bytes());
        block[0xF0..0x100].copy_from_slice(&vol.uuid);
        let name = vol.name.as_bytes();
        let len = name.len().min(255);
        block[0x2C0..0x2C0 + len].copy_from_slice(&name[..len]);
        seal_object_checksum(&mut block).expect("seal volume superblock");
        block
    }

    fn omap_phys_block(&self, paddr: u64, tree_root: u64) -> Vec<u8> {
        let bs = self.block_size as usize;
        let mut block = vec![0_u8; bs];
        block[0x08..0x10].copy_from_slice(&paddr.to_le_bytes());
        block[0x10..0x18].copy_from_slice(&1_u64.to_le_bytes());
        block[0x18..0x1C].copy_from_slice(&11_u32.to_le_bytes()); // OMAP type
        block[0x30..0x38].copy_from_slice(&tree_root.to_le_bytes());
        seal_object_checksum(&mut block).expect("seal omap descriptor");
        block
    }
}

// ── Log capture ─────────────────────────────────────────────────────────────

/// Run `f` with a thread-local subscriber that records every emitted
/// event as one line: level, target, then `field=value` pairs (the
/// message renders as `message=...`). Used to assert that alert logs
/// actually fire and carry the identifiers they promise.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, Vec<String>) {
    let store: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let subscriber = CaptureSubscriber {
        store: Arc::clone(&store),
        next_span: AtomicU64::new(1),
    };
    let result = tracing::subscriber::with_default(subscriber, f);
    let lines = store.lock().expect("log store").clone();
    (result, lines)
}

struct CaptureSubscriber {
    store: Arc<Mutex<Vec<String>>>,
    next_span: AtomicU64,
}

impl Subscriber for CaptureSubscriber {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, _span: &span::Attributes<'_>) -> span::Id {
        span::Id::from_u64(self.next_span.fetch_add(1, Ordering::Relaxed))
    }

    fn record(&self, _span: &span::Id, _values: &span::Record<'_>) {}

    fn record_follows_from(&self, _span: &span::Id, _follows: &span::Id) {}

    fn event(&self, event: &Event<'_>) {
        let metadata = event.metadata();
        let mut line = format!("{} {}", metadata.level(), metadata.target());
        event.record(&mut LineVisitor { line: &mut line });
        self.store.lock().expect("log store").push(line);
    }

    fn enter(&self, _span: &span::Id) {}

    fn exit(&self, _span: &span::Id) {}
}

struct LineVisitor<'a> {
    line: &'a mut String,
}

impl Visit for LineVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let _ = write!(self.line, " {}={:?}", field.name(), value);
    }
}

// ── Read-counting device ────────────────────────────────────────────────────

/// A `ByteDevice` wrapper that counts reads, used to prove cache hits
/// issue no I/O.
#[derive(Debug, Clone)]
pub struct CountingDevice<D: ByteDevice> {
    inner: D,
    reads: Arc<AtomicU64>,
}

impl<D: ByteDevice> CountingDevice<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            reads: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared read counter; clone before handing the device away.
    #[must_use]
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.reads)
    }
}

impl<D: ByteDevice> ByteDevice for CountingDevice<D> {
    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> apfs_error::Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.inner.read_exact_at(offset, buf)
    }
}

//! Container (NXSB) and volume (APSB) superblocks, plus the omap
//! descriptor both of them point at.

use crate::ObjPhys;
use apfs_types::{
    read_fixed, read_le_u32, read_le_u64, trim_nul_padded, BlockSize, Oid, Paddr, ParseError,
    APFS_MAGIC, NX_MAGIC,
};
use serde::{Deserialize, Serialize};

/// Offset of the variable-length `fs_oid[]` array in the container
/// superblock. A volume index is valid only if its slot fits in one block.
pub const NX_FS_OID_OFFSET: usize = 0xB8;

const NX_MIN_SIZE: usize = NX_FS_OID_OFFSET;
const APSB_MIN_SIZE: usize = 0x2C0 + 256;
const OMAP_PHYS_MIN_SIZE: usize = 0x38;

/// Parsed subset of the container superblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NxSuperblock {
    pub obj: ObjPhys,
    pub block_size: BlockSize,
    pub block_count: u64,
    pub uuid: [u8; 16],
    pub omap_oid: Paddr,
    pub max_file_systems: u32,
}

/// Parse a container superblock from a raw block.
///
/// Validates the magic and the advertised block size; the checksum is the
/// mount bootstrap's responsibility because the probe read may be shorter
/// than the real block.
pub fn parse_nx_superblock(block: &[u8]) -> Result<NxSuperblock, ParseError> {
    if block.len() < NX_MIN_SIZE {
        return Err(ParseError::InsufficientData {
            needed: NX_MIN_SIZE,
            offset: 0,
            actual: block.len(),
        });
    }

    let magic = read_le_u32(block, 0x20)?;
    if magic != NX_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(NX_MAGIC),
            actual: u64::from(magic),
        });
    }

    Ok(NxSuperblock {
        obj: ObjPhys::parse(block)?,
        block_size: BlockSize::new(read_le_u32(block, 0x24)?)?,
        block_count: read_le_u64(block, 0x28)?,
        uuid: read_fixed::<16>(block, 0x48)?,
        omap_oid: Paddr(read_le_u64(block, 0xA0)?),
        max_file_systems: read_le_u32(block, 0xB4)?,
    })
}

/// Read one slot of the container's `fs_oid[]` array.
///
/// The caller bounds-checks the index against the block size; this only
/// guards the raw slice.
pub fn nx_fs_oid(block: &[u8], index: u32) -> Result<Oid, ParseError> {
    let slot = NX_FS_OID_OFFSET
        .checked_add(8 * index as usize)
        .ok_or(ParseError::InvalidField {
            field: "fs_oid",
            reason: "index overflow",
        })?;
    Ok(Oid(read_le_u64(block, slot)?))
}

/// Parsed subset of a volume superblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApfsSuperblock {
    pub obj: ObjPhys,
    pub fs_index: u32,
    pub fs_alloc_count: u64,
    pub omap_oid: Paddr,
    pub root_tree_oid: Oid,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_symlinks: u64,
    pub num_other_fsobjects: u64,
    pub vol_uuid: [u8; 16],
    pub volname: String,
}

pub fn parse_apfs_superblock(block: &[u8]) -> Result<ApfsSuperblock, ParseError> {
    if block.len() < APSB_MIN_SIZE {
        return Err(ParseError::InsufficientData {
            needed: APSB_MIN_SIZE,
            offset: 0,
            actual: block.len(),
        });
    }

    let magic = read_le_u32(block, 0x20)?;
    if magic != APFS_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(APFS_MAGIC),
            actual: u64::from(magic),
        });
    }

    Ok(ApfsSuperblock {
        obj: ObjPhys::parse(block)?,
        fs_index: read_le_u32(block, 0x24)?,
        fs_alloc_count: read_le_u64(block, 0x58)?,
        omap_oid: Paddr(read_le_u64(block, 0x80)?),
        root_tree_oid: Oid(read_le_u64(block, 0x88)?),
        num_files: read_le_u64(block, 0xB8)?,
        num_directories: read_le_u64(block, 0xC0)?,
        num_symlinks: read_le_u64(block, 0xC8)?,
        num_other_fsobjects: read_le_u64(block, 0xD0)?,
        vol_uuid: read_fixed::<16>(block, 0xF0)?,
        volname: trim_nul_padded(&read_fixed::<256>(block, 0x2C0)?),
    })
}

impl ApfsSuperblock {
    /// Total file-system objects in this volume (files + dirs + symlinks
    /// + everything else).
    #[must_use]
    pub fn total_objects(&self) -> u64 {
        self.num_files
            .wrapping_add(self.num_directories)
            .wrapping_add(self.num_symlinks)
            .wrapping_add(self.num_other_fsobjects)
    }

    /// Filesystem identifier: the volume UUID's two 64-bit halves XORed.
    #[must_use]
    pub fn fsid(&self) -> u64 {
        let lo = u64::from_le_bytes(self.vol_uuid[0..8].try_into().unwrap_or([0; 8]));
        let hi = u64::from_le_bytes(self.vol_uuid[8..16].try_into().unwrap_or([0; 8]));
        lo ^ hi
    }
}

/// The omap descriptor block: points at the root of the omap B-tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapPhys {
    pub obj: ObjPhys,
    pub tree_oid: Paddr,
}

pub fn parse_omap_phys(block: &[u8]) -> Result<OmapPhys, ParseError> {
    if block.len() < OMAP_PHYS_MIN_SIZE {
        return Err(ParseError::InsufficientData {
            needed: OMAP_PHYS_MIN_SIZE,
            offset: 0,
            actual: block.len(),
        });
    }
    Ok(OmapPhys {
        obj: ObjPhys::parse(block)?,
        tree_oid: Paddr(read_le_u64(block, 0x30)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_nx(block_size: u32) -> Vec<u8> {
        let mut block = vec![0_u8; 4096];
        block[0x20..0x24].copy_from_slice(&NX_MAGIC.to_le_bytes());
        block[0x24..0x28].copy_from_slice(&block_size.to_le_bytes());
        block[0x28..0x30].copy_from_slice(&100_u64.to_le_bytes());
        block[0xA0..0xA8].copy_from_slice(&5_u64.to_le_bytes());
        block[0xB4..0xB8].copy_from_slice(&2_u32.to_le_bytes());
        block[0xB8..0xC0].copy_from_slice(&0x0402_u64.to_le_bytes());
        block[0xC0..0xC8].copy_from_slice(&0x0403_u64.to_le_bytes());
        block
    }

    #[test]
    fn nx_parse_smoke() {
        let block = make_nx(4096);
        let nx = parse_nx_superblock(&block).expect("parse");
        assert_eq!(nx.block_size.get(), 4096);
        assert_eq!(nx.block_count, 100);
        assert_eq!(nx.omap_oid, Paddr(5));
        assert_eq!(nx.max_file_systems, 2);
        assert_eq!(nx_fs_oid(&block, 0).expect("slot 0"), Oid(0x0402));
        assert_eq!(nx_fs_oid(&block, 1).expect("slot 1"), Oid(0x0403));
        assert_eq!(nx_fs_oid(&block, 2).expect("slot 2"), Oid(0));
    }

    #[test]
    fn nx_rejects_wrong_magic() {
        let mut block = make_nx(4096);
        block[0x20..0x24].copy_from_slice(b"XXXX");
        let err = parse_nx_superblock(&block).unwrap_err();
        assert!(matches!(err, ParseError::InvalidMagic { .. }), "got: {err:?}");
    }

    #[test]
    fn nx_rejects_bad_block_size() {
        let block = make_nx(3000);
        let err = parse_nx_superblock(&block).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "block_size",
                    ..
                }
            ),
            "got: {err:?}"
        );
    }

    fn make_apsb() -> Vec<u8> {
        let mut block = vec![0_u8; 4096];
        block[0x20..0x24].copy_from_slice(&APFS_MAGIC.to_le_bytes());
        block[0x58..0x60].copy_from_slice(&10_u64.to_le_bytes());
        block[0x80..0x88].copy_from_slice(&20_u64.to_le_bytes());
        block[0x88..0x90].copy_from_slice(&0x404_u64.to_le_bytes());
        block[0xB8..0xC0].copy_from_slice(&3_u64.to_le_bytes());
        block[0xC0..0xC8].copy_from_slice(&2_u64.to_le_bytes());
        block[0xC8..0xD0].copy_from_slice(&1_u64.to_le_bytes());
        block[0xF0] = 0xAA;
        block[0xF8] = 0x55;
        block[0x2C0..0x2C4].copy_from_slice(b"test");
        block
    }

    #[test]
    fn apsb_parse_smoke() {
        let vsb = parse_apfs_superblock(&make_apsb()).expect("parse");
        assert_eq!(vsb.fs_alloc_count, 10);
        assert_eq!(vsb.omap_oid, Paddr(20));
        assert_eq!(vsb.root_tree_oid, Oid(0x404));
        assert_eq!(vsb.total_objects(), 6);
        assert_eq!(vsb.volname, "test");
        assert_eq!(vsb.fsid(), 0xAA ^ 0x55);
    }

    #[test]
    fn apsb_rejects_wrong_magic() {
        let mut block = make_apsb();
        block[0x20] = 0;
        assert!(matches!(
            parse_apfs_superblock(&block).unwrap_err(),
            ParseError::InvalidMagic { .. }
        ));
    }

    #[test]
    fn omap_phys_parse() {
        let mut block = vec![0_u8; 4096];
        block[0x30..0x38].copy_from_slice(&77_u64.to_le_bytes());
        let omap = parse_omap_phys(&block).expect("parse");
        assert_eq!(omap.tree_oid, Paddr(77));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn nx_parse_no_panic(block in proptest::collection::vec(any::<u8>(), 0..=8192)) {
            let _ = parse_nx_superblock(&block);
        }

        #[test]
        fn apsb_parse_no_panic(block in proptest::collection::vec(any::<u8>(), 0..=8192)) {
            let _ = parse_apfs_superblock(&block);
        }

        #[test]
        fn omap_phys_parse_no_panic(block in proptest::collection::vec(any::<u8>(), 0..=256)) {
            let _ = parse_omap_phys(&block);
        }
    }
}

#![forbid(unsafe_code)]
//! On-disk format parsing for APFS.
//!
//! Every parser here takes a raw byte region, validates offsets against
//! the region length, and returns a typed view or a `ParseError`. No I/O
//! happens in this crate.

use apfs_types::{
    fletcher64, read_le_u32, read_le_u64, MAX_CKSUM_SIZE, OBJ_HEADER_SIZE, Oid, ParseError, Xid,
};
use serde::{Deserialize, Serialize};

mod node;
mod records;
mod superblock;

pub use node::{
    locate_kv, parse_btree_info, BtreeInfo, BtreeNodeHeader, KvRange, BTNODE_FIXED_KV_SIZE,
    BTNODE_LEAF, BTNODE_ROOT, BTOFF_INVALID, BTREE_INFO_SIZE, BTREE_NODE_DATA_START,
};
pub use records::{
    jkey_header_word, parse_drec_key, parse_drec_val, parse_file_extent_key,
    parse_file_extent_val, parse_inode_val, parse_jkey_header, parse_omap_key, parse_omap_val,
    parse_xattr_key, parse_xattr_val, DrecKey, DrecVal, Dstream, FileExtentKey, FileExtentVal,
    InodeVal, JKeyHeader, OmapKey, OmapVal, XattrKey, XattrVal, DREC_VAL_FIXED_SIZE,
    FILE_EXTENT_KEY_SIZE, FILE_EXTENT_VAL_SIZE, INODE_VAL_FIXED_SIZE, OMAP_KEY_SIZE,
    OMAP_VAL_SIZE,
};
pub use superblock::{
    nx_fs_oid, parse_apfs_superblock, parse_nx_superblock, parse_omap_phys, ApfsSuperblock,
    NxSuperblock, OmapPhys, NX_FS_OID_OFFSET,
};

/// Header carried by every object block: checksum, then identity fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjPhys {
    pub cksum: u64,
    pub oid: Oid,
    pub xid: Xid,
    pub obj_type: u32,
    pub subtype: u32,
}

impl ObjPhys {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < OBJ_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: OBJ_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }
        Ok(Self {
            cksum: read_le_u64(block, 0x00)?,
            oid: Oid(read_le_u64(block, 0x08)?),
            xid: Xid(read_le_u64(block, 0x10)?),
            obj_type: read_le_u32(block, 0x18)?,
            subtype: read_le_u32(block, 0x1C)?,
        })
    }
}

/// Verify the Fletcher-64 seal of an object block.
///
/// The stored checksum covers everything after the 8-byte checksum field.
pub fn verify_object_checksum(block: &[u8]) -> Result<(), ParseError> {
    if block.len() < OBJ_HEADER_SIZE {
        return Err(ParseError::InsufficientData {
            needed: OBJ_HEADER_SIZE,
            offset: 0,
            actual: block.len(),
        });
    }

    let stored = read_le_u64(block, 0)?;
    let computed = fletcher64(&block[MAX_CKSUM_SIZE..]);
    if stored != computed {
        return Err(ParseError::InvalidField {
            field: "object_cksum",
            reason: "fletcher64 checksum mismatch",
        });
    }
    Ok(())
}

/// Stamp a valid Fletcher-64 seal onto an object block (test/tooling aid).
pub fn seal_object_checksum(block: &mut [u8]) -> Result<(), ParseError> {
    if block.len() < OBJ_HEADER_SIZE {
        return Err(ParseError::InsufficientData {
            needed: OBJ_HEADER_SIZE,
            offset: 0,
            actual: block.len(),
        });
    }
    let cksum = fletcher64(&block[MAX_CKSUM_SIZE..]);
    block[0..MAX_CKSUM_SIZE].copy_from_slice(&cksum.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn object_header_round_trip() {
        let mut block = vec![0_u8; 4096];
        block[0x08..0x10].copy_from_slice(&0x0402_u64.to_le_bytes());
        block[0x10..0x18].copy_from_slice(&9_u64.to_le_bytes());
        block[0x18..0x1C].copy_from_slice(&0x4000_000B_u32.to_le_bytes());
        seal_object_checksum(&mut block).expect("seal");

        verify_object_checksum(&block).expect("verify");
        let obj = ObjPhys::parse(&block).expect("parse");
        assert_eq!(obj.oid, Oid(0x0402));
        assert_eq!(obj.xid, Xid(9));
        assert_eq!(obj.obj_type, 0x4000_000B);
    }

    #[test]
    fn checksum_mismatch_detected() {
        let mut block = vec![0_u8; 4096];
        seal_object_checksum(&mut block).expect("seal");
        block[0x200] ^= 0x01;
        let err = verify_object_checksum(&block).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "object_cksum",
                    ..
                }
            ),
            "got: {err:?}"
        );
    }

    #[test]
    fn short_block_rejected() {
        assert!(verify_object_checksum(&[0_u8; 16]).is_err());
        assert!(ObjPhys::parse(&[0_u8; 31]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn verify_object_checksum_no_panic(
            block in proptest::collection::vec(any::<u8>(), 0..=8192),
        ) {
            let _ = verify_object_checksum(&block);
        }

        #[test]
        fn sealed_blocks_always_verify(
            mut block in proptest::collection::vec(any::<u8>(), 32..=4096),
        ) {
            seal_object_checksum(&mut block).expect("seal");
            prop_assert!(verify_object_checksum(&block).is_ok());
        }
    }
}

//! B-tree node layout: header, table of contents, key/value location.
//!
//! A node is one block. After the object header come the node header
//! fields, then the data area at 0x38: the ToC, the key area growing
//! upward, and the value area growing downward from the end of the block
//! (root nodes reserve a 40-byte info footer at the very end).

use crate::ObjPhys;
use apfs_types::{read_le_u16, read_le_u32, read_le_u64, ParseError};
use serde::{Deserialize, Serialize};

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;

/// First byte of the node's data area (ToC base).
pub const BTREE_NODE_DATA_START: usize = 0x38;
/// Size of the `btree_info` footer on root nodes.
pub const BTREE_INFO_SIZE: usize = 40;
/// Sentinel for "no value" in a ToC slot.
pub const BTOFF_INVALID: u16 = 0xFFFF;

const TOC_ENTRY_FIXED: usize = 4;
const TOC_ENTRY_VARIABLE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeNodeHeader {
    pub obj: ObjPhys,
    pub flags: u16,
    pub level: u16,
    pub nkeys: u32,
    pub table_off: u16,
    pub table_len: u16,
}

impl BtreeNodeHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < BTREE_NODE_DATA_START {
            return Err(ParseError::InsufficientData {
                needed: BTREE_NODE_DATA_START,
                offset: 0,
                actual: block.len(),
            });
        }
        Ok(Self {
            obj: ObjPhys::parse(block)?,
            flags: read_le_u16(block, 0x20)?,
            level: read_le_u16(block, 0x22)?,
            nkeys: read_le_u32(block, 0x24)?,
            table_off: read_le_u16(block, 0x28)?,
            table_len: read_le_u16(block, 0x2A)?,
        })
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    #[must_use]
    pub fn fixed_kv(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }

    fn toc_entry_size(&self) -> usize {
        if self.fixed_kv() {
            TOC_ENTRY_FIXED
        } else {
            TOC_ENTRY_VARIABLE
        }
    }

    /// Start of the ToC within the block.
    fn toc_start(&self) -> usize {
        BTREE_NODE_DATA_START + usize::from(self.table_off)
    }

    /// Start of the key area (the byte after the ToC region).
    fn key_base(&self) -> usize {
        self.toc_start() + usize::from(self.table_len)
    }

    /// End of the value area: the block end, minus the info footer on
    /// root nodes.
    fn val_end(&self, block_len: usize) -> usize {
        if self.is_root() {
            block_len.saturating_sub(BTREE_INFO_SIZE)
        } else {
            block_len
        }
    }

    /// Validate the geometry against the block it was parsed from.
    ///
    /// Checks that the ToC region lies within the block, that the
    /// declared entry count fits in the ToC, and that the level is sane
    /// for the flags.
    pub fn validate(&self, block_len: usize) -> Result<(), ParseError> {
        let toc_end = self
            .toc_start()
            .checked_add(usize::from(self.table_len))
            .ok_or(ParseError::InvalidField {
                field: "table_space",
                reason: "overflow",
            })?;
        if toc_end > self.val_end(block_len) {
            return Err(ParseError::InvalidField {
                field: "table_space",
                reason: "table of contents extends past the value area",
            });
        }

        let nkeys = usize::try_from(self.nkeys)
            .map_err(|_| ParseError::IntegerConversion { field: "nkeys" })?;
        let needed = nkeys
            .checked_mul(self.toc_entry_size())
            .ok_or(ParseError::InvalidField {
                field: "nkeys",
                reason: "overflow",
            })?;
        if needed > usize::from(self.table_len) {
            return Err(ParseError::InvalidField {
                field: "nkeys",
                reason: "entry count exceeds table of contents capacity",
            });
        }

        if self.is_leaf() != (self.level == 0) {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "leaf flag disagrees with level",
            });
        }

        Ok(())
    }
}

/// Tree-wide geometry stored in the root node's footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeInfo {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

/// Parse the `btree_info` footer from the last 40 bytes of a root node.
pub fn parse_btree_info(block: &[u8]) -> Result<BtreeInfo, ParseError> {
    let base = block
        .len()
        .checked_sub(BTREE_INFO_SIZE)
        .ok_or(ParseError::InsufficientData {
            needed: BTREE_INFO_SIZE,
            offset: 0,
            actual: block.len(),
        })?;

    Ok(BtreeInfo {
        flags: read_le_u32(block, base)?,
        node_size: read_le_u32(block, base + 4)?,
        key_size: read_le_u32(block, base + 8)?,
        val_size: read_le_u32(block, base + 12)?,
        longest_key: read_le_u32(block, base + 16)?,
        longest_val: read_le_u32(block, base + 20)?,
        key_count: read_le_u64(block, base + 24)?,
        node_count: read_le_u64(block, base + 32)?,
    })
}

/// Byte ranges of one entry's key and value within the node's raw block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRange {
    pub key: std::ops::Range<usize>,
    pub val: std::ops::Range<usize>,
}

/// Locate entry `index` in a node.
///
/// For fixed-size trees the key length comes from the tree info and the
/// value length is the tree's value size on leaves and 8 bytes (a child
/// pointer) on internal nodes. Every computed range is checked against
/// the block before it is returned.
pub fn locate_kv(
    block: &[u8],
    hdr: &BtreeNodeHeader,
    info: &BtreeInfo,
    index: usize,
) -> Result<KvRange, ParseError> {
    let nkeys = usize::try_from(hdr.nkeys)
        .map_err(|_| ParseError::IntegerConversion { field: "nkeys" })?;
    if index >= nkeys {
        return Err(ParseError::InvalidField {
            field: "index",
            reason: "entry index out of range",
        });
    }

    let entry = hdr.toc_start() + index * hdr.toc_entry_size();
    let key_base = hdr.key_base();
    let val_end = hdr.val_end(block.len());

    let (key_off, key_len, val_off, val_len) = if hdr.fixed_kv() {
        let koff = usize::from(read_le_u16(block, entry)?);
        let voff = read_le_u16(block, entry + 2)?;
        if voff == BTOFF_INVALID {
            return Err(ParseError::InvalidField {
                field: "val_off",
                reason: "entry has no value",
            });
        }
        let key_len = usize::try_from(info.key_size)
            .map_err(|_| ParseError::IntegerConversion { field: "key_size" })?;
        let val_len = if hdr.is_leaf() {
            usize::try_from(info.val_size)
                .map_err(|_| ParseError::IntegerConversion { field: "val_size" })?
        } else {
            8
        };
        if key_len == 0 || val_len == 0 {
            return Err(ParseError::InvalidField {
                field: "btree_info",
                reason: "fixed key/value size is zero",
            });
        }
        (koff, key_len, usize::from(voff), val_len)
    } else {
        let koff = usize::from(read_le_u16(block, entry)?);
        let klen = usize::from(read_le_u16(block, entry + 2)?);
        let voff = usize::from(read_le_u16(block, entry + 4)?);
        let vlen = usize::from(read_le_u16(block, entry + 6)?);
        if klen == 0 {
            return Err(ParseError::InvalidField {
                field: "key_len",
                reason: "zero-length key",
            });
        }
        (koff, klen, voff, vlen)
    };

    let key_start = key_base
        .checked_add(key_off)
        .ok_or(ParseError::InvalidField {
            field: "key_off",
            reason: "overflow",
        })?;
    let key_end = key_start
        .checked_add(key_len)
        .ok_or(ParseError::InvalidField {
            field: "key_len",
            reason: "overflow",
        })?;
    if key_end > val_end {
        return Err(ParseError::InvalidField {
            field: "key_off",
            reason: "key extends past the value area",
        });
    }

    if val_off < val_len || val_off > val_end {
        return Err(ParseError::InvalidField {
            field: "val_off",
            reason: "value range outside the node",
        });
    }
    let val_start = val_end - val_off;
    let val_stop = val_start + val_len;

    Ok(KvRange {
        key: key_start..key_end,
        val: val_start..val_stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn locate_variable_entry() {
        let bs = 4096;
        let mut block = vec![0_u8; bs];
        block[0x20..0x22].copy_from_slice(&(BTNODE_ROOT | BTNODE_LEAF).to_le_bytes());
        block[0x24..0x28].copy_from_slice(&1_u32.to_le_bytes());
        block[0x28..0x2A].copy_from_slice(&0_u16.to_le_bytes());
        block[0x2A..0x2C].copy_from_slice(&8_u16.to_le_bytes());
        block[0x38..0x3A].copy_from_slice(&0_u16.to_le_bytes());
        block[0x3A..0x3C].copy_from_slice(&16_u16.to_le_bytes());
        block[0x3C..0x3E].copy_from_slice(&24_u16.to_le_bytes());
        block[0x3E..0x40].copy_from_slice(&24_u16.to_le_bytes());

        let hdr = BtreeNodeHeader::parse(&block).expect("header");
        hdr.validate(bs).expect("validate");
        let info = parse_btree_info(&block).expect("info");
        let kv = locate_kv(&block, &hdr, &info, 0).expect("locate");

        // key_base = 0x38 + 0 + 8 = 0x40
        assert_eq!(kv.key, 0x40..0x50);
        // val_end = 4096 - 40 = 4056; val at 4056 - 24 .. + 24
        assert_eq!(kv.val, 4032..4056);
    }

    #[test]
    fn locate_fixed_entry_leaf_and_internal() {
        let bs = 4096;
        let mut block = vec![0_u8; bs];
        // fixed leaf root, one entry
        block[0x20..0x22]
            .copy_from_slice(&(BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE).to_le_bytes());
        block[0x24..0x28].copy_from_slice(&1_u32.to_le_bytes());
        block[0x28..0x2A].copy_from_slice(&0_u16.to_le_bytes());
        block[0x2A..0x2C].copy_from_slice(&4_u16.to_le_bytes());
        // entry: koff 0, voff 16
        block[0x38..0x3A].copy_from_slice(&0_u16.to_le_bytes());
        block[0x3A..0x3C].copy_from_slice(&16_u16.to_le_bytes());
        // info footer: key_size 16, val_size 16
        let base = bs - BTREE_INFO_SIZE;
        block[base + 8..base + 12].copy_from_slice(&16_u32.to_le_bytes());
        block[base + 12..base + 16].copy_from_slice(&16_u32.to_le_bytes());

        let hdr = BtreeNodeHeader::parse(&block).expect("header");
        hdr.validate(bs).expect("validate");
        let info = parse_btree_info(&block).expect("info");
        let kv = locate_kv(&block, &hdr, &info, 0).expect("locate");
        assert_eq!(kv.key, 0x3C..0x4C);
        assert_eq!(kv.val.len(), 16);
        assert_eq!(kv.val.end, bs - BTREE_INFO_SIZE);

        // Same geometry but an internal node: value shrinks to a child ptr.
        block[0x20..0x22].copy_from_slice(&(BTNODE_ROOT | BTNODE_FIXED_KV_SIZE).to_le_bytes());
        block[0x22..0x24].copy_from_slice(&1_u16.to_le_bytes());
        block[0x3A..0x3C].copy_from_slice(&8_u16.to_le_bytes());
        let hdr = BtreeNodeHeader::parse(&block).expect("header");
        let kv = locate_kv(&block, &hdr, &info, 0).expect("locate internal");
        assert_eq!(kv.val.len(), 8);
    }

    #[test]
    fn ghost_value_rejected() {
        let bs = 4096;
        let mut block = vec![0_u8; bs];
        block[0x20..0x22]
            .copy_from_slice(&(BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE).to_le_bytes());
        block[0x24..0x28].copy_from_slice(&1_u32.to_le_bytes());
        block[0x2A..0x2C].copy_from_slice(&4_u16.to_le_bytes());
        block[0x3A..0x3C].copy_from_slice(&BTOFF_INVALID.to_le_bytes());
        let base = bs - BTREE_INFO_SIZE;
        block[base + 8..base + 12].copy_from_slice(&16_u32.to_le_bytes());
        block[base + 12..base + 16].copy_from_slice(&16_u32.to_le_bytes());

        let hdr = BtreeNodeHeader::parse(&block).expect("header");
        let info = parse_btree_info(&block).expect("info");
        let err = locate_kv(&block, &hdr, &info, 0).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "val_off",
                    ..
                }
            ),
            "got: {err:?}"
        );
    }

    #[test]
    fn out_of_range_index_rejected() {
        let mut block = vec![0_u8; 4096];
        block[0x20..0x22].copy_from_slice(&(BTNODE_ROOT | BTNODE_LEAF).to_le_bytes());
        let hdr = BtreeNodeHeader::parse(&block).expect("header");
        let info = parse_btree_info(&block).expect("info");
        assert!(locate_kv(&block, &hdr, &info, 0).is_err());
    }

    #[test]
    fn validate_rejects_oversized_toc() {
        let mut block = vec![0_u8; 4096];
        block[0x20..0x22].copy_from_slice(&(BTNODE_ROOT | BTNODE_LEAF).to_le_bytes());
        block[0x2A..0x2C].copy_from_slice(&u16::MAX.to_le_bytes());
        let hdr = BtreeNodeHeader::parse(&block).expect("header");
        let err = hdr.validate(4096).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "table_space",
                    ..
                }
            ),
            "got: {err:?}"
        );
    }

    #[test]
    fn validate_rejects_nkeys_overflow() {
        let mut block = vec![0_u8; 4096];
        block[0x20..0x22].copy_from_slice(&(BTNODE_ROOT | BTNODE_LEAF).to_le_bytes());
        block[0x24..0x28].copy_from_slice(&100_u32.to_le_bytes());
        block[0x2A..0x2C].copy_from_slice(&8_u16.to_le_bytes()); // room for one entry
        let hdr = BtreeNodeHeader::parse(&block).expect("header");
        let err = hdr.validate(4096).unwrap_err();
        assert!(
            matches!(err, ParseError::InvalidField { field: "nkeys", .. }),
            "got: {err:?}"
        );
    }

    #[test]
    fn validate_rejects_leaf_level_mismatch() {
        let mut block = vec![0_u8; 4096];
        block[0x20..0x22].copy_from_slice(&(BTNODE_ROOT | BTNODE_LEAF).to_le_bytes());
        block[0x22..0x24].copy_from_slice(&2_u16.to_le_bytes());
        let hdr = BtreeNodeHeader::parse(&block).expect("header");
        let err = hdr.validate(4096).unwrap_err();
        assert!(
            matches!(err, ParseError::InvalidField { field: "level", .. }),
            "got: {err:?}"
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn node_header_no_panic(block in proptest::collection::vec(any::<u8>(), 0..=4096)) {
            if let Ok(hdr) = BtreeNodeHeader::parse(&block) {
                let _ = hdr.validate(block.len());
            }
        }

        #[test]
        fn locate_kv_no_panic(
            block in proptest::collection::vec(any::<u8>(), 96..=4096),
            index in 0_usize..8,
        ) {
            if let Ok(hdr) = BtreeNodeHeader::parse(&block) {
                if hdr.validate(block.len()).is_ok() {
                    if let Ok(info) = parse_btree_info(&block) {
                        let _ = locate_kv(&block, &hdr, &info, index);
                    }
                }
            }
        }
    }
}

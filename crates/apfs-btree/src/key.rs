//! Catalog search keys and their total on-disk order.
//!
//! A catalog key compares by object id, then record type, then a
//! type-dependent secondary field. The omap key order is the plain
//! lexicographic (oid, xid) order derived on `OmapKey` itself.

use apfs_ondisk::{parse_drec_key, parse_file_extent_key, parse_jkey_header, parse_xattr_key};
use apfs_types::{
    drec_hash, ParseError, APFS_TYPE_DIR_REC, APFS_TYPE_FILE_EXTENT, APFS_TYPE_INODE,
    APFS_TYPE_XATTR,
};
use std::cmp::Ordering;

/// Type-dependent tail of a catalog key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Secondary {
    /// Records keyed by the header word alone (inodes).
    None,
    /// File extents: the extent's logical byte address.
    LogicalAddr(u64),
    /// Directory records: packed length+hash word, then the name bytes.
    DrecHash { name_len_and_hash: u32, name: Vec<u8> },
    /// Extended attributes: the attribute name.
    XattrName(Vec<u8>),
    /// Record types the reader does not interpret; ordered bytewise.
    Raw(Vec<u8>),
    /// Sorts after every real secondary; used as a range upper bound.
    Max,
}

impl Secondary {
    fn rank(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::LogicalAddr(_) | Self::DrecHash { .. } | Self::XattrName(_) | Self::Raw(_) => 1,
            Self::Max => 2,
        }
    }
}

impl Ord for Secondary {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::None, Self::None) | (Self::Max, Self::Max) => Ordering::Equal,
            (Self::LogicalAddr(a), Self::LogicalAddr(b)) => a.cmp(b),
            (
                Self::DrecHash {
                    name_len_and_hash: a_nlh,
                    name: a_name,
                },
                Self::DrecHash {
                    name_len_and_hash: b_nlh,
                    name: b_name,
                },
            ) => a_nlh.cmp(b_nlh).then_with(|| a_name.cmp(b_name)),
            (Self::XattrName(a), Self::XattrName(b)) | (Self::Raw(a), Self::Raw(b)) => a.cmp(b),
            // Mixed variants only occur with mismatched record types, which
            // the type comparison already ordered; fall back to ranks so the
            // order stays total.
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Secondary {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A parsed (or constructed) catalog key with the on-disk sort order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CatalogKey {
    pub obj_id: u64,
    pub kind: u8,
    pub secondary: Secondary,
}

impl CatalogKey {
    #[must_use]
    pub fn inode(obj_id: u64) -> Self {
        Self {
            obj_id,
            kind: APFS_TYPE_INODE,
            secondary: Secondary::None,
        }
    }

    #[must_use]
    pub fn file_extent(obj_id: u64, logical_addr: u64) -> Self {
        Self {
            obj_id,
            kind: APFS_TYPE_FILE_EXTENT,
            secondary: Secondary::LogicalAddr(logical_addr),
        }
    }

    #[must_use]
    pub fn dir_rec(obj_id: u64, name: &[u8]) -> Self {
        Self {
            obj_id,
            kind: APFS_TYPE_DIR_REC,
            secondary: Secondary::DrecHash {
                name_len_and_hash: drec_hash(name),
                name: name.to_vec(),
            },
        }
    }

    #[must_use]
    pub fn xattr(obj_id: u64, name: &[u8]) -> Self {
        Self {
            obj_id,
            kind: APFS_TYPE_XATTR,
            secondary: Secondary::XattrName(name.to_vec()),
        }
    }

    /// Smallest key for an (object id, type) pair; range lower bound.
    #[must_use]
    pub fn range_start(obj_id: u64, kind: u8) -> Self {
        Self {
            obj_id,
            kind,
            secondary: Secondary::None,
        }
    }

    /// Largest key for an (object id, type) pair; range upper bound.
    #[must_use]
    pub fn range_end(obj_id: u64, kind: u8) -> Self {
        Self {
            obj_id,
            kind,
            secondary: Secondary::Max,
        }
    }

    /// Decode a raw catalog key into its comparable form.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let hdr = parse_jkey_header(raw)?;
        let secondary = match hdr.kind {
            APFS_TYPE_INODE => Secondary::None,
            APFS_TYPE_FILE_EXTENT => {
                Secondary::LogicalAddr(parse_file_extent_key(raw)?.logical_addr)
            }
            APFS_TYPE_DIR_REC => {
                let key = parse_drec_key(raw)?;
                Secondary::DrecHash {
                    name_len_and_hash: key.name_len_and_hash,
                    name: key.name,
                }
            }
            APFS_TYPE_XATTR => Secondary::XattrName(parse_xattr_key(raw)?.name),
            _ => Secondary::Raw(raw[8..].to_vec()),
        };
        Ok(Self {
            obj_id: hdr.obj_id,
            kind: hdr.kind,
            secondary,
        })
    }

    /// Compare a raw on-disk key against this search key.
    pub fn cmp_raw(&self, raw: &[u8]) -> Result<Ordering, ParseError> {
        Ok(Self::parse(raw)?.cmp(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apfs_ondisk::jkey_header_word;

    fn raw_inode_key(obj_id: u64) -> Vec<u8> {
        jkey_header_word(obj_id, APFS_TYPE_INODE).to_le_bytes().to_vec()
    }

    fn raw_extent_key(obj_id: u64, addr: u64) -> Vec<u8> {
        let mut raw = jkey_header_word(obj_id, APFS_TYPE_FILE_EXTENT)
            .to_le_bytes()
            .to_vec();
        raw.extend_from_slice(&addr.to_le_bytes());
        raw
    }

    fn raw_drec_key(obj_id: u64, name: &[u8]) -> Vec<u8> {
        let mut raw = jkey_header_word(obj_id, APFS_TYPE_DIR_REC)
            .to_le_bytes()
            .to_vec();
        raw.extend_from_slice(&drec_hash(name).to_le_bytes());
        raw.extend_from_slice(name);
        raw.push(0);
        raw
    }

    #[test]
    fn key_order_obj_id_first() {
        let a = CatalogKey::parse(&raw_extent_key(5, 100)).unwrap();
        let b = CatalogKey::parse(&raw_inode_key(6)).unwrap();
        assert!(a < b);
    }

    #[test]
    fn key_order_type_second() {
        let inode = CatalogKey::parse(&raw_inode_key(5)).unwrap();
        let extent = CatalogKey::parse(&raw_extent_key(5, 0)).unwrap();
        let drec = CatalogKey::parse(&raw_drec_key(5, b"a")).unwrap();
        assert!(inode < extent);
        assert!(extent < drec);
    }

    #[test]
    fn key_order_secondary_third() {
        let a = CatalogKey::parse(&raw_extent_key(5, 0)).unwrap();
        let b = CatalogKey::parse(&raw_extent_key(5, 65536)).unwrap();
        assert!(a < b);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }

    #[test]
    fn range_bounds_bracket_all_records_of_a_type() {
        let start = CatalogKey::range_start(5, APFS_TYPE_DIR_REC);
        let end = CatalogKey::range_end(5, APFS_TYPE_DIR_REC);
        let entry = CatalogKey::parse(&raw_drec_key(5, b"zzzz")).unwrap();
        assert!(start <= entry);
        assert!(entry <= end);

        let other_obj = CatalogKey::parse(&raw_drec_key(6, b"a")).unwrap();
        assert!(other_obj > end);
    }

    #[test]
    fn cmp_raw_matches_search_key() {
        let search = CatalogKey::file_extent(5, 8192);
        assert_eq!(
            search.cmp_raw(&raw_extent_key(5, 8192)).unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            search.cmp_raw(&raw_extent_key(5, 0)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            search.cmp_raw(&raw_extent_key(5, 65536)).unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn binary_search_agrees_with_linear_scan() {
        // Key ordering law: the greatest key <= needle found by binary
        // search must match a linear scan over the sorted key set.
        let names: [&[u8]; 5] = [b"a", b"bb", b"ccc", b"d", b"e"];
        let mut keys: Vec<CatalogKey> = names
            .iter()
            .map(|n| CatalogKey::parse(&raw_drec_key(7, n)).unwrap())
            .collect();
        keys.sort();

        for needle in &keys {
            let linear = keys.iter().filter(|k| *k <= needle).next_back();
            let bin = match keys.binary_search(needle) {
                Ok(i) => Some(&keys[i]),
                Err(0) => None,
                Err(i) => Some(&keys[i - 1]),
            };
            assert_eq!(linear, bin);
        }
    }
}

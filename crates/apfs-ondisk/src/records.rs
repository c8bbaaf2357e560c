//! Omap and catalog record payloads.
//!
//! Catalog keys start with a packed header word: record type in the top
//! four bits, object id in the low 60. Values are fixed-layout structs,
//! optionally followed by an xfield blob (inodes and directory records).

use apfs_types::{
    ensure_slice, read_le_u16, read_le_u32, read_le_u64, Cnid, Oid, Paddr, ParseError, Xid,
    DREC_LEN_MASK, FILE_EXTENT_LEN_MASK, OBJ_ID_MASK, OBJ_TYPE_SHIFT,
};
use serde::{Deserialize, Serialize};

pub const OMAP_KEY_SIZE: usize = 16;
pub const OMAP_VAL_SIZE: usize = 16;
pub const FILE_EXTENT_KEY_SIZE: usize = 16;
pub const FILE_EXTENT_VAL_SIZE: usize = 24;
pub const INODE_VAL_FIXED_SIZE: usize = 92;
pub const DREC_VAL_FIXED_SIZE: usize = 18;

const DREC_KEY_FIXED_SIZE: usize = 12;
const XATTR_KEY_FIXED_SIZE: usize = 10;
const XATTR_VAL_FIXED_SIZE: usize = 4;
const DSTREAM_SIZE: usize = 40;

/// Inode xfield types used by the reader.
const INO_EXT_TYPE_NAME: u8 = 4;
const INO_EXT_TYPE_DSTREAM: u8 = 8;

// ── Omap records ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OmapKey {
    pub oid: Oid,
    pub xid: Xid,
}

pub fn parse_omap_key(raw: &[u8]) -> Result<OmapKey, ParseError> {
    if raw.len() != OMAP_KEY_SIZE {
        return Err(ParseError::InvalidField {
            field: "omap_key",
            reason: "wrong size",
        });
    }
    Ok(OmapKey {
        oid: Oid(read_le_u64(raw, 0)?),
        xid: Xid(read_le_u64(raw, 8)?),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapVal {
    pub flags: u32,
    pub size: u32,
    pub paddr: Paddr,
}

pub fn parse_omap_val(raw: &[u8]) -> Result<OmapVal, ParseError> {
    if raw.len() != OMAP_VAL_SIZE {
        return Err(ParseError::InvalidField {
            field: "omap_val",
            reason: "wrong size",
        });
    }
    Ok(OmapVal {
        flags: read_le_u32(raw, 0)?,
        size: read_le_u32(raw, 4)?,
        paddr: Paddr(read_le_u64(raw, 8)?),
    })
}

// ── Catalog key header ──────────────────────────────────────────────────────

/// The leading word of every catalog key, unpacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JKeyHeader {
    pub obj_id: u64,
    pub kind: u8,
}

pub fn parse_jkey_header(raw: &[u8]) -> Result<JKeyHeader, ParseError> {
    let word = read_le_u64(raw, 0)?;
    Ok(JKeyHeader {
        obj_id: word & OBJ_ID_MASK,
        kind: (word >> OBJ_TYPE_SHIFT) as u8,
    })
}

/// Pack a catalog key header word.
#[must_use]
pub fn jkey_header_word(obj_id: u64, kind: u8) -> u64 {
    (obj_id & OBJ_ID_MASK) | (u64::from(kind) << OBJ_TYPE_SHIFT)
}

// ── File extents ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtentKey {
    pub obj_id: u64,
    pub logical_addr: u64,
}

pub fn parse_file_extent_key(raw: &[u8]) -> Result<FileExtentKey, ParseError> {
    if raw.len() != FILE_EXTENT_KEY_SIZE {
        return Err(ParseError::InvalidField {
            field: "file_extent_key",
            reason: "wrong size",
        });
    }
    let hdr = parse_jkey_header(raw)?;
    Ok(FileExtentKey {
        obj_id: hdr.obj_id,
        logical_addr: read_le_u64(raw, 8)?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtentVal {
    pub len_and_flags: u64,
    pub phys_block_num: Paddr,
    pub crypto_id: u64,
}

impl FileExtentVal {
    /// Byte length of the extent, with the flag bits masked off.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len_and_flags & FILE_EXTENT_LEN_MASK
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An extent with no backing storage.
    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.phys_block_num == Paddr(0)
    }
}

pub fn parse_file_extent_val(raw: &[u8]) -> Result<FileExtentVal, ParseError> {
    if raw.len() != FILE_EXTENT_VAL_SIZE {
        return Err(ParseError::InvalidField {
            field: "file_extent_val",
            reason: "wrong size",
        });
    }
    Ok(FileExtentVal {
        len_and_flags: read_le_u64(raw, 0)?,
        phys_block_num: Paddr(read_le_u64(raw, 8)?),
        crypto_id: read_le_u64(raw, 16)?,
    })
}

// ── Inode records ───────────────────────────────────────────────────────────

/// The data stream xfield: logical size plus accounting counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dstream {
    pub size: u64,
    pub alloced_size: u64,
    pub default_crypto_id: u64,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeVal {
    pub parent_id: Cnid,
    /// Owner of the inode's data stream; file extent keys use this id.
    pub private_id: u64,
    pub create_time: u64,
    pub mod_time: u64,
    pub change_time: u64,
    pub access_time: u64,
    pub internal_flags: u64,
    pub nchildren_or_nlink: u32,
    pub bsd_flags: u32,
    pub owner: u32,
    pub group: u32,
    pub mode: u16,
    pub dstream: Option<Dstream>,
    pub name: Option<String>,
}

pub fn parse_inode_val(raw: &[u8]) -> Result<InodeVal, ParseError> {
    if raw.len() < INODE_VAL_FIXED_SIZE {
        return Err(ParseError::InsufficientData {
            needed: INODE_VAL_FIXED_SIZE,
            offset: 0,
            actual: raw.len(),
        });
    }

    let mut inode = InodeVal {
        parent_id: Cnid(read_le_u64(raw, 0)?),
        private_id: read_le_u64(raw, 8)?,
        create_time: read_le_u64(raw, 16)?,
        mod_time: read_le_u64(raw, 24)?,
        change_time: read_le_u64(raw, 32)?,
        access_time: read_le_u64(raw, 40)?,
        internal_flags: read_le_u64(raw, 48)?,
        nchildren_or_nlink: read_le_u32(raw, 56)?,
        bsd_flags: read_le_u32(raw, 68)?,
        owner: read_le_u32(raw, 72)?,
        group: read_le_u32(raw, 76)?,
        mode: read_le_u16(raw, 80)?,
        dstream: None,
        name: None,
    };

    for field in parse_xfields(&raw[INODE_VAL_FIXED_SIZE..])? {
        match field.xtype {
            INO_EXT_TYPE_DSTREAM => {
                if field.data.len() != DSTREAM_SIZE {
                    return Err(ParseError::InvalidField {
                        field: "dstream",
                        reason: "wrong size",
                    });
                }
                inode.dstream = Some(Dstream {
                    size: read_le_u64(field.data, 0)?,
                    alloced_size: read_le_u64(field.data, 8)?,
                    default_crypto_id: read_le_u64(field.data, 16)?,
                    total_bytes_written: read_le_u64(field.data, 24)?,
                    total_bytes_read: read_le_u64(field.data, 32)?,
                });
            }
            INO_EXT_TYPE_NAME => {
                let bytes = match field.data.split_last() {
                    Some((&0, head)) => head,
                    _ => field.data,
                };
                inode.name = Some(String::from_utf8_lossy(bytes).into_owned());
            }
            _ => {}
        }
    }

    Ok(inode)
}

struct Xfield<'a> {
    xtype: u8,
    data: &'a [u8],
}

/// Walk an xfield blob: a count, a descriptor table, then 8-byte-aligned
/// payloads in descriptor order. An empty blob is valid.
fn parse_xfields(blob: &[u8]) -> Result<Vec<Xfield<'_>>, ParseError> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }
    if blob.len() < 4 {
        return Err(ParseError::InsufficientData {
            needed: 4,
            offset: 0,
            actual: blob.len(),
        });
    }

    let num = usize::from(read_le_u16(blob, 0)?);
    let table_end = 4_usize
        .checked_add(num.checked_mul(4).ok_or(ParseError::InvalidField {
            field: "xf_num_exts",
            reason: "overflow",
        })?)
        .ok_or(ParseError::InvalidField {
            field: "xf_num_exts",
            reason: "overflow",
        })?;
    if table_end > blob.len() {
        return Err(ParseError::InsufficientData {
            needed: table_end,
            offset: 0,
            actual: blob.len(),
        });
    }

    let mut fields = Vec::with_capacity(num);
    let mut payload = table_end;
    for i in 0..num {
        let desc = 4 + i * 4;
        let xtype = blob[desc];
        let size = usize::from(read_le_u16(blob, desc + 2)?);
        let data = ensure_slice(blob, payload, size)?;
        fields.push(Xfield { xtype, data });
        // Payloads are 8-byte aligned.
        payload = payload
            .checked_add(size.div_ceil(8) * 8)
            .ok_or(ParseError::InvalidField {
                field: "x_size",
                reason: "overflow",
            })?;
    }

    Ok(fields)
}

// ── Directory records ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrecKey {
    pub obj_id: u64,
    pub name_len_and_hash: u32,
    /// Name bytes without the trailing NUL.
    pub name: Vec<u8>,
}

pub fn parse_drec_key(raw: &[u8]) -> Result<DrecKey, ParseError> {
    if raw.len() < DREC_KEY_FIXED_SIZE {
        return Err(ParseError::InsufficientData {
            needed: DREC_KEY_FIXED_SIZE,
            offset: 0,
            actual: raw.len(),
        });
    }
    let hdr = parse_jkey_header(raw)?;
    let name_len_and_hash = read_le_u32(raw, 8)?;
    let len = (name_len_and_hash & DREC_LEN_MASK) as usize;
    if len == 0 {
        return Err(ParseError::InvalidField {
            field: "drec_name_len",
            reason: "zero-length name",
        });
    }
    let stored = ensure_slice(raw, DREC_KEY_FIXED_SIZE, len)?;
    let name = match stored.split_last() {
        Some((&0, head)) => head.to_vec(),
        _ => {
            return Err(ParseError::InvalidField {
                field: "drec_name",
                reason: "missing NUL terminator",
            })
        }
    };
    Ok(DrecKey {
        obj_id: hdr.obj_id,
        name_len_and_hash,
        name,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrecVal {
    pub file_id: Cnid,
    pub date_added: u64,
    pub flags: u16,
}

impl DrecVal {
    /// Directory-entry file type (`DT_*`) from the flag word.
    #[must_use]
    pub fn dt(&self) -> u16 {
        self.flags & apfs_types::DREC_TYPE_MASK
    }
}

pub fn parse_drec_val(raw: &[u8]) -> Result<DrecVal, ParseError> {
    if raw.len() < DREC_VAL_FIXED_SIZE {
        return Err(ParseError::InsufficientData {
            needed: DREC_VAL_FIXED_SIZE,
            offset: 0,
            actual: raw.len(),
        });
    }
    Ok(DrecVal {
        file_id: Cnid(read_le_u64(raw, 0)?),
        date_added: read_le_u64(raw, 8)?,
        flags: read_le_u16(raw, 16)?,
    })
}

// ── Extended attributes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XattrKey {
    pub obj_id: u64,
    /// Name bytes without the trailing NUL.
    pub name: Vec<u8>,
}

pub fn parse_xattr_key(raw: &[u8]) -> Result<XattrKey, ParseError> {
    if raw.len() < XATTR_KEY_FIXED_SIZE {
        return Err(ParseError::InsufficientData {
            needed: XATTR_KEY_FIXED_SIZE,
            offset: 0,
            actual: raw.len(),
        });
    }
    let hdr = parse_jkey_header(raw)?;
    let len = usize::from(read_le_u16(raw, 8)?);
    if len == 0 {
        return Err(ParseError::InvalidField {
            field: "xattr_name_len",
            reason: "zero-length name",
        });
    }
    let stored = ensure_slice(raw, XATTR_KEY_FIXED_SIZE, len)?;
    let name = match stored.split_last() {
        Some((&0, head)) => head.to_vec(),
        _ => {
            return Err(ParseError::InvalidField {
                field: "xattr_name",
                reason: "missing NUL terminator",
            })
        }
    };
    Ok(XattrKey {
        obj_id: hdr.obj_id,
        name,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XattrVal {
    pub flags: u16,
    /// Raw xdata: attribute bytes when embedded, a stream descriptor
    /// otherwise.
    pub data: Vec<u8>,
}

pub fn parse_xattr_val(raw: &[u8]) -> Result<XattrVal, ParseError> {
    if raw.len() < XATTR_VAL_FIXED_SIZE {
        return Err(ParseError::InsufficientData {
            needed: XATTR_VAL_FIXED_SIZE,
            offset: 0,
            actual: raw.len(),
        });
    }
    let flags = read_le_u16(raw, 0)?;
    let len = usize::from(read_le_u16(raw, 2)?);
    let data = ensure_slice(raw, XATTR_VAL_FIXED_SIZE, len)?.to_vec();
    Ok(XattrVal { flags, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use apfs_types::{drec_hash, APFS_TYPE_DIR_REC, APFS_TYPE_FILE_EXTENT, APFS_TYPE_INODE};
    use proptest::prelude::*;

    #[test]
    fn jkey_header_packing() {
        let word = jkey_header_word(0x1234, APFS_TYPE_INODE);
        let hdr = parse_jkey_header(&word.to_le_bytes()).expect("parse");
        assert_eq!(hdr.obj_id, 0x1234);
        assert_eq!(hdr.kind, APFS_TYPE_INODE);
    }

    #[test]
    fn omap_records_round_trip() {
        let mut key = [0_u8; OMAP_KEY_SIZE];
        key[0..8].copy_from_slice(&0x402_u64.to_le_bytes());
        key[8..16].copy_from_slice(&7_u64.to_le_bytes());
        let parsed = parse_omap_key(&key).expect("key");
        assert_eq!(parsed.oid, Oid(0x402));
        assert_eq!(parsed.xid, Xid(7));

        let mut val = [0_u8; OMAP_VAL_SIZE];
        val[4..8].copy_from_slice(&4096_u32.to_le_bytes());
        val[8..16].copy_from_slice(&33_u64.to_le_bytes());
        let parsed = parse_omap_val(&val).expect("val");
        assert_eq!(parsed.size, 4096);
        assert_eq!(parsed.paddr, Paddr(33));

        assert!(parse_omap_key(&key[..15]).is_err());
        assert!(parse_omap_val(&val[..8]).is_err());
    }

    #[test]
    fn file_extent_records() {
        let mut key = [0_u8; FILE_EXTENT_KEY_SIZE];
        key[0..8]
            .copy_from_slice(&jkey_header_word(0x500, APFS_TYPE_FILE_EXTENT).to_le_bytes());
        key[8..16].copy_from_slice(&65536_u64.to_le_bytes());
        let parsed = parse_file_extent_key(&key).expect("key");
        assert_eq!(parsed.obj_id, 0x500);
        assert_eq!(parsed.logical_addr, 65536);

        // Flag bits above bit 56 do not alter the length.
        let mut val = [0_u8; FILE_EXTENT_VAL_SIZE];
        let len_and_flags = (0xAB_u64 << 56) | 8192;
        val[0..8].copy_from_slice(&len_and_flags.to_le_bytes());
        val[8..16].copy_from_slice(&1000_u64.to_le_bytes());
        let parsed = parse_file_extent_val(&val).expect("val");
        assert_eq!(parsed.len(), 8192);
        assert_eq!(parsed.phys_block_num, Paddr(1000));
        assert!(!parsed.is_hole());

        val[8..16].copy_from_slice(&0_u64.to_le_bytes());
        assert!(parse_file_extent_val(&val).expect("val").is_hole());
    }

    fn make_inode_val(with_dstream: bool) -> Vec<u8> {
        let mut raw = vec![0_u8; INODE_VAL_FIXED_SIZE];
        raw[0..8].copy_from_slice(&2_u64.to_le_bytes()); // parent
        raw[8..16].copy_from_slice(&0x500_u64.to_le_bytes()); // private_id
        raw[16..24].copy_from_slice(&1_000_000_000_u64.to_le_bytes());
        raw[56..60].copy_from_slice(&1_u32.to_le_bytes());
        raw[72..76].copy_from_slice(&501_u32.to_le_bytes());
        raw[76..80].copy_from_slice(&20_u32.to_le_bytes());
        raw[80..82].copy_from_slice(&0o100_644_u16.to_le_bytes());

        if with_dstream {
            // xfield blob: 1 field, dstream (type 8, size 40)
            let mut blob = Vec::new();
            blob.extend_from_slice(&1_u16.to_le_bytes());
            blob.extend_from_slice(&44_u16.to_le_bytes());
            blob.extend_from_slice(&[INO_EXT_TYPE_DSTREAM, 0]);
            blob.extend_from_slice(&40_u16.to_le_bytes());
            let mut ds = vec![0_u8; 40];
            ds[0..8].copy_from_slice(&12345_u64.to_le_bytes());
            ds[8..16].copy_from_slice(&16384_u64.to_le_bytes());
            blob.extend_from_slice(&ds);
            raw.extend_from_slice(&blob);
        }
        raw
    }

    #[test]
    fn inode_val_without_xfields() {
        let inode = parse_inode_val(&make_inode_val(false)).expect("parse");
        assert_eq!(inode.parent_id, Cnid(2));
        assert_eq!(inode.private_id, 0x500);
        assert_eq!(inode.owner, 501);
        assert_eq!(inode.group, 20);
        assert_eq!(inode.mode, 0o100_644);
        assert!(inode.dstream.is_none());
    }

    #[test]
    fn inode_val_with_dstream() {
        let inode = parse_inode_val(&make_inode_val(true)).expect("parse");
        let ds = inode.dstream.expect("dstream");
        assert_eq!(ds.size, 12345);
        assert_eq!(ds.alloced_size, 16384);
    }

    #[test]
    fn inode_val_with_name_xfield() {
        let mut raw = make_inode_val(false);
        raw.extend_from_slice(&1_u16.to_le_bytes());
        raw.extend_from_slice(&10_u16.to_le_bytes());
        raw.extend_from_slice(&[INO_EXT_TYPE_NAME, 0]);
        raw.extend_from_slice(&6_u16.to_le_bytes());
        raw.extend_from_slice(b"hello\0");
        let inode = parse_inode_val(&raw).expect("parse");
        assert_eq!(inode.name.as_deref(), Some("hello"));
    }

    #[test]
    fn inode_val_truncated_xfield_rejected() {
        let mut raw = make_inode_val(false);
        raw.extend_from_slice(&1_u16.to_le_bytes());
        raw.extend_from_slice(&44_u16.to_le_bytes());
        raw.extend_from_slice(&[INO_EXT_TYPE_DSTREAM, 0]);
        raw.extend_from_slice(&40_u16.to_le_bytes());
        raw.extend_from_slice(&[0_u8; 10]); // payload cut short
        assert!(parse_inode_val(&raw).is_err());
    }

    #[test]
    fn drec_key_round_trip() {
        let name = b"file.txt";
        let nlh = drec_hash(name);
        let mut raw = Vec::new();
        raw.extend_from_slice(&jkey_header_word(2, APFS_TYPE_DIR_REC).to_le_bytes());
        raw.extend_from_slice(&nlh.to_le_bytes());
        raw.extend_from_slice(name);
        raw.push(0);

        let key = parse_drec_key(&raw).expect("parse");
        assert_eq!(key.obj_id, 2);
        assert_eq!(key.name, name);
        assert_eq!(key.name_len_and_hash, nlh);
    }

    #[test]
    fn drec_key_missing_nul_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&jkey_header_word(2, APFS_TYPE_DIR_REC).to_le_bytes());
        raw.extend_from_slice(&3_u32.to_le_bytes()); // len 3, hash 0
        raw.extend_from_slice(b"abc"); // no NUL inside the declared length
        assert!(parse_drec_key(&raw).is_err());
    }

    #[test]
    fn drec_val_type_bits() {
        let mut raw = [0_u8; DREC_VAL_FIXED_SIZE];
        raw[0..8].copy_from_slice(&0x10_u64.to_le_bytes());
        raw[16..18].copy_from_slice(&apfs_types::DT_DIR.to_le_bytes());
        let val = parse_drec_val(&raw).expect("parse");
        assert_eq!(val.file_id, Cnid(0x10));
        assert_eq!(val.dt(), apfs_types::DT_DIR);
    }

    #[test]
    fn xattr_round_trip() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&jkey_header_word(0x10, apfs_types::APFS_TYPE_XATTR).to_le_bytes());
        let name = apfs_types::SYMLINK_XATTR_NAME.as_bytes();
        raw.extend_from_slice(&u16::try_from(name.len() + 1).unwrap().to_le_bytes());
        raw.extend_from_slice(name);
        raw.push(0);
        let key = parse_xattr_key(&raw).expect("key");
        assert_eq!(key.obj_id, 0x10);
        assert_eq!(key.name, name);

        let mut val = Vec::new();
        val.extend_from_slice(&apfs_types::XATTR_DATA_EMBEDDED.to_le_bytes());
        val.extend_from_slice(&7_u16.to_le_bytes());
        val.extend_from_slice(b"target\0");
        let parsed = parse_xattr_val(&val).expect("val");
        assert_eq!(parsed.flags, apfs_types::XATTR_DATA_EMBEDDED);
        assert_eq!(parsed.data, b"target\0");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn inode_val_no_panic(raw in proptest::collection::vec(any::<u8>(), 0..=512)) {
            let _ = parse_inode_val(&raw);
        }

        #[test]
        fn drec_key_no_panic(raw in proptest::collection::vec(any::<u8>(), 0..=300)) {
            let _ = parse_drec_key(&raw);
        }

        #[test]
        fn xattr_records_no_panic(raw in proptest::collection::vec(any::<u8>(), 0..=300)) {
            let _ = parse_xattr_key(&raw);
            let _ = parse_xattr_val(&raw);
        }

        #[test]
        fn extent_records_no_panic(raw in proptest::collection::vec(any::<u8>(), 0..=64)) {
            let _ = parse_file_extent_key(&raw);
            let _ = parse_file_extent_val(&raw);
        }
    }
}

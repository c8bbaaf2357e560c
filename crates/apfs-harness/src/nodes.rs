//! B-tree node serialization for synthesized images.
//!
//! Mirrors the layout the reader parses: object header, node header,
//! ToC, key area growing upward, value area growing downward from the
//! end (root nodes reserve the 40-byte info footer).

use anyhow::{ensure, Context, Result};
use apfs_ondisk::{
    seal_object_checksum, BTNODE_FIXED_KV_SIZE, BTNODE_ROOT, BTREE_INFO_SIZE,
    BTREE_NODE_DATA_START,
};

#[derive(Debug)]
pub(crate) struct NodeSpec {
    pub block_size: usize,
    pub flags: u16,
    pub level: u16,
    /// Object id stamped into the header: the paddr for physical
    /// objects, the virtual oid for catalog nodes.
    pub oid: u64,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    /// (key_size, val_size) for the info footer of fixed-kv roots.
    pub fixed: Option<(u32, u32)>,
}

pub(crate) fn build_node(spec: &NodeSpec) -> Result<Vec<u8>> {
    let bs = spec.block_size;
    let is_root = spec.flags & BTNODE_ROOT != 0;
    let entry_size = if spec.flags & BTNODE_FIXED_KV_SIZE != 0 {
        4
    } else {
        8
    };
    let table_len = spec.entries.len() * entry_size;
    let key_base = BTREE_NODE_DATA_START + table_len;
    let val_end = if is_root { bs - BTREE_INFO_SIZE } else { bs };

    let keys_len: usize = spec.entries.iter().map(|(k, _)| k.len()).sum();
    let vals_len: usize = spec.entries.iter().map(|(_, v)| v.len()).sum();
    ensure!(
        key_base + keys_len + vals_len <= val_end,
        "node overflow: {} entries need {} bytes in a {}-byte block",
        spec.entries.len(),
        key_base + keys_len + vals_len,
        bs
    );

    let mut block = vec![0_u8; bs];
    block[0x08..0x10].copy_from_slice(&spec.oid.to_le_bytes());
    block[0x10..0x18].copy_from_slice(&1_u64.to_le_bytes());
    let obj_type: u32 = if is_root { 2 } else { 3 };
    block[0x18..0x1C].copy_from_slice(&obj_type.to_le_bytes());

    block[0x20..0x22].copy_from_slice(&spec.flags.to_le_bytes());
    block[0x22..0x24].copy_from_slice(&spec.level.to_le_bytes());
    block[0x24..0x28].copy_from_slice(
        &u32::try_from(spec.entries.len())
            .context("entry count")?
            .to_le_bytes(),
    );
    block[0x28..0x2A].copy_from_slice(&0_u16.to_le_bytes());
    block[0x2A..0x2C].copy_from_slice(&u16::try_from(table_len).context("toc size")?.to_le_bytes());

    let mut key_off = 0_usize;
    let mut val_off = 0_usize;
    for (i, (key, val)) in spec.entries.iter().enumerate() {
        let toc = BTREE_NODE_DATA_START + i * entry_size;
        val_off += val.len();
        if entry_size == 4 {
            block[toc..toc + 2]
                .copy_from_slice(&u16::try_from(key_off).context("key offset")?.to_le_bytes());
            block[toc + 2..toc + 4]
                .copy_from_slice(&u16::try_from(val_off).context("val offset")?.to_le_bytes());
        } else {
            block[toc..toc + 2]
                .copy_from_slice(&u16::try_from(key_off).context("key offset")?.to_le_bytes());
            block[toc + 2..toc + 4]
                .copy_from_slice(&u16::try_from(key.len()).context("key length")?.to_le_bytes());
            block[toc + 4..toc + 6]
                .copy_from_slice(&u16::try_from(val_off).context("val offset")?.to_le_bytes());
            block[toc + 6..toc + 8]
                .copy_from_slice(&u16::try_from(val.len()).context("val length")?.to_le_bytes());
        }
        block[key_base + key_off..key_base + key_off + key.len()].copy_from_slice(key);
        let vstart = val_end - val_off;
        block[vstart..vstart + val.len()].copy_from_slice(val);
        key_off += key.len();
    }

    if is_root {
        let base = bs - BTREE_INFO_SIZE;
        let (key_size, val_size) = spec.fixed.unwrap_or((0, 0));
        block[base + 4..base + 8].copy_from_slice(&(bs as u32).to_le_bytes());
        block[base + 8..base + 12].copy_from_slice(&key_size.to_le_bytes());
        block[base + 12..base + 16].copy_from_slice(&val_size.to_le_bytes());
        block[base + 24..base + 32]
            .copy_from_slice(&(spec.entries.len() as u64).to_le_bytes());
        block[base + 32..base + 40].copy_from_slice(&1_u64.to_le_bytes());
    }

    seal_object_checksum(&mut block).context("seal node")?;
    Ok(block)
}

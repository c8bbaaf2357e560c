#![forbid(unsafe_code)]
//! B-tree traversal for the omap and the catalog.
//!
//! `Table` is the handle to one node: it owns the block buffer, carries
//! the validated header and the tree-wide geometry, and locates key and
//! value bytes by entry index. The query engine descends from a root
//! `Table` to a leaf; the omap resolver layers virtual-to-physical
//! translation on top.

use apfs_block::{BlockBuf, BlockDevice};
use apfs_error::{ApfsError, Result};
use apfs_ondisk::{
    locate_kv, parse_btree_info, verify_object_checksum, BtreeInfo, BtreeNodeHeader,
};
use apfs_types::{Paddr, ParseError};

mod key;
mod query;

pub use key::{CatalogKey, Secondary};
pub use query::{
    catalog_query, omap_lookup, omap_query, omap_read_table, walk_catalog_records,
    walk_omap_records, LookupMode, QueryResult,
};

/// Map a parse-layer failure to a corruption error tagged with the block.
pub(crate) fn corrupt(block: Paddr, err: &ParseError) -> ApfsError {
    ApfsError::Corruption {
        block: block.0,
        detail: err.to_string(),
    }
}

/// One B-tree node, parsed and checksum-verified.
///
/// Contents are immutable once opened; handles are cheap to share because
/// the underlying buffer is reference-counted.
#[derive(Debug, Clone)]
pub struct Table {
    buf: BlockBuf,
    header: BtreeNodeHeader,
    info: BtreeInfo,
}

impl Table {
    /// Read and parse a node block.
    ///
    /// Root nodes carry their own `btree_info` footer; non-root nodes
    /// inherit the geometry of the root they were reached from.
    pub fn open(
        dev: &dyn BlockDevice,
        block: Paddr,
        inherited: Option<BtreeInfo>,
    ) -> Result<Self> {
        let buf = dev.read_block(block)?;
        let data = buf.as_slice();

        verify_object_checksum(data).map_err(|e| corrupt(block, &e))?;
        let header = BtreeNodeHeader::parse(data).map_err(|e| corrupt(block, &e))?;
        header.validate(data.len()).map_err(|e| corrupt(block, &e))?;

        let info = if header.is_root() {
            parse_btree_info(data).map_err(|e| corrupt(block, &e))?
        } else {
            inherited.ok_or_else(|| ApfsError::Corruption {
                block: block.0,
                detail: "non-root node reached without tree geometry".to_owned(),
            })?
        };

        Ok(Self { buf, header, info })
    }

    /// Number of entries in this node.
    #[must_use]
    pub fn records(&self) -> usize {
        self.header.nkeys as usize
    }

    #[must_use]
    pub fn level(&self) -> u16 {
        self.header.level
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.header.is_leaf()
    }

    #[must_use]
    pub fn block(&self) -> Paddr {
        self.buf.block()
    }

    #[must_use]
    pub fn info(&self) -> BtreeInfo {
        self.info
    }

    /// The node's full raw block, for decoding keys and values in place.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Byte range of entry `index`'s key within `raw()`.
    pub fn locate_key(&self, index: usize) -> Result<std::ops::Range<usize>> {
        Ok(self.locate(index)?.key)
    }

    /// Byte range of entry `index`'s value within `raw()`.
    pub fn locate_value(&self, index: usize) -> Result<std::ops::Range<usize>> {
        Ok(self.locate(index)?.val)
    }

    pub fn key_bytes(&self, index: usize) -> Result<&[u8]> {
        let range = self.locate_key(index)?;
        Ok(&self.raw()[range])
    }

    pub fn val_bytes(&self, index: usize) -> Result<&[u8]> {
        let range = self.locate_value(index)?;
        Ok(&self.raw()[range])
    }

    fn locate(&self, index: usize) -> Result<apfs_ondisk::KvRange> {
        locate_kv(self.raw(), &self.header, &self.info, index)
            .map_err(|e| corrupt(self.block(), &e))
    }
}

//! Query engine: descend a copy-on-write B-tree from a root `Table` to a
//! leaf record, plus the omap resolver and bounded record walkers.
//!
//! Child pointers in the omap tree are physical block numbers; child
//! pointers in the catalog are virtual oids that are translated through
//! the volume omap before the child is read.

use crate::{corrupt, CatalogKey, Table};
use apfs_block::BlockDevice;
use apfs_error::{ApfsError, Result};
use apfs_ondisk::{parse_omap_key, parse_omap_val, BtreeInfo, OmapKey};
use apfs_types::{Oid, Paddr, ParseError, Xid};
use std::cmp::Ordering;
use std::ops::Range;
use tracing::trace;

/// Trees deeper than this are treated as corrupt. Real containers stay in
/// the single digits; the bound keeps a forged level field from driving
/// unbounded descent.
const MAX_TREE_DEPTH: u16 = 16;

/// How the leaf record is selected once the descent arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// The record's key must equal the search key.
    Exact,
    /// The greatest record with key <= the search key.
    LessOrEqual,
}

/// A located record: the leaf's `Table` handle, the entry index, and the
/// key/value byte ranges within the leaf's raw block. The leaf buffer
/// stays alive for as long as the result is held.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub table: Table,
    pub index: usize,
    pub key: Range<usize>,
    pub val: Range<usize>,
}

impl QueryResult {
    #[must_use]
    pub fn key_bytes(&self) -> &[u8] {
        &self.table.raw()[self.key.clone()]
    }

    #[must_use]
    pub fn val_bytes(&self) -> &[u8] {
        &self.table.raw()[self.val.clone()]
    }
}

type KeyCmp<'a> = dyn Fn(&[u8]) -> std::result::Result<Ordering, ParseError> + 'a;
type ChildOpen<'a> = dyn Fn(u64, BtreeInfo) -> Result<Table> + 'a;

/// Greatest entry index whose key is <= the search key, or `None`.
///
/// Binary search; entries within a node are key-ordered ascending.
fn last_le(node: &Table, cmp_entry: &KeyCmp<'_>) -> Result<Option<usize>> {
    let mut lo = 0_usize;
    let mut hi = node.records();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let ord = cmp_entry(node.key_bytes(mid)?).map_err(|e| corrupt(node.block(), &e))?;
        if ord == Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo.checked_sub(1))
}

/// Decode an internal entry's value as a child pointer.
fn child_pointer(node: &Table, index: usize) -> Result<u64> {
    let val = node.val_bytes(index)?;
    let bytes: [u8; 8] = val.try_into().map_err(|_| ApfsError::Corruption {
        block: node.block().0,
        detail: format!("internal value is not an 8-byte child pointer (len {})", val.len()),
    })?;
    Ok(u64::from_le_bytes(bytes))
}

fn check_child_level(parent: &Table, child: &Table) -> Result<()> {
    if child.level() + 1 != parent.level() {
        return Err(ApfsError::Corruption {
            block: child.block().0,
            detail: format!(
                "child level {} does not follow parent level {}",
                child.level(),
                parent.level()
            ),
        });
    }
    Ok(())
}

fn query_inner(
    root: &Table,
    open_child: &ChildOpen<'_>,
    cmp_entry: &KeyCmp<'_>,
    mode: LookupMode,
) -> Result<QueryResult> {
    if root.level() > MAX_TREE_DEPTH {
        return Err(ApfsError::Corruption {
            block: root.block().0,
            detail: format!("tree depth {} exceeds the supported maximum", root.level()),
        });
    }

    let mut node = root.clone();
    loop {
        let Some(index) = last_le(&node, cmp_entry)? else {
            return Err(ApfsError::NotFound(
                "no record at or below the search key".to_owned(),
            ));
        };

        if node.is_leaf() {
            if mode == LookupMode::Exact {
                let ord =
                    cmp_entry(node.key_bytes(index)?).map_err(|e| corrupt(node.block(), &e))?;
                if ord != Ordering::Equal {
                    return Err(ApfsError::NotFound("no exact record match".to_owned()));
                }
            }
            let key = node.locate_key(index)?;
            let val = node.locate_value(index)?;
            return Ok(QueryResult {
                table: node,
                index,
                key,
                val,
            });
        }

        let child = open_child(child_pointer(&node, index)?, node.info())?;
        check_child_level(&node, &child)?;
        node = child;
    }
}

// ── Omap ────────────────────────────────────────────────────────────────────

/// Query the object map's B-tree directly.
pub fn omap_query(
    dev: &dyn BlockDevice,
    omap_root: &Table,
    key: OmapKey,
    mode: LookupMode,
) -> Result<QueryResult> {
    query_inner(
        omap_root,
        &|child, info| Table::open(dev, Paddr(child), Some(info)),
        &|raw| Ok(parse_omap_key(raw)?.cmp(&key)),
        mode,
    )
}

/// Translate a virtual object id to the physical block of its newest
/// committed version.
pub fn omap_lookup(dev: &dyn BlockDevice, omap_root: &Table, oid: Oid) -> Result<Paddr> {
    // Nearest-lower on (oid, MAX) lands on the highest xid for the oid.
    let search = OmapKey {
        oid,
        xid: Xid::MAX,
    };
    let found = omap_query(dev, omap_root, search, LookupMode::LessOrEqual)
        .map_err(|e| match e {
            ApfsError::NotFound(_) => {
                ApfsError::NotFound(format!("omap has no mapping for oid {oid}"))
            }
            other => other,
        })?;

    let entry =
        parse_omap_key(found.key_bytes()).map_err(|e| corrupt(found.table.block(), &e))?;
    if entry.oid != oid {
        return Err(ApfsError::NotFound(format!(
            "omap has no mapping for oid {oid}"
        )));
    }

    let val = parse_omap_val(found.val_bytes()).map_err(|e| corrupt(found.table.block(), &e))?;
    trace!(target: "apfs::btree", oid = oid.0, xid = entry.xid.0, paddr = val.paddr.0, "omap_lookup");
    Ok(val.paddr)
}

/// Resolve a virtual oid through the omap and open the result as a node.
///
/// The target is expected to be the root of its own tree (it carries a
/// `btree_info` footer), so no geometry is inherited.
pub fn omap_read_table(dev: &dyn BlockDevice, omap_root: &Table, oid: Oid) -> Result<Table> {
    let paddr = omap_lookup(dev, omap_root, oid)?;
    Table::open(dev, paddr, None)
}

// ── Catalog ─────────────────────────────────────────────────────────────────

/// Query the catalog. Internal child pointers are virtual oids resolved
/// through the volume omap.
pub fn catalog_query(
    dev: &dyn BlockDevice,
    omap_root: &Table,
    cat_root: &Table,
    key: &CatalogKey,
    mode: LookupMode,
) -> Result<QueryResult> {
    query_inner(
        cat_root,
        &|child, info| {
            let paddr = omap_lookup(dev, omap_root, Oid(child))?;
            Table::open(dev, paddr, Some(info))
        },
        &|raw| Ok(key.cmp_raw(raw)?),
        mode,
    )
}

// ── Record walkers ──────────────────────────────────────────────────────────

/// Visit every record of the omap tree in key order. The visitor returns
/// `false` to stop early.
pub fn walk_omap_records(
    dev: &dyn BlockDevice,
    root: &Table,
    visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
) -> Result<()> {
    walk_inner(
        root,
        &|child, info| Table::open(dev, Paddr(child), Some(info)),
        None,
        visit,
    )
    .map(|_| ())
}

/// Visit catalog records with keys in `[lower, upper]`, in key order.
///
/// Subtrees that cannot intersect the bounds are pruned during the
/// descent. The visitor returns `false` to stop early.
pub fn walk_catalog_records(
    dev: &dyn BlockDevice,
    omap_root: &Table,
    root: &Table,
    lower: &CatalogKey,
    upper: &CatalogKey,
    visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
) -> Result<()> {
    let cmp_lower: &KeyCmp<'_> = &|raw| Ok(lower.cmp_raw(raw)?);
    let cmp_upper: &KeyCmp<'_> = &|raw| Ok(upper.cmp_raw(raw)?);
    walk_inner(
        root,
        &|child, info| {
            let paddr = omap_lookup(dev, omap_root, Oid(child))?;
            Table::open(dev, paddr, Some(info))
        },
        Some((cmp_lower, cmp_upper)),
        visit,
    )
    .map(|_| ())
}

/// Depth-first in-order walk. Returns `false` once the visitor (or the
/// upper bound) stops the traversal.
fn walk_inner(
    node: &Table,
    open_child: &ChildOpen<'_>,
    bounds: Option<(&KeyCmp<'_>, &KeyCmp<'_>)>,
    visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
) -> Result<bool> {
    if node.level() > MAX_TREE_DEPTH {
        return Err(ApfsError::Corruption {
            block: node.block().0,
            detail: format!("tree depth {} exceeds the supported maximum", node.level()),
        });
    }

    if node.is_leaf() {
        for index in 0..node.records() {
            let key = node.key_bytes(index)?;
            if let Some((cmp_lower, cmp_upper)) = bounds {
                if cmp_lower(key).map_err(|e| corrupt(node.block(), &e))? == Ordering::Less {
                    continue;
                }
                if cmp_upper(key).map_err(|e| corrupt(node.block(), &e))? == Ordering::Greater {
                    return Ok(false);
                }
            }
            let range = node.locate_value(index)?;
            if !visit(node.key_bytes(index)?, &node.raw()[range])? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    for index in 0..node.records() {
        if let Some((cmp_lower, cmp_upper)) = bounds {
            // Child `index` covers keys in [key[index], key[index + 1]).
            if index + 1 < node.records() {
                let next = node.key_bytes(index + 1)?;
                if cmp_lower(next).map_err(|e| corrupt(node.block(), &e))? != Ordering::Greater {
                    continue;
                }
            }
            let first = node.key_bytes(index)?;
            if cmp_upper(first).map_err(|e| corrupt(node.block(), &e))? == Ordering::Greater {
                return Ok(false);
            }
        }

        let child = open_child(child_pointer(node, index)?, node.info())?;
        check_child_level(node, &child)?;
        if !walk_inner(&child, open_child, bounds, visit)? {
            return Ok(false);
        }
    }
    Ok(true)
}

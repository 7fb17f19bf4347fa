//! The copy-on-write B+tree engine.
//!
//! One tree is described entirely by its `DbRecord`: root page, depth and
//! page/entry counters. Branch pages map separator keys to child pages;
//! index 0 of every branch carries a zero-length key and covers all keys
//! below the separator at index 1. Leaf pages hold the key/value nodes,
//! with large values relocated to overflow chains and `DUPSORT`
//! duplicates relocated to a nested sub-tree whose descriptor is embedded
//! in the leaf node.
//!
//! ## Descent
//!
//! Reads walk the tree statelessly: binary-search each branch, follow the
//! child, stop at a leaf. Writes walk the same path in modify mode, where
//! every visited page is first made private to the transaction
//! (copy-on-write), the parent's child pointer is patched to the new page
//! number, and the parent link of each dirty page is refreshed so splits
//! and rebalances can climb back up without machine pointers.
//!
//! ## Mutation
//!
//! - `put` rewrites same-sized values in place, splits leaves that cannot
//!   take the new node, and spills values of a quarter page or more into
//!   overflow chains.
//! - `del` removes the node, then rebalances: pages under a quarter full
//!   borrow a node from a fat sibling or merge into it, recursively up
//!   the tree; the root collapses when a branch is down to one child.
//! - `DUPSORT` values become keys of the embedded sub-tree; operations on
//!   it run through a temporary DB slot sharing the parent transaction's
//!   dirty pages and allocator, and the mutated descriptor is written
//!   back into the parent leaf afterwards.
//!
//! Split point and fill thresholds, the separator rules (including the
//! zero-length flattening of a branch's leftmost key) and the shape of
//! the rebalance decisions follow the storage format exactly; see
//! `DESIGN.md` for the places where behavior is deliberately different.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::flags::{DbFlags, WriteFlags};
use crate::meta::DbRecord;
use crate::page::{
    branch_size, is_overflow_size, overflow_page_count, NodePayload, NodeRef, PageView, Pgno,
    INVALID_PGNO, NODE_BIGDATA, NODE_HEADER_SIZE, NODE_SUBDATA, INDEX_ENTRY_SIZE,
    PAGE_BRANCH, PAGE_HEADER_SIZE, PAGE_LEAF, PAGE_OVERFLOW,
};
use crate::txn::{check_dbi, check_key, Dbi, TxnRef, WriteTxn};
use crate::{CmpFn, MAX_KEY_SIZE};

/// Scratch copy of a key; large enough for most keys without heap.
type KeyBuf = SmallVec<[u8; 64]>;

/// Target of a descent.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SearchKey<'k> {
    /// Leftmost leaf.
    First,
    /// Rightmost leaf.
    Last,
    Key(&'k [u8]),
}

// ----------------------------------------------------------------------
// Comparators
// ----------------------------------------------------------------------

pub(crate) fn forward_cmp(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Byte-reverse comparison: used for `REVERSEKEY`, and for `INTEGERKEY`
/// on little-endian hosts where it yields numeric order.
pub(crate) fn reverse_cmp(a: &[u8], b: &[u8]) -> Ordering {
    a.iter().rev().cmp(b.iter().rev())
}

/// Pick the effective comparator for a tree: user override first, then
/// the flag-driven built-ins.
pub(crate) fn resolve_cmp(db_flags: u16, user: Option<CmpFn>) -> CmpFn {
    if let Some(cmp) = user {
        return cmp;
    }
    let reverse_mask = if cfg!(target_endian = "little") {
        (DbFlags::REVERSEKEY | DbFlags::INTEGERKEY).persisted()
    } else {
        DbFlags::REVERSEKEY.persisted()
    };
    if db_flags & reverse_mask != 0 {
        reverse_cmp
    } else {
        forward_cmp
    }
}

// ----------------------------------------------------------------------
// Search
// ----------------------------------------------------------------------

/// Binary search for `key` within a page. Returns the index of the
/// smallest node with key >= `key` (None if all are smaller) and whether
/// the match is exact. Branch pages skip index 0: its zero-length key is
/// a stand-in for minus infinity.
pub(crate) fn search_node(
    page: PageView<'_>,
    cmp: CmpFn,
    key: &[u8],
) -> Result<(Option<usize>, bool)> {
    let num_keys = page.num_keys();
    debug_assert!(num_keys > 0);

    let mut low = if page.is_leaf() { 0i64 } else { 1i64 };
    let mut high = num_keys as i64 - 1;
    let mut i = 0usize;
    let mut rc = Ordering::Equal;

    while low <= high {
        i = ((low + high) >> 1) as usize;
        let node = page.node(i)?;
        rc = cmp(key, node.key());
        match rc {
            Ordering::Equal => break,
            Ordering::Greater => low = i as i64 + 1,
            Ordering::Less => high = i as i64 - 1,
        }
    }

    if rc == Ordering::Greater {
        // The probed node is smaller; step to the smallest larger one.
        i += 1;
        if i >= num_keys {
            return Ok((None, false));
        }
    }
    Ok((Some(i), rc == Ordering::Equal))
}

/// Walk from `root` down to a leaf, following `key`. Visited pages and
/// the branch indices taken are appended to `frames` when given (the
/// leaf goes in with index 0; the caller positions it).
pub(crate) fn descend<'a>(
    txn: TxnRef<'a>,
    root: Pgno,
    cmp: CmpFn,
    key: SearchKey<'_>,
    mut frames: Option<&mut Vec<(Pgno, usize)>>,
) -> Result<Pgno> {
    let mut pgno = root;
    loop {
        let page = PageView::new(txn.page(pgno)?)?;
        if page.is_leaf() {
            if let Some(frames) = frames.as_deref_mut() {
                frames.push((pgno, 0));
            }
            return Ok(pgno);
        }
        ensure!(
            page.is_branch(),
            "page {} is neither leaf nor branch during descent",
            pgno
        );
        let num_keys = page.num_keys();
        // A branch page always carries at least two children; a root
        // collapse removes the page instead of leaving one behind.
        debug_assert!(num_keys > 1, "branch page {} has {} keys", pgno, num_keys);

        let index = match key {
            SearchKey::First => 0,
            SearchKey::Last => num_keys - 1,
            SearchKey::Key(k) => match search_node(page, cmp, k)? {
                (None, _) => num_keys - 1,
                (Some(i), true) => i,
                (Some(i), false) => {
                    // Separators mark the first key of their subtree, so
                    // an inexact hit belongs to the child on the left.
                    debug_assert!(i > 0);
                    i - 1
                }
            },
        };

        if let Some(frames) = frames.as_deref_mut() {
            frames.push((pgno, index));
        }
        pgno = page.node(index)?.child_pgno();
    }
}

/// Value bytes of a leaf node, chasing the overflow chain if needed.
pub(crate) fn node_data<'a>(txn: TxnRef<'a>, node: NodeRef<'a>) -> Result<&'a [u8]> {
    if !node.is_big_data() {
        return Ok(node.stored_data());
    }
    let head = node.overflow_root()?;
    let span = txn.page(head)?;
    let size = node.data_size();
    ensure!(
        PAGE_HEADER_SIZE + size <= span.len(),
        "overflow chain at page {} is shorter than its value ({} bytes)",
        head,
        size
    );
    Ok(&span[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + size])
}

/// Point lookup. For `DUPSORT` trees this returns the first duplicate.
pub(crate) fn lookup<'a>(txn: TxnRef<'a>, dbi: Dbi, key: &[u8]) -> Result<Option<&'a [u8]>> {
    let db = txn.db(dbi);
    if db.root() == INVALID_PGNO {
        return Ok(None);
    }
    let cmp = resolve_cmp(db.flags(), txn.dbx(dbi).cmp);
    let leaf_pgno = descend(txn, db.root(), cmp, SearchKey::Key(key), None)?;
    let page = PageView::new(txn.page(leaf_pgno)?)?;
    if page.num_keys() == 0 {
        return Ok(None);
    }
    let (index, exact) = search_node(page, cmp, key)?;
    let (Some(index), true) = (index, exact) else {
        return Ok(None);
    };
    let node = page.node(index)?;

    if db.flags() & DbFlags::DUPSORT.persisted() != 0 && node.is_sub_data() {
        let sub = DbRecord::from_bytes(node.stored_data())?;
        if sub.root() == INVALID_PGNO {
            return Ok(None);
        }
        let dcmp = resolve_cmp(sub.flags(), txn.dbx(dbi).dcmp);
        let sub_leaf = descend(txn, sub.root(), dcmp, SearchKey::First, None)?;
        let sub_page = PageView::new(txn.page(sub_leaf)?)?;
        return Ok(Some(sub_page.node(0)?.key()));
    }
    node_data(txn, node).map(Some)
}

// ----------------------------------------------------------------------
// Modify-mode descent
// ----------------------------------------------------------------------

/// Copy-on-write descent: returns the (now dirty) leaf page for `key`,
/// or `None` if the tree is empty. Every page on the path is touched and
/// its parent link refreshed.
pub(crate) fn search_modify(
    txn: &mut WriteTxn<'_>,
    dbi: Dbi,
    key: SearchKey<'_>,
) -> Result<Option<Pgno>> {
    txn.check_usable()?;

    // A named DB's record lives in the main DB; bring the path to that
    // record into this transaction before the sub-tree itself changes.
    if dbi.0 > Dbi::MAIN.0 && !txn.dbxs[dbi.0].dirty {
        let name = txn.dbxs[dbi.0].name.clone();
        if !name.is_empty() {
            search_modify(txn, Dbi::MAIN, SearchKey::Key(name.as_bytes()))?;
        }
        txn.dbxs[dbi.0].dirty = true;
    }

    let root = txn.dbs[dbi.0].root();
    if root == INVALID_PGNO {
        return Ok(None);
    }

    let root = if txn.is_dirty(root) {
        txn.set_dirty_parent(root, None);
        root
    } else {
        let new_root = txn.touch(root, None)?;
        txn.dbs[dbi.0].set_root(new_root);
        new_root
    };

    let cmp = resolve_cmp(txn.dbs[dbi.0].flags(), txn.dbxs[dbi.0].cmp);
    let mut pgno = root;
    loop {
        let (is_leaf, index, child) = {
            let page = PageView::new(txn.page(pgno)?)?;
            if page.is_leaf() {
                (true, 0, 0)
            } else {
                ensure!(
                    page.is_branch(),
                    "page {} is neither leaf nor branch during descent",
                    pgno
                );
                let num_keys = page.num_keys();
                debug_assert!(num_keys > 1, "branch page {} has {} keys", pgno, num_keys);
                let index = match key {
                    SearchKey::First => 0,
                    SearchKey::Last => num_keys - 1,
                    SearchKey::Key(k) => match search_node(page, cmp, k)? {
                        (None, _) => num_keys - 1,
                        (Some(i), true) => i,
                        (Some(i), false) => {
                            debug_assert!(i > 0);
                            i - 1
                        }
                    },
                };
                (false, index, page.node(index)?.child_pgno())
            }
        };
        if is_leaf {
            return Ok(Some(pgno));
        }
        pgno = txn.touch(child, Some((pgno, index)))?;
    }
}

// ----------------------------------------------------------------------
// Insert
// ----------------------------------------------------------------------

pub(crate) enum PutOutcome {
    Done,
    /// `NOOVERWRITE` (or `NODUPDATA` on the sub-tree) hit an existing
    /// entry; the transaction remains usable.
    KeyExist,
}

enum PreparedValue {
    Inline { flags: u8 },
    Overflow { head: Pgno },
    SubTree { record: DbRecord },
}

impl<'env> WriteTxn<'env> {
    /// Insert or update a key. In a `DUPSORT` database the value joins
    /// the key's sorted duplicate set.
    pub fn put(&mut self, dbi: Dbi, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        check_dbi(dbi, self.dbs.len())?;
        check_key(key)?;
        self.check_usable()?;
        if self.dbs[dbi.0].flags() & DbFlags::DUPSORT.persisted() != 0 {
            ensure!(
                !data.is_empty() && data.len() <= MAX_KEY_SIZE,
                "value size {} is out of range for a DUPSORT database (1..={})",
                data.len(),
                MAX_KEY_SIZE
            );
        }
        ensure!(
            data.len() <= u32::MAX as usize,
            "value of {} bytes is too large",
            data.len()
        );

        match put_internal(self, dbi, key, data, flags, 0) {
            Ok(PutOutcome::Done) => Ok(()),
            Ok(PutOutcome::KeyExist) => bail!("key already exists"),
            Err(e) => {
                self.mark_error();
                Err(e)
            }
        }
    }

    /// Delete a key, or with `data` one duplicate out of a `DUPSORT`
    /// key. Returns whether anything was deleted.
    pub fn del(&mut self, dbi: Dbi, key: &[u8], data: Option<&[u8]>) -> Result<bool> {
        check_dbi(dbi, self.dbs.len())?;
        check_key(key)?;
        self.check_usable()?;

        match del_internal(self, dbi, key, data) {
            Ok(deleted) => Ok(deleted),
            Err(e) => {
                self.mark_error();
                Err(e)
            }
        }
    }
}

/// Write a named database's descriptor into the main DB under its name.
pub(crate) fn put_db_record(txn: &mut WriteTxn<'_>, name: &[u8], record: &DbRecord) -> Result<()> {
    let bytes = crate::txn::db_record_bytes(record).to_vec();
    match put_internal(txn, Dbi::MAIN, name, &bytes, WriteFlags::empty(), NODE_SUBDATA)? {
        PutOutcome::Done => Ok(()),
        PutOutcome::KeyExist => unreachable!("db record puts never set NOOVERWRITE"),
    }
}

pub(crate) fn put_internal(
    txn: &mut WriteTxn<'_>,
    dbi: Dbi,
    key: &[u8],
    data: &[u8],
    flags: WriteFlags,
    node_flags: u8,
) -> Result<PutOutcome> {
    let psize = txn.psize();
    let dupsort = txn.dbs[dbi.0].flags() & DbFlags::DUPSORT.persisted() != 0;
    let cmp = resolve_cmp(txn.dbs[dbi.0].flags(), txn.dbxs[dbi.0].cmp);
    trace!(dbi = dbi.0, key_len = key.len(), data_len = data.len(), "put");

    let mut replacing = false;
    let (leaf, index) = match search_modify(txn, dbi, SearchKey::Key(key))? {
        None => {
            // Empty tree: the first leaf becomes the root.
            let pgno = txn.new_page(dbi, PAGE_LEAF, 1)?;
            let db = &mut txn.dbs[dbi.0];
            db.set_root(pgno);
            db.set_depth(db.depth() + 1);
            debug!(dbi = dbi.0, root = pgno, "created root leaf");
            (pgno, 0)
        }
        Some(leaf) => {
            let page = PageView::new(txn.page(leaf)?)?;
            let (found, exact) = if page.num_keys() == 0 {
                (None, false)
            } else {
                search_node(page, cmp, key)?
            };
            if let (Some(i), true) = (found, exact) {
                if dupsort {
                    // The node already holds a duplicate sub-tree; add
                    // the value to it.
                    return put_dup(txn, dbi, leaf, i, data, flags);
                }
                if flags.contains(WriteFlags::NOOVERWRITE) {
                    return Ok(PutOutcome::KeyExist);
                }
                let node = page.node(i)?;
                if !node.is_big_data() && node.data_size() == data.len() {
                    // Same size: overwrite in place, no allocation.
                    let mut page = txn.page_mut(leaf)?;
                    page.node_stored_data_mut(i)?.copy_from_slice(data);
                    return Ok(PutOutcome::Done);
                }
                // Different size: replace the node wholesale, returning
                // its old overflow chain to the free list.
                if node.is_big_data() {
                    let head = node.overflow_root()?;
                    let size = node.data_size();
                    free_overflow_chain(txn, head, size)?;
                }
                let mut pm = txn.page_mut(leaf)?;
                pm.delete_node(i);
                replacing = true;
                (leaf, i)
            } else {
                // Not found: the ordered position, appended if past end.
                let index = found.unwrap_or(page.num_keys());
                (leaf, index)
            }
        }
    };

    // Decide what the leaf node will store.
    let prepared = if dupsort {
        PreparedValue::SubTree {
            record: DbRecord::new(0),
        }
    } else if is_overflow_size(psize, data.len()) {
        let npages = overflow_page_count(psize, data.len());
        let head = txn.new_page(dbi, PAGE_OVERFLOW, npages)?;
        let mut pm = txn.page_mut(head)?;
        pm.overflow_body_mut()[..data.len()].copy_from_slice(data);
        trace!(head, npages, "spilled value to overflow chain");
        PreparedValue::Overflow { head }
    } else {
        PreparedValue::Inline { flags: node_flags }
    };

    let record_bytes;
    let head_bytes;
    let (stored, data_size, nflags): (&[u8], usize, u8) = match &prepared {
        PreparedValue::Inline { flags } => (data, data.len(), *flags),
        PreparedValue::Overflow { head } => {
            head_bytes = head.to_le_bytes();
            (&head_bytes, data.len(), NODE_BIGDATA | node_flags)
        }
        PreparedValue::SubTree { record } => {
            record_bytes = crate::txn::db_record_bytes(record).to_vec();
            (record_bytes.as_slice(), record_bytes.len(), NODE_SUBDATA)
        }
    };

    let node_size = NODE_HEADER_SIZE + key.len() + stored.len() + INDEX_ENTRY_SIZE;
    let fits = PageView::new(txn.page(leaf)?)?.size_left() >= node_size;
    let payload = NodePayload::Leaf {
        stored,
        data_size,
        flags: nflags,
    };
    let (leaf, index) = if fits {
        let mut pm = txn.page_mut(leaf)?;
        pm.insert_node(index, key, payload)?;
        (leaf, index)
    } else {
        split(txn, dbi, leaf, index, key, payload)?
    };

    if !replacing {
        let db = &mut txn.dbs[dbi.0];
        db.set_entries(db.entries() + 1);
    }

    if dupsort {
        return put_dup(txn, dbi, leaf, index, data, flags);
    }
    Ok(PutOutcome::Done)
}

/// Insert a duplicate value into the sub-tree embedded in a leaf node:
/// the value becomes a key of the sub-tree (with an empty value), and
/// the mutated descriptor is written back into the node.
fn put_dup(
    txn: &mut WriteTxn<'_>,
    dbi: Dbi,
    leaf: Pgno,
    index: usize,
    data: &[u8],
    flags: WriteFlags,
) -> Result<PutOutcome> {
    let record = {
        let page = PageView::new(txn.page(leaf)?)?;
        *DbRecord::from_bytes(page.node(index)?.stored_data())?
    };

    // NODUPDATA means "no overwrite" at the sub-tree level, and a plain
    // NOOVERWRITE passes through unchanged.
    let sub_flags = if flags.intersects(WriteFlags::NODUPDATA | WriteFlags::NOOVERWRITE) {
        WriteFlags::NOOVERWRITE
    } else {
        WriteFlags::empty()
    };
    let sub_dbi = txn.push_sub_db(dbi, record);
    let result = put_internal(txn, sub_dbi, data, b"", sub_flags, 0);
    let record = txn.pop_sub_db();

    let mut pm = txn.page_mut(leaf)?;
    pm.node_stored_data_mut(index)?
        .copy_from_slice(crate::txn::db_record_bytes(&record));
    result
}

// ----------------------------------------------------------------------
// Split
// ----------------------------------------------------------------------

/// Split a full page while inserting a new entry at `new_index`. Returns
/// the page and index where the new entry ended up. The parent gains the
/// separator, splitting recursively if it is full itself.
fn split(
    txn: &mut WriteTxn<'_>,
    dbi: Dbi,
    page_pgno: Pgno,
    new_index: usize,
    new_key: &[u8],
    new_payload: NodePayload<'_>,
) -> Result<(Pgno, usize)> {
    let psize = txn.psize();
    let kind_flags = PageView::new(txn.page(page_pgno)?)?.flags() & (PAGE_BRANCH | PAGE_LEAF);
    let is_branch = kind_flags & PAGE_BRANCH != 0;

    // Make sure there is a parent to take the separator.
    let (parent, page_pi) = match txn.dirty_parent(page_pgno) {
        Some(link) => link,
        None => {
            let root = txn.new_page(dbi, PAGE_BRANCH, 1)?;
            {
                let mut pm = txn.page_mut(root)?;
                pm.insert_node(0, b"", NodePayload::Branch { child: page_pgno })?;
            }
            let db = &mut txn.dbs[dbi.0];
            db.set_root(root);
            db.set_depth(db.depth() + 1);
            txn.set_dirty_parent(page_pgno, Some((root, 0)));
            debug!(dbi = dbi.0, root, "split grew a new root");
            (root, 0)
        }
    };

    let right = txn.new_page(dbi, kind_flags, 1)?;
    let mut right_pi = page_pi + 1;
    txn.set_dirty_parent(right, Some((parent, right_pi)));
    trace!(
        page = page_pgno,
        right,
        new_index,
        "splitting {} page",
        if is_branch { "branch" } else { "leaf" }
    );

    // Take the page's nodes to scratch and wipe it.
    let scratch = txn.page(page_pgno)?.to_vec();
    {
        let mut pm = txn.page_mut(page_pgno)?;
        let flags = pm.view().flags();
        pm.init(page_pgno, flags, psize);
    }
    let scratch_view = PageView::new(&scratch)?;
    let scratch_keys = scratch_view.num_keys();
    let split_index = scratch_keys / 2 + 1;

    // The separator: the new key itself when it lands exactly on the
    // split point, otherwise the first key of the right half.
    let separator: KeyBuf = if new_index == split_index {
        KeyBuf::from_slice(new_key)
    } else {
        KeyBuf::from_slice(scratch_view.node(split_index)?.key())
    };

    if PageView::new(txn.page(parent)?)?.size_left() < branch_size(separator.len()) {
        let (new_parent, sep_index) = split(
            txn,
            dbi,
            parent,
            right_pi,
            &separator,
            NodePayload::Branch { child: right },
        )?;
        txn.set_dirty_parent(right, Some((new_parent, sep_index)));
        right_pi = sep_index;

        // The left page may have moved to the new parent as well.
        let (left_parent, _) = txn.dirty_parent(page_pgno).expect("dirty page has a link");
        if left_parent != new_parent
            && page_pi >= PageView::new(txn.page(left_parent)?)?.num_keys()
        {
            txn.set_dirty_parent(page_pgno, Some((new_parent, sep_index - 1)));
        }
    } else {
        let mut pm = txn.page_mut(parent)?;
        pm.insert_node(right_pi, &separator, NodePayload::Branch { child: right })?;
    }

    // Redistribute: left half back into the original page, right half
    // into the sibling, with the new entry spliced in at its position.
    let mut landed = (page_pgno, new_index);
    let mut inserted = false;
    let mut i = 0usize;
    let mut j = 0usize;
    loop {
        let dst = if i < split_index {
            page_pgno
        } else {
            if i == split_index {
                // Restart indexing on the right page; slot 0 may already
                // be taken by the new entry.
                j = usize::from(i == new_index && inserted);
            }
            right
        };

        let take_new = i == new_index && !inserted;
        if !take_new && i == scratch_keys {
            break;
        }

        let (key_src, payload): (&[u8], NodePayload<'_>) = if take_new {
            inserted = true;
            landed = (dst, j);
            (new_key, new_payload)
        } else {
            let node = scratch_view.node(i)?;
            i += 1;
            let payload = if is_branch {
                NodePayload::Branch {
                    child: node.child_pgno(),
                }
            } else {
                NodePayload::Leaf {
                    stored: node.stored_data(),
                    data_size: node.data_size(),
                    flags: node.flags(),
                }
            };
            (node.key(), payload)
        };

        // The leftmost node of a branch page carries no key bytes.
        let key_bytes = if is_branch && j == 0 { &[][..] } else { key_src };
        let mut pm = txn.page_mut(dst)?;
        pm.insert_node(j, key_bytes, payload)?;
        j += 1;
    }

    Ok(landed)
}

// ----------------------------------------------------------------------
// Delete and rebalance
// ----------------------------------------------------------------------

fn del_internal(
    txn: &mut WriteTxn<'_>,
    dbi: Dbi,
    key: &[u8],
    dup: Option<&[u8]>,
) -> Result<bool> {
    let cmp = resolve_cmp(txn.dbs[dbi.0].flags(), txn.dbxs[dbi.0].cmp);
    let dupsort = txn.dbs[dbi.0].flags() & DbFlags::DUPSORT.persisted() != 0;
    trace!(dbi = dbi.0, key_len = key.len(), "del");

    let Some(leaf) = search_modify(txn, dbi, SearchKey::Key(key))? else {
        return Ok(false);
    };
    let (index, is_sub, sub_record) = {
        let page = PageView::new(txn.page(leaf)?)?;
        if page.num_keys() == 0 {
            return Ok(false);
        }
        let (found, exact) = search_node(page, cmp, key)?;
        let (Some(index), true) = (found, exact) else {
            return Ok(false);
        };
        let node = page.node(index)?;
        let sub = node
            .is_sub_data()
            .then(|| DbRecord::from_bytes(node.stored_data()).copied())
            .transpose()?;
        (index, node.is_sub_data(), sub)
    };

    if dupsort && is_sub {
        let record = sub_record.expect("sub-data node carries a record");
        if let Some(dup) = dup {
            // Delete one duplicate; the key survives while the sub-tree
            // has entries.
            let sub_dbi = txn.push_sub_db(dbi, record);
            let result = del_internal(txn, sub_dbi, dup, None);
            let record = txn.pop_sub_db();
            if !result? {
                return Ok(false);
            }
            if record.root() != INVALID_PGNO {
                let mut pm = txn.page_mut(leaf)?;
                pm.node_stored_data_mut(index)?
                    .copy_from_slice(crate::txn::db_record_bytes(&record));
                return Ok(true);
            }
            // Sub-tree emptied: fall through and delete the key itself.
        } else if record.root() != INVALID_PGNO {
            // Whole-key delete: every page of the sub-tree is freed,
            // root included.
            let mut pages = Vec::new();
            collect_tree_pages(TxnRef::Write(txn), record.root(), &mut pages)?;
            for pgno in pages {
                txn.free_pgs.insert(pgno);
            }
        }
    }

    del0(txn, dbi, leaf, index)?;
    Ok(true)
}

/// Remove the node at `index` from a dirty leaf: free its overflow
/// chain, drop the node, fix the entry count, rebalance.
pub(crate) fn del0(txn: &mut WriteTxn<'_>, dbi: Dbi, leaf: Pgno, index: usize) -> Result<()> {
    let chain = {
        let page = PageView::new(txn.page(leaf)?)?;
        let node = page.node(index)?;
        node.is_big_data()
            .then(|| node.overflow_root().map(|head| (head, node.data_size())))
            .transpose()?
    };
    if let Some((head, size)) = chain {
        free_overflow_chain(txn, head, size)?;
    }

    {
        let mut pm = txn.page_mut(leaf)?;
        pm.delete_node(index);
    }
    let db = &mut txn.dbs[dbi.0];
    db.set_entries(db.entries().saturating_sub(1));
    rebalance(txn, dbi, leaf)
}

/// Push every page number of an overflow chain onto the free list.
fn free_overflow_chain(txn: &mut WriteTxn<'_>, head: Pgno, data_size: usize) -> Result<()> {
    let npages = overflow_page_count(txn.psize(), data_size);
    for pgno in head..head + npages as Pgno {
        txn.free_pgs.insert(pgno);
    }
    trace!(head, npages, "freed overflow chain");
    Ok(())
}

/// Collect every page of a tree, root included, in no particular order.
fn collect_tree_pages(txn: TxnRef<'_>, root: Pgno, out: &mut Vec<Pgno>) -> Result<()> {
    out.push(root);
    let page = PageView::new(txn.page(root)?)?;
    if page.is_branch() {
        for i in 0..page.num_keys() {
            collect_tree_pages(txn, page.node(i)?.child_pgno(), out)?;
        }
    }
    Ok(())
}

/// Restore the fill invariant after a delete: pages under a quarter full
/// either borrow a node from a healthy sibling or merge into one,
/// recursively up the tree.
fn rebalance(txn: &mut WriteTxn<'_>, dbi: Dbi, pgno: Pgno) -> Result<()> {
    let psize = txn.psize();
    let (fill, num_keys, is_leaf) = {
        let page = PageView::new(txn.page(pgno)?)?;
        (page.fill_per_mille(psize), page.num_keys(), page.is_leaf())
    };
    if fill >= crate::page::FILL_THRESHOLD {
        return Ok(());
    }
    trace!(pgno, fill, "rebalancing");

    let Some((parent, pi)) = txn.dirty_parent(pgno) else {
        // The root is allowed to be underfull; it only collapses.
        let db = &mut txn.dbs[dbi.0];
        if num_keys == 0 && is_leaf {
            debug!(dbi = dbi.0, "tree is now empty");
            db.set_root(INVALID_PGNO);
            db.set_depth(db.depth().saturating_sub(1));
            db.set_leaf_pages(db.leaf_pages().saturating_sub(1));
        } else if !is_leaf && num_keys == 1 {
            let child = PageView::new(txn.page(pgno)?)?.node(0)?.child_pgno();
            let db = &mut txn.dbs[dbi.0];
            db.set_root(child);
            db.set_depth(db.depth().saturating_sub(1));
            db.set_branch_pages(db.branch_pages().saturating_sub(1));
            txn.set_dirty_parent(child, None);
            debug!(dbi = dbi.0, root = child, "collapsed root branch");
        }
        return Ok(());
    };

    debug_assert!(PageView::new(txn.page(parent)?)?.num_keys() > 1);

    // Pick a donor: the right sibling when this is the leftmost child,
    // the left sibling otherwise.
    let (neighbor, neighbor_pi, src_index, dst_index) = {
        let parent_view = PageView::new(txn.page(parent)?)?;
        if pi == 0 {
            let neighbor = parent_view.node(1)?.child_pgno();
            (neighbor, 1, 0, num_keys)
        } else {
            let neighbor = parent_view.node(pi - 1)?.child_pgno();
            let neighbor_keys = PageView::new(txn.page(neighbor)?)?.num_keys();
            (neighbor, pi - 1, neighbor_keys - 1, 0)
        }
    };

    let (neighbor_fill, neighbor_keys) = {
        let page = PageView::new(txn.page(neighbor)?)?;
        (page.fill_per_mille(psize), page.num_keys())
    };

    if neighbor_fill >= crate::page::FILL_THRESHOLD && neighbor_keys >= 2 {
        move_node(
            txn, neighbor, neighbor_pi, src_index, pgno, pi, dst_index, parent,
        )
    } else if pi == 0 {
        merge(txn, dbi, neighbor, neighbor_pi, pgno, pi, parent)
    } else {
        merge(txn, dbi, pgno, pi, neighbor, neighbor_pi, parent)
    }
}

/// Move one node from `src` to `dst`, keeping the parent separators (and
/// the zero-length leftmost branch key) consistent.
#[allow(clippy::too_many_arguments)]
fn move_node(
    txn: &mut WriteTxn<'_>,
    src: Pgno,
    src_pi: usize,
    src_index: usize,
    dst: Pgno,
    dst_pi: usize,
    dst_index: usize,
    parent: Pgno,
) -> Result<()> {
    let src = txn.touch(src, Some((parent, src_pi)))?;
    let dst = txn.touch(dst, Some((parent, dst_pi)))?;

    let (moved_key, moved_payload_owned, is_branch) = {
        let page = PageView::new(txn.page(src)?)?;
        let node = page.node(src_index)?;
        let key = KeyBuf::from_slice(node.key());
        let payload: (Vec<u8>, usize, u8, Pgno) = (
            node.stored_data().to_vec(),
            node.data_size(),
            node.flags(),
            node.child_pgno(),
        );
        (key, payload, page.is_branch())
    };
    trace!(src, dst, src_index, dst_index, "moving node between siblings");

    {
        let (stored, data_size, flags, child) = (
            moved_payload_owned.0.as_slice(),
            moved_payload_owned.1,
            moved_payload_owned.2,
            moved_payload_owned.3,
        );
        let payload = if is_branch {
            NodePayload::Branch { child }
        } else {
            NodePayload::Leaf {
                stored,
                data_size,
                flags,
            }
        };
        let mut pm = txn.page_mut(dst)?;
        pm.insert_node(dst_index, &moved_key, payload)?;
    }
    {
        let mut pm = txn.page_mut(src)?;
        pm.delete_node(src_index);
    }

    if src_index == 0 {
        if src_pi != 0 {
            // The source's separator becomes its new first key.
            let new_first = {
                let page = PageView::new(txn.page(src)?)?;
                KeyBuf::from_slice(page.node(0)?.key())
            };
            let mut pm = txn.page_mut(parent)?;
            pm.update_key(src_pi, &new_first)?;
        }
        if is_branch {
            let mut pm = txn.page_mut(src)?;
            pm.update_key(0, b"")?;
        }
    }

    if dst_index == 0 {
        if dst_pi != 0 {
            let mut pm = txn.page_mut(parent)?;
            pm.update_key(dst_pi, &moved_key)?;
        }
        if is_branch {
            let mut pm = txn.page_mut(dst)?;
            pm.update_key(0, b"")?;
        }
    }

    Ok(())
}

/// Fold `src` into `dst`, unlink it from the parent, and rebalance the
/// parent in turn.
fn merge(
    txn: &mut WriteTxn<'_>,
    dbi: Dbi,
    src: Pgno,
    src_pi: usize,
    dst: Pgno,
    dst_pi: usize,
    parent: Pgno,
) -> Result<()> {
    let src = txn.touch(src, Some((parent, src_pi)))?;
    let dst = txn.touch(dst, Some((parent, dst_pi)))?;
    trace!(src, dst, "merging sibling pages");

    let src_bytes = txn.page(src)?.to_vec();
    let src_view = PageView::new(&src_bytes)?;
    let is_leaf = src_view.is_leaf();
    for i in 0..src_view.num_keys() {
        let node = src_view.node(i)?;
        let payload = if is_leaf {
            NodePayload::Leaf {
                stored: node.stored_data(),
                data_size: node.data_size(),
                flags: node.flags(),
            }
        } else {
            NodePayload::Branch {
                child: node.child_pgno(),
            }
        };
        let mut pm = txn.page_mut(dst)?;
        let at = pm.view().num_keys();
        pm.insert_node(at, node.key(), payload)?;
    }

    {
        let mut pm = txn.page_mut(parent)?;
        pm.delete_node(src_pi);
        if src_pi == 0 {
            pm.update_key(0, b"")?;
        }
    }

    let db = &mut txn.dbs[dbi.0];
    if is_leaf {
        db.set_leaf_pages(db.leaf_pages().saturating_sub(1));
    } else {
        db.set_branch_pages(db.branch_pages().saturating_sub(1));
    }

    rebalance(txn, dbi, parent)
}

// ----------------------------------------------------------------------
// Free-DB helpers for the allocator and commit
// ----------------------------------------------------------------------

/// Read the oldest record of the free DB: `(freeing txnid, raw list)`.
pub(crate) fn first_free_record(txn: &WriteTxn<'_>) -> Result<Option<(u64, Vec<u8>)>> {
    let db = &txn.dbs[Dbi::FREE.0];
    if db.root() == INVALID_PGNO {
        return Ok(None);
    }
    let txn_ref = TxnRef::Write(txn);
    let cmp = resolve_cmp(db.flags(), None);
    let leaf = descend(txn_ref, db.root(), cmp, SearchKey::First, None)?;
    let page = PageView::new(txn_ref.page(leaf)?)?;
    if page.num_keys() == 0 {
        return Ok(None);
    }
    let node = page.node(0)?;
    ensure!(
        node.key().len() == 8,
        "free DB key has {} bytes, expected 8",
        node.key().len()
    );
    let freed_txnid = u64::from_le_bytes(node.key().try_into().expect("8 bytes"));
    let idl = node_data(txn_ref, node)?.to_vec();
    Ok(Some((freed_txnid, idl)))
}

/// Drop the oldest record of the free DB (it has just been consumed).
pub(crate) fn delete_leftmost(txn: &mut WriteTxn<'_>, dbi: Dbi) -> Result<()> {
    let Some(leaf) = search_modify(txn, dbi, SearchKey::First)? else {
        return Ok(());
    };
    if PageView::new(txn.page(leaf)?)?.num_keys() == 0 {
        return Ok(());
    }
    del0(txn, dbi, leaf, 0)
}

/// Bring the rightmost leaf of a tree into the dirty set, so a record
/// appended right after accounts for the copy-on-write it causes.
pub(crate) fn touch_rightmost(txn: &mut WriteTxn<'_>, dbi: Dbi) -> Result<()> {
    search_modify(txn, dbi, SearchKey::Last).map(|_| ())
}

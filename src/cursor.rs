//! Cursors: ordered traversal with an explicit page stack.
//!
//! A cursor remembers its position as a stack of `(page, index)` frames,
//! root at the bottom, leaf on top. Moving to a neighboring entry is a
//! local operation: bump the leaf index, or walk up until an ancestor
//! can advance and descend down its edge. Because committed pages are
//! immutable and a cursor borrows its transaction, the stack can never
//! dangle.
//!
//! For `DUPSORT` databases a cursor carries a nested sub-cursor over the
//! duplicate sub-tree embedded in the current leaf node. Every time the
//! main cursor lands on a key, the sub-cursor is re-seated on that key's
//! sub-tree; `NEXT`/`PREV` drain the duplicates before moving the main
//! cursor, while the `*_NODUP` variants skip straight to the neighboring
//! key.
//!
//! Returned key and value slices borrow from the transaction's pages,
//! not from the cursor, so they stay valid while the transaction lives
//! even as the cursor keeps moving.

use eyre::{ensure, Result};

use crate::flags::DbFlags;
use crate::meta::DbRecord;
use crate::page::{NodeRef, PageView, Pgno, INVALID_PGNO};
use crate::tree::{self, SearchKey};
use crate::txn::{check_key, Dbi, TxnRef};
use crate::CmpFn;

/// Cursor positioning operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// First entry of the database (first duplicate of the first key).
    First,
    /// Last entry of the database (last duplicate of the last key).
    Last,
    /// Next entry; walks duplicates before moving to the next key.
    Next,
    /// Next duplicate of the current key only.
    NextDup,
    /// First duplicate of the next key.
    NextNoDup,
    /// Previous entry; walks duplicates backwards first.
    Prev,
    /// Previous duplicate of the current key only.
    PrevDup,
    /// Last duplicate of the previous key.
    PrevNoDup,
    /// Position at an exact key.
    Set,
    /// Position at the smallest key >= the given key.
    SetRange,
    /// Position at an exact key/value pair (`DUPSORT`).
    GetBoth,
    /// Exact key, smallest duplicate >= the given value (`DUPSORT`).
    GetBothRange,
}

type Frame = (Pgno, usize);
type Entry<'a> = (&'a [u8], &'a [u8]);

/// Position over the duplicate sub-tree of the current key.
struct SubCursor {
    db: DbRecord,
    cmp: CmpFn,
    stack: Vec<Frame>,
    initialized: bool,
}

/// An ordered cursor over one database.
pub struct Cursor<'a> {
    txn: TxnRef<'a>,
    dbi: Dbi,
    cmp: CmpFn,
    dupsort: bool,
    stack: Vec<Frame>,
    initialized: bool,
    eof: bool,
    sub: Option<SubCursor>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(txn: TxnRef<'a>, dbi: Dbi) -> Result<Self> {
        let db = txn.db(dbi);
        let dupsort = db.flags() & DbFlags::DUPSORT.persisted() != 0;
        let cmp = tree::resolve_cmp(db.flags(), txn.dbx(dbi).cmp);
        let sub = dupsort.then(|| SubCursor {
            db: DbRecord::new(0),
            cmp: tree::resolve_cmp(0, txn.dbx(dbi).dcmp),
            stack: Vec::new(),
            initialized: false,
        });
        Ok(Self {
            txn,
            dbi,
            cmp,
            dupsort,
            stack: Vec::new(),
            initialized: false,
            eof: false,
            sub,
        })
    }

    /// Perform one positioning operation. `Ok(None)` means the cursor
    /// ran off the end (or the sought entry does not exist).
    pub fn get(
        &mut self,
        key: Option<&[u8]>,
        data: Option<&[u8]>,
        op: CursorOp,
    ) -> Result<Option<Entry<'a>>> {
        match op {
            CursorOp::First => self.op_first(),
            CursorOp::Last => self.op_last(),
            CursorOp::Next | CursorOp::NextDup | CursorOp::NextNoDup => {
                if !self.initialized {
                    self.op_first()
                } else {
                    self.op_next(op)
                }
            }
            CursorOp::Prev | CursorOp::PrevDup | CursorOp::PrevNoDup => {
                if !self.initialized || self.eof {
                    self.op_last()
                } else {
                    self.op_prev(op)
                }
            }
            CursorOp::Set | CursorOp::SetRange => {
                let key = key.ok_or_else(|| eyre::eyre!("{:?} needs a key", op))?;
                check_key(key)?;
                self.op_set(key, None, op)
            }
            CursorOp::GetBoth | CursorOp::GetBothRange => {
                let key = key.ok_or_else(|| eyre::eyre!("{:?} needs a key", op))?;
                let data = data.ok_or_else(|| eyre::eyre!("{:?} needs a value", op))?;
                check_key(key)?;
                self.op_set(key, Some(data), op)
            }
        }
    }

    pub fn first(&mut self) -> Result<Option<Entry<'a>>> {
        self.get(None, None, CursorOp::First)
    }

    pub fn last(&mut self) -> Result<Option<Entry<'a>>> {
        self.get(None, None, CursorOp::Last)
    }

    pub fn next(&mut self) -> Result<Option<Entry<'a>>> {
        self.get(None, None, CursorOp::Next)
    }

    pub fn prev(&mut self) -> Result<Option<Entry<'a>>> {
        self.get(None, None, CursorOp::Prev)
    }

    pub fn set(&mut self, key: &[u8]) -> Result<Option<Entry<'a>>> {
        self.get(Some(key), None, CursorOp::Set)
    }

    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<Entry<'a>>> {
        self.get(Some(key), None, CursorOp::SetRange)
    }

    /// Number of duplicates of the key the cursor is positioned on.
    pub fn count(&self) -> Result<u64> {
        ensure!(self.dupsort, "count requires a DUPSORT database");
        let sub = self.sub.as_ref().expect("dupsort cursor has a sub-cursor");
        ensure!(sub.initialized, "cursor is not positioned");
        Ok(sub.db.entries())
    }

    // ------------------------------------------------------------------

    fn root(&self) -> Pgno {
        self.txn.db(self.dbi).root()
    }

    fn op_first(&mut self) -> Result<Option<Entry<'a>>> {
        self.stack.clear();
        if self.root() == INVALID_PGNO {
            return Ok(None);
        }
        tree::descend(
            self.txn,
            self.root(),
            self.cmp,
            SearchKey::First,
            Some(&mut self.stack),
        )?;
        self.initialized = true;
        self.eof = false;
        self.entry(false).map(Some)
    }

    fn op_last(&mut self) -> Result<Option<Entry<'a>>> {
        self.stack.clear();
        if self.root() == INVALID_PGNO {
            return Ok(None);
        }
        tree::descend(
            self.txn,
            self.root(),
            self.cmp,
            SearchKey::Last,
            Some(&mut self.stack),
        )?;
        let (leaf, _) = *self.stack.last().expect("descent pushed the leaf");
        let num_keys = PageView::new(self.txn.page(leaf)?)?.num_keys();
        if num_keys == 0 {
            return Ok(None);
        }
        self.stack.last_mut().expect("leaf frame").1 = num_keys - 1;
        self.initialized = true;
        self.eof = false;
        self.entry(true).map(Some)
    }

    fn op_set(
        &mut self,
        key: &[u8],
        data: Option<&[u8]>,
        op: CursorOp,
    ) -> Result<Option<Entry<'a>>> {
        self.stack.clear();
        if self.root() == INVALID_PGNO {
            return Ok(None);
        }
        tree::descend(
            self.txn,
            self.root(),
            self.cmp,
            SearchKey::Key(key),
            Some(&mut self.stack),
        )?;

        let (leaf, _) = *self.stack.last().expect("descent pushed the leaf");
        let page = PageView::new(self.txn.page(leaf)?)?;
        let (found, exact) = if page.num_keys() == 0 {
            (None, false)
        } else {
            tree::search_node(page, self.cmp, key)?
        };

        let needs_exact = matches!(op, CursorOp::Set | CursorOp::GetBoth);
        if needs_exact && !exact {
            return Ok(None);
        }

        match found {
            Some(index) => self.stack.last_mut().expect("leaf frame").1 = index,
            None => {
                // Every key on this leaf is smaller; the answer starts
                // the right sibling.
                if !stack_sibling(self.txn, &mut self.stack, true)? {
                    return Ok(None);
                }
                self.stack.last_mut().expect("leaf frame").1 = 0;
            }
        }
        self.initialized = true;
        self.eof = false;

        let (leaf, index) = *self.stack.last().expect("leaf frame");
        let page = PageView::new(self.txn.page(leaf)?)?;
        let node = page.node(index)?;
        let out_key = node.key();

        if self.dupsort && node.is_sub_data() {
            self.seat_sub(node)?;
            let dup = match (op, data) {
                (CursorOp::GetBoth, Some(data)) => self.sub_set(data, true)?,
                (CursorOp::GetBothRange, Some(data)) => self.sub_set(data, false)?,
                _ => Some(self.sub_first()?),
            };
            return Ok(dup.map(|d| (out_key, d)));
        }

        let out_data = tree::node_data(self.txn, node)?;
        Ok(Some((out_key, out_data)))
    }

    fn op_next(&mut self, op: CursorOp) -> Result<Option<Entry<'a>>> {
        if self.eof || self.stack.is_empty() {
            return Ok(None);
        }

        if self.dupsort && matches!(op, CursorOp::Next | CursorOp::NextDup) {
            let advanced = self.sub_next()?;
            if op == CursorOp::NextDup {
                return match advanced {
                    Some(dup) => Ok(Some((self.current_key()?, dup))),
                    None => Ok(None),
                };
            }
            if let Some(dup) = advanced {
                return Ok(Some((self.current_key()?, dup)));
            }
            // Duplicates exhausted: move to the next key.
        }

        if !stack_next(self.txn, &mut self.stack)? {
            self.eof = true;
            return Ok(None);
        }
        self.entry(false).map(Some)
    }

    fn op_prev(&mut self, op: CursorOp) -> Result<Option<Entry<'a>>> {
        if self.stack.is_empty() {
            return Ok(None);
        }

        if self.dupsort && matches!(op, CursorOp::Prev | CursorOp::PrevDup) {
            let advanced = self.sub_prev()?;
            if op == CursorOp::PrevDup {
                return match advanced {
                    Some(dup) => Ok(Some((self.current_key()?, dup))),
                    None => Ok(None),
                };
            }
            if let Some(dup) = advanced {
                return Ok(Some((self.current_key()?, dup)));
            }
        }

        if !stack_prev(self.txn, &mut self.stack)? {
            return Ok(None);
        }
        self.eof = false;
        self.entry(true).map(Some)
    }

    /// Key and value at the current stack top, re-seating the duplicate
    /// sub-cursor. With `backwards` the sub-cursor starts on the last
    /// duplicate.
    fn entry(&mut self, backwards: bool) -> Result<Entry<'a>> {
        let (leaf, index) = *self.stack.last().expect("cursor is positioned");
        let page = PageView::new(self.txn.page(leaf)?)?;
        ensure!(page.is_leaf(), "cursor stack top {} is not a leaf", leaf);
        let node = page.node(index)?;
        let key = node.key();

        if self.dupsort && node.is_sub_data() {
            self.seat_sub(node)?;
            let dup = if backwards {
                self.sub_last()?
            } else {
                self.sub_first()?
            };
            return Ok((key, dup));
        }
        let data = tree::node_data(self.txn, node)?;
        Ok((key, data))
    }

    fn current_key(&self) -> Result<&'a [u8]> {
        let (leaf, index) = *self.stack.last().expect("cursor is positioned");
        let page = PageView::new(self.txn.page(leaf)?)?;
        Ok(page.node(index)?.key())
    }

    // -------------------------- sub-cursor ---------------------------

    /// Re-seat the sub-cursor on the sub-tree embedded in `node`.
    fn seat_sub(&mut self, node: NodeRef<'a>) -> Result<()> {
        let record = *DbRecord::from_bytes(node.stored_data())?;
        let sub = self.sub.as_mut().expect("dupsort cursor has a sub-cursor");
        sub.db = record;
        sub.stack.clear();
        sub.initialized = false;
        Ok(())
    }

    fn sub_first(&mut self) -> Result<&'a [u8]> {
        let txn = self.txn;
        let sub = self.sub.as_mut().expect("dupsort cursor has a sub-cursor");
        ensure!(
            sub.db.root() != INVALID_PGNO,
            "duplicate sub-tree is empty"
        );
        sub.stack.clear();
        tree::descend(txn, sub.db.root(), sub.cmp, SearchKey::First, Some(&mut sub.stack))?;
        sub.initialized = true;
        let (leaf, _) = *sub.stack.last().expect("descent pushed the leaf");
        let page = PageView::new(txn.page(leaf)?)?;
        Ok(page.node(0)?.key())
    }

    fn sub_last(&mut self) -> Result<&'a [u8]> {
        let txn = self.txn;
        let sub = self.sub.as_mut().expect("dupsort cursor has a sub-cursor");
        ensure!(
            sub.db.root() != INVALID_PGNO,
            "duplicate sub-tree is empty"
        );
        sub.stack.clear();
        tree::descend(txn, sub.db.root(), sub.cmp, SearchKey::Last, Some(&mut sub.stack))?;
        sub.initialized = true;
        let (leaf, _) = *sub.stack.last().expect("descent pushed the leaf");
        let page = PageView::new(txn.page(leaf)?)?;
        let last = page.num_keys() - 1;
        sub.stack.last_mut().expect("leaf frame").1 = last;
        Ok(page.node(last)?.key())
    }

    /// Position the sub-cursor on a duplicate: exact, or smallest >=.
    fn sub_set(&mut self, data: &[u8], exact: bool) -> Result<Option<&'a [u8]>> {
        let txn = self.txn;
        let sub = self.sub.as_mut().expect("dupsort cursor has a sub-cursor");
        if sub.db.root() == INVALID_PGNO {
            return Ok(None);
        }
        sub.stack.clear();
        tree::descend(txn, sub.db.root(), sub.cmp, SearchKey::Key(data), Some(&mut sub.stack))?;
        let (leaf, _) = *sub.stack.last().expect("descent pushed the leaf");
        let page = PageView::new(txn.page(leaf)?)?;
        if page.num_keys() == 0 {
            return Ok(None);
        }
        let (found, found_exact) = tree::search_node(page, sub.cmp, data)?;
        if exact && !found_exact {
            return Ok(None);
        }
        let index = match found {
            Some(index) => index,
            None => {
                if !stack_sibling(txn, &mut sub.stack, true)? {
                    return Ok(None);
                }
                0
            }
        };
        sub.stack.last_mut().expect("leaf frame").1 = index;
        sub.initialized = true;
        let (leaf, _) = *sub.stack.last().expect("leaf frame");
        let page = PageView::new(txn.page(leaf)?)?;
        Ok(Some(page.node(index)?.key()))
    }

    fn sub_next(&mut self) -> Result<Option<&'a [u8]>> {
        let txn = self.txn;
        let sub = self.sub.as_mut().expect("dupsort cursor has a sub-cursor");
        if !sub.initialized || sub.stack.is_empty() {
            return Ok(None);
        }
        if !stack_next(txn, &mut sub.stack)? {
            return Ok(None);
        }
        let (leaf, index) = *sub.stack.last().expect("leaf frame");
        let page = PageView::new(txn.page(leaf)?)?;
        Ok(Some(page.node(index)?.key()))
    }

    fn sub_prev(&mut self) -> Result<Option<&'a [u8]>> {
        let txn = self.txn;
        let sub = self.sub.as_mut().expect("dupsort cursor has a sub-cursor");
        if !sub.initialized || sub.stack.is_empty() {
            return Ok(None);
        }
        if !stack_prev(txn, &mut sub.stack)? {
            return Ok(None);
        }
        let (leaf, index) = *sub.stack.last().expect("leaf frame");
        let page = PageView::new(txn.page(leaf)?)?;
        Ok(Some(page.node(index)?.key()))
    }
}

// ----------------------------------------------------------------------
// Stack movement shared by the main cursor and the sub-cursor
// ----------------------------------------------------------------------

/// Advance the leaf frame one entry to the right, crossing page
/// boundaries as needed. `false` means the tree is exhausted.
fn stack_next(txn: TxnRef<'_>, stack: &mut Vec<Frame>) -> Result<bool> {
    let (leaf, index) = *stack.last().expect("positioned cursor");
    let num_keys = PageView::new(txn.page(leaf)?)?.num_keys();
    if index + 1 < num_keys {
        stack.last_mut().expect("leaf frame").1 = index + 1;
        return Ok(true);
    }
    stack_sibling(txn, stack, true)
}

/// Step the leaf frame one entry to the left.
fn stack_prev(txn: TxnRef<'_>, stack: &mut Vec<Frame>) -> Result<bool> {
    let (_, index) = *stack.last().expect("positioned cursor");
    if index > 0 {
        stack.last_mut().expect("leaf frame").1 = index - 1;
        return Ok(true);
    }
    if !stack_sibling(txn, stack, false)? {
        return Ok(false);
    }
    let (leaf, _) = *stack.last().expect("leaf frame");
    let num_keys = PageView::new(txn.page(leaf)?)?.num_keys();
    stack.last_mut().expect("leaf frame").1 = num_keys.saturating_sub(1);
    Ok(true)
}

/// Move the cursor one leaf sideways: climb until an ancestor can step
/// in the wanted direction, then descend its edge back to leaf level.
/// The leaf is pushed with index 0; `stack_prev` fixes it up.
fn stack_sibling(txn: TxnRef<'_>, stack: &mut Vec<Frame>, right: bool) -> Result<bool> {
    if stack.len() < 2 {
        return Ok(false);
    }
    stack.pop();

    loop {
        let Some(&(pgno, index)) = stack.last() else {
            return Ok(false);
        };
        let num_keys = PageView::new(txn.page(pgno)?)?.num_keys();
        let can_move = if right {
            index + 1 < num_keys
        } else {
            index > 0
        };
        if can_move {
            let new_index = if right { index + 1 } else { index - 1 };
            stack.last_mut().expect("frame").1 = new_index;
            break;
        }
        stack.pop();
        if stack.is_empty() {
            return Ok(false);
        }
    }

    loop {
        let &(pgno, index) = stack.last().expect("frame");
        let page = PageView::new(txn.page(pgno)?)?;
        ensure!(page.is_branch(), "cursor frame {} is not a branch", pgno);
        let child = page.node(index)?.child_pgno();
        let child_page = PageView::new(txn.page(child)?)?;
        if child_page.is_leaf() {
            stack.push((child, 0));
            return Ok(true);
        }
        let entry_index = if right {
            0
        } else {
            child_page.num_keys() - 1
        };
        stack.push((child, entry_index));
    }
}


//! Transactions: snapshots, the dirty-page set, page allocation and the
//! two-meta commit protocol.
//!
//! ## Read transactions
//!
//! `begin_read` claims the thread's reader slot, publishes the current
//! global transaction id into it and snapshots the DB descriptors from
//! the authoritative meta page. From then on every page access resolves
//! straight out of the read-only map; nothing the writer does can move a
//! page the snapshot can reach, because reuse of freed pages is gated on
//! the slot's published id.
//!
//! ## Write transactions
//!
//! `begin_write` takes the process-shared writer mutex, bumps the global
//! transaction id and snapshots descriptors the same way. Mutations never
//! touch the map: the first write to a clean page copies it into a
//! private buffer (copy-on-write `touch`), records the old page number in
//! the transaction's free list, and patches the parent's child pointer.
//! Dirty buffers live in a map keyed by page number, which doubles as the
//! ascending write order for commit.
//!
//! ## Page allocation
//!
//! New page numbers come from three places, tried in order:
//!
//! 1. When the in-memory reclaim list is empty, the oldest record of the
//!    free-list DB is loaded (and deleted) if its freeing transaction is
//!    old enough. This just keeps the reclaim list topped up.
//! 2. A single page is peeled off the reclaim list's tail, provided every
//!    live reader's snapshot is newer than the batch's freeing
//!    transaction.
//! 3. Otherwise the file tail: `next_pgno` advances. Multi-page requests
//!    (overflow chains) always take this path; the free list is not
//!    searched for contiguous runs.
//!
//! ## Commit
//!
//! 1. The partially consumed reclaim batch, if any, goes back into the
//!    free DB under its original key.
//! 2. The tail page of the free DB is touched, then this transaction's
//!    freed pages are written under its own id.
//! 3. Updated records of named DBs are written into the main DB.
//! 4. Dirty pages stream out in ascending page order through vectored
//!    writes, contiguous runs coalesced, up to 64 buffers per batch.
//! 5. fsync; write the meta tail on the opposite toggle; fsync again.
//! 6. Named-DB descriptors are published into the other half of the
//!    double-buffered table and the writer mutex is released.
//!
//! A failure anywhere flags the transaction as poisoned: every later
//! operation fails fast until abort. Abort throws away the dirty buffers,
//! walks the global transaction id back and releases the writer mutex.

use std::collections::BTreeMap;

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{debug, trace};
use zerocopy::IntoBytes;

use crate::env::{Environment, NamedDbEntry, Stat};
use crate::flags::{DbFlags, EnvFlags, WriteFlags};
use crate::idl::Idl;
use crate::meta::{DbRecord, Meta, CORE_DBS};
use crate::page::{PageMut, Pgno, INVALID_PGNO, PAGE_DIRTY, PAGE_HEADER_SIZE};
use crate::tree;
use crate::cursor::Cursor;
use crate::{CmpFn, MAX_KEY_SIZE};

/// Handle to one database inside the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dbi(pub(crate) usize);

impl Dbi {
    /// The reserved free-list database. Readable; do not write to it.
    pub const FREE: Dbi = Dbi(0);
    /// The unnamed main database.
    pub const MAIN: Dbi = Dbi(1);
}

/// Per-database transaction-local state: comparators and the dirty mark
/// that forces the record back into the main DB at commit.
#[derive(Debug, Clone)]
pub(crate) struct DbxState {
    pub name: String,
    pub cmp: Option<CmpFn>,
    pub dcmp: Option<CmpFn>,
    pub dirty: bool,
}

impl DbxState {
    fn core() -> Self {
        Self {
            name: String::new(),
            cmp: None,
            dcmp: None,
            dirty: false,
        }
    }
}

/// A page buffer private to the write transaction, plus its ephemeral
/// position in the tree. The parent link is refreshed on every descent in
/// modify mode; it always names another dirty page.
pub(crate) struct DirtyPage {
    pub buf: Box<[u8]>,
    pub num: usize,
    pub parent: Option<(Pgno, usize)>,
}

/// A batch of reclaimable pages pulled out of the free DB, still keyed by
/// the transaction that freed them.
pub(crate) struct Reclaim {
    pub txnid: u64,
    pub pages: Idl,
}

fn snapshot_dbs(env: &Environment, meta: &Meta) -> (Vec<DbRecord>, Vec<DbxState>) {
    let named = env.named().lock();
    let mut dbs = vec![*meta.db(0), *meta.db(1)];
    let mut dbxs = vec![DbxState::core(), DbxState::core()];
    dbs.extend_from_slice(&named.dbs[named.toggle]);
    for entry in &named.entries {
        dbxs.push(DbxState {
            name: entry.name.clone(),
            cmp: entry.cmp,
            dcmp: entry.dcmp,
            dirty: false,
        });
    }
    (dbs, dbxs)
}

/// A read-only snapshot transaction.
pub struct ReadTxn<'env> {
    env: &'env Environment,
    txnid: u64,
    slot: u32,
    pub(crate) dbs: Vec<DbRecord>,
    pub(crate) dbxs: Vec<DbxState>,
    last_pgno: Pgno,
    done: bool,
}

impl<'env> ReadTxn<'env> {
    pub(crate) fn new(env: &'env Environment) -> Result<Self> {
        let slot = env.claim_reader_slot()?;
        let txnid = env.lock_region().txnid();
        env.lock_region().reader(slot).set_txnid(txnid);

        let (_, meta) = env.read_meta()?;
        let (dbs, dbxs) = snapshot_dbs(env, meta);
        trace!(txnid, slot, "begin read transaction");
        Ok(Self {
            env,
            txnid,
            slot,
            dbs,
            dbxs,
            last_pgno: meta.last_pgno(),
            done: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.txnid
    }

    /// Open a database handle. `None` is the main DB; named databases
    /// must already exist (creation needs a write transaction).
    pub fn db(&mut self, name: Option<&str>, _flags: DbFlags) -> Result<Dbi> {
        match name {
            None => Ok(Dbi::MAIN),
            Some(name) => {
                if let Some(dbi) = find_named(&self.dbxs, name) {
                    return Ok(dbi);
                }
                ensure!(
                    self.dbs.len() < self.env.max_dbs(),
                    "too many open databases (max {})",
                    self.env.max_dbs()
                );
                let record = {
                    let txn = TxnRef::Read(self);
                    match tree::lookup(txn, Dbi::MAIN, name.as_bytes())? {
                        Some(data) => *DbRecord::from_bytes(data)?,
                        None => bail!("no database named '{}'", name),
                    }
                };
                self.dbs.push(record);
                self.dbxs.push(DbxState {
                    name: name.to_string(),
                    ..DbxState::core()
                });
                Ok(Dbi(self.dbs.len() - 1))
            }
        }
    }

    pub fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<&[u8]>> {
        check_dbi(dbi, self.dbs.len())?;
        check_key(key)?;
        tree::lookup(TxnRef::Read(self), dbi, key)
    }

    pub fn cursor(&self, dbi: Dbi) -> Result<Cursor<'_>> {
        check_dbi(dbi, self.dbs.len())?;
        Cursor::new(TxnRef::Read(self), dbi)
    }

    pub fn stat(&self, dbi: Dbi) -> Result<Stat> {
        check_dbi(dbi, self.dbs.len())?;
        Ok(Stat::from_record(
            self.env.page_size() as u32,
            &self.dbs[dbi.0],
        ))
    }

    pub fn abort(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.done {
            self.env.lock_region().reader(self.slot).set_txnid(0);
            self.done = true;
        }
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// The write transaction. At most one exists per environment at a time.
pub struct WriteTxn<'env> {
    env: &'env Environment,
    txnid: u64,
    meta_target: usize,
    pub(crate) dbs: Vec<DbRecord>,
    pub(crate) dbxs: Vec<DbxState>,
    pub(crate) dirty: BTreeMap<Pgno, DirtyPage>,
    pub(crate) free_pgs: Idl,
    pub(crate) reclaim: Option<Reclaim>,
    pub(crate) next_pgno: Pgno,
    last_pgno: Pgno,
    error: bool,
    done: bool,
}

impl<'env> WriteTxn<'env> {
    pub(crate) fn new(env: &'env Environment) -> Result<Self> {
        env.lock_region().lock_writer()?;
        let txnid = env.lock_region().txnid() + 1;
        env.lock_region().set_txnid(txnid);

        let (toggle, meta) = match env.read_meta() {
            Ok(pair) => pair,
            Err(e) => {
                env.lock_region().set_txnid(txnid - 1);
                env.lock_region().unlock_writer();
                return Err(e);
            }
        };
        let (dbs, dbxs) = snapshot_dbs(env, meta);
        debug!(
            txnid,
            last_pgno = meta.last_pgno(),
            root = meta.db(1).root(),
            "begin write transaction"
        );
        Ok(Self {
            env,
            txnid,
            meta_target: 1 - toggle,
            dbs,
            dbxs,
            dirty: BTreeMap::new(),
            free_pgs: Idl::new(),
            reclaim: None,
            next_pgno: meta.last_pgno() + 1,
            last_pgno: meta.last_pgno(),
            error: false,
            done: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.txnid
    }

    pub(crate) fn psize(&self) -> usize {
        self.env.page_size()
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        ensure!(!self.error, "transaction is in an error state");
        Ok(())
    }

    pub(crate) fn mark_error(&mut self) {
        self.error = true;
    }

    /// Open (or with [`DbFlags::CREATE`] create) a database handle.
    pub fn db(&mut self, name: Option<&str>, flags: DbFlags) -> Result<Dbi> {
        self.check_usable()?;
        match name {
            None => {
                let persisted = flags.persisted();
                if persisted != 0 {
                    let main = &mut self.dbs[Dbi::MAIN.0];
                    main.set_flags(main.flags() | persisted);
                }
                Ok(Dbi::MAIN)
            }
            Some(name) => {
                if let Some(dbi) = find_named(&self.dbxs, name) {
                    return Ok(dbi);
                }
                ensure!(
                    self.dbs.len() < self.env.max_dbs(),
                    "too many open databases (max {})",
                    self.env.max_dbs()
                );
                let found = tree::lookup(TxnRef::Write(self), Dbi::MAIN, name.as_bytes())?
                    .map(|data| DbRecord::from_bytes(data).copied())
                    .transpose()?;
                let (record, created) = match found {
                    Some(record) => (record, false),
                    None => {
                        ensure!(
                            flags.contains(DbFlags::CREATE),
                            "no database named '{}'",
                            name
                        );
                        (DbRecord::new(flags.persisted()), true)
                    }
                };
                if created {
                    tree::put_db_record(self, name.as_bytes(), &record)?;
                }
                self.dbs.push(record);
                self.dbxs.push(DbxState {
                    name: name.to_string(),
                    cmp: None,
                    dcmp: None,
                    dirty: created,
                });
                Ok(Dbi(self.dbs.len() - 1))
            }
        }
    }

    /// Install a custom key comparator for a database.
    pub fn set_compare(&mut self, dbi: Dbi, cmp: CmpFn) -> Result<()> {
        check_dbi(dbi, self.dbs.len())?;
        self.dbxs[dbi.0].cmp = Some(cmp);
        Ok(())
    }

    /// Install a custom duplicate comparator for a `DUPSORT` database.
    pub fn set_dup_compare(&mut self, dbi: Dbi, cmp: CmpFn) -> Result<()> {
        check_dbi(dbi, self.dbs.len())?;
        self.dbxs[dbi.0].dcmp = Some(cmp);
        Ok(())
    }

    pub fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<&[u8]>> {
        check_dbi(dbi, self.dbs.len())?;
        check_key(key)?;
        tree::lookup(TxnRef::Write(self), dbi, key)
    }

    pub fn cursor(&self, dbi: Dbi) -> Result<Cursor<'_>> {
        check_dbi(dbi, self.dbs.len())?;
        Cursor::new(TxnRef::Write(self), dbi)
    }

    pub fn stat(&self, dbi: Dbi) -> Result<Stat> {
        check_dbi(dbi, self.dbs.len())?;
        Ok(Stat::from_record(
            self.env.page_size() as u32,
            &self.dbs[dbi.0],
        ))
    }

    // ------------------------------------------------------------------
    // Page access
    // ------------------------------------------------------------------

    pub(crate) fn is_dirty(&self, pgno: Pgno) -> bool {
        self.dirty.contains_key(&pgno)
    }

    /// Resolve a page: dirty buffer first, then the map. Overflow heads
    /// return their whole span.
    pub(crate) fn page(&self, pgno: Pgno) -> Result<&[u8]> {
        if let Some(dp) = self.dirty.get(&pgno) {
            return Ok(&dp.buf);
        }
        ensure!(
            pgno <= self.last_pgno,
            "page {} is past the end of the database (last {})",
            pgno,
            self.last_pgno
        );
        map_page(self.env, pgno, self.last_pgno)
    }

    pub(crate) fn page_mut(&mut self, pgno: Pgno) -> Result<PageMut<'_>> {
        let dp = self
            .dirty
            .get_mut(&pgno)
            .ok_or_else(|| eyre::eyre!("page {} is not dirty", pgno))?;
        PageMut::new(&mut dp.buf)
    }

    pub(crate) fn dirty_parent(&self, pgno: Pgno) -> Option<(Pgno, usize)> {
        self.dirty.get(&pgno).and_then(|dp| dp.parent)
    }

    pub(crate) fn set_dirty_parent(&mut self, pgno: Pgno, parent: Option<(Pgno, usize)>) {
        if let Some(dp) = self.dirty.get_mut(&pgno) {
            dp.parent = parent;
        }
    }

    // ------------------------------------------------------------------
    // Allocation and copy-on-write
    // ------------------------------------------------------------------

    /// Acquire `num` contiguous pages as a fresh dirty buffer.
    pub(crate) fn alloc_page(
        &mut self,
        num: usize,
        parent: Option<(Pgno, usize)>,
    ) -> Result<Pgno> {
        let mut pgno = None;

        if self.txnid > 2 {
            let mut oldest = self.txnid - 2;

            if self.reclaim.is_none() && self.dbs[Dbi::FREE.0].root() != INVALID_PGNO {
                // Top up the reclaim list from the oldest free-DB record,
                // provided its freeing transaction is old enough.
                if let Some((freed_txnid, idl_bytes)) = tree::first_free_record(self)? {
                    if oldest > freed_txnid {
                        let pages = Idl::from_bytes(&idl_bytes)?;
                        trace!(
                            freed_txnid,
                            count = pages.len(),
                            "loaded reclaimable pages from free DB"
                        );
                        self.reclaim = Some(Reclaim {
                            txnid: freed_txnid,
                            pages,
                        });
                        tree::delete_leftmost(self, Dbi::FREE)?;
                    }
                }
            }

            if let Some(rec) = &self.reclaim {
                let lock = self.env.lock_region();
                for i in 0..lock.num_readers() {
                    let r = lock.reader(i).txnid();
                    if r != 0 && r < oldest {
                        oldest = r;
                    }
                }
                // Multi-page requests always come from the tail; the free
                // list is not searched for contiguous runs.
                if oldest > rec.txnid && num == 1 {
                    let rec = self.reclaim.as_mut().expect("checked above");
                    pgno = rec.pages.pop_last();
                    if rec.pages.is_empty() {
                        self.reclaim = None;
                    }
                }
            }
        }

        let pgno = match pgno {
            Some(p) => p,
            None => {
                let p = self.next_pgno;
                self.next_pgno += num as Pgno;
                p
            }
        };

        let psize = self.psize();
        ensure!(
            (pgno as usize + num) * psize <= self.env.map_size(),
            "memory map is full (page {}, map {} bytes)",
            pgno,
            self.env.map_size()
        );

        let buf = vec![0u8; num * psize].into_boxed_slice();
        self.dirty.insert(pgno, DirtyPage { buf, num, parent });
        trace!(pgno, num, "allocated dirty page");
        Ok(pgno)
    }

    /// Copy-on-write: make `pgno` writable, returning its (possibly new)
    /// page number. The parent's child pointer is patched when the page
    /// moves.
    pub(crate) fn touch(
        &mut self,
        pgno: Pgno,
        parent: Option<(Pgno, usize)>,
    ) -> Result<Pgno> {
        if self.is_dirty(pgno) {
            self.set_dirty_parent(pgno, parent);
            return Ok(pgno);
        }

        let new_pgno = self.alloc_page(1, parent)?;
        {
            let src = map_page(self.env, pgno, self.last_pgno)?;
            let dp = self.dirty.get_mut(&new_pgno).expect("just inserted");
            dp.buf.copy_from_slice(src);
            let mut page = PageMut::new(&mut dp.buf)?;
            let header = page.header_mut();
            header.set_pgno(new_pgno);
            header.set_flags(header.flags() | PAGE_DIRTY);
        }
        self.free_pgs.insert(pgno);
        trace!(old = pgno, new = new_pgno, "touched page");

        if let Some((parent_pgno, parent_idx)) = parent {
            let mut parent_page = self.page_mut(parent_pgno)?;
            parent_page.set_node_child(parent_idx, new_pgno)?;
        }
        Ok(new_pgno)
    }

    /// Allocate and initialize a page for a database, keeping its page
    /// counters current.
    pub(crate) fn new_page(&mut self, dbi: Dbi, flags: u32, num: usize) -> Result<Pgno> {
        use crate::page::{PAGE_BRANCH, PAGE_LEAF, PAGE_OVERFLOW};

        let pgno = self.alloc_page(num, None)?;
        let psize = self.psize();
        {
            let dp = self.dirty.get_mut(&pgno).expect("just inserted");
            let mut page = PageMut::new(&mut dp.buf)?;
            page.init(pgno, flags | PAGE_DIRTY, psize);
            if flags & PAGE_OVERFLOW != 0 {
                page.header_mut().set_overflow_count(num as u32);
            }
        }
        let db = &mut self.dbs[dbi.0];
        if flags & PAGE_BRANCH != 0 {
            db.set_branch_pages(db.branch_pages() + 1);
        } else if flags & PAGE_LEAF != 0 {
            db.set_leaf_pages(db.leaf_pages() + 1);
        } else if flags & PAGE_OVERFLOW != 0 {
            db.set_overflow_pages(db.overflow_pages() + num as u64);
        }
        Ok(pgno)
    }

    /// Attach a temporary DB slot for a `DUPSORT` sub-tree. The sub-tree
    /// shares this transaction's dirty pages, allocator and free list;
    /// its key comparator is the parent's duplicate comparator.
    pub(crate) fn push_sub_db(&mut self, parent: Dbi, record: DbRecord) -> Dbi {
        let dcmp = self.dbxs[parent.0].dcmp;
        self.dbs.push(record);
        self.dbxs.push(DbxState {
            name: String::new(),
            cmp: dcmp,
            dcmp: None,
            dirty: true,
        });
        Dbi(self.dbs.len() - 1)
    }

    /// Detach the temporary sub-tree slot, returning its mutated record
    /// so the caller can write it back into the parent leaf node.
    pub(crate) fn pop_sub_db(&mut self) -> DbRecord {
        self.dbxs.pop();
        self.dbs.pop().expect("sub-db slot present")
    }

    // ------------------------------------------------------------------
    // Commit and abort
    // ------------------------------------------------------------------

    /// Durably apply the transaction.
    pub fn commit(mut self) -> Result<()> {
        if self.error {
            self.abort_inner();
            bail!("cannot commit a transaction in an error state");
        }
        if self.dirty.is_empty() {
            // Nothing written: walk the txnid back and release.
            self.abort_inner();
            return Ok(());
        }

        match self.commit_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_error();
                self.abort_inner();
                Err(e)
            }
        }
    }

    fn commit_inner(&mut self) -> Result<()> {
        debug!(
            txnid = self.txnid,
            dirty = self.dirty.len(),
            root = self.dbs[Dbi::MAIN.0].root(),
            "committing"
        );

        // Put the partially consumed reclaim batch back; there is at most
        // one record in flight.
        if let Some(rec) = self.reclaim.take() {
            let key = rec.txnid.to_le_bytes();
            let data = rec.pages.to_bytes();
            tree::put_internal(self, Dbi::FREE, &key, &data, WriteFlags::empty(), 0)?;
        }

        // Record this transaction's freed pages. The tail of the free DB
        // is touched first so the copy-on-write it causes is already
        // accounted for in the list being written.
        if !self.free_pgs.is_empty() {
            tree::touch_rightmost(self, Dbi::FREE)?;
            let key = self.txnid.to_le_bytes();
            let data = self.free_pgs.to_bytes();
            tree::put_internal(self, Dbi::FREE, &key, &data, WriteFlags::empty(), 0)?;
        }

        // Rewrite the records of named DBs changed by this transaction.
        for i in CORE_DBS..self.dbs.len() {
            if self.dbxs[i].dirty {
                let name = std::mem::take(&mut self.dbxs[i].name);
                let record = self.dbs[i];
                let result = tree::put_db_record(self, name.as_bytes(), &record);
                self.dbxs[i].name = name;
                result?;
            }
        }

        self.write_dirty_pages()?;
        self.sync()?;
        self.write_meta()?;
        self.sync()?;

        // Publish named-DB state into the other toggle for new readers.
        {
            let mut named = self.env.named().lock();
            for i in CORE_DBS..self.dbxs.len() {
                let ei = i - CORE_DBS;
                if ei >= named.entries.len() {
                    named.entries.push(NamedDbEntry {
                        name: self.dbxs[i].name.clone(),
                        cmp: self.dbxs[i].cmp,
                        dcmp: self.dbxs[i].dcmp,
                    });
                }
            }
            let next = 1 - named.toggle;
            named.dbs[next] = self.dbs[CORE_DBS..].to_vec();
            named.toggle = next;
        }

        self.env.lock_region().unlock_writer();
        self.done = true;
        debug!(txnid = self.txnid, last_pgno = self.next_pgno - 1, "committed");
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if !self.env.env_flags().contains(EnvFlags::NOSYNC) {
            self.env.data_file().sync_all().wrap_err("fsync failed")?;
        }
        Ok(())
    }

    /// Stream the dirty pages out in ascending page order, coalescing
    /// contiguous runs into vectored writes of up to 64 buffers.
    fn write_dirty_pages(&mut self) -> Result<()> {
        const COMMIT_PAGES: usize = 64;

        for dp in self.dirty.values_mut() {
            let mut page = PageMut::new(&mut dp.buf)?;
            page.header_mut().clear_flag(PAGE_DIRTY);
        }

        let psize = self.psize();
        let fd = self.env.data_fd();
        let mut iov: Vec<libc::iovec> = Vec::with_capacity(COMMIT_PAGES);
        let mut batch_offset = 0u64;
        let mut batch_bytes = 0usize;
        let mut expected_next = 0;

        let flush = |iov: &mut Vec<libc::iovec>, offset: u64, bytes: usize| -> Result<()> {
            if iov.is_empty() {
                return Ok(());
            }
            trace!(count = iov.len(), offset, "writing dirty page batch");
            // SAFETY: every iovec points into a dirty buffer owned by
            // this transaction, alive and unmoved for the whole call.
            let written =
                unsafe { libc::pwritev(fd, iov.as_ptr(), iov.len() as libc::c_int, offset as i64) };
            ensure!(
                written == bytes as isize,
                "short write committing pages at offset {}: {} of {} bytes ({})",
                offset,
                written,
                bytes,
                std::io::Error::last_os_error()
            );
            iov.clear();
            Ok(())
        };

        for (&pgno, dp) in self.dirty.iter() {
            let len = dp.num * psize;
            if iov.is_empty() || pgno != expected_next || iov.len() >= COMMIT_PAGES {
                flush(&mut iov, batch_offset, batch_bytes)?;
                batch_offset = pgno * psize as u64;
                batch_bytes = 0;
            }
            iov.push(libc::iovec {
                iov_base: dp.buf.as_ptr() as *mut libc::c_void,
                iov_len: len,
            });
            batch_bytes += len;
            expected_next = pgno + dp.num as Pgno;
        }
        flush(&mut iov, batch_offset, batch_bytes)?;
        Ok(())
    }

    /// Write the mutable meta tail on the opposite toggle: DB records,
    /// last page and this transaction's id. The fixed head of the meta
    /// (magic, version, page size) is never rewritten.
    fn write_meta(&self) -> Result<()> {
        let tail = Meta::tail_bytes(
            [self.dbs[0], self.dbs[1]],
            self.next_pgno - 1,
            self.txnid,
        );
        let offset = (self.meta_target * self.psize()
            + PAGE_HEADER_SIZE
            + crate::meta::MUTABLE_TAIL_OFFSET) as u64;
        use std::os::unix::fs::FileExt;
        debug!(toggle = self.meta_target, txnid = self.txnid, "writing meta");
        self.env
            .data_file()
            .write_all_at(&tail, offset)
            .wrap_err("failed to write meta page")
    }

    /// Throw the transaction away, releasing the writer mutex.
    pub fn abort(mut self) {
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        if self.done {
            return;
        }
        debug!(txnid = self.txnid, "aborting write transaction");
        self.dirty.clear();
        self.reclaim = None;
        self.free_pgs = Idl::new();
        let lock = self.env.lock_region();
        lock.set_txnid(lock.txnid() - 1);
        lock.unlock_writer();
        self.done = true;
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        self.abort_inner();
    }
}

/// Shared read access to either transaction kind, for the tree engine
/// and cursors.
#[derive(Clone, Copy)]
pub(crate) enum TxnRef<'a> {
    Read(&'a ReadTxn<'a>),
    Write(&'a WriteTxn<'a>),
}

impl<'a> TxnRef<'a> {
    pub fn db(self, dbi: Dbi) -> &'a DbRecord {
        match self {
            TxnRef::Read(t) => &t.dbs[dbi.0],
            TxnRef::Write(t) => &t.dbs[dbi.0],
        }
    }

    pub fn dbx(self, dbi: Dbi) -> &'a DbxState {
        match self {
            TxnRef::Read(t) => &t.dbxs[dbi.0],
            TxnRef::Write(t) => &t.dbxs[dbi.0],
        }
    }

    pub fn page(self, pgno: Pgno) -> Result<&'a [u8]> {
        match self {
            TxnRef::Read(t) => {
                ensure!(
                    pgno <= t.last_pgno,
                    "page {} is past the end of the database (last {})",
                    pgno,
                    t.last_pgno
                );
                map_page(t.env, pgno, t.last_pgno)
            }
            TxnRef::Write(t) => t.page(pgno),
        }
    }
}

/// Read a page (or a whole overflow span) from the shared map.
fn map_page(env: &Environment, pgno: Pgno, last_pgno: Pgno) -> Result<&[u8]> {
    let first = env.page_span(pgno, 1)?;
    let view = crate::page::PageView::new(first)?;
    if view.is_overflow() {
        let count = view.header().overflow_count() as usize;
        ensure!(
            count >= 1 && pgno + count as Pgno - 1 <= last_pgno,
            "overflow chain at page {} ({} pages) is out of bounds",
            pgno,
            count
        );
        return env.page_span(pgno, count);
    }
    Ok(first)
}

fn find_named(dbxs: &[DbxState], name: &str) -> Option<Dbi> {
    dbxs.iter()
        .enumerate()
        .skip(CORE_DBS)
        .find(|(_, dbx)| dbx.name == name)
        .map(|(i, _)| Dbi(i))
}

pub(crate) fn check_key(key: &[u8]) -> Result<()> {
    ensure!(
        !key.is_empty() && key.len() <= MAX_KEY_SIZE,
        "key size {} is out of range (1..={})",
        key.len(),
        MAX_KEY_SIZE
    );
    Ok(())
}

pub(crate) fn check_dbi(dbi: Dbi, num_dbs: usize) -> Result<()> {
    ensure!(dbi.0 < num_dbs, "unknown database handle {}", dbi.0);
    Ok(())
}

// DbRecord values are written into the main DB as plain bytes.
pub(crate) fn db_record_bytes(record: &DbRecord) -> &[u8] {
    record.as_bytes()
}

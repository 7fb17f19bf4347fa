//! Environment lifecycle: files, mapping, reader registration.
//!
//! An environment is a directory holding two files:
//!
//! - `data.mdb`: the database proper, an array of pages mapped read-only
//!   into every process. Two meta pages at the front alternate as commit
//!   roots; everything else is B+tree and overflow pages.
//! - `lock.mdb`: the process-shared lock region (see [`crate::lock`]).
//!
//! The data map is `PROT_READ`: committed pages are immutable by
//! construction and the single writer mutates only private buffers until
//! commit appends them through the file descriptor. The map is sized at
//! open time (the `map_size` builder knob, persisted in the meta page) and
//! never remapped; the file grows underneath it as commits extend the
//! tree, and the allocator refuses to grow past the map.
//!
//! ## Page size
//!
//! A fresh environment adopts the host page size (clamped to a sane
//! range) and records it in the meta page; reopening always uses the
//! recorded value, so a database created on a 4K-page host works on a 16K
//! host and vice versa.
//!
//! ## Reader registration
//!
//! The first read transaction on a thread claims a reader slot under the
//! reader-table mutex and caches the slot index in thread-local storage;
//! later read transactions on the same thread reuse it without taking the
//! mutex. A slot stores the reader's snapshot txnid while a transaction
//! is live and zero in between. The writer scans the slots (without
//! locking) to find the oldest live snapshot when it decides which freed
//! pages are safe to recycle.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use tracing::debug;

use crate::flags::EnvFlags;
use crate::lock::{self, LockRegion};
use crate::meta::{self, DbRecord, Meta, CORE_DBS};
use crate::page::Pgno;
use crate::txn::{ReadTxn, WriteTxn};
use crate::CmpFn;

pub const DATA_FILE: &str = "data.mdb";
pub const LOCK_FILE: &str = "lock.mdb";

const DEFAULT_MAP_SIZE: usize = 1 << 20;
const DEFAULT_MAX_READERS: u32 = 126;
const DEFAULT_MAX_DBS: u32 = 2;

const MIN_PAGE_SIZE: usize = 512;
const MAX_PAGE_SIZE: usize = 32768;

static NEXT_ENV_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Reader slot owned by this thread, per environment instance.
    static READER_SLOTS: RefCell<HashMap<u64, u32>> = RefCell::new(HashMap::new());
}

/// Statistics for one database, mirroring its on-disk descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub page_size: u32,
    pub depth: u16,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entries: u64,
}

impl Stat {
    pub(crate) fn from_record(page_size: u32, db: &DbRecord) -> Self {
        Self {
            page_size,
            depth: db.depth(),
            branch_pages: db.branch_pages(),
            leaf_pages: db.leaf_pages(),
            overflow_pages: db.overflow_pages(),
            entries: db.entries(),
        }
    }
}

/// Environment-wide information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    pub map_size: usize,
    pub last_pgno: Pgno,
    pub last_txnid: u64,
    pub max_readers: u32,
    pub num_readers: u32,
}

/// One live entry of the reader table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    pub pid: u32,
    pub tid: u64,
    pub txnid: u64,
}

/// A named database known to the environment: its name and comparator
/// overrides. Descriptor snapshots live in the double-buffered tables.
#[derive(Debug, Clone)]
pub(crate) struct NamedDbEntry {
    pub name: String,
    pub cmp: Option<CmpFn>,
    pub dcmp: Option<CmpFn>,
}

/// Named-DB descriptors, double-buffered: readers snapshot the current
/// toggle while a committing writer publishes into the other one.
pub(crate) struct NamedDbs {
    pub entries: Vec<NamedDbEntry>,
    pub dbs: [Vec<DbRecord>; 2],
    pub toggle: usize,
}

/// Builder for [`Environment`].
#[derive(Debug, Clone)]
pub struct EnvBuilder {
    map_size: Option<usize>,
    max_readers: u32,
    max_dbs: u32,
    flags: EnvFlags,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self {
            map_size: None,
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: DEFAULT_MAX_DBS,
            flags: EnvFlags::empty(),
        }
    }

    /// Size of the read-only data map. Also the hard ceiling on database
    /// growth. Defaults to the persisted size, or 1 MiB for a fresh
    /// environment.
    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = Some(size);
        self
    }

    pub fn max_readers(mut self, readers: u32) -> Self {
        self.max_readers = readers.max(1);
        self
    }

    /// How many named databases may be open, beyond the two reserved
    /// slots.
    pub fn max_dbs(mut self, dbs: u32) -> Self {
        self.max_dbs = dbs.max(DEFAULT_MAX_DBS);
        self
    }

    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Environment> {
        Environment::open(path.as_ref(), self)
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A database environment: one data file, one lock file, any number of
/// read snapshots and at most one writer at a time.
pub struct Environment {
    data_file: File,
    _lock_file: File,
    map: Mmap,
    map_size: usize,
    psize: usize,
    flags: EnvFlags,
    max_dbs: u32,
    lock: LockRegion,
    named: Mutex<NamedDbs>,
    env_id: u64,
    path: PathBuf,
}

impl Environment {
    pub fn builder() -> EnvBuilder {
        EnvBuilder::new()
    }

    fn open(path: &Path, builder: EnvBuilder) -> Result<Self> {
        let rdonly = builder.flags.contains(EnvFlags::RDONLY);
        if !path.exists() {
            ensure!(!rdonly, "cannot create read-only environment at '{}'", path.display());
            std::fs::create_dir_all(path)
                .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))
            .wrap_err_with(|| format!("failed to open lock file in '{}'", path.display()))?;

        let exclusive = lock::acquire_file_lock(&lock_file)?;
        let lock = if exclusive {
            LockRegion::open(&lock_file, builder.max_readers, true)?
        } else {
            let len = lock_file.metadata()?.len() as usize;
            let max_readers = lock::readers_for_size(len);
            ensure!(max_readers > 0, "lock file is truncated");
            LockRegion::open(&lock_file, max_readers, false)?
        };

        let data_file = OpenOptions::new()
            .read(true)
            .write(!rdonly)
            .create(!rdonly)
            .truncate(false)
            .open(path.join(DATA_FILE))
            .wrap_err_with(|| format!("failed to open data file in '{}'", path.display()))?;

        let file_len = data_file.metadata()?.len();
        let (psize, map_size) = if file_len == 0 {
            ensure!(!rdonly, "read-only open of an empty environment");
            let psize = host_page_size();
            let map_size = builder.map_size.unwrap_or(DEFAULT_MAP_SIZE).max(2 * psize);
            let image = meta::initial_image(
                psize,
                (builder.flags.bits() & 0xffff) as u16,
                map_size as u64,
                0,
            );
            data_file
                .write_all_at(&image, 0)
                .wrap_err("failed to write initial meta pages")?;
            data_file.sync_all()?;
            debug!(psize, map_size, "created new environment");
            (psize, map_size)
        } else {
            let mut buf = vec![0u8; (file_len as usize).min(4096)];
            data_file
                .read_exact_at(&mut buf, 0)
                .wrap_err("failed to read meta page")?;
            let (psize, persisted_map_size) = match Meta::from_page(&buf) {
                Ok(meta) => (meta.page_size() as usize, meta.map_size() as usize),
                // Page 0 may be the meta torn by a crash; probe for the
                // second copy at each plausible page size.
                Err(e) => probe_second_meta(&data_file, file_len)
                    .ok_or_else(|| e.wrap_err("meta page 0 is unreadable"))?,
            };
            ensure!(
                (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&psize),
                "meta page records an unusable page size: {}",
                psize
            );
            let map_size = builder
                .map_size
                .unwrap_or(persisted_map_size)
                .max(2 * psize);
            (psize, map_size)
        };

        if !rdonly {
            repair_torn_meta(&data_file, psize)?;
        }

        // SAFETY: the map is read-only; the writer appends through the fd
        // and never rewrites a page a committed meta can reach, so views
        // handed to readers stay stable.
        let map = unsafe {
            MmapOptions::new()
                .len(map_size)
                .map(&data_file)
                .wrap_err_with(|| format!("failed to map '{}'", path.display()))?
        };

        let env = Self {
            data_file,
            _lock_file: lock_file,
            map,
            map_size,
            psize,
            flags: builder.flags,
            max_dbs: builder.max_dbs,
            lock,
            named: Mutex::new(NamedDbs {
                entries: Vec::new(),
                dbs: [Vec::new(), Vec::new()],
                toggle: 0,
            }),
            env_id: NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
        };

        let (_, newest) = env.read_meta()?;
        if exclusive {
            env.lock.set_txnid(newest.txnid());
            lock::downgrade_file_lock(&env._lock_file)?;
        }
        debug!(
            txnid = newest.txnid(),
            last_pgno = newest.last_pgno(),
            "opened environment at '{}'",
            path.display()
        );
        Ok(env)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.psize
    }

    pub(crate) fn env_flags(&self) -> EnvFlags {
        self.flags
    }

    pub(crate) fn max_dbs(&self) -> usize {
        self.max_dbs as usize + CORE_DBS
    }

    pub(crate) fn lock_region(&self) -> &LockRegion {
        &self.lock
    }

    pub(crate) fn named(&self) -> &Mutex<NamedDbs> {
        &self.named
    }

    pub(crate) fn data_fd(&self) -> RawFd {
        self.data_file.as_raw_fd()
    }

    pub(crate) fn data_file(&self) -> &File {
        &self.data_file
    }

    pub(crate) fn map_size(&self) -> usize {
        self.map_size
    }

    /// A span of `count` contiguous pages out of the read-only map.
    pub(crate) fn page_span(&self, pgno: Pgno, count: usize) -> Result<&[u8]> {
        let start = pgno as usize * self.psize;
        let end = start + count * self.psize;
        ensure!(
            end <= self.map.len(),
            "page {} (+{}) is beyond the memory map",
            pgno,
            count
        );
        Ok(&self.map[start..end])
    }

    /// Parse both meta pages and return the authoritative one: the newer
    /// of the two, or the surviving one when the other is torn. A torn
    /// meta is the expected aftermath of a crash mid-commit; only both
    /// being unreadable is fatal.
    pub(crate) fn read_meta(&self) -> Result<(usize, &Meta)> {
        let meta0 = Meta::from_page(self.page_span(0, 1)?);
        let meta1 = Meta::from_page(self.page_span(1, 1)?);
        match (meta0, meta1) {
            (Ok(meta0), Ok(meta1)) => {
                let toggle = Meta::select([meta0, meta1]);
                Ok((toggle, if toggle == 0 { meta0 } else { meta1 }))
            }
            (Ok(meta0), Err(_)) => Ok((0, meta0)),
            (Err(_), Ok(meta1)) => Ok((1, meta1)),
            (Err(e), Err(_)) => Err(e.wrap_err("both meta pages are unreadable")),
        }
    }

    /// Begin a read-only snapshot transaction.
    pub fn begin_read(&self) -> Result<ReadTxn<'_>> {
        ReadTxn::new(self)
    }

    /// Begin the write transaction. Blocks while another writer (in any
    /// process) holds the writer mutex.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        ensure!(
            !self.flags.contains(EnvFlags::RDONLY),
            "cannot write in a read-only environment"
        );
        WriteTxn::new(self)
    }

    /// Flush the data file. With `force`, syncs even under `NOSYNC`.
    pub fn sync(&self, force: bool) -> Result<()> {
        ensure!(
            !self.flags.contains(EnvFlags::RDONLY),
            "cannot sync a read-only environment"
        );
        if force || !self.flags.contains(EnvFlags::NOSYNC) {
            self.data_file.sync_all().wrap_err("fsync failed")?;
        }
        Ok(())
    }

    /// Statistics of the main database as of the last commit.
    pub fn stat(&self) -> Result<Stat> {
        let (_, meta) = self.read_meta()?;
        Ok(Stat::from_record(self.psize as u32, meta.db(1)))
    }

    pub fn info(&self) -> Result<EnvInfo> {
        let (_, meta) = self.read_meta()?;
        Ok(EnvInfo {
            map_size: self.map_size,
            last_pgno: meta.last_pgno(),
            last_txnid: meta.txnid(),
            max_readers: self.lock.max_readers(),
            num_readers: self.lock.num_readers(),
        })
    }

    /// Snapshot of the live rows of the reader table.
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        let mut readers = Vec::new();
        for i in 0..self.lock.num_readers() {
            let slot = self.lock.reader(i);
            if slot.pid() != 0 {
                readers.push(ReaderInfo {
                    pid: slot.pid(),
                    tid: slot.tid(),
                    txnid: slot.txnid(),
                });
            }
        }
        readers
    }

    /// Claim (or reuse) this thread's reader slot.
    pub(crate) fn claim_reader_slot(&self) -> Result<u32> {
        let cached = READER_SLOTS.with(|slots| slots.borrow().get(&self.env_id).copied());
        if let Some(slot) = cached {
            return Ok(slot);
        }

        let _guard = self.lock.lock_reader_table()?;
        let num = self.lock.num_readers();
        let mut index = num;
        for i in 0..num {
            if self.lock.reader(i).pid() == 0 {
                index = i;
                break;
            }
        }
        ensure!(
            index < self.lock.max_readers(),
            "reader table is full ({} slots)",
            self.lock.max_readers()
        );

        // SAFETY: pthread_self has no preconditions.
        let tid = unsafe { libc::pthread_self() as u64 };
        self.lock.reader(index).claim(std::process::id(), tid);
        if index >= num {
            self.lock.set_num_readers(index + 1);
        }
        READER_SLOTS.with(|slots| slots.borrow_mut().insert(self.env_id, index));
        Ok(index)
    }
}

/// Rebuild a torn meta page from its surviving twin. Commits rewrite
/// only the mutable meta tail, so a slot whose fixed head was destroyed
/// by a crash must be restored before it can take commits again. The
/// copy keeps the survivor's txnid; identical twins are harmless.
fn repair_torn_meta(data_file: &File, psize: usize) -> Result<()> {
    use crate::page::{PageMut, PAGE_HEADER_SIZE, PAGE_META};
    use crate::meta::META_SIZE;

    let mut pages = [vec![0u8; psize], vec![0u8; psize]];
    for (slot, page) in pages.iter_mut().enumerate() {
        data_file
            .read_exact_at(page, (slot * psize) as u64)
            .wrap_err("failed to read meta page")?;
    }
    let valid = [
        Meta::from_page(&pages[0]).is_ok(),
        Meta::from_page(&pages[1]).is_ok(),
    ];
    if valid[0] == valid[1] {
        return Ok(());
    }

    let good = usize::from(valid[1]);
    let bad = 1 - good;
    let mut image = vec![0u8; psize];
    {
        let mut page = PageMut::new(&mut image[..]).expect("page sized buffer");
        let header = page.header_mut();
        header.set_pgno(bad as Pgno);
        header.set_flags(PAGE_META);
    }
    image[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE]
        .copy_from_slice(&pages[good][PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE]);
    data_file
        .write_all_at(&image, (bad * psize) as u64)
        .wrap_err("failed to rewrite torn meta page")?;
    data_file.sync_all()?;
    debug!(slot = bad, "repaired torn meta page");
    Ok(())
}

/// Look for a valid meta record on page 1, trying every page size the
/// format allows. Used when page 0 was torn by a crash.
fn probe_second_meta(data_file: &File, file_len: u64) -> Option<(usize, usize)> {
    let mut psize = MIN_PAGE_SIZE;
    while psize <= MAX_PAGE_SIZE {
        if (2 * psize) as u64 <= file_len {
            let mut buf = vec![0u8; psize];
            if data_file.read_exact_at(&mut buf, psize as u64).is_ok() {
                if let Ok(meta) = Meta::from_page(&buf) {
                    if meta.page_size() as usize == psize {
                        return Some((psize, meta.map_size() as usize));
                    }
                }
            }
        }
        psize *= 2;
    }
    None
}

fn host_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let host = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    (host.max(0) as usize).clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_page_size_is_sane() {
        let psize = host_page_size();
        assert!((MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&psize));
        assert!(psize.is_power_of_two());
    }

    #[test]
    fn fresh_environment_has_empty_metas() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::builder().open(dir.path()).unwrap();

        let (toggle, meta) = env.read_meta().unwrap();
        assert_eq!(toggle, 0);
        assert_eq!(meta.txnid(), 0);
        assert_eq!(meta.last_pgno(), 1);

        let info = env.info().unwrap();
        assert_eq!(info.last_txnid, 0);
        assert_eq!(info.num_readers, 0);
    }

    #[test]
    fn map_size_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let size = 4 << 20;
        {
            let _env = Environment::builder().map_size(size).open(dir.path()).unwrap();
        }
        let env = Environment::builder().open(dir.path()).unwrap();
        assert_eq!(env.info().unwrap().map_size, size);
    }

    #[test]
    fn rdonly_refuses_missing_environment() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let result = Environment::builder()
            .flags(EnvFlags::RDONLY)
            .open(&missing);
        assert!(result.is_err());
    }

    #[test]
    fn reader_slot_is_reused_per_thread() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::builder().open(dir.path()).unwrap();

        let a = env.claim_reader_slot().unwrap();
        let b = env.claim_reader_slot().unwrap();
        assert_eq!(a, b);
        assert_eq!(env.lock_region().num_readers(), 1);
    }
}

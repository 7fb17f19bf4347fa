//! The process-shared lock region.
//!
//! Next to the data file lives a small lock file, memory-mapped read-write
//! by every process that opens the environment. It carries the state that
//! has to be visible across processes:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ magic, version                               │
//! │ reader-table mutex (process-shared)          │
//! │ global transaction id                        │
//! │ number of claimed reader slots               │
//! ├─────────────────── cache line ───────────────┤
//! │ writer mutex (process-shared)                │
//! ├─────────────────── cache line ───────────────┤
//! │ reader slot 0: txnid, pid, tid               │
//! │ reader slot 1: ...                           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Each reader slot occupies a full cache line so that readers publishing
//! their snapshot ids do not bounce each other's lines. The reader-table
//! mutex guards only slot allocation; once a thread owns a slot it stores
//! its snapshot txnid with a plain atomic write and the writer reads it
//! without any lock. That read is racy on purpose: observing a stale
//! (newer) txnid merely delays page reclamation, and a reader only ever
//! moves its slot forward after the global counter already covers it.
//!
//! The first opener initializes the region: it takes an exclusive fcntl
//! lock on the lock file, stamps magic and version, initializes both
//! process-shared mutexes and zeroes the slots, then downgrades to a
//! shared lock that every other opener acquires directly.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use eyre::{bail, ensure, Result};
use memmap2::MmapMut;

use crate::meta::{FORMAT_VERSION, MAGIC};

const CACHE_LINE: usize = 64;

/// One claimed read snapshot. `txnid == 0` means the owning thread has no
/// transaction open; `pid == 0` means the slot has never been claimed.
#[repr(C, align(64))]
pub struct ReaderSlot {
    txnid: AtomicU64,
    tid: AtomicU64,
    pid: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<ReaderSlot>() == CACHE_LINE);

impl ReaderSlot {
    pub fn txnid(&self) -> u64 {
        self.txnid.load(Ordering::Acquire)
    }

    pub fn set_txnid(&self, txnid: u64) {
        self.txnid.store(txnid, Ordering::Release);
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn tid(&self) -> u64 {
        self.tid.load(Ordering::Acquire)
    }

    pub fn claim(&self, pid: u32, tid: u64) {
        self.pid.store(pid, Ordering::Release);
        self.tid.store(tid, Ordering::Release);
    }
}

#[repr(C, align(64))]
struct RegionHeader {
    magic: u32,
    version: u32,
    rmutex: libc::pthread_mutex_t,
    txnid: AtomicU64,
    num_readers: AtomicU32,
}

#[repr(C, align(64))]
struct RegionPrefix {
    header: RegionHeader,
    wmutex: libc::pthread_mutex_t,
}

/// Byte offset of the first reader slot; the prefix is cache-line sized
/// and aligned, so this is simply its size.
fn readers_offset() -> usize {
    std::mem::size_of::<RegionPrefix>()
}

/// Total lock file size for a given reader capacity.
pub fn region_size(max_readers: u32) -> usize {
    readers_offset() + max_readers as usize * std::mem::size_of::<ReaderSlot>()
}

/// Reader capacity encoded by an existing lock file's size.
pub fn readers_for_size(len: usize) -> u32 {
    (len.saturating_sub(readers_offset()) / std::mem::size_of::<ReaderSlot>()) as u32
}

/// Try to take an exclusive fcntl lock on the first byte of the lock
/// file. Returns `true` on success; otherwise falls back to a shared lock
/// (some other process already initialized the region).
pub fn acquire_file_lock(file: &File) -> Result<bool> {
    if set_file_lock(file, libc::F_WRLCK) {
        return Ok(true);
    }
    ensure!(
        set_file_lock(file, libc::F_RDLCK),
        "failed to acquire shared lock on lock file: {}",
        std::io::Error::last_os_error()
    );
    Ok(false)
}

/// Downgrade the initializer's exclusive lock to a shared one.
pub fn downgrade_file_lock(file: &File) -> Result<()> {
    ensure!(
        set_file_lock(file, libc::F_RDLCK),
        "failed to downgrade lock file lock: {}",
        std::io::Error::last_os_error()
    );
    Ok(())
}

fn set_file_lock(file: &File, kind: libc::c_int) -> bool {
    // SAFETY: flock is a plain C struct passed by pointer to fcntl; the
    // fd is owned by `file` and stays open for the duration of the call.
    unsafe {
        let mut lock: libc::flock = std::mem::zeroed();
        lock.l_type = kind as libc::c_short;
        lock.l_whence = libc::SEEK_SET as libc::c_short;
        lock.l_start = 0;
        lock.l_len = 1;
        libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) == 0
    }
}

/// The mapped lock region.
#[derive(Debug)]
pub struct LockRegion {
    map: MmapMut,
    max_readers: u32,
}

// SAFETY: all mutation of the mapped region goes through process-shared
// pthread mutexes or atomics; the raw pointers handed out by the accessor
// methods never outlive `self`.
unsafe impl Send for LockRegion {}
unsafe impl Sync for LockRegion {}

impl LockRegion {
    /// Map the lock file. When `exclusive` is set the region is (re-)
    /// initialized; otherwise its magic and version are validated.
    pub fn open(file: &File, max_readers: u32, exclusive: bool) -> Result<Self> {
        let size = region_size(max_readers);
        if exclusive {
            file.set_len(size as u64)?;
        }

        // SAFETY: the region is deliberately shared across processes;
        // all cross-process fields are accessed through atomics or the
        // process-shared mutexes initialized below.
        let map = unsafe { MmapMut::map_mut(file)? };
        ensure!(
            map.len() >= size,
            "lock file too small: {} bytes for {} readers",
            map.len(),
            max_readers
        );

        let region = Self { map, max_readers };
        if exclusive {
            region.init()?;
        } else {
            let header = region.header();
            ensure!(header.magic == MAGIC, "lock region has invalid magic");
            ensure!(
                header.version == FORMAT_VERSION,
                "lock region version {} does not match expected version {}",
                header.version,
                FORMAT_VERSION
            );
        }
        Ok(region)
    }

    fn prefix(&self) -> *const RegionPrefix {
        self.map.as_ptr() as *const RegionPrefix
    }

    fn header(&self) -> &RegionHeader {
        // SAFETY: the map is at least region_size bytes and the prefix
        // sits at offset 0 with cache-line alignment (mmap returns
        // page-aligned memory).
        unsafe { &(*self.prefix()).header }
    }

    fn init(&self) -> Result<()> {
        let prefix = self.prefix() as *mut RegionPrefix;
        // SAFETY: we hold the exclusive file lock, so no other process is
        // touching the region while it is stamped.
        unsafe {
            init_shared_mutex(std::ptr::addr_of_mut!((*prefix).header.rmutex))?;
            init_shared_mutex(std::ptr::addr_of_mut!((*prefix).wmutex))?;
            (*prefix).header.txnid = AtomicU64::new(0);
            (*prefix).header.num_readers = AtomicU32::new(0);
            (*prefix).header.magic = MAGIC;
            (*prefix).header.version = FORMAT_VERSION;
            let readers = self.map.as_ptr().add(readers_offset()) as *mut u8;
            std::ptr::write_bytes(
                readers,
                0,
                self.max_readers as usize * std::mem::size_of::<ReaderSlot>(),
            );
        }
        Ok(())
    }

    pub fn max_readers(&self) -> u32 {
        self.max_readers
    }

    pub fn txnid(&self) -> u64 {
        self.header().txnid.load(Ordering::Acquire)
    }

    pub fn set_txnid(&self, txnid: u64) {
        self.header().txnid.store(txnid, Ordering::Release);
    }

    pub fn num_readers(&self) -> u32 {
        self.header().num_readers.load(Ordering::Acquire)
    }

    pub fn set_num_readers(&self, n: u32) {
        self.header().num_readers.store(n, Ordering::Release);
    }

    pub fn reader(&self, index: u32) -> &ReaderSlot {
        debug_assert!(index < self.max_readers);
        // SAFETY: index is within the mapped slot array; slots contain
        // only atomics so shared references across processes are sound.
        unsafe {
            let base = self.map.as_ptr().add(readers_offset()) as *const ReaderSlot;
            &*base.add(index as usize)
        }
    }

    /// Serialize reader slot allocation. Slot txnid publication itself is
    /// lock-free.
    pub fn lock_reader_table(&self) -> Result<ReaderTableGuard<'_>> {
        let mutex = std::ptr::addr_of!(self.header().rmutex) as *mut libc::pthread_mutex_t;
        // SAFETY: the mutex was initialized process-shared by the first
        // opener; the pointer stays valid while the map lives.
        let rc = unsafe { libc::pthread_mutex_lock(mutex) };
        if rc != 0 {
            bail!("failed to lock reader table mutex: errno {}", rc);
        }
        Ok(ReaderTableGuard { region: self })
    }

    /// Block until this process/thread owns the single-writer mutex.
    pub fn lock_writer(&self) -> Result<()> {
        let mutex =
            // SAFETY: same lifetime argument as lock_reader_table.
            unsafe { std::ptr::addr_of!((*self.prefix()).wmutex) as *mut libc::pthread_mutex_t };
        let rc = unsafe { libc::pthread_mutex_lock(mutex) };
        if rc != 0 {
            bail!("failed to lock writer mutex: errno {}", rc);
        }
        Ok(())
    }

    pub fn unlock_writer(&self) {
        let mutex =
            // SAFETY: same lifetime argument as lock_reader_table.
            unsafe { std::ptr::addr_of!((*self.prefix()).wmutex) as *mut libc::pthread_mutex_t };
        // SAFETY: only called by the thread that holds the mutex.
        let rc = unsafe { libc::pthread_mutex_unlock(mutex) };
        debug_assert_eq!(rc, 0, "writer mutex unlock failed: errno {rc}");
    }
}

/// Holds the reader-table mutex; unlocks on drop.
pub struct ReaderTableGuard<'a> {
    region: &'a LockRegion,
}

impl Drop for ReaderTableGuard<'_> {
    fn drop(&mut self) {
        let mutex =
            std::ptr::addr_of!(self.region.header().rmutex) as *mut libc::pthread_mutex_t;
        // SAFETY: guard construction locked this mutex on this thread.
        let rc = unsafe { libc::pthread_mutex_unlock(mutex) };
        debug_assert_eq!(rc, 0, "reader table mutex unlock failed: errno {rc}");
    }
}

unsafe fn init_shared_mutex(mutex: *mut libc::pthread_mutex_t) -> Result<()> {
    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    let rc = libc::pthread_mutexattr_init(&mut attr);
    ensure!(rc == 0, "pthread_mutexattr_init failed: errno {}", rc);
    let rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if rc != 0 {
        libc::pthread_mutexattr_destroy(&mut attr);
        bail!("pthread_mutexattr_setpshared failed: errno {}", rc);
    }
    let rc = libc::pthread_mutex_init(mutex, &attr);
    libc::pthread_mutexattr_destroy(&mut attr);
    ensure!(rc == 0, "pthread_mutex_init failed: errno {}", rc);
    Ok(())
}

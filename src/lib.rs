//! # mapledb - Memory-Mapped Copy-on-Write Key-Value Store
//!
//! mapledb is an embedded, single-file key-value store built on a
//! copy-on-write B+tree with multi-version concurrency control. The whole
//! database lives in one memory-mapped file; readers resolve pages straight
//! out of the map with no locks, no page cache, and no copies.
//!
//! ## Design Summary
//!
//! - **Snapshots for free**: a read transaction pins the tree roots that
//!   were current when it began. Because committed pages are never modified
//!   in place, the snapshot stays consistent for as long as the reader
//!   lives.
//! - **One writer**: write transactions serialize on a process-shared mutex
//!   kept in a small lock file next to the data file. Writers never block
//!   readers and readers never block writers.
//! - **Crash consistency without a log**: each commit writes new pages past
//!   the durable end of the tree, syncs, then flips one of two alternating
//!   meta pages and syncs again. A torn data write is invisible (the meta
//!   still points at the old tree); a torn meta write leaves the other meta
//!   authoritative.
//! - **Space reuse**: pages released by copy-on-write are recorded in a
//!   reserved free-list database keyed by the freeing transaction id, and
//!   are handed back to the allocator once no live reader can still see
//!   them.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │   Environment (files, map, named DBs)     │
//! ├───────────────────────────────────────────┤
//! │  ReadTxn / WriteTxn (snapshots, dirty     │
//! │  pages, allocation, commit protocol)      │
//! ├─────────────────────┬─────────────────────┤
//! │   B+tree engine     │      Cursors        │
//! ├─────────────────────┴─────────────────────┤
//! │  Pages, nodes, meta records, free lists   │
//! ├───────────────────────────────────────────┤
//! │  data.mdb (mmap, read-only)   lock.mdb    │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use mapledb::{Environment, Dbi, WriteFlags};
//!
//! let env = Environment::builder()
//!     .map_size(10 * 1024 * 1024)
//!     .open("./mydb")?;
//!
//! let mut txn = env.begin_write()?;
//! txn.put(Dbi::MAIN, b"hello", b"world", WriteFlags::empty())?;
//! txn.commit()?;
//!
//! let rtxn = env.begin_read()?;
//! assert_eq!(rtxn.get(Dbi::MAIN, b"hello")?, Some(&b"world"[..]));
//! ```
//!
//! ## Module Overview
//!
//! - [`env`]: environment lifecycle, file layout, reader table
//! - [`txn`]: transactions, page allocation, the commit protocol
//! - [`tree`]: the copy-on-write B+tree engine
//! - [`cursor`]: ordered iteration, range lookups, duplicate traversal
//! - [`page`] / [`meta`]: on-disk page, node and meta-page layouts
//! - [`idl`]: the compact page-number list carried by the free-list DB
//! - [`lock`]: the process-shared lock region

pub mod cursor;
pub mod env;
pub mod flags;
pub mod idl;
pub mod lock;
pub mod meta;
pub mod page;
pub mod tree;
pub mod txn;

pub use cursor::{Cursor, CursorOp};
pub use env::{EnvBuilder, EnvInfo, Environment, ReaderInfo, Stat};
pub use flags::{DbFlags, EnvFlags, WriteFlags};
pub use page::{Pgno, INVALID_PGNO};
pub use txn::{Dbi, ReadTxn, WriteTxn};

/// Largest accepted key, in bytes.
pub const MAX_KEY_SIZE: usize = 511;

/// Library version triple.
pub fn version() -> (u32, u32, u32) {
    (0, 1, 0)
}

/// Comparator installed with [`WriteTxn::set_compare`] or
/// [`WriteTxn::set_dup_compare`].
pub type CmpFn = fn(&[u8], &[u8]) -> std::cmp::Ordering;

//! Meta pages and DB descriptor records.
//!
//! Pages 0 and 1 of the data file each carry a meta record describing one
//! committed state of the whole environment: the roots and statistics of
//! the free-list DB and the main DB, the highest page number in use, and
//! the id of the transaction that committed it. Commits alternate between
//! the two slots; on open the record with the larger transaction id wins,
//! and a torn write to one slot leaves the other authoritative.
//!
//! A `DbRecord` is the 48-byte descriptor of one B+tree. Besides the two
//! in the meta page, descriptors appear as values in the main DB (named
//! databases) and as values in `DUPSORT` leaf nodes (duplicate sub-trees).
//! Slot 0's descriptor moonlights as environment storage: its `pad` field
//! holds the page size and its `flags` field the persisted environment
//! flags, neither of which ever changes after creation. Commit therefore
//! rewrites only the meta tail starting at `MUTABLE_TAIL_OFFSET`.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::page::{PageHeader, PageMut, Pgno, INVALID_PGNO, PAGE_HEADER_SIZE, PAGE_META};

pub const MAGIC: u32 = 0xBEEF_C0DE;
pub const FORMAT_VERSION: u32 = 1;

/// Reserved DB slots: the free-list DB and the main DB.
pub const CORE_DBS: usize = 2;

pub const DB_RECORD_SIZE: usize = 48;
pub const META_SIZE: usize = 136;

/// Byte offset inside `Meta` where commit-time rewrites start: everything
/// before it (magic, version, map address and size, the page size and
/// persisted flags in `dbs[0]`) is fixed at creation.
pub const MUTABLE_TAIL_OFFSET: usize = 30;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DbRecord {
    pad: U32,
    flags: U16,
    depth: U16,
    branch_pages: U64,
    leaf_pages: U64,
    overflow_pages: U64,
    entries: U64,
    root: U64,
}

const _: () = assert!(std::mem::size_of::<DbRecord>() == DB_RECORD_SIZE);

impl DbRecord {
    /// A descriptor for an empty tree.
    pub fn new(flags: u16) -> Self {
        Self {
            pad: U32::new(0),
            flags: U16::new(flags),
            depth: U16::new(0),
            branch_pages: U64::new(0),
            leaf_pages: U64::new(0),
            overflow_pages: U64::new(0),
            entries: U64::new(0),
            root: U64::new(INVALID_PGNO),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= DB_RECORD_SIZE,
            "buffer too small for DbRecord: {} < {}",
            bytes.len(),
            DB_RECORD_SIZE
        );
        Self::ref_from_bytes(&bytes[..DB_RECORD_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse DbRecord: {:?}", e))
    }

    pub fn pad(&self) -> u32 {
        self.pad.get()
    }

    pub fn set_pad(&mut self, pad: u32) {
        self.pad = U32::new(pad);
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = U16::new(flags);
    }

    pub fn depth(&self) -> u16 {
        self.depth.get()
    }

    pub fn set_depth(&mut self, depth: u16) {
        self.depth = U16::new(depth);
    }

    pub fn branch_pages(&self) -> u64 {
        self.branch_pages.get()
    }

    pub fn set_branch_pages(&mut self, n: u64) {
        self.branch_pages = U64::new(n);
    }

    pub fn leaf_pages(&self) -> u64 {
        self.leaf_pages.get()
    }

    pub fn set_leaf_pages(&mut self, n: u64) {
        self.leaf_pages = U64::new(n);
    }

    pub fn overflow_pages(&self) -> u64 {
        self.overflow_pages.get()
    }

    pub fn set_overflow_pages(&mut self, n: u64) {
        self.overflow_pages = U64::new(n);
    }

    pub fn entries(&self) -> u64 {
        self.entries.get()
    }

    pub fn set_entries(&mut self, n: u64) {
        self.entries = U64::new(n);
    }

    pub fn root(&self) -> Pgno {
        self.root.get()
    }

    pub fn set_root(&mut self, root: Pgno) {
        self.root = U64::new(root);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Meta {
    magic: U32,
    version: U32,
    map_addr: U64,
    map_size: U64,
    dbs: [DbRecord; CORE_DBS],
    last_pgno: U64,
    txnid: U64,
}

const _: () = assert!(std::mem::size_of::<Meta>() == META_SIZE);
// magic + version + map_addr + map_size, then dbs[0].pad and dbs[0].flags.
const _: () = assert!(MUTABLE_TAIL_OFFSET == 4 + 4 + 8 + 8 + 4 + 2);

impl Meta {
    /// Parse and validate the meta record embedded in a meta page.
    pub fn from_page(page: &[u8]) -> Result<&Self> {
        ensure!(
            page.len() >= PAGE_HEADER_SIZE + META_SIZE,
            "meta page too small: {} bytes",
            page.len()
        );
        let header = PageHeader::ref_from_bytes(&page[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse page header: {:?}", e))?;
        ensure!(
            header.flags() & PAGE_META != 0,
            "page {} is not a meta page",
            header.pgno()
        );

        let meta = Self::ref_from_bytes(&page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse meta record: {:?}", e))?;
        ensure!(meta.magic.get() == MAGIC, "meta page has invalid magic");
        ensure!(
            meta.version.get() == FORMAT_VERSION,
            "database format version {} does not match expected version {}",
            meta.version.get(),
            FORMAT_VERSION
        );
        Ok(meta)
    }

    pub fn map_addr(&self) -> u64 {
        self.map_addr.get()
    }

    pub fn map_size(&self) -> u64 {
        self.map_size.get()
    }

    pub fn db(&self, index: usize) -> &DbRecord {
        &self.dbs[index]
    }

    /// Page size, stored in slot 0's `pad` field at creation.
    pub fn page_size(&self) -> u32 {
        self.dbs[0].pad()
    }

    /// Persisted environment flags, stored in slot 0's `flags` field.
    pub fn env_flags(&self) -> u16 {
        self.dbs[0].flags()
    }

    pub fn last_pgno(&self) -> Pgno {
        self.last_pgno.get()
    }

    pub fn txnid(&self) -> u64 {
        self.txnid.get()
    }

    /// Which of the two meta slots is authoritative: the newer one.
    pub fn select(metas: [&Meta; 2]) -> usize {
        usize::from(metas[0].txnid() < metas[1].txnid())
    }

    /// The bytes of the mutable tail, rewritten by every commit.
    pub fn tail_bytes(
        dbs: [DbRecord; CORE_DBS],
        last_pgno: Pgno,
        txnid: u64,
    ) -> [u8; META_SIZE - MUTABLE_TAIL_OFFSET] {
        let meta = Meta {
            magic: U32::new(MAGIC),
            version: U32::new(FORMAT_VERSION),
            map_addr: U64::new(0),
            map_size: U64::new(0),
            dbs,
            last_pgno: U64::new(last_pgno),
            txnid: U64::new(txnid),
        };
        meta.as_bytes()[MUTABLE_TAIL_OFFSET..]
            .try_into()
            .expect("fixed tail length")
    }
}

/// Build the first two pages of a fresh data file: two identical meta
/// pages describing an empty environment.
pub fn initial_image(
    psize: usize,
    persisted_env_flags: u16,
    map_size: u64,
    map_addr: u64,
) -> Vec<u8> {
    let mut dbs = [DbRecord::new(0), DbRecord::new(0)];
    dbs[0].set_pad(psize as u32);
    dbs[0].set_flags(persisted_env_flags | crate::flags::DbFlags::INTEGERKEY.persisted());

    let meta = Meta {
        magic: U32::new(MAGIC),
        version: U32::new(FORMAT_VERSION),
        map_addr: U64::new(map_addr),
        map_size: U64::new(map_size),
        dbs,
        last_pgno: U64::new(1),
        txnid: U64::new(0),
    };

    let mut image = vec![0u8; psize * 2];
    for (slot, chunk) in image.chunks_exact_mut(psize).enumerate() {
        {
            let mut page = PageMut::new(&mut chunk[..]).expect("page sized buffer");
            let header = page.header_mut();
            header.set_pgno(slot as Pgno);
            header.set_flags(PAGE_META);
        }
        chunk[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE].copy_from_slice(meta.as_bytes());
    }
    image
}

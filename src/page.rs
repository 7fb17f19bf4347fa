//! On-disk page and node layout.
//!
//! Every page starts with a 16-byte header followed by a slot array of
//! 2-byte node offsets growing upward; node bodies grow downward from the
//! end of the page. Free space is the gap between `lower` (end of the slot
//! array) and `upper` (start of the node area):
//!
//! ```text
//! Offset  Size  Field    Description
//! ------  ----  -------  -------------------------------------------
//! 0       8     pgno     page number == file offset / page size
//! 8       4     flags    BRANCH | LEAF | OVERFLOW | META | DIRTY
//! 12      2     lower    end of the slot array
//! 14      2     upper    start of the node area
//! ```
//!
//! Overflow pages reuse the `lower`/`upper` word as a 32-bit count of the
//! contiguous pages in the chain; only the first page of a chain carries a
//! header.
//!
//! A node is a 10-byte header followed by the key bytes and, on leaf
//! pages, the value bytes:
//!
//! ```text
//! Offset  Size  Field    Description
//! ------  ----  -------  -------------------------------------------
//! 0       8     payload  child page number (branch) or value size (leaf)
//! 8       2     meta     bits 0..4 node flags, bits 4..16 key size
//! 10      k     key
//! 10+k    d     value    leaf only; 8-byte chain head under BIGDATA
//! ```
//!
//! Nodes are addressed through the slot array, never by machine pointer,
//! so pages can live anywhere in the map. All multi-byte fields are
//! little-endian.
//!
//! The editing primitives here (`insert_node`, `delete_node`,
//! `update_key`) do plain slot-array surgery: deleting a node compacts the
//! node area and rewrites every slot that pointed below the hole. They
//! assume the caller already verified free space; the B+tree layer splits
//! before inserting into a page that cannot take the node.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Page number; equals the page's file offset divided by the page size.
pub type Pgno = u64;

/// Marks an absent page, e.g. the root of an empty tree.
pub const INVALID_PGNO: Pgno = Pgno::MAX;

pub const PAGE_HEADER_SIZE: usize = 16;
pub const NODE_HEADER_SIZE: usize = 10;
pub const INDEX_ENTRY_SIZE: usize = 2;

/// Non-root pages keep at least this many keys.
pub const MIN_KEYS: usize = 2;

/// Values of at least `page_size / OVERFLOW_DIVISOR` bytes move to an
/// overflow chain.
pub const OVERFLOW_DIVISOR: usize = 4;

/// Pages whose payload fill ratio drops below this (per mille) get
/// rebalanced.
pub const FILL_THRESHOLD: u64 = 250;

pub const PAGE_BRANCH: u32 = 0x01;
pub const PAGE_LEAF: u32 = 0x02;
pub const PAGE_OVERFLOW: u32 = 0x04;
pub const PAGE_META: u32 = 0x08;
/// In-memory only; stripped as pages are written out.
pub const PAGE_DIRTY: u32 = 0x10;

/// Leaf value lives in an overflow chain; the node stores the head pgno.
pub const NODE_BIGDATA: u8 = 0x01;
/// Leaf value is a serialized DB record for a nested sub-tree.
pub const NODE_SUBDATA: u8 = 0x02;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    pgno: U64,
    flags: U32,
    lower: U16,
    upper: U16,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn pgno(&self) -> Pgno {
        self.pgno.get()
    }

    pub fn set_pgno(&mut self, pgno: Pgno) {
        self.pgno = U64::new(pgno);
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = U32::new(flags);
    }

    pub fn clear_flag(&mut self, flag: u32) {
        self.flags = U32::new(self.flags.get() & !flag);
    }

    pub fn lower(&self) -> usize {
        self.lower.get() as usize
    }

    pub fn upper(&self) -> usize {
        self.upper.get() as usize
    }

    pub fn set_lower(&mut self, lower: usize) {
        self.lower = U16::new(lower as u16);
    }

    pub fn set_upper(&mut self, upper: usize) {
        self.upper = U16::new(upper as u16);
    }

    /// Number of contiguous pages in an overflow chain. Shares storage
    /// with `lower`/`upper`.
    pub fn overflow_count(&self) -> u32 {
        (self.lower.get() as u32) | ((self.upper.get() as u32) << 16)
    }

    pub fn set_overflow_count(&mut self, count: u32) {
        self.lower = U16::new((count & 0xffff) as u16);
        self.upper = U16::new((count >> 16) as u16);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    payload: U64,
    meta: U16,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    fn new(payload: u64, flags: u8, key_size: usize) -> Self {
        debug_assert!(key_size < 1 << 12);
        debug_assert!(flags < 1 << 4);
        Self {
            payload: U64::new(payload),
            meta: U16::new((flags as u16) | ((key_size as u16) << 4)),
        }
    }

    fn flags(&self) -> u8 {
        (self.meta.get() & 0xf) as u8
    }

    fn key_size(&self) -> usize {
        (self.meta.get() >> 4) as usize
    }

    fn set_key_size(&mut self, key_size: usize) {
        debug_assert!(key_size < 1 << 12);
        self.meta = U16::new((self.meta.get() & 0xf) | ((key_size as u16) << 4));
    }
}

/// What a leaf or branch node stores besides its key.
#[derive(Debug, Clone, Copy)]
pub enum NodePayload<'a> {
    /// Branch node: child page number, no value bytes.
    Branch { child: Pgno },
    /// Leaf node: the bytes written into the page (the value itself, or
    /// the 8-byte chain head under `NODE_BIGDATA`) and the logical value
    /// size recorded in the header.
    Leaf {
        stored: &'a [u8],
        data_size: usize,
        flags: u8,
    },
}

/// Decoded view of one node.
#[derive(Debug, Clone, Copy)]
pub struct NodeRef<'a> {
    flags: u8,
    payload: u64,
    key: &'a [u8],
    stored: &'a [u8],
}

impl<'a> NodeRef<'a> {
    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    pub fn child_pgno(&self) -> Pgno {
        self.payload
    }

    /// Logical value size; for `NODE_BIGDATA` this is the overflow value
    /// length, not the 8 stored bytes.
    pub fn data_size(&self) -> usize {
        self.payload as usize
    }

    /// The bytes physically stored in the page after the key.
    pub fn stored_data(&self) -> &'a [u8] {
        self.stored
    }

    pub fn is_big_data(&self) -> bool {
        self.flags & NODE_BIGDATA != 0
    }

    pub fn is_sub_data(&self) -> bool {
        self.flags & NODE_SUBDATA != 0
    }

    /// Head page of the overflow chain holding this node's value.
    pub fn overflow_root(&self) -> Result<Pgno> {
        ensure!(
            self.is_big_data() && self.stored.len() == 8,
            "node does not reference an overflow chain"
        );
        Ok(Pgno::from_le_bytes(self.stored.try_into().expect("8 bytes")))
    }
}

/// Read-only view over one page's bytes.
#[derive(Debug, Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
}

impl<'a> PageView<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "page buffer too small: {} bytes",
            data.len()
        );
        Ok(Self { data })
    }

    pub fn header(&self) -> &'a PageHeader {
        PageHeader::ref_from_bytes(&self.data[..PAGE_HEADER_SIZE]).expect("length checked")
    }

    pub fn pgno(&self) -> Pgno {
        self.header().pgno()
    }

    pub fn flags(&self) -> u32 {
        self.header().flags()
    }

    pub fn is_leaf(&self) -> bool {
        self.flags() & PAGE_LEAF != 0
    }

    pub fn is_branch(&self) -> bool {
        self.flags() & PAGE_BRANCH != 0
    }

    pub fn is_overflow(&self) -> bool {
        self.flags() & PAGE_OVERFLOW != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.flags() & PAGE_DIRTY != 0
    }

    pub fn num_keys(&self) -> usize {
        (self.header().lower() - PAGE_HEADER_SIZE) / INDEX_ENTRY_SIZE
    }

    pub fn size_left(&self) -> usize {
        self.header().upper() - self.header().lower()
    }

    /// Payload fill ratio in per mille, over a page of `psize` bytes.
    pub fn fill_per_mille(&self, psize: usize) -> u64 {
        let usable = (psize - PAGE_HEADER_SIZE) as u64;
        1000 * (usable - self.size_left() as u64) / usable
    }

    pub fn node_offset(&self, index: usize) -> usize {
        let slot = PAGE_HEADER_SIZE + index * INDEX_ENTRY_SIZE;
        u16::from_le_bytes(self.data[slot..slot + 2].try_into().expect("2 bytes")) as usize
    }

    pub fn node(&self, index: usize) -> Result<NodeRef<'a>> {
        ensure!(
            index < self.num_keys(),
            "node index {} out of range on page {} ({} keys)",
            index,
            self.pgno(),
            self.num_keys()
        );
        let ofs = self.node_offset(index);
        ensure!(
            ofs + NODE_HEADER_SIZE <= self.data.len(),
            "node offset {} out of bounds on page {}",
            ofs,
            self.pgno()
        );
        let header =
            NodeHeader::ref_from_bytes(&self.data[ofs..ofs + NODE_HEADER_SIZE]).expect("sized");
        let ksize = header.key_size();
        let key_start = ofs + NODE_HEADER_SIZE;
        let stored_len = if self.is_branch() {
            0
        } else if header.flags() & NODE_BIGDATA != 0 {
            8
        } else {
            header.payload.get() as usize
        };
        ensure!(
            key_start + ksize + stored_len <= self.data.len(),
            "node at offset {} overruns page {}",
            ofs,
            self.pgno()
        );
        Ok(NodeRef {
            flags: header.flags(),
            payload: header.payload.get(),
            key: &self.data[key_start..key_start + ksize],
            stored: &self.data[key_start + ksize..key_start + ksize + stored_len],
        })
    }
}

/// Mutable view over one dirty page's bytes.
#[derive(Debug)]
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "page buffer too small: {} bytes",
            data.len()
        );
        Ok(Self { data })
    }

    /// Stamp a fresh leaf or branch page: empty slot array, node area at
    /// the very end of `psize` bytes.
    pub fn init(&mut self, pgno: Pgno, flags: u32, psize: usize) {
        let header = self.header_mut();
        header.set_pgno(pgno);
        header.set_flags(flags);
        header.set_lower(PAGE_HEADER_SIZE);
        header.set_upper(psize);
    }

    pub fn header_mut(&mut self) -> &mut PageHeader {
        PageHeader::mut_from_bytes(&mut self.data[..PAGE_HEADER_SIZE]).expect("length checked")
    }

    pub fn view(&self) -> PageView<'_> {
        PageView { data: self.data }
    }

    fn set_node_offset(&mut self, index: usize, ofs: usize) {
        let slot = PAGE_HEADER_SIZE + index * INDEX_ENTRY_SIZE;
        self.data[slot..slot + 2].copy_from_slice(&(ofs as u16).to_le_bytes());
    }

    /// Insert a node at `index`, shifting higher slots up. The caller has
    /// already checked that the node fits.
    pub fn insert_node(
        &mut self,
        index: usize,
        key: &[u8],
        payload: NodePayload<'_>,
    ) -> Result<()> {
        let view = self.view();
        let num_keys = view.num_keys();
        let lower = view.header().lower();
        let upper = view.header().upper();
        ensure!(index <= num_keys, "insert index {} out of range", index);

        let mut node_size = NODE_HEADER_SIZE + key.len();
        if let NodePayload::Leaf { stored, .. } = payload {
            node_size += stored.len();
        }
        if node_size + INDEX_ENTRY_SIZE > upper - lower {
            bail!(
                "not enough room on page {} for a {} byte node ({} free)",
                view.pgno(),
                node_size,
                upper - lower
            );
        }

        for i in (index..num_keys).rev() {
            let ofs = self.view().node_offset(i);
            self.set_node_offset(i + 1, ofs);
        }

        let ofs = upper - node_size;
        self.set_node_offset(index, ofs);
        let header = self.header_mut();
        header.set_upper(ofs);
        header.set_lower(lower + INDEX_ENTRY_SIZE);

        let (node_header, stored_bytes) = match payload {
            NodePayload::Branch { child } => (NodeHeader::new(child, 0, key.len()), &[][..]),
            NodePayload::Leaf {
                stored,
                data_size,
                flags,
            } => (NodeHeader::new(data_size as u64, flags, key.len()), stored),
        };
        self.data[ofs..ofs + NODE_HEADER_SIZE].copy_from_slice(node_header.as_bytes());
        let key_start = ofs + NODE_HEADER_SIZE;
        self.data[key_start..key_start + key.len()].copy_from_slice(key);
        self.data[key_start + key.len()..key_start + key.len() + stored_bytes.len()]
            .copy_from_slice(stored_bytes);
        Ok(())
    }

    /// Remove the node at `index`, compacting the node area and patching
    /// every slot that pointed below it.
    pub fn delete_node(&mut self, index: usize) {
        let view = self.view();
        let num_keys = view.num_keys();
        debug_assert!(index < num_keys);

        let node = view.node(index).expect("index checked");
        let node_size = NODE_HEADER_SIZE + node.key().len() + node.stored_data().len();
        let ptr = view.node_offset(index);
        let lower = view.header().lower();
        let upper = view.header().upper();

        let mut j = 0;
        for i in 0..num_keys {
            if i == index {
                continue;
            }
            let mut ofs = self.view().node_offset(i);
            if ofs < ptr {
                ofs += node_size;
            }
            self.set_node_offset(j, ofs);
            j += 1;
        }

        self.data.copy_within(upper..ptr, upper + node_size);
        let header = self.header_mut();
        header.set_lower(lower - INDEX_ENTRY_SIZE);
        header.set_upper(upper + node_size);
    }

    /// Replace the key of the node at `index` in place, sliding the node
    /// area to absorb the size difference.
    pub fn update_key(&mut self, index: usize, new_key: &[u8]) -> Result<()> {
        let view = self.view();
        let num_keys = view.num_keys();
        let node = view.node(index)?;
        let old_ksize = node.key().len();
        let ptr = view.node_offset(index);
        let upper = view.header().upper();

        let delta = new_key.len() as isize - old_ksize as isize;
        if delta != 0 {
            if delta > 0 && (view.size_left() as isize) < delta {
                bail!(
                    "not enough room on page {} to grow key by {} bytes",
                    view.pgno(),
                    delta
                );
            }

            for i in 0..num_keys {
                let ofs = self.view().node_offset(i);
                if ofs <= ptr {
                    self.set_node_offset(i, (ofs as isize - delta) as usize);
                }
            }

            // Slide everything from the node area start through this
            // node's header so the key bytes can change size in place.
            let len = ptr - upper + NODE_HEADER_SIZE;
            let new_upper = (upper as isize - delta) as usize;
            self.data.copy_within(upper..upper + len, new_upper);
            self.header_mut().set_upper(new_upper);

            let node_ofs = (ptr as isize - delta) as usize;
            let header =
                NodeHeader::mut_from_bytes(&mut self.data[node_ofs..node_ofs + NODE_HEADER_SIZE])
                    .expect("sized");
            header.set_key_size(new_key.len());
            let key_start = node_ofs + NODE_HEADER_SIZE;
            self.data[key_start..key_start + new_key.len()].copy_from_slice(new_key);
        } else {
            let key_start = ptr + NODE_HEADER_SIZE;
            self.data[key_start..key_start + new_key.len()].copy_from_slice(new_key);
        }
        Ok(())
    }

    /// Redirect a branch node's child pointer, e.g. after copy-on-write
    /// moved the child to a new page number.
    pub fn set_node_child(&mut self, index: usize, child: Pgno) -> Result<()> {
        ensure!(
            index < self.view().num_keys(),
            "node index {} out of range on page {}",
            index,
            self.view().pgno()
        );
        let ofs = self.view().node_offset(index);
        let header = NodeHeader::mut_from_bytes(&mut self.data[ofs..ofs + NODE_HEADER_SIZE])
            .expect("sized");
        header.payload = zerocopy::little_endian::U64::new(child);
        Ok(())
    }

    /// Mutable access to the stored value bytes of the node at `index`,
    /// for same-size overwrites and sub-tree record writebacks.
    pub fn node_stored_data_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let node = self.view().node(index)?;
        let start = self.view().node_offset(index) + NODE_HEADER_SIZE + node.key().len();
        let len = node.stored_data().len();
        Ok(&mut self.data[start..start + len])
    }

    /// Raw body of an overflow page (everything after the header).
    pub fn overflow_body_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }
}

/// Bytes a leaf node will consume, slot entry included. Values bound for
/// an overflow chain only store the 8-byte chain head in the page.
pub fn leaf_size(psize: usize, key_len: usize, data_len: usize) -> usize {
    let mut sz = NODE_HEADER_SIZE + key_len + data_len;
    if data_len >= psize / OVERFLOW_DIVISOR {
        sz -= data_len - std::mem::size_of::<Pgno>();
    }
    sz + INDEX_ENTRY_SIZE
}

/// Bytes a branch node will consume, slot entry included.
pub fn branch_size(key_len: usize) -> usize {
    NODE_HEADER_SIZE + key_len + INDEX_ENTRY_SIZE
}

/// Whether a value of `data_len` bytes goes to an overflow chain.
pub fn is_overflow_size(psize: usize, data_len: usize) -> bool {
    data_len >= psize / OVERFLOW_DIVISOR
}

/// Number of contiguous pages needed for an overflow value.
pub fn overflow_page_count(psize: usize, data_len: usize) -> usize {
    (PAGE_HEADER_SIZE + data_len).div_ceil(psize)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PSIZE: usize = 4096;

    fn leaf_page(buf: &mut [u8]) -> PageMut<'_> {
        let mut page = PageMut::new(buf).unwrap();
        page.init(7, PAGE_LEAF | PAGE_DIRTY, PSIZE);
        page
    }

    fn put(page: &mut PageMut<'_>, index: usize, key: &[u8], data: &[u8]) {
        page.insert_node(
            index,
            key,
            NodePayload::Leaf {
                stored: data,
                data_size: data.len(),
                flags: 0,
            },
        )
        .unwrap();
    }

    #[test]
    fn page_header_is_16_bytes() {
        assert_eq!(std::mem::size_of::<PageHeader>(), PAGE_HEADER_SIZE);
    }

    #[test]
    fn node_header_is_10_bytes() {
        assert_eq!(std::mem::size_of::<NodeHeader>(), NODE_HEADER_SIZE);
    }

    #[test]
    fn init_leaves_page_empty() {
        let mut buf = vec![0u8; PSIZE];
        let page = leaf_page(&mut buf);

        assert_eq!(page.view().num_keys(), 0);
        assert_eq!(page.view().size_left(), PSIZE - PAGE_HEADER_SIZE);
        assert!(page.view().is_leaf());
        assert!(page.view().is_dirty());
    }

    #[test]
    fn insert_and_read_back_nodes() {
        let mut buf = vec![0u8; PSIZE];
        let mut page = leaf_page(&mut buf);

        put(&mut page, 0, b"bbb", b"2");
        put(&mut page, 0, b"aaa", b"1");
        put(&mut page, 2, b"ccc", b"3");

        let view = page.view();
        assert_eq!(view.num_keys(), 3);
        assert_eq!(view.node(0).unwrap().key(), b"aaa");
        assert_eq!(view.node(1).unwrap().key(), b"bbb");
        assert_eq!(view.node(2).unwrap().key(), b"ccc");
        assert_eq!(view.node(1).unwrap().stored_data(), b"2");
    }

    #[test]
    fn delete_node_compacts_and_keeps_order() {
        let mut buf = vec![0u8; PSIZE];
        let mut page = leaf_page(&mut buf);
        put(&mut page, 0, b"a", b"111");
        put(&mut page, 1, b"b", b"222");
        put(&mut page, 2, b"c", b"333");
        let free_before = page.view().size_left();

        page.delete_node(1);

        let view = page.view();
        assert_eq!(view.num_keys(), 2);
        assert_eq!(view.node(0).unwrap().key(), b"a");
        assert_eq!(view.node(0).unwrap().stored_data(), b"111");
        assert_eq!(view.node(1).unwrap().key(), b"c");
        assert_eq!(view.node(1).unwrap().stored_data(), b"333");
        assert!(view.size_left() > free_before);
    }

    #[test]
    fn insert_rejects_when_full() {
        let mut buf = vec![0u8; 64];
        let mut page = PageMut::new(&mut buf).unwrap();
        page.init(1, PAGE_LEAF, 64);

        put(&mut page, 0, b"k1", b"v1");
        let result = page.insert_node(
            1,
            b"a-rather-long-key-that-cannot-fit",
            NodePayload::Leaf {
                stored: b"value",
                data_size: 5,
                flags: 0,
            },
        );

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("not enough room"));
    }

    #[test]
    fn update_key_grows_and_shrinks() {
        let mut buf = vec![0u8; PSIZE];
        let mut page = leaf_page(&mut buf);
        put(&mut page, 0, b"aa", b"first");
        put(&mut page, 1, b"mm", b"second");
        put(&mut page, 2, b"zz", b"third");

        page.update_key(1, b"mmmmmm").unwrap();
        assert_eq!(page.view().node(1).unwrap().key(), b"mmmmmm");
        assert_eq!(page.view().node(1).unwrap().stored_data(), b"second");
        assert_eq!(page.view().node(0).unwrap().stored_data(), b"first");
        assert_eq!(page.view().node(2).unwrap().stored_data(), b"third");

        page.update_key(1, b"m").unwrap();
        assert_eq!(page.view().node(1).unwrap().key(), b"m");
        assert_eq!(page.view().node(1).unwrap().stored_data(), b"second");
        assert_eq!(page.view().node(2).unwrap().stored_data(), b"third");
    }

    #[test]
    fn update_key_fails_without_room() {
        let mut buf = vec![0u8; 48];
        let mut page = PageMut::new(&mut buf).unwrap();
        page.init(1, PAGE_LEAF, 48);
        put(&mut page, 0, b"k", b"v");

        let big = vec![b'x'; 64];
        assert!(page.update_key(0, &big).is_err());
    }

    #[test]
    fn branch_nodes_store_child_pointers() {
        let mut buf = vec![0u8; PSIZE];
        let mut page = PageMut::new(&mut buf).unwrap();
        page.init(3, PAGE_BRANCH | PAGE_DIRTY, PSIZE);

        page.insert_node(0, b"", NodePayload::Branch { child: 11 })
            .unwrap();
        page.insert_node(1, b"sep", NodePayload::Branch { child: 12 })
            .unwrap();

        let view = page.view();
        assert_eq!(view.node(0).unwrap().key(), b"");
        assert_eq!(view.node(0).unwrap().child_pgno(), 11);
        assert_eq!(view.node(1).unwrap().child_pgno(), 12);
        assert_eq!(view.node(1).unwrap().stored_data(), b"");
    }

    #[test]
    fn overflow_count_packs_into_bounds_word() {
        let mut buf = vec![0u8; PAGE_HEADER_SIZE];
        let mut page = PageMut::new(&mut buf).unwrap();
        let header = page.header_mut();
        header.set_flags(PAGE_OVERFLOW);
        header.set_overflow_count(0x0003_0001);

        assert_eq!(page.view().header().overflow_count(), 0x0003_0001);
    }

    #[test]
    fn big_data_node_exposes_chain_head() {
        let mut buf = vec![0u8; PSIZE];
        let mut page = leaf_page(&mut buf);
        let head = 42u64.to_le_bytes();
        page.insert_node(
            0,
            b"big",
            NodePayload::Leaf {
                stored: &head,
                data_size: 100_000,
                flags: NODE_BIGDATA,
            },
        )
        .unwrap();

        let node = page.view().node(0).unwrap();
        assert!(node.is_big_data());
        assert_eq!(node.data_size(), 100_000);
        assert_eq!(node.overflow_root().unwrap(), 42);
    }

    #[test]
    fn size_math_matches_overflow_rule() {
        assert!(!is_overflow_size(PSIZE, PSIZE / 4 - 1));
        assert!(is_overflow_size(PSIZE, PSIZE / 4));
        assert_eq!(
            leaf_size(PSIZE, 3, PSIZE),
            NODE_HEADER_SIZE + 3 + 8 + INDEX_ENTRY_SIZE
        );
        assert_eq!(overflow_page_count(PSIZE, 3 * PSIZE), 4);
    }
}

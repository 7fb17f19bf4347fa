//! Public flag sets for environments, databases and write operations.
//!
//! The database flags double as the on-disk `flags` field of a DB record,
//! truncated to 16 bits; `CREATE` intentionally sits above bit 15 so it is
//! never persisted. Environment flags below bit 16 are stamped into the
//! meta page at creation time (`FIXEDMAP`), the rest are runtime-only.

use bitflags::bitflags;

bitflags! {
    /// Environment-wide behavior flags, passed to [`crate::EnvBuilder`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        /// Ask for the map at the address recorded in the meta page.
        const FIXEDMAP = 0x01;
        /// Skip both fsyncs at commit. Trades durability for speed; a
        /// crash may lose the last transactions but never corrupts.
        const NOSYNC = 0x10000;
        /// Open read-only; write transactions are refused.
        const RDONLY = 0x20000;
    }
}

bitflags! {
    /// Per-database flags, passed when opening a database handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DbFlags: u32 {
        /// Compare keys back to front.
        const REVERSEKEY = 0x02;
        /// Keep all values for one key, sorted, in a nested sub-tree.
        const DUPSORT = 0x04;
        /// Keys are native-endian integers; on little-endian hosts the
        /// byte-reverse comparator yields numeric order.
        const INTEGERKEY = 0x08;
        /// Create the named database if it does not exist.
        const CREATE = 0x40000;
    }
}

bitflags! {
    /// Flags for [`crate::WriteTxn::put`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        /// Fail if the key is already present.
        const NOOVERWRITE = 0x10;
        /// In a `DUPSORT` database, fail if the exact key/value pair is
        /// already present.
        const NODUPDATA = 0x20;
    }
}

impl DbFlags {
    /// The 16 bits that are stored in a DB record on disk.
    pub fn persisted(self) -> u16 {
        (self.bits() & 0xffff) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_flag_is_not_persisted() {
        let flags = DbFlags::DUPSORT | DbFlags::CREATE;
        assert_eq!(flags.persisted(), DbFlags::DUPSORT.bits() as u16);
    }

    #[test]
    fn db_flags_roundtrip_through_u16() {
        let flags = DbFlags::REVERSEKEY | DbFlags::INTEGERKEY;
        let bits = flags.persisted();
        let back = DbFlags::from_bits_truncate(bits as u32);
        assert_eq!(back, flags);
    }
}

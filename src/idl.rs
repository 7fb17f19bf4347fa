//! Compact ordered lists of page numbers.
//!
//! The free-list database stores, for each freeing transaction, the set of
//! page numbers that transaction released. The value bytes of such a record
//! are an `Idl` in its raw form: a little-endian `u64` count followed by
//! the page numbers in descending order. A count of zero switches to the
//! range form, where the next two words hold the inclusive `[high, low]`
//! bounds of a contiguous run.
//!
//! Descending order makes the cheap operation the useful one: the
//! allocator peels pages off the tail, so it always reuses the lowest page
//! number first and the list only ever shrinks in place.

use eyre::{ensure, Result};

/// An ordered set of page numbers, stored descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Idl {
    /// Explicit list, sorted descending, no duplicates.
    List(Vec<u64>),
    /// Contiguous inclusive range; empty once `low > high`.
    Range { high: u64, low: u64 },
}

impl Idl {
    pub fn new() -> Self {
        Idl::List(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Idl::List(ids) => ids.is_empty(),
            Idl::Range { high, low } => low > high,
        }
    }

    /// Number of page numbers in the set.
    pub fn len(&self) -> usize {
        match self {
            Idl::List(ids) => ids.len(),
            Idl::Range { high, low } => {
                if low > high {
                    0
                } else {
                    (high - low + 1) as usize
                }
            }
        }
    }

    /// Insert a page number, keeping descending order. Duplicates are
    /// ignored. A range is materialized into a list first.
    pub fn insert(&mut self, pgno: u64) {
        if let Idl::Range { high, low } = *self {
            let mut ids: Vec<u64> = if low > high {
                Vec::new()
            } else {
                (low..=high).rev().collect()
            };
            match ids.binary_search_by(|probe| probe.cmp(&pgno).reverse()) {
                Ok(_) => {}
                Err(pos) => ids.insert(pos, pgno),
            }
            *self = Idl::List(ids);
            return;
        }
        if let Idl::List(ids) = self {
            match ids.binary_search_by(|probe| probe.cmp(&pgno).reverse()) {
                Ok(_) => {}
                Err(pos) => ids.insert(pos, pgno),
            }
        }
    }

    /// The tail element: the smallest page number in the set.
    pub fn last(&self) -> Option<u64> {
        match self {
            Idl::List(ids) => ids.last().copied(),
            Idl::Range { high, low } => (low <= high).then_some(*low),
        }
    }

    /// Remove and return the tail element.
    pub fn pop_last(&mut self) -> Option<u64> {
        match self {
            Idl::List(ids) => ids.pop(),
            Idl::Range { high, low } => {
                if *low > *high {
                    None
                } else {
                    let pgno = *low;
                    *low += 1;
                    Some(pgno)
                }
            }
        }
    }

    /// Size of the raw serialized form in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            Idl::List(ids) => (ids.len() + 1) * 8,
            Idl::Range { .. } => 3 * 8,
        }
    }

    /// Serialize to the raw on-disk form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_bytes());
        match self {
            Idl::List(ids) => {
                out.extend_from_slice(&(ids.len() as u64).to_le_bytes());
                for id in ids {
                    out.extend_from_slice(&id.to_le_bytes());
                }
            }
            Idl::Range { high, low } => {
                out.extend_from_slice(&0u64.to_le_bytes());
                out.extend_from_slice(&high.to_le_bytes());
                out.extend_from_slice(&low.to_le_bytes());
            }
        }
        out
    }

    /// Parse the raw on-disk form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= 8 && bytes.len() % 8 == 0,
            "malformed page list: {} bytes",
            bytes.len()
        );
        let word = |i: usize| {
            u64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().expect("8-byte chunk"))
        };
        let count = word(0) as usize;
        if count == 0 {
            if bytes.len() >= 24 {
                return Ok(Idl::Range {
                    high: word(1),
                    low: word(2),
                });
            }
            return Ok(Idl::List(Vec::new()));
        }
        ensure!(
            bytes.len() >= (count + 1) * 8,
            "page list claims {} entries but holds {} bytes",
            count,
            bytes.len()
        );
        let ids = (1..=count).map(word).collect();
        Ok(Idl::List(ids))
    }
}

impl Default for Idl {
    fn default() -> Self {
        Self::new()
    }
}

// dedup_runner/src/dedup_set.rs
//! Bit-per-value membership over the whole numeric domain.
//!
//! The set is owned by the dedup processor thread and mutated through
//! `&mut self` only; producers never touch it and reach it through the input
//! queue instead, so `insert` is a plain test-and-set with no lock.

use crate::error::{Result, ServerError};

const WORD_BITS: u64 = u64::BITS as u64;

pub struct DedupSet {
    words: Vec<u64>,
    capacity: u64,
}

impl DedupSet {
    /// Allocates `capacity` cleared bits.
    pub fn with_capacity(capacity: u64) -> Self {
        let words = capacity.div_ceil(WORD_BITS) as usize;
        Self {
            // zeroed allocation; pages are only touched once a bit in them is set
            words: vec![0u64; words],
            capacity,
        }
    }

    /// Bits for every `digits`-wide decimal value.
    pub fn for_digits(digits: u32) -> Self {
        Self::with_capacity(10u64.pow(digits))
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn contains(&self, value: u64) -> Result<bool> {
        let (word, mask) = self.locate(value)?;
        Ok(self.words[word] & mask != 0)
    }

    /// Sets bit `value`. Returns `true` when the bit was previously clear,
    /// i.e. the value is seen for the first time.
    pub fn insert(&mut self, value: u64) -> Result<bool> {
        let (word, mask) = self.locate(value)?;
        let slot = &mut self.words[word];
        let fresh = *slot & mask == 0;
        *slot |= mask;
        Ok(fresh)
    }

    fn locate(&self, value: u64) -> Result<(usize, u64)> {
        if value >= self.capacity {
            return Err(ServerError::OutOfDomain {
                value,
                capacity: self.capacity,
            });
        }
        Ok(((value / WORD_BITS) as usize, 1u64 << (value % WORD_BITS)))
    }
}

impl std::fmt::Debug for DedupSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupSet")
            .field("capacity", &self.capacity)
            .field("words", &self.words.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_reports_first_sighting_only() {
        let mut set = DedupSet::for_digits(3);
        assert_eq!(set.capacity(), 1000);
        assert!(set.insert(42).unwrap());
        assert!(!set.insert(42).unwrap());
        assert!(set.contains(42).unwrap());
        assert!(!set.contains(43).unwrap());
    }

    #[test]
    fn domain_edges_are_addressable() {
        let mut set = DedupSet::for_digits(2);
        assert!(set.insert(0).unwrap());
        assert!(set.insert(63).unwrap());
        assert!(set.insert(64).unwrap());
        assert!(set.insert(99).unwrap());
        assert!(!set.contains(98).unwrap());
    }

    #[test]
    fn out_of_domain_is_an_error() {
        let mut set = DedupSet::for_digits(2);
        assert!(matches!(
            set.insert(100),
            Err(ServerError::OutOfDomain { value: 100, capacity: 100 })
        ));
        assert!(set.contains(u64::MAX).is_err());
    }

    #[test]
    fn full_width_domain_allocates_lazily() {
        let mut set = DedupSet::for_digits(9);
        assert_eq!(set.capacity(), 1_000_000_000);
        assert!(set.insert(999_999_999).unwrap());
        assert!(set.insert(0).unwrap());
        assert!(!set.insert(999_999_999).unwrap());
    }
}

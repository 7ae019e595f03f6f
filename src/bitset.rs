//! Resizable bitset used to represent sets of client indices.

use core::fmt::{self, Write};
use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};
use core::str::FromStr;

const BITS: usize = u64::BITS as usize;

/// Automatically resizing bitset over positions `0..`, backed by 64-bit words.
///
/// The backing vector is kept canonical: the last word is never zero. This
/// makes equality a plain vector compare and keeps sparse sets cheap to copy,
/// which matters because interest and advertised sets are passed around by
/// value throughout the exporter and the sender.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BitSet {
    blocks: Vec<u64>,
}

impl BitSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set with a single bit.
    pub fn single(pos: usize) -> Self {
        let mut set = Self::new();
        set.set(pos);
        set
    }

    /// Sets the bit at `pos`, growing the backing vector when needed.
    pub fn set(&mut self, pos: usize) {
        let idx = pos / BITS;
        if idx >= self.blocks.len() {
            self.blocks.resize(idx + 1, 0);
        }
        self.blocks[idx] |= 1 << (pos % BITS);
    }

    /// Clears the bit at `pos`, shrinking the backing vector when possible.
    pub fn reset(&mut self, pos: usize) {
        let idx = pos / BITS;
        if idx < self.blocks.len() {
            self.blocks[idx] &= !(1 << (pos % BITS));
            self.compact();
        }
    }

    /// Returns whether the bit at `pos` is set.
    pub fn test(&self, pos: usize) -> bool {
        let idx = pos / BITS;
        idx < self.blocks.len() && self.blocks[idx] & (1 << (pos % BITS)) != 0
    }

    /// Clears all bits.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Returns whether no bit is set.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Returns the number of set bits.
    pub fn count(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| block.count_ones() as usize)
            .sum()
    }

    /// Returns the position of the first set bit.
    pub fn find_first(&self) -> Option<usize> {
        self.find_from(0)
    }

    /// Returns the position of the first set bit after `pos`.
    pub fn find_next(&self, pos: usize) -> Option<usize> {
        self.find_from(pos + 1)
    }

    /// Returns the position of the last set bit.
    pub fn find_last(&self) -> Option<usize> {
        // Canonical form: the last block is non-zero.
        let block = *self.blocks.last()?;
        let offset = BITS - 1 - block.leading_zeros() as usize;
        Some((self.blocks.len() - 1) * BITS + offset)
    }

    /// Returns the position of the first clear bit.
    ///
    /// Always succeeds: positions past the backing vector are clear.
    pub fn find_first_clear(&self) -> usize {
        self.find_clear_from(0)
    }

    /// Returns the position of the first clear bit after `pos`.
    pub fn find_next_clear(&self, pos: usize) -> usize {
        self.find_clear_from(pos + 1)
    }

    /// Iterates over the positions of all set bits, in increasing order.
    pub fn ones(&self) -> Ones<'_> {
        Ones {
            set: self,
            next: Some(0),
        }
    }

    /// Returns whether `self` and `rhs` have any common bit.
    pub fn intersects(&self, rhs: &BitSet) -> bool {
        self.blocks
            .iter()
            .zip(&rhs.blocks)
            .any(|(a, b)| a & b != 0)
    }

    /// Returns whether every bit of `rhs` is also set in `self`.
    pub fn contains(&self, rhs: &BitSet) -> bool {
        if rhs.blocks.len() > self.blocks.len() {
            return false;
        }
        rhs.blocks
            .iter()
            .zip(&self.blocks)
            .all(|(b, a)| a & b == *b)
    }

    /// Clears every bit of `rhs` from `self`.
    pub fn subtract(&mut self, rhs: &BitSet) {
        let len = self.blocks.len().min(rhs.blocks.len());
        for idx in 0..len {
            self.blocks[idx] &= !rhs.blocks[idx];
        }
        self.compact();
    }

    /// Returns the set of bits in `self` that are not in `rhs`.
    ///
    /// Used pervasively to compute "newly interested" and "no longer
    /// interested" client sets.
    pub fn difference(&self, rhs: &BitSet) -> BitSet {
        let mut out = self.clone();
        out.subtract(rhs);
        out
    }

    /// Writes the set positions as a comma-separated list, for logging.
    pub fn to_numbered_string(&self) -> String {
        let mut out = String::new();
        for (count, pos) in self.ones().enumerate() {
            if count > 0 {
                out.push(',');
            }
            let _ = write!(out, "{pos}");
        }
        out
    }

    fn find_from(&self, pos: usize) -> Option<usize> {
        let mut idx = pos / BITS;
        if idx >= self.blocks.len() {
            return None;
        }
        let mut block = self.blocks[idx] & (u64::MAX << (pos % BITS));
        loop {
            if block != 0 {
                return Some(idx * BITS + block.trailing_zeros() as usize);
            }
            idx += 1;
            if idx == self.blocks.len() {
                return None;
            }
            block = self.blocks[idx];
        }
    }

    fn find_clear_from(&self, pos: usize) -> usize {
        let mut idx = pos / BITS;
        if idx >= self.blocks.len() {
            return pos;
        }
        // Treat bits below `pos` in the starting block as set.
        let mut block = self.blocks[idx] | !(u64::MAX << (pos % BITS));
        loop {
            if block != u64::MAX {
                return idx * BITS + block.trailing_ones() as usize;
            }
            idx += 1;
            if idx == self.blocks.len() {
                return idx * BITS;
            }
            block = self.blocks[idx];
        }
    }

    /// Drops trailing zero words so the set stays canonical.
    fn compact(&mut self) {
        while self.blocks.last() == Some(&0) {
            self.blocks.pop();
        }
    }
}

/// Iterator over set bit positions, see [`BitSet::ones`].
pub struct Ones<'a> {
    set: &'a BitSet,
    next: Option<usize>,
}

impl Iterator for Ones<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let pos = self.set.find_from(self.next?)?;
        self.next = Some(pos + 1);
        Some(pos)
    }
}

impl BitAndAssign<&BitSet> for BitSet {
    fn bitand_assign(&mut self, rhs: &BitSet) {
        self.blocks.truncate(rhs.blocks.len());
        for (a, b) in self.blocks.iter_mut().zip(&rhs.blocks) {
            *a &= b;
        }
        self.compact();
    }
}

impl BitOrAssign<&BitSet> for BitSet {
    fn bitor_assign(&mut self, rhs: &BitSet) {
        if rhs.blocks.len() > self.blocks.len() {
            self.blocks.resize(rhs.blocks.len(), 0);
        }
        for (a, b) in self.blocks.iter_mut().zip(&rhs.blocks) {
            *a |= b;
        }
    }
}

impl BitAnd for &BitSet {
    type Output = BitSet;

    fn bitand(self, rhs: &BitSet) -> BitSet {
        let mut out = self.clone();
        out &= rhs;
        out
    }
}

impl BitOr for &BitSet {
    type Output = BitSet;

    fn bitor(self, rhs: &BitSet) -> BitSet {
        let mut out = self.clone();
        out |= rhs;
        out
    }
}

/// Textual form, highest bit first: `{0, 2}` prints as `"101"`.
impl fmt::Display for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(last) = self.find_last() else {
            return Ok(());
        };
        for pos in (0..=last).rev() {
            f.write_char(if self.test(pos) { '1' } else { '0' })?;
        }
        Ok(())
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitSet({{{}}})", self.to_numbered_string())
    }
}

/// Error returned when parsing a [`BitSet`] from text.
#[derive(Debug, PartialEq, Eq)]
pub struct ParseBitSetError;

impl fmt::Display for ParseBitSetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("bitset strings may contain only '0' and '1'")
    }
}

impl std::error::Error for ParseBitSetError {}

impl FromStr for BitSet {
    type Err = ParseBitSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = BitSet::new();
        let len = s.len();
        for (idx, ch) in s.chars().enumerate() {
            match ch {
                '1' => set.set(len - 1 - idx),
                '0' => (),
                _ => return Err(ParseBitSetError),
            }
        }
        Ok(set)
    }
}

/// Allocates the smallest unused index, up to a fixed maximum.
///
/// Client indices come from here; reusing the smallest free index keeps the
/// interest and advertised bitsets short-lived clients would otherwise grow.
#[derive(Debug, Default)]
pub struct IndexAllocator {
    in_use: BitSet,
    max_index: usize,
}

impl IndexAllocator {
    pub fn new(max_index: usize) -> Self {
        Self {
            in_use: BitSet::new(),
            max_index,
        }
    }

    /// Returns the smallest free index, or `None` when all are taken.
    pub fn alloc_index(&mut self) -> Option<usize> {
        let index = self.in_use.find_first_clear();
        if index > self.max_index {
            return None;
        }
        self.in_use.set(index);
        Some(index)
    }

    /// Releases a previously allocated index.
    pub fn free_index(&mut self, index: usize) {
        debug_assert!(self.in_use.test(index));
        self.in_use.reset(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reset_canonical() {
        let mut set = BitSet::new();
        set.set(200);
        assert!(set.test(200));
        assert!(!set.test(199));
        set.reset(200);
        assert!(set.is_empty());
        assert_eq!(set, BitSet::new());
    }

    #[test]
    fn find_first_next() {
        let mut set = BitSet::new();
        for pos in [0, 63, 64, 130] {
            set.set(pos);
        }
        assert_eq!(set.find_first(), Some(0));
        assert_eq!(set.find_next(0), Some(63));
        assert_eq!(set.find_next(63), Some(64));
        assert_eq!(set.find_next(64), Some(130));
        assert_eq!(set.find_next(130), None);
        assert_eq!(set.find_last(), Some(130));
        assert_eq!(set.ones().collect::<Vec<_>>(), vec![0, 63, 64, 130]);
    }

    #[test]
    fn find_clear() {
        let mut set = BitSet::new();
        assert_eq!(set.find_first_clear(), 0);
        for pos in 0..66 {
            set.set(pos);
        }
        assert_eq!(set.find_first_clear(), 66);
        set.reset(64);
        assert_eq!(set.find_first_clear(), 64);
        assert_eq!(set.find_next_clear(64), 66);
    }

    #[test]
    fn logical_ops() {
        let mut a = BitSet::new();
        a.set(1);
        a.set(70);
        let mut b = BitSet::new();
        b.set(70);
        b.set(200);

        assert!(a.intersects(&b));
        assert_eq!((&a & &b).ones().collect::<Vec<_>>(), vec![70]);
        assert_eq!((&a | &b).ones().collect::<Vec<_>>(), vec![1, 70, 200]);
        assert_eq!(a.difference(&b).ones().collect::<Vec<_>>(), vec![1]);
        assert!((&a | &b).contains(&a));
        assert!(!a.contains(&b));

        let mut c = a.clone();
        c.subtract(&b);
        assert_eq!(c.ones().collect::<Vec<_>>(), vec![1]);

        // And-assign against a shorter set must shrink canonically.
        let mut d = b.clone();
        d &= &BitSet::single(70);
        assert_eq!(d, BitSet::single(70));
    }

    #[test]
    fn string_round_trip() {
        let mut set = BitSet::new();
        set.set(0);
        set.set(2);
        assert_eq!(set.to_string(), "101");
        assert_eq!("101".parse::<BitSet>().unwrap(), set);

        let mut sparse = BitSet::new();
        sparse.set(65);
        sparse.set(3);
        let text = sparse.to_string();
        assert_eq!(text.len(), 66);
        assert_eq!(text.parse::<BitSet>().unwrap(), sparse);

        assert_eq!(BitSet::new().to_string(), "");
        assert_eq!("".parse::<BitSet>().unwrap(), BitSet::new());
        assert!("10x".parse::<BitSet>().is_err());
    }

    #[test]
    fn index_allocator_reuses_smallest() {
        let mut alloc = IndexAllocator::new(2);
        assert_eq!(alloc.alloc_index(), Some(0));
        assert_eq!(alloc.alloc_index(), Some(1));
        alloc.free_index(0);
        assert_eq!(alloc.alloc_index(), Some(0));
        assert_eq!(alloc.alloc_index(), Some(2));
        assert_eq!(alloc.alloc_index(), None);
    }
}

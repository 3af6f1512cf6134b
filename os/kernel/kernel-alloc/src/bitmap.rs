//! Frame occupancy bitmap: bit set = in use.

pub struct Bitmap<'a> {
    words: &'a mut [u64],
    bits: usize,
}

impl<'a> Bitmap<'a> {
    /// Wrap `words`, tracking the first `bits` bits. Every bit starts set.
    ///
    /// `words` must hold at least `bits` bits.
    pub fn new_full(words: &'a mut [u64], bits: usize) -> Self {
        debug_assert!(words.len() * 64 >= bits);
        words.fill(u64::MAX);
        Self { words, bits }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bits
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    #[inline]
    #[must_use]
    pub fn is_set(&self, index: usize) -> bool {
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn set_range(&mut self, start: usize, end: usize) {
        for i in start..end.min(self.bits) {
            self.words[i / 64] |= 1 << (i % 64);
        }
    }

    pub fn clear_range(&mut self, start: usize, end: usize) {
        for i in start..end.min(self.bits) {
            self.words[i / 64] &= !(1 << (i % 64));
        }
    }

    /// Whether every bit of `[start, end)` is set.
    #[must_use]
    pub fn all_set(&self, start: usize, end: usize) -> bool {
        (start..end).all(|i| i < self.bits && self.is_set(i))
    }

    /// Whether any bit of `[start, end)` is set; bits past the end count as set.
    #[must_use]
    pub fn any_set(&self, start: usize, end: usize) -> bool {
        (start..end).any(|i| i >= self.bits || self.is_set(i))
    }

    #[must_use]
    pub fn count_clear(&self) -> usize {
        (0..self.bits).filter(|&i| !self.is_set(i)).count()
    }

    /// First run of `count` clear bits starting in `[from, start_before)`.
    ///
    /// The run itself may extend past `start_before`.
    #[must_use]
    pub fn find_clear_run(&self, from: usize, start_before: usize, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let mut start = from;
        let mut len = 0;
        let mut i = from;
        while i < self.bits {
            if len == 0 {
                if i >= start_before {
                    return None;
                }
                // Skip fully used words.
                if i % 64 == 0 && self.words[i / 64] == u64::MAX {
                    i += 64;
                    continue;
                }
            }
            if self.is_set(i) {
                len = 0;
            } else {
                if len == 0 {
                    start = i;
                }
                len += 1;
                if len == count {
                    return Some(start);
                }
            }
            i += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full() {
        let mut words = [0u64; 2];
        let bm = Bitmap::new_full(&mut words, 100);
        assert_eq!(bm.count_clear(), 0);
        assert!(bm.all_set(0, 100));
        assert!(!bm.all_set(99, 101));
    }

    #[test]
    fn any_set_finds_a_single_bit() {
        let mut words = [0u64; 2];
        let mut bm = Bitmap::new_full(&mut words, 100);
        bm.clear_range(0, 100);
        assert!(!bm.any_set(0, 100));
        bm.set_range(70, 71);
        assert!(bm.any_set(64, 80));
        assert!(!bm.any_set(71, 100));
        assert!(bm.any_set(99, 101));
    }

    #[test]
    fn runs_may_cross_word_boundaries() {
        let mut words = [0u64; 3];
        let mut bm = Bitmap::new_full(&mut words, 150);
        bm.clear_range(60, 70);
        assert_eq!(bm.find_clear_run(0, 150, 10), Some(60));
        assert_eq!(bm.find_clear_run(0, 150, 11), None);
        assert_eq!(bm.find_clear_run(65, 150, 5), Some(65));
    }

    #[test]
    fn start_limit_bounds_the_run_start_only() {
        let mut words = [0u64; 1];
        let mut bm = Bitmap::new_full(&mut words, 64);
        bm.clear_range(10, 20);
        assert_eq!(bm.find_clear_run(0, 12, 10), Some(10));
        assert_eq!(bm.find_clear_run(0, 10, 10), None);
    }

    #[test]
    fn ranges_are_clamped_to_len() {
        let mut words = [0u64; 1];
        let mut bm = Bitmap::new_full(&mut words, 10);
        bm.clear_range(0, 64);
        assert_eq!(bm.count_clear(), 10);
        bm.set_range(5, 64);
        assert_eq!(bm.count_clear(), 5);
        assert_eq!(bm.find_clear_run(0, 10, 6), None);
    }
}

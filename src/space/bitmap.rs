//! Fixed-size bit map; set bit = free unit.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMap {
    bits: usize,
    words: Vec<u64>,
}

impl BitMap {
    /// All bits clear (every unit used).
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            words: vec![0u64; bits.div_ceil(64)],
        }
    }

    pub fn from_bytes(bits: usize, bytes: &[u8]) -> Self {
        let mut m = Self::new(bits);
        for (i, chunk) in bytes.chunks(8).enumerate().take(m.words.len()) {
            let mut w = [0u8; 8];
            w[..chunk.len()].copy_from_slice(chunk);
            m.words[i] = u64::from_le_bytes(w);
        }
        m.mask_tail();
        m
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out.truncate(self.byte_len());
        out
    }

    pub fn byte_len(&self) -> usize {
        self.bits.div_ceil(8)
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    fn mask_tail(&mut self) {
        let rem = self.bits % 64;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }

    pub fn get(&self, i: usize) -> bool {
        i < self.bits && self.words[i / 64] & (1 << (i % 64)) != 0
    }

    fn apply_range(&mut self, start: usize, len: usize, set: bool) {
        let end = (start + len).min(self.bits);
        let mut i = start;
        while i < end {
            let w = i / 64;
            let lo = i % 64;
            let hi = (end - w * 64).min(64);
            let mask = if hi - lo == 64 {
                u64::MAX
            } else {
                ((1u64 << (hi - lo)) - 1) << lo
            };
            if set {
                self.words[w] |= mask;
            } else {
                self.words[w] &= !mask;
            }
            i = w * 64 + hi;
        }
    }

    /// Mark [start, start+len) free.
    pub fn set_range(&mut self, start: usize, len: usize) {
        self.apply_range(start, len, true);
    }

    /// Mark [start, start+len) used.
    pub fn unset_range(&mut self, start: usize, len: usize) {
        self.apply_range(start, len, false);
    }

    /// Number of set bits in [start, start+len).
    pub fn count_set_range(&self, start: usize, len: usize) -> usize {
        (start..(start + len).min(self.bits)).filter(|&i| self.get(i)).count()
    }

    pub fn count_set_bits(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Length of the run of set bits ending at the last bit.
    pub fn count_set_bits_end(&self) -> usize {
        let mut n = 0usize;
        let full_words = self.bits / 64;
        let rem = self.bits % 64;
        if rem != 0 {
            let w = self.words[full_words];
            let top = w << (64 - rem);
            let ones = (!top).leading_zeros() as usize;
            if ones < rem {
                return ones;
            }
            n += rem;
        }
        for w in self.words[..full_words].iter().rev() {
            let ones = (!*w).leading_zeros() as usize;
            n += ones;
            if ones < 64 {
                break;
            }
        }
        n
    }

    /// All bits set (whole range free) or cleared.
    pub fn reset(&mut self, free: bool) {
        let fill = if free { u64::MAX } else { 0 };
        self.words.iter_mut().for_each(|w| *w = fill);
        self.mask_tail();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_and_counts() {
        let mut m = BitMap::new(200);
        assert_eq!(m.count_set_bits(), 0);
        m.set_range(10, 100);
        assert_eq!(m.count_set_bits(), 100);
        assert_eq!(m.count_set_range(0, 20), 10);
        assert_eq!(m.count_set_bits_end(), 0);

        m.set_range(150, 50);
        assert_eq!(m.count_set_bits_end(), 50);
        m.set_range(110, 40);
        assert_eq!(m.count_set_bits_end(), 190);

        m.unset_range(60, 5);
        assert_eq!(m.count_set_bits(), 185);
        assert!(!m.get(62) && m.get(65));
    }

    #[test]
    fn reset_and_bytes() {
        let mut m = BitMap::new(70);
        m.reset(true);
        assert_eq!(m.count_set_bits(), 70);
        assert_eq!(m.count_set_bits_end(), 70);

        m.unset_range(0, 3);
        let back = BitMap::from_bytes(70, &m.to_bytes());
        assert_eq!(back, m);
        assert_eq!(m.to_bytes().len(), 9);

        m.reset(false);
        assert_eq!(m.count_set_bits(), 0);
    }

    #[test]
    fn exact_word_multiple() {
        let mut m = BitMap::new(128);
        m.set_range(64, 64);
        assert_eq!(m.count_set_bits_end(), 64);
        m.set_range(63, 1);
        assert_eq!(m.count_set_bits_end(), 65);
    }
}

//! Scalable bitmap for slot allocation.
//!
//! Bits are spread over several atomic words so that concurrent allocators
//! starting from different hints touch different cache lines:
//!
//! ```text
//!   depth = 64, shift = 4 (16 bits per word)
//!
//!   word 0  [0 .. 16)   word 1 [16 .. 32)   word 2 [32 .. 48)   word 3 [48 .. 64)
//!          ▲                      ▲
//!       hint A                 hint B
//! ```
//!
//! A search starts at the caller's hint, scans forward word by word and wraps
//! around once. Setting and clearing a bit are single atomic operations; no
//! lock is ever taken.

use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD_SHIFT: u32 = 6;

pub struct SBitmap {
    shift: u32,
    depth: usize,
    words: Box<[AtomicU64]>,
}

impl SBitmap {
    pub fn new(depth: usize) -> Self {
        let shift = Self::calculate_shift(depth);
        let bits_per_word = 1usize << shift;
        let nr_words = depth.div_ceil(bits_per_word).max(1);
        let words = (0..nr_words).map(|_| AtomicU64::new(0)).collect();
        Self {
            shift,
            depth,
            words,
        }
    }

    /// Picks the word size so that at least four words are in use when the
    /// depth allows it.
    fn calculate_shift(depth: usize) -> u32 {
        let mut shift = BITS_PER_WORD_SHIFT;
        if depth >= 4 {
            while (4usize << shift) > depth {
                shift -= 1;
            }
        }
        shift
    }

    /// Number of allocatable bits.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of bits backed by storage; may exceed `depth` after a shrink.
    pub fn capacity(&self) -> usize {
        self.words.len() << self.shift
    }

    pub fn bits_per_word(&self) -> usize {
        1 << self.shift
    }

    /// Finds a clear bit below `depth`, sets it and returns its index.
    pub fn get(&self, hint: usize) -> Option<usize> {
        if self.depth == 0 {
            return None;
        }
        let hint = if hint >= self.depth { 0 } else { hint };
        let nr_words = self.depth.div_ceil(self.bits_per_word());
        let mut index = hint >> self.shift;
        let mut offset = hint & (self.bits_per_word() - 1);

        // One extra step revisits the starting word below the hint.
        for _ in 0..=nr_words {
            if let Some(bit) = self.get_in_word(index, offset) {
                return Some((index << self.shift) + bit);
            }
            offset = 0;
            index = (index + 1) % nr_words;
        }
        None
    }

    fn get_in_word(&self, index: usize, offset: usize) -> Option<usize> {
        let base = index << self.shift;
        let word_depth = (self.depth - base).min(self.bits_per_word());
        let valid = if word_depth == 64 {
            u64::MAX
        } else {
            (1u64 << word_depth) - 1
        };
        let from = if offset >= 64 { 0 } else { u64::MAX << offset };
        let word = &self.words[index];

        let mut current = word.load(Ordering::Relaxed);
        loop {
            let candidates = !current & valid & from;
            if candidates == 0 {
                return None;
            }
            let bit = candidates.trailing_zeros() as usize;
            match word.compare_exchange_weak(
                current,
                current | (1u64 << bit),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(bit),
                Err(actual) => current = actual,
            }
        }
    }

    fn locate(&self, bit: usize) -> (&AtomicU64, u64) {
        let word = &self.words[bit >> self.shift];
        (word, 1u64 << (bit & (self.bits_per_word() - 1)))
    }

    /// Sets `bit` unconditionally; returns whether it was already set.
    pub fn set(&self, bit: usize) -> bool {
        let (word, mask) = self.locate(bit);
        word.fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clears `bit`; returns whether it was set.
    pub fn clear(&self, bit: usize) -> bool {
        let (word, mask) = self.locate(bit);
        word.fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    pub fn test(&self, bit: usize) -> bool {
        if bit >= self.capacity() {
            return false;
        }
        let (word, mask) = self.locate(bit);
        word.load(Ordering::Acquire) & mask != 0
    }

    /// Number of set bits, including any left above `depth` by a shrink.
    pub fn weight(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    pub fn for_each_set(&self, mut f: impl FnMut(usize)) {
        for (index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                f((index << self.shift) + bit);
                bits &= bits - 1;
            }
        }
    }

    /// Changes the allocatable depth.
    ///
    /// Growing past the backing storage allocates a new bitmap and migrates
    /// every set bit. Shrinking keeps the storage so bits still held above
    /// the new depth can be cleared later.
    pub fn resize(&mut self, depth: usize) {
        if depth <= self.capacity() {
            self.depth = depth;
            return;
        }
        let grown = SBitmap::new(depth);
        self.for_each_set(|bit| {
            grown.set(bit);
        });
        *self = grown;
    }
}

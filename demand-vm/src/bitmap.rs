use alloc::{vec, vec::Vec};

/// In-memory occupancy bitmap over slot indices
pub struct Bitmap {
    words: Vec<u64>,
    bits: usize,
}

impl Bitmap {
    /// Create an all-clear bitmap of `bits` slots
    pub fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
            bits,
        }
    }

    /// Allocate the first free slot
    pub fn alloc(&mut self) -> Option<usize> {
        let (word_id, inner_id) = self
            .words
            .iter()
            .enumerate()
            .find(|(_, &bits64)| bits64 != u64::MAX)
            .map(|(word_id, bits64)| (word_id, bits64.trailing_ones() as usize))?;
        let bit = word_id * 64 + inner_id;
        if bit >= self.bits {
            return None;
        }
        self.words[word_id] |= 1u64 << inner_id;
        Some(bit)
    }

    /// Deallocate a slot
    pub fn dealloc(&mut self, bit: usize) {
        let (word_id, inner_id) = decomposition(bit);
        assert!(
            bit < self.bits && self.words[word_id] & (1u64 << inner_id) > 0,
            "slot {bit} is not allocated"
        );
        self.words[word_id] &= !(1u64 << inner_id);
    }

    /// Whether a slot is occupied
    pub fn is_set(&self, bit: usize) -> bool {
        let (word_id, inner_id) = decomposition(bit);
        bit < self.bits && self.words[word_id] & (1u64 << inner_id) > 0
    }

    /// Get the max number of allocatable slots
    pub fn maximum(&self) -> usize {
        self.bits
    }

    /// Number of occupied slots
    pub fn count_used(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Decompose a bit into (`word_id`, `inner_id`)
fn decomposition(bit: usize) -> (usize, usize) {
    (bit / 64, bit % 64)
}

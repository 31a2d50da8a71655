//! Provides `OneLevelPrioBitmap`, a bit array structure supporting
//! constant-time bit scan operations.
use core::fmt;

/// Trait for bit arrays used to find the highest priority level with a
/// non-empty queue.
///
/// All methods panic when the given bit position is out of range.
pub trait PrioBitmap: Clone + Copy + fmt::Debug {
    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Get the position of the first set bit.
    fn find_set(&self) -> Option<usize>;
}

/// Stores `LEN` (≤ 32) entries in a single word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OneLevelPrioBitmap<const LEN: usize> {
    bits: u32,
}

impl<const LEN: usize> OneLevelPrioBitmap<LEN> {
    const LEN_OK: () = assert!(LEN <= u32::BITS as usize, "too many entries");

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::LEN_OK;
        Self { bits: 0 }
    }
}

impl<const LEN: usize> Default for OneLevelPrioBitmap<LEN> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const LEN: usize> fmt::Debug for OneLevelPrioBitmap<LEN> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl<const LEN: usize> PrioBitmap for OneLevelPrioBitmap<LEN> {
    fn get(&self, i: usize) -> bool {
        assert!(i < LEN);
        self.bits & (1 << i) != 0
    }

    fn clear(&mut self, i: usize) {
        assert!(i < LEN);
        self.bits &= !(1 << i);
    }

    fn set(&mut self, i: usize) {
        assert!(i < LEN);
        self.bits |= 1 << i;
    }

    fn find_set(&self) -> Option<usize> {
        let i = self.bits.trailing_zeros();
        if i == u32::BITS {
            None
        } else {
            Some(i as usize)
        }
    }
}

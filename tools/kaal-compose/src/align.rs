//! Alignment helpers and power-of-two chunk decomposition
//!
//! These are the pure building blocks shared by the virtual layout code and
//! the untyped covering allocator. All sizes passed as `m` must be powers of
//! two.

use core::iter::FusedIterator;

/// Align `x` up to the next multiple of `m`
///
/// `m` must be a power of two.
#[inline]
pub fn align_up(x: u64, m: u64) -> u64 {
    debug_assert!(m.is_power_of_two());
    (x + (m - 1)) & !(m - 1)
}

/// Like [`align_up`], but returns `None` instead of overflowing
#[inline]
pub fn checked_align_up(x: u64, m: u64) -> Option<u64> {
    debug_assert!(m.is_power_of_two());
    Some(x.checked_add(m - 1)? & !(m - 1))
}

/// Align `x` down to a multiple of `m`
#[inline]
pub fn align_down(x: u64, m: u64) -> u64 {
    debug_assert!(m.is_power_of_two());
    x & !(m - 1)
}

/// Check whether `x` is a multiple of `m`
#[inline]
pub fn is_aligned(x: u64, m: u64) -> bool {
    x & (m - 1) == 0
}

/// Bit index of the lowest set bit of `n` (`n` must be non-zero)
#[inline]
pub fn lowest_set_bit(n: u64) -> u32 {
    debug_assert!(n != 0);
    n.trailing_zeros()
}

/// Bit index of the highest set bit of `n` (`n` must be non-zero)
#[inline]
pub fn highest_set_bit(n: u64) -> u32 {
    debug_assert!(n != 0);
    63 - n.leading_zeros()
}

/// Smallest `b` such that `1 << b >= n`
#[inline]
pub fn ceil_log2(n: u64) -> u32 {
    if n <= 1 {
        0
    } else {
        highest_set_bit(n - 1) + 1
    }
}

/// Decompose `[start, end)` into maximal self-aligned power-of-two chunks
///
/// Yields `(chunk_start, size_bits)` pairs in ascending address order. No
/// chunk is larger than `2^max_size_bits`. Address zero is treated as
/// infinitely aligned, so only the remaining length and `max_size_bits` bound
/// the first chunk of a region starting there.
///
/// # Example
/// ```
/// use kaal_compose::align::aligned_chunks;
///
/// let chunks: Vec<_> = aligned_chunks(64, 0x1000, 0x4000).collect();
/// assert_eq!(chunks, vec![(0x1000, 12), (0x2000, 13)]);
/// ```
pub fn aligned_chunks(max_size_bits: u32, start: u64, end: u64) -> AlignedChunks {
    AlignedChunks {
        cur: start,
        end,
        max_size_bits,
    }
}

/// Iterator returned by [`aligned_chunks`]
#[derive(Debug)]
pub struct AlignedChunks {
    cur: u64,
    end: u64,
    max_size_bits: u32,
}

impl Iterator for AlignedChunks {
    type Item = (u64, u8);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur >= self.end {
            return None;
        }

        let mut bits = highest_set_bit(self.end - self.cur);
        if self.cur != 0 {
            bits = bits.min(lowest_set_bit(self.cur));
        }
        bits = bits.min(self.max_size_bits);

        let chunk_start = self.cur;
        self.cur += 1 << bits;
        Some((chunk_start, bits as u8))
    }
}

impl FusedIterator for AlignedChunks {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0x1234, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0, 0x1000), 0);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert!(is_aligned(0x20_0000, 0x20_0000));
        assert!(!is_aligned(0x1000, 0x20_0000));
        assert_eq!(checked_align_up(u64::MAX, 0x1000), None);
    }

    #[test]
    fn test_bit_helpers() {
        assert_eq!(lowest_set_bit(0x3000), 12);
        assert_eq!(highest_set_bit(0x3000), 13);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(16), 4);
        assert_eq!(ceil_log2(17), 5);
    }

    #[test]
    fn test_chunks_of_unaligned_region() {
        let chunks: Vec<_> = aligned_chunks(64, 0x1000, 0x1_0000).collect();
        assert_eq!(
            chunks,
            vec![(0x1000, 12), (0x2000, 13), (0x4000, 14), (0x8000, 15)]
        );
    }

    #[test]
    fn test_chunks_from_zero_capped() {
        let chunks: Vec<_> = aligned_chunks(12, 0, 0x3000).collect();
        assert_eq!(chunks, vec![(0, 12), (0x1000, 12), (0x2000, 12)]);

        let chunks: Vec<_> = aligned_chunks(64, 0, 0x3000).collect();
        assert_eq!(chunks, vec![(0, 13), (0x2000, 12)]);
    }

    #[test]
    fn test_chunks_empty_region() {
        assert_eq!(aligned_chunks(64, 0x5000, 0x5000).count(), 0);
    }

    proptest! {
        #[test]
        fn align_up_is_idempotent_and_minimal(x in 0u64..(u64::MAX >> 2), k in 0u32..40) {
            let m = 1u64 << k;
            let a = align_up(x, m);
            prop_assert_eq!(align_up(a, m), a);
            prop_assert!(a >= x);
            prop_assert!(a - x < m);
            prop_assert_eq!(a == x, x % m == 0);
        }

        #[test]
        fn chunks_exactly_cover_region(
            start in 0u64..(1 << 40),
            len in 0u64..(1 << 20),
            max_bits in 6u32..=64,
        ) {
            let end = start + len;
            let mut next = start;
            for (base, bits) in aligned_chunks(max_bits, start, end) {
                let size = 1u64 << bits;
                prop_assert_eq!(base, next);
                prop_assert!(u32::from(bits) <= max_bits);
                prop_assert_eq!(base % size, 0);
                prop_assert!(base + size <= end);
                next = base + size;
            }
            prop_assert_eq!(next, end);
        }
    }
}

#![feature(portable_simd)]

//! Counting `i8` elements strictly greater than a threshold, with a scalar
//! reference kernel and lane-parallel kernels built on `core::simd`, plus the
//! harness that checks them against each other and measures them over
//! cache-sized chunks.

use std::fmt;
use std::hint::black_box;
use std::simd::prelude::*;

pub mod driver;
pub mod error;
pub mod huge;
pub mod perf;
pub mod probe;
pub mod verify;

pub use error::{Error, Result};

/// Elements compared per step by the vector kernels.
pub const GROUP_WIDTH: usize = 32;

/// `to_simd` on a mask sets every bit of a matching lane, so an `i8` lane
/// contributes this many set bits to the popcount.
pub const MASK_BITS_PER_LANE: u32 = u8::BITS;

const SUB_WORD_BYTES: usize = size_of::<u32>();

#[inline(never)]
pub fn count_gt_naive(haystack: &[i8], threshold: i8) -> usize {
    let (haystack, threshold) = black_box((haystack, threshold));
    haystack.iter().copied().filter(|&x| x > threshold).count()
}

/// Expands to a lane-parallel counter over `$lanes`-wide groups and its
/// per-group step.
macro_rules! vector_kernel {
    ($(#[$attr:meta])* $count:ident, $group:ident, $lanes:literal) => {
        /// Number of lanes in `group` greater than `threshold`.
        ///
        /// The integer mask is split into `u32` sub-words; each popcount is
        /// divided by [`MASK_BITS_PER_LANE`] to turn set bits back into lanes.
        #[inline(always)]
        pub fn $group(group: Simd<i8, $lanes>, threshold: Simd<i8, $lanes>) -> u32 {
            const { assert!($lanes % SUB_WORD_BYTES == 0) };

            let mask = group.simd_gt(threshold).to_simd().cast::<u8>().to_array();
            let (words, _) = mask.as_chunks::<SUB_WORD_BYTES>();
            words
                .iter()
                .map(|word| u32::from_ne_bytes(*word).count_ones() / MASK_BITS_PER_LANE)
                .sum()
        }

        $(#[$attr])*
        #[inline(never)]
        pub fn $count(haystack: &[i8], threshold: i8) -> usize {
            let (haystack, threshold) = black_box((haystack, threshold));
            assert!(
                haystack.len() % $lanes == 0,
                "length {} is not a multiple of the group width {}",
                haystack.len(),
                $lanes
            );

            let threshold = Simd::<i8, $lanes>::splat(threshold);
            let mut count = 0usize;
            for group in haystack.chunks_exact($lanes) {
                count += $group(Simd::from_slice(group), threshold) as usize;
            }
            count
        }
    };
}

vector_kernel!(
    /// Counts elements greater than `threshold`, [`GROUP_WIDTH`] lanes at a time.
    ///
    /// # Panics
    ///
    /// If `haystack.len()` is not a multiple of [`GROUP_WIDTH`].
    count_gt_simd,
    group_matches,
    32
);

/// Like [`count_gt_simd`], but reads the comparison as a one-bit-per-lane
/// bitmask, so the popcount needs no division.
#[inline(never)]
pub fn count_gt_bitmask(haystack: &[i8], threshold: i8) -> usize {
    let (haystack, threshold) = black_box((haystack, threshold));
    assert!(
        haystack.len() % GROUP_WIDTH == 0,
        "length {} is not a multiple of the group width {}",
        haystack.len(),
        GROUP_WIDTH
    );

    let threshold = Simd::<i8, GROUP_WIDTH>::splat(threshold);
    haystack
        .chunks_exact(GROUP_WIDTH)
        .map(|group| {
            let mask = Simd::from_slice(group).simd_gt(threshold);
            mask.to_bitmask().count_ones() as usize
        })
        .sum()
}

/// The counting implementations under measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kernel {
    Naive,
    Simd,
    Bitmask,
}

impl Kernel {
    pub const ALL: [Kernel; 3] = [Kernel::Naive, Kernel::Simd, Kernel::Bitmask];

    /// Kernels checked against [`Kernel::Naive`].
    pub const VECTOR: [Kernel; 2] = [Kernel::Simd, Kernel::Bitmask];

    pub fn name(self) -> &'static str {
        match self {
            Kernel::Naive => "scalar  8",
            Kernel::Simd => "SIMD  8",
            Kernel::Bitmask => "bitmask  8",
        }
    }

    pub fn count(self, haystack: &[i8], threshold: i8) -> usize {
        match self {
            Kernel::Naive => count_gt_naive(haystack, threshold),
            Kernel::Simd => count_gt_simd(haystack, threshold),
            Kernel::Bitmask => count_gt_bitmask(haystack, threshold),
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    vector_kernel!(count_gt_x4, group_matches_x4, 4);

    fn grouped(max_groups: usize) -> impl Strategy<Value = Vec<i8>> {
        (0..=max_groups).prop_flat_map(|groups| {
            proptest::collection::vec(any::<i8>(), groups * GROUP_WIDTH)
        })
    }

    #[test]
    fn verify_count() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut occurences_naive = vec![];
        let mut occurences_simd = vec![];
        let mut occurences_bitmask = vec![];

        for _ in 0..64 {
            let threshold = rng.random();
            let haystack: Vec<i8> = (0..1024).map(|_| rng.random()).collect();

            occurences_naive.push(count_gt_naive(&haystack, threshold));
            occurences_simd.push(count_gt_simd(&haystack, threshold));
            occurences_bitmask.push(count_gt_bitmask(&haystack, threshold));
        }

        assert_eq!(occurences_naive, occurences_simd);
        assert_eq!(occurences_naive, occurences_bitmask);
    }

    #[test]
    fn naive_scenario() {
        let haystack = [5, 5, 5, 10, 20];
        assert_eq!(count_gt_naive(&haystack, 5), 2);
        assert_eq!(count_gt_naive(&haystack, 20), 0);
        assert_eq!(count_gt_naive(&haystack, -1), 5);
    }

    #[test]
    fn width_four_groups() {
        let haystack = [1, 2, 3, 4, 5, 6, 7, 8];
        let threshold = Simd::splat(4);

        let per_group: Vec<u32> = haystack
            .chunks_exact(4)
            .map(|group| group_matches_x4(Simd::from_slice(group), threshold))
            .collect();

        assert_eq!(per_group, [0u32, 4]);
        assert_eq!(count_gt_x4(&haystack, 4), 4);
        assert_eq!(count_gt_x4(&haystack, 4), count_gt_naive(&haystack, 4));
    }

    #[test]
    fn group_counts_every_lane_once() {
        let group = Simd::<i8, GROUP_WIDTH>::splat(i8::MAX);
        assert_eq!(group_matches(group, Simd::splat(i8::MIN)), GROUP_WIDTH as u32);
        assert_eq!(group_matches(group, Simd::splat(i8::MAX)), 0);
    }

    #[test]
    fn exact_group_boundaries() {
        for len in [0, GROUP_WIDTH, 64 * GROUP_WIDTH] {
            let haystack: Vec<i8> = (0..len).map(|i| (i % 100) as i8).collect();
            for kernel in Kernel::ALL {
                assert_eq!(
                    kernel.count(&haystack, 49),
                    count_gt_naive(&haystack, 49),
                    "{kernel} at len {len}"
                );
            }
        }
    }

    #[test]
    #[should_panic(expected = "not a multiple of the group width")]
    fn simd_rejects_partial_group() {
        count_gt_simd(&[0; GROUP_WIDTH + 1], 0);
    }

    #[test]
    #[should_panic(expected = "not a multiple of the group width")]
    fn bitmask_rejects_partial_group() {
        count_gt_bitmask(&[0; GROUP_WIDTH - 1], 0);
    }

    proptest! {
        #[test]
        fn vector_kernels_match_naive(haystack in grouped(16), threshold in any::<i8>()) {
            let expected = count_gt_naive(&haystack, threshold);
            prop_assert_eq!(count_gt_simd(&haystack, threshold), expected);
            prop_assert_eq!(count_gt_bitmask(&haystack, threshold), expected);
        }

        #[test]
        fn count_is_non_increasing_in_threshold(haystack in grouped(8), a in any::<i8>(), b in any::<i8>()) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            for kernel in Kernel::ALL {
                prop_assert!(kernel.count(&haystack, hi) <= kernel.count(&haystack, lo));
            }
        }

        #[test]
        fn extreme_thresholds(haystack in grouped(8)) {
            let above_min = haystack.iter().filter(|&&x| x != i8::MIN).count();
            for kernel in Kernel::ALL {
                prop_assert_eq!(kernel.count(&haystack, i8::MIN), above_min);
                prop_assert_eq!(kernel.count(&haystack, i8::MAX), 0);
            }
        }

        #[test]
        fn chunked_sum_matches_whole(haystack in grouped(16), threshold in any::<i8>(), groups_per_chunk in 1usize..5) {
            let whole = count_gt_naive(&haystack, threshold);
            for kernel in Kernel::ALL {
                let chunked: usize = haystack
                    .chunks(groups_per_chunk * GROUP_WIDTH)
                    .map(|chunk| kernel.count(chunk, threshold))
                    .sum();
                prop_assert_eq!(chunked, whole);
            }
        }
    }
}

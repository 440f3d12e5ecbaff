//! Cross-checks the vector kernels against the scalar reference before any
//! of them are timed.

use tracing::{debug, info};

use crate::{count_gt_naive, Error, Kernel, Result};

/// Thresholds for roughly 1%, 10%, 50%, 90% and 99% selectivity over values
/// drawn from `0..100`.
pub const THRESHOLDS: [i8; 5] = [1, 10, 50, 90, 99];

/// Runs every kernel over the whole `haystack` for each threshold and fails
/// on the first count that differs from [`count_gt_naive`].
pub fn verify_equivalence(haystack: &[i8], thresholds: &[i8], kernels: &[Kernel]) -> Result<()> {
    for &kernel in kernels {
        verify_counter(haystack, thresholds, kernel.name(), |h, t| kernel.count(h, t))?;
    }

    info!(
        elements = haystack.len(),
        thresholds = thresholds.len(),
        kernels = kernels.len(),
        "all kernels agree with the scalar reference"
    );
    Ok(())
}

/// Checks a single counter against [`count_gt_naive`].
pub fn verify_counter<F>(haystack: &[i8], thresholds: &[i8], name: &'static str, count: F) -> Result<()>
where
    F: Fn(&[i8], i8) -> usize,
{
    for &threshold in thresholds {
        let expected = count_gt_naive(haystack, threshold);
        let actual = count(haystack, threshold);
        if actual != expected {
            return Err(Error::Mismatch {
                kernel: name,
                threshold,
                expected,
                actual,
            });
        }
        debug!(kernel = name, threshold, count = actual, "agrees with scalar reference");
    }
    Ok(())
}
